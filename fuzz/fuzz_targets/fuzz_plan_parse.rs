// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Fuzz the AI-reply plan parser: the one place untrusted text enters.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Must reject or parse, never panic.
        let _ = taxis::ops::parse_plan(text);
    }
});
