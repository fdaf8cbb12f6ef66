// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Operation generator
//!
//! Turns an [`OrganizeContext`] into a prompt, hands it to the completion
//! provider, and parses the reply into a validated [`OperationPlan`].
//! Generation-level failures (`invalid_ai_response`, `ai_unavailable`)
//! abort the cycle before any file is touched.

pub mod context;

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PromptConfig;
use crate::ollama::CompletionProvider;
use crate::ops::{parse_plan, AbstractOperation, OperationPlan};
use crate::Result;
use context::{canonical_target_name, ArchiveAdvice, OrganizeContext};

/// Generator over a pluggable completion provider
pub struct OperationGenerator {
    provider: Arc<dyn CompletionProvider>,
    prompts: PromptConfig,
}

impl OperationGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, prompts: PromptConfig) -> Self {
        Self { provider, prompts }
    }

    /// Produce a validated plan for the given context.
    pub async fn generate(&self, ctx: &OrganizeContext) -> Result<OperationPlan> {
        let prompt = self.render_prompt(ctx);
        debug!("prompt length: {} bytes", prompt.len());

        let reply = self.provider.complete(&prompt).await?;
        let mut plan = parse_plan(&reply)?;

        normalize_targets(&mut plan);

        info!(
            "generated {} operations ({} with fallbacks)",
            plan.len(),
            plan.fallback_operations.iter().flatten().count()
        );
        Ok(plan)
    }

    fn render_prompt(&self, ctx: &OrganizeContext) -> String {
        let mut prompt = String::new();

        prompt.push_str(&self.prompts.organize);
        prompt.push_str("\n\n");

        let _ = writeln!(prompt, "Source directory: {}", ctx.source_root.display());
        if let Some(dest) = &ctx.destination_hint {
            let _ = writeln!(prompt, "Preferred destination root: {}", dest.display());
        }

        prompt.push_str("\nCurrent directory tree:\n");
        prompt.push_str(&ctx.tree);

        prompt.push_str("\nFiles to organize:\n");
        for file in &ctx.files {
            let category = file.category.as_deref().unwrap_or("unknown");
            if file.is_git_project {
                let _ = writeln!(
                    prompt,
                    "- {} (git project, move as a unit)",
                    file.path.display()
                );
                continue;
            }
            let _ = writeln!(
                prompt,
                "- {} ({} bytes, category: {})",
                file.path.display(),
                file.size_bytes,
                category
            );
            if let Some(excerpt) = &file.content_excerpt {
                let short: String = excerpt.chars().take(200).collect();
                let _ = writeln!(prompt, "  excerpt: {}", short.replace('\n', " "));
            }
            if let Some(listing) = &file.archive {
                let _ = writeln!(
                    prompt,
                    "  archive: {} files, sample: {:?}",
                    listing.file_count,
                    listing.sample_files.iter().take(5).collect::<Vec<_>>()
                );
            }
        }

        if !ctx.memory_hints.is_empty() {
            prompt.push_str("\nLearned destinations (bias, not rules):\n");
            for hint in ctx.memory_hints.iter().take(20) {
                let _ = writeln!(
                    prompt,
                    "- {} -> {} (confidence {:.2}, used {}x)",
                    hint.file_category,
                    hint.destination_path.display(),
                    hint.confidence_score,
                    hint.usage_count
                );
            }
        }

        if !ctx.series_hints.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.prompts.series);
            prompt.push('\n');
            for hint in ctx.series_hints.iter().take(20) {
                let _ = writeln!(
                    prompt,
                    "- {} -> {} (seasons as '{}')",
                    hint.series_name,
                    hint.destination_path.display(),
                    hint.season_structure
                );
            }
        }

        if !ctx.archive_advice.is_empty() {
            prompt.push_str("\nArchive handling:\n");
            for advice in &ctx.archive_advice {
                match advice {
                    ArchiveAdvice::Redundant { archive, found_at } => {
                        let _ = writeln!(
                            prompt,
                            "- {} is already extracted under {}; propose delete for the archive",
                            archive.display(),
                            found_at.display()
                        );
                    }
                    ArchiveAdvice::ExtractFirst { archive } => {
                        let _ = writeln!(
                            prompt,
                            "- {} is not extracted anywhere; propose extract before organizing its contents",
                            archive.display()
                        );
                    }
                }
            }
        }

        prompt
    }
}

/// Canonicalize the target file names of move/rename operations. The AI
/// is instructed to strip junk itself; this guarantees it.
fn normalize_targets(plan: &mut OperationPlan) {
    for op in plan
        .operations
        .iter_mut()
        .chain(plan.fallback_operations.iter_mut().flatten())
    {
        if let AbstractOperation::Move { dest, .. } | AbstractOperation::Rename { dest, .. } = op {
            if let Some(name) = dest.file_name().and_then(|n| n.to_str()) {
                let canonical = canonical_target_name(name);
                if canonical != name {
                    *dest = dest.with_file_name(canonical);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearningConfig, ScanConfig};
    use crate::db::Database;
    use crate::drives::identity::IdentityProbe;
    use crate::drives::{DriveRegistry, MountSnapshot};
    use crate::memory::DestinationMemory;
    use crate::TaxisError;
    use async_trait::async_trait;
    use super::context::ContextBuilder;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted provider for headless tests
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String>>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TaxisError::AiUnavailable("script exhausted".into())))
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn context_for(root: &Path) -> OrganizeContext {
        let db = Database::in_memory().unwrap();
        let probe = IdentityProbe::with_roots(root.join("ns"), root.join("nu"));
        let registry = DriveRegistry::with_probe("u", db.clone(), probe);
        registry
            .discover_from(vec![MountSnapshot {
                mount_point: root.to_path_buf(),
                label: "root".into(),
                total_bytes: 1,
                removable: false,
                file_system: "ext4".into(),
                device: None,
            }])
            .unwrap();
        let memory = DestinationMemory::with_registry("u", db, registry, LearningConfig::default());
        ContextBuilder::new(ScanConfig::default())
            .build(root, &memory, None)
            .unwrap()
    }

    #[tokio::test]
    async fn generates_plan_from_reply() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "hello").unwrap();

        let reply = r#"{
            "operations": [{"type": "mkdir", "path": "/Docs", "parents": true}],
            "explanations": ["Make the folder"],
            "fallback_operations": [null]
        }"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(reply.to_string())]));
        let generator =
            OperationGenerator::new(provider, crate::config::AppConfig::default().prompts);

        let plan = generator.generate(&context_for(tmp.path())).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.operations[0].kind(), "mkdir");
    }

    #[tokio::test]
    async fn malformed_reply_is_invalid_ai_response() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(
            "sorry, I cannot help with that".to_string()
        )]));
        let generator =
            OperationGenerator::new(provider, crate::config::AppConfig::default().prompts);

        let err = generator.generate(&context_for(tmp.path())).await.unwrap_err();
        assert!(matches!(err, TaxisError::InvalidAiResponse(_)));
    }

    #[tokio::test]
    async fn provider_failure_is_ai_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(TaxisError::AiUnavailable(
            "timeout".into(),
        ))]));
        let generator =
            OperationGenerator::new(provider, crate::config::AppConfig::default().prompts);

        let err = generator.generate(&context_for(tmp.path())).await.unwrap_err();
        assert!(matches!(err, TaxisError::AiUnavailable(_)));
    }

    #[tokio::test]
    async fn move_targets_are_normalized() {
        let tmp = tempfile::tempdir().unwrap();
        let reply = r#"{
            "operations": [{"type": "move", "src": "/dl/x.mkv", "dest": "/Movies/[YTS] Film (1).mkv"}],
            "explanations": ["File the movie"]
        }"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(reply.to_string())]));
        let generator =
            OperationGenerator::new(provider, crate::config::AppConfig::default().prompts);

        let plan = generator.generate(&context_for(tmp.path())).await.unwrap();
        match &plan.operations[0] {
            AbstractOperation::Move { dest, .. } => {
                assert_eq!(dest.file_name().unwrap().to_str().unwrap(), "Film.mkv");
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[test]
    fn prompt_mentions_memory_and_advice() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("song.mp3"), "x").unwrap();

        let ctx = context_for(tmp.path());
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let generator =
            OperationGenerator::new(provider, crate::config::AppConfig::default().prompts);

        let prompt = generator.render_prompt(&ctx);
        assert!(prompt.contains("song.mp3"));
        assert!(prompt.contains("category: Music"));
    }
}
