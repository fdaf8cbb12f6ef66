// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Cycle coordinator
//!
//! Drives discover -> analyze -> generate -> preview -> execute and
//! publishes typed events on a broadcast channel so UIs and test
//! harnesses can observe progress without coupling. Operations run
//! strictly sequentially; pause and cancel are cooperative and checked
//! between operations, never mid-operation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::drives::DriveRecord;
use crate::executor::OperationExecutor;
use crate::generator::context::{ContextBuilder, OrganizeContext};
use crate::generator::OperationGenerator;
use crate::memory::DestinationMemory;
use crate::ollama::CompletionProvider;
use crate::ops::{AbstractOperation, OperationPlan, OperationResult};
use crate::Result;

/// Events published to any listener (UI or test harness)
#[derive(Debug, Clone)]
pub enum OrganizerEvent {
    DriveConnected(DriveRecord),
    DriveDisconnected(DriveRecord),
    BatchPlanned {
        batch_id: String,
        operation_count: usize,
    },
    OperationStarted {
        batch_id: String,
        index: usize,
        operation: AbstractOperation,
    },
    OperationCompleted {
        batch_id: String,
        index: usize,
        result: OperationResult,
    },
    BatchCompleted(BatchSummary),
}

/// Final tally of one executed batch
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// A generated batch awaiting approval
#[derive(Debug)]
pub struct PlannedBatch {
    pub id: String,
    pub context: OrganizeContext,
    pub plan: OperationPlan,
}

/// Cooperative pause/cancel flags shared with callers
struct Control {
    paused: AtomicBool,
    cancelled: AtomicBool,
    resume: Notify,
}

/// Coordinator owning one user's organize sessions.
///
/// Owns neither store: destination memory and the drive registry live in
/// [`DestinationMemory`]; the coordinator only holds transient batch
/// state.
pub struct Coordinator {
    config: AppConfig,
    db: Database,
    memory: Arc<DestinationMemory>,
    generator: OperationGenerator,
    events: broadcast::Sender<OrganizerEvent>,
    control: Arc<Control>,
}

impl Coordinator {
    pub fn new(
        config: AppConfig,
        db: Database,
        memory: Arc<DestinationMemory>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let generator = OperationGenerator::new(provider, config.prompts.clone());
        Self {
            config,
            db,
            memory,
            generator,
            events,
            control: Arc::new(Control {
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                resume: Notify::new(),
            }),
        }
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrganizerEvent> {
        self.events.subscribe()
    }

    /// Stop dispatching new operations after the current one finishes.
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::SeqCst);
        info!("batch paused");
    }

    /// Resume a paused batch.
    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::SeqCst);
        self.control.resume.notify_waiters();
        info!("batch resumed");
    }

    /// Discard all queued operations. Completed operations are not
    /// undone; the current operation finishes first.
    pub fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.control.resume.notify_waiters();
        info!("batch cancelled");
    }

    /// Build the context, ask the AI, and validate its plan. No file is
    /// touched; the plan is published for preview.
    pub async fn plan(
        &self,
        source: &Path,
        destination_hint: Option<PathBuf>,
    ) -> Result<PlannedBatch> {
        // Apply drive changes the background monitor queued up.
        for change in self.memory.drain_drive_events()? {
            self.emit(if change.connected {
                OrganizerEvent::DriveConnected(change.record)
            } else {
                OrganizerEvent::DriveDisconnected(change.record)
            });
        }

        // First run on an empty registry discovers the current mounts.
        if self.memory.registry().list()?.is_empty() {
            self.memory.drives()?;
        }

        let builder = ContextBuilder::new(self.config.scan.clone());
        let context = builder.build(source, &self.memory, destination_hint)?;
        let plan = self.generator.generate(&context).await?;

        let id = uuid::Uuid::new_v4().to_string();
        self.emit(OrganizerEvent::BatchPlanned {
            batch_id: id.clone(),
            operation_count: plan.len(),
        });
        info!("planned batch {} with {} operations", id, plan.len());

        Ok(PlannedBatch { id, context, plan })
    }

    /// Execute an approved batch sequentially, emitting progress after
    /// every operation. Partial failures do not stop the batch.
    pub async fn execute(&self, batch: PlannedBatch) -> Result<BatchSummary> {
        let mut allowed_roots = vec![batch.context.source_root.clone()];
        if let Some(hint) = &batch.context.destination_hint {
            allowed_roots.push(hint.clone());
        }

        let executor = OperationExecutor::new(
            &self.config.user_id,
            self.db.clone(),
            self.memory.clone(),
            allowed_roots,
        );

        let categories: HashMap<PathBuf, String> = batch
            .context
            .files
            .iter()
            .filter_map(|f| f.category.clone().map(|c| (f.path.clone(), c)))
            .collect();

        let total = batch.plan.len();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        for (index, operation) in batch.plan.operations.iter().enumerate() {
            if self.control.cancelled.load(Ordering::SeqCst) {
                skipped = total - index;
                warn!("batch {} cancelled with {} operations left", batch.id, skipped);
                break;
            }

            // Cooperative pause between operations. The resume signal can
            // race the flag store, so re-check on a short interval too.
            while self.control.paused.load(Ordering::SeqCst)
                && !self.control.cancelled.load(Ordering::SeqCst)
            {
                let _ = tokio::time::timeout(
                    Duration::from_millis(100),
                    self.control.resume.notified(),
                )
                .await;
            }
            if self.control.cancelled.load(Ordering::SeqCst) {
                skipped = total - index;
                break;
            }

            self.emit(OrganizerEvent::OperationStarted {
                batch_id: batch.id.clone(),
                index,
                operation: operation.clone(),
            });

            let fallback = batch.plan.fallback_operations[index].as_ref();
            let results = executor.run(&batch.id, operation, fallback, &categories);

            let final_success = results.last().map(|r| r.success).unwrap_or(false);
            if final_success {
                succeeded += 1;
            } else {
                failed += 1;
            }

            for result in results {
                self.emit(OrganizerEvent::OperationCompleted {
                    batch_id: batch.id.clone(),
                    index,
                    result,
                });
            }
        }

        let summary = BatchSummary {
            batch_id: batch.id,
            succeeded,
            failed,
            skipped,
        };
        info!(
            "batch {} done: {} succeeded, {} failed, {} skipped",
            summary.batch_id, summary.succeeded, summary.failed, summary.skipped
        );
        self.emit(OrganizerEvent::BatchCompleted(summary.clone()));
        Ok(summary)
    }

    /// The full cycle: plan, then execute immediately. Callers wanting a
    /// preview step call [`Self::plan`] and [`Self::execute`] themselves.
    pub async fn run_cycle(
        &self,
        source: &Path,
        destination_hint: Option<PathBuf>,
    ) -> Result<BatchSummary> {
        let planned = self.plan(source, destination_hint).await?;
        self.execute(planned).await
    }

    fn emit(&self, event: OrganizerEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }
}
