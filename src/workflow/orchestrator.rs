//! Workflow orchestrator: runs the approval sequence for one workflow
//! type as a single background task, with pause/resume/stop control and
//! transparent recovery from a dead automation driver.
//!
//! Control commands arrive from request handlers while the run loop is
//! awaiting driver operations; they communicate through the shared run
//! snapshot and two flags. Flags are re-checked after every suspension
//! point, not just before it.

use crate::config::WorkflowConfig;
use crate::driver::{DriverAdapter, DriverError, DriverResult};
use crate::events::{EventBus, ServerEvent};
use crate::workflow::schema::{
    ItemOutcome, Progress, RunStatus, WorkflowRun, WorkflowStep, WorkflowType,
    PAUSE_REASON_DISCONNECTED,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One orchestrator per workflow type; exactly one live run at a time.
pub struct Orchestrator {
    /// Back-reference handed to the spawned run task.
    me: Weak<Self>,
    workflow: WorkflowType,
    run: RwLock<WorkflowRun>,
    /// Cooperative cancellation; checked at loop top, after the pause
    /// wait, and after driver re-acquisition.
    cancel: AtomicBool,
    pause: AtomicBool,
    /// Token that authorized the current run; every published event
    /// carries it as the routing key.
    token: Mutex<Option<String>>,
    driver: Arc<dyn DriverAdapter>,
    /// Shared across both orchestrator instances: the driver is owned by
    /// at most one run at a time, so concurrent starts serialize here.
    driver_slot: Arc<tokio::sync::Mutex<()>>,
    bus: Arc<EventBus>,
    cfg: WorkflowConfig,
}

impl Orchestrator {
    pub fn new(
        workflow: WorkflowType,
        driver: Arc<dyn DriverAdapter>,
        driver_slot: Arc<tokio::sync::Mutex<()>>,
        bus: Arc<EventBus>,
        cfg: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            workflow,
            run: RwLock::new(WorkflowRun::idle()),
            cancel: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            token: Mutex::new(None),
            driver,
            driver_slot,
            bus,
            cfg,
        })
    }

    pub fn workflow(&self) -> WorkflowType {
        self.workflow
    }

    /// Read-only snapshot; never blocks on the run loop, never mutates.
    pub fn get_status(&self) -> WorkflowRun {
        self.run.read().clone()
    }

    /// Accept a new run and spawn its background task. Rejected while a
    /// run is in progress (running or paused) so results are never reset
    /// under a live run, and rejected from `error` until an explicit
    /// reset acknowledges the failure.
    pub fn start(
        &self,
        items: Vec<String>,
        token: String,
        context_hint: Option<String>,
    ) -> Result<(), String> {
        if items.is_empty() {
            return Err("item list is empty".to_string());
        }
        let Some(orch) = self.me.upgrade() else {
            return Err("orchestrator is shutting down".to_string());
        };

        {
            let mut run = self.run.write();
            match run.status {
                RunStatus::Running | RunStatus::Paused => {
                    return Err("a run is already in progress".to_string());
                }
                // An errored run must be inspected and reset before reuse.
                RunStatus::Error => {
                    return Err("previous run ended in error; reset first".to_string());
                }
                _ => {}
            }
            *run = WorkflowRun::idle();
            run.status = RunStatus::Running;
            run.set_step(WorkflowStep::AcquiringDriver);
            run.progress = Some(Progress {
                current: 0,
                total: items.len(),
                current_item_id: items[0].clone(),
            });
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.pause.store(false, Ordering::SeqCst);
        *self.token.lock() = Some(token);
        self.publish_progress();

        tracing::info!(
            "{} workflow started with {} item(s)",
            self.workflow.as_str(),
            items.len()
        );

        tokio::spawn(async move {
            orch.run_loop(items, context_hint).await;
        });
        Ok(())
    }

    /// Request a pause. Takes effect between items: the loop finishes the
    /// current item first, then flips to paused. No-op unless running.
    pub fn pause(&self, reason: Option<String>) {
        let mut run = self.run.write();
        if run.status != RunStatus::Running {
            return;
        }
        run.results.pause_reason = reason;
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Resume a paused run. The loop continues from the same item index
    /// that was in progress, not the next one.
    pub fn resume(&self) {
        {
            let mut run = self.run.write();
            if run.status != RunStatus::Paused {
                return;
            }
            run.status = RunStatus::Running;
            run.results.pause_reason = None;
        }
        self.pause.store(false, Ordering::SeqCst);
        self.publish_progress();
    }

    /// Cancel the run from running or paused. Cooperative: an in-flight
    /// item finishes (bounded by its own timeout) before this takes effect.
    pub fn stop(&self) {
        {
            let run = self.run.read();
            if !matches!(run.status, RunStatus::Running | RunStatus::Paused) {
                return;
            }
        }
        self.cancel.store(true, Ordering::SeqCst);
        // Wake the pause wait so cancellation is observed promptly.
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Return to idle and clear results. Only valid when no run is live.
    pub fn reset(&self) -> Result<(), String> {
        {
            let mut run = self.run.write();
            if matches!(run.status, RunStatus::Running | RunStatus::Paused) {
                return Err("cannot reset while a run is in progress".to_string());
            }
            *run = WorkflowRun::idle();
        }
        self.publish_progress();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------

    async fn run_loop(self: Arc<Self>, items: Vec<String>, _context_hint: Option<String>) {
        // Exclusive driver ownership for the whole run.
        let _slot = Arc::clone(&self.driver_slot).lock_owned().await;

        if self.cancelled() {
            return self.finalize_cancelled().await;
        }

        let total = items.len();
        let mut index = 0;

        while index < total {
            if self.cancelled() {
                return self.finalize_cancelled().await;
            }

            // Bounded poll until resumed or cancelled.
            if !self.wait_while_paused().await {
                return self.finalize_cancelled().await;
            }

            // Transparent driver (re)acquisition: not a pause, not an error.
            if !self.driver.is_alive().await {
                self.set_step(WorkflowStep::AcquiringDriver);
                let recovered = self.driver.ensure_ready().await;
                // stop() during recovery wins as soon as the attempt settles.
                if self.cancelled() {
                    return self.finalize_cancelled().await;
                }
                if let Err(e) = recovered {
                    tracing::warn!(
                        "{} workflow: driver re-acquisition failed: {}",
                        self.workflow.as_str(),
                        e
                    );
                    self.auto_pause();
                    continue; // same index, back to the pause wait
                }
            }

            let item_id = items[index].clone();
            {
                let mut run = self.run.write();
                run.progress = Some(Progress {
                    current: index + 1,
                    total,
                    current_item_id: item_id.clone(),
                });
            }
            self.publish_progress();

            let attempt = tokio::time::timeout(
                Duration::from_millis(self.cfg.item_timeout_ms),
                self.process_item(&item_id),
            )
            .await
            .unwrap_or_else(|_| Err(DriverError::Timeout(self.cfg.item_timeout_ms)));

            match attempt {
                Ok(()) => {
                    {
                        let mut run = self.run.write();
                        run.results
                            .transaction_results
                            .insert(item_id.clone(), ItemOutcome::Approved);
                        run.results.approved_count += 1;
                    }
                    self.publish_progress();
                    index += 1;
                    self.inter_item_delay(index, total).await;
                }
                Err(e) if e.is_disconnection() => {
                    tracing::warn!(
                        "{} workflow lost the driver on item {}: {}",
                        self.workflow.as_str(),
                        item_id,
                        e
                    );
                    // Partial results stay as they are; the same item is
                    // retried after resume, neither approved nor failed yet.
                    self.auto_pause();
                }
                Err(DriverError::Other(msg)) => {
                    tracing::error!(
                        "{} workflow aborted on item {}: {}",
                        self.workflow.as_str(),
                        item_id,
                        msg
                    );
                    return self.finalize_error(msg).await;
                }
                Err(e) => {
                    // Business rejection or per-item timeout: record and
                    // move on. The run itself does not stop.
                    tracing::debug!(
                        "{} workflow: item {} failed: {}",
                        self.workflow.as_str(),
                        item_id,
                        e
                    );
                    {
                        let mut run = self.run.write();
                        run.results
                            .transaction_results
                            .insert(item_id.clone(), ItemOutcome::Error);
                        run.results.error_count += 1;
                    }
                    self.publish_progress();
                    index += 1;
                    self.inter_item_delay(index, total).await;
                }
            }
        }

        {
            let mut run = self.run.write();
            run.status = RunStatus::Completed;
            run.set_step(WorkflowStep::Finalizing);
        }
        self.publish_progress();
        tracing::info!("{} workflow completed", self.workflow.as_str());
    }

    /// navigate → act → confirm → verify for one work item.
    async fn process_item(&self, item_id: &str) -> DriverResult<()> {
        self.set_step(WorkflowStep::Navigating);
        self.driver
            .navigate(&self.workflow.item_path(item_id))
            .await?;

        self.set_step(WorkflowStep::Approving);
        self.driver.click(self.workflow.action_selector()).await?;

        self.set_step(WorkflowStep::SubmittingRecord);
        self.driver.click(self.workflow.confirm_selector()).await?;

        self.set_step(WorkflowStep::Verifying);
        self.driver
            .wait_for(self.workflow.verify_selector(), self.cfg.item_timeout_ms)
            .await?;

        Ok(())
    }

    /// Returns false if cancellation arrived during the wait.
    async fn wait_while_paused(&self) -> bool {
        loop {
            if self.cancelled() {
                return false;
            }
            if !self.pause.load(Ordering::SeqCst) {
                return true;
            }

            // A requested pause becomes effective here, between items.
            let became_paused = {
                let mut run = self.run.write();
                if run.status == RunStatus::Running {
                    run.status = RunStatus::Paused;
                    true
                } else {
                    false
                }
            };
            if became_paused {
                tracing::info!("{} workflow paused", self.workflow.as_str());
                self.publish_progress();
            }

            tokio::time::sleep(Duration::from_millis(self.cfg.pause_poll_ms)).await;
        }
    }

    /// Disconnection-class failure: flip to paused with the fixed reason
    /// code and keep partial results. Recovered by resume().
    fn auto_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        {
            let mut run = self.run.write();
            run.status = RunStatus::Paused;
            run.results.pause_reason = Some(PAUSE_REASON_DISCONNECTED.to_string());
        }
        self.publish_progress();
    }

    async fn inter_item_delay(&self, next_index: usize, total: usize) {
        // Skipped after the last item.
        if next_index < total && self.cfg.inter_item_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_item_delay_ms)).await;
        }
    }

    async fn finalize_cancelled(&self) {
        self.driver.close().await;
        {
            let mut run = self.run.write();
            run.status = RunStatus::Cancelled;
        }
        self.publish_progress();
        tracing::info!("{} workflow cancelled", self.workflow.as_str());
    }

    async fn finalize_error(&self, message: String) {
        {
            let mut run = self.run.write();
            run.status = RunStatus::Error;
            run.error = Some(message);
        }
        self.publish_progress();
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_step(&self, step: WorkflowStep) {
        {
            let mut run = self.run.write();
            run.set_step(step);
        }
        self.publish_progress();
    }

    fn publish_progress(&self) {
        let token = self.token.lock().clone();
        let Some(token) = token else {
            return;
        };
        let run = self.run.read().clone();
        self.bus.publish(&ServerEvent::WorkflowProgress {
            token,
            workflow: self.workflow,
            run,
        });
    }
}
