//! # Reprocessing Loop
//!
//! Repeated claim → dispatch → drain cycles over a [`WorkSource`].
//!
//! ```text
//!  ┌──────────┐ batch ┌──────────┐ batch empty ┌────────────┐ in-flight == 0
//!  │ POLLING  │──────►│ DRAINING │────────────►│ IDLE_CHECK │──────────┐
//!  └──────────┘       └──────────┘             └────────────┘          │
//!     ▲   │ empty / claim error (pause)                                │
//!     └───┴────────────────────────────────────────────────────────────┘
//!                         shutdown ──► DONE
//! ```
//!
//! Every dispatch holds an [`AdmissionPermit`], so no more than
//! `max_concurrent` processor invocations run at once. A new claim is only
//! issued once the previous batch has fully drained. Per-item counters are
//! tallied by the coordinating task from the results of the spawned
//! invocations; the spawned tasks never touch shared counters.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::processor::{panic_message, ItemOutcome, Processor};
use super::work_source::{WorkItemId, WorkSource};
use crate::admission::{AdmissionController, AdmissionPermit};
use crate::config::ReprocessingConfig;
use crate::constants::events;
use crate::error::{ReprocessorError, Result};
use crate::logging::log_cycle_summary;
use crate::retry_policy::Backoff;
use crate::shutdown::ShutdownSignal;

/// Where the loop currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Polling,
    Draining,
    IdleCheck,
    Done,
}

/// Result of one non-empty claim-and-drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub batch_size: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Items left undispatched because the cycle was interrupted
    pub not_dispatched: usize,
    /// Shutdown (or a closed admission controller) stopped dispatch early
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn dispatched(&self) -> usize {
        self.success_count + self.error_count
    }
}

/// Totals over the lifetime of one [`ReprocessingLoop::run`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    pub cycles: u64,
    pub empty_polls: u64,
    pub claim_failures: u64,
    pub total_success: usize,
    pub total_errors: usize,
    pub peak_in_flight: usize,
}

impl LoopReport {
    fn record(&mut self, summary: &CycleSummary) {
        self.cycles += 1;
        self.total_success += summary.success_count;
        self.total_errors += summary.error_count;
    }
}

/// Bounded-concurrency claim-and-dispatch loop
pub struct ReprocessingLoop<S: ?Sized, P: ?Sized> {
    id: Uuid,
    source: Arc<S>,
    processor: Arc<P>,
    admission: AdmissionController,
    config: ReprocessingConfig,
    state: RwLock<LoopState>,
    cycles: AtomicU64,
}

impl<S, P> std::fmt::Debug for ReprocessingLoop<S, P>
where
    S: ?Sized,
    P: ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReprocessingLoop")
            .field("id", &self.id)
            .field("state", &*self.state.read())
            .field("admission", &self.admission)
            .field("config", &self.config)
            .finish()
    }
}

impl<S, P> ReprocessingLoop<S, P>
where
    S: WorkSource + ?Sized + 'static,
    P: Processor + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, processor: Arc<P>, config: ReprocessingConfig) -> Result<Self> {
        config.validate()?;
        let admission = AdmissionController::new(config.max_concurrent)?;

        Ok(Self {
            id: Uuid::new_v4(),
            source,
            processor,
            admission,
            config,
            state: RwLock::new(LoopState::Polling),
            cycles: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn config(&self) -> &ReprocessingConfig {
        &self.config
    }

    /// Run cycles until `shutdown` fires. A loop runs once; `Done` is final.
    ///
    /// Claim failures are retried with the configured backoff; the loop only
    /// gives up when a bounded `claim_retry` policy is exhausted. On shutdown
    /// no new work is claimed or admitted, in-flight items finish, then the
    /// loop returns.
    #[instrument(skip_all, fields(loop_id = %self.id))]
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<LoopReport> {
        if self.state() == LoopState::Done {
            return Err(ReprocessorError::ShutdownError(format!(
                "reprocessing loop {} has already stopped",
                self.id
            )));
        }

        info!(
            source = self.source.name(),
            max_results_to_load = self.config.max_results_to_load,
            max_concurrent = self.config.max_concurrent,
            "🚀 REPROCESSING: Loop starting"
        );

        let mut report = LoopReport::default();
        let mut claim_backoff = Backoff::new(self.config.claim_retry.clone());

        let outcome = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            match self.run_cycle(&shutdown).await {
                Ok(Some(summary)) => {
                    claim_backoff.reset();
                    report.record(&summary);
                    if summary.interrupted {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    claim_backoff.reset();
                    report.empty_polls += 1;
                    let pause = self.config.empty_poll_interval();
                    if pause.is_zero() {
                        tokio::task::yield_now().await;
                    } else if sleep_or_shutdown(pause, &shutdown).await {
                        break Ok(());
                    }
                }
                Err(ReprocessorError::ClaimError(message)) => {
                    report.claim_failures += 1;
                    let delay = claim_backoff.next_delay();
                    if !claim_backoff.can_retry() {
                        error!(
                            event = events::CLAIM_FAILED,
                            consecutive_failures = claim_backoff.consecutive_failures(),
                            error = %message,
                            "❌ REPROCESSING: Claim retries exhausted - stopping loop"
                        );
                        break Err(ReprocessorError::ClaimError(message));
                    }
                    warn!(
                        event = events::CLAIM_FAILED,
                        consecutive_failures = claim_backoff.consecutive_failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "⚠️ REPROCESSING: Claim failed - backing off"
                    );
                    if sleep_or_shutdown(delay, &shutdown).await {
                        break Ok(());
                    }
                }
                Err(other) => break Err(other),
            }
        };

        self.set_state(LoopState::Done);
        self.admission.close();
        report.peak_in_flight = self.admission.peak_in_flight();

        match &outcome {
            Ok(()) => info!(
                cycles = report.cycles,
                total_success = report.total_success,
                total_errors = report.total_errors,
                peak_in_flight = report.peak_in_flight,
                "🛑 REPROCESSING: Loop stopped"
            ),
            Err(e) => error!(error = %e, cycles = report.cycles, "❌ REPROCESSING: Loop failed"),
        }

        outcome.map(|()| report)
    }

    /// One POLLING step followed, for a non-empty batch, by a full drain.
    ///
    /// Returns `Ok(None)` when nothing was claimable. A failed claim surfaces as
    /// [`ReprocessorError::ClaimError`]; it has not dispatched anything.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> Result<Option<CycleSummary>> {
        self.set_state(LoopState::Polling);

        let batch = self
            .source
            .claim_batch(self.config.max_results_to_load)
            .await
            .map_err(|e| ReprocessorError::ClaimError(e.to_string()))?;

        if batch.is_empty() {
            debug!(source = self.source.name(), "No claimable items");
            return Ok(None);
        }

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let summary = self.drain(cycle, batch, shutdown).await;
        log_cycle_summary(&summary);
        Ok(Some(summary))
    }

    async fn drain(
        &self,
        cycle: u64,
        mut batch: Vec<WorkItemId>,
        shutdown: &ShutdownSignal,
    ) -> CycleSummary {
        self.set_state(LoopState::Draining);
        debug!(
            event = events::CYCLE_STARTED,
            cycle,
            batch_size = batch.len(),
            "Draining claimed batch"
        );

        let mut summary = CycleSummary {
            cycle,
            batch_size: batch.len(),
            ..CycleSummary::default()
        };
        let mut in_flight: JoinSet<(WorkItemId, ItemOutcome)> = JoinSet::new();

        while let Some(item) = batch.pop() {
            while let Some(joined) = in_flight.try_join_next() {
                tally(&mut summary, joined);
            }

            if shutdown.is_triggered() {
                batch.push(item);
                summary.interrupted = true;
                break;
            }

            let admitted = tokio::select! {
                biased;
                _ = shutdown.triggered() => None,
                permit = self.admission.acquire() => permit.ok(),
            };
            let Some(permit) = admitted else {
                batch.push(item);
                summary.interrupted = true;
                break;
            };

            let processor = Arc::clone(&self.processor);
            let timeout = self.config.item_timeout();
            in_flight.spawn(process_item(processor, item, permit, timeout));
        }
        summary.not_dispatched = batch.len();

        if summary.interrupted {
            info!(
                cycle,
                not_dispatched = summary.not_dispatched,
                in_flight = in_flight.len(),
                "🛑 REPROCESSING: Dispatch stopped - waiting for in-flight items"
            );
        }

        self.set_state(LoopState::IdleCheck);
        while let Some(joined) = in_flight.join_next().await {
            tally(&mut summary, joined);
        }
        // Every slot is back before the next claim
        self.admission.wait_idle().await;

        summary
    }

    fn set_state(&self, next: LoopState) {
        *self.state.write() = next;
    }
}

/// Invoke the processor for one item, holding its admission slot throughout.
///
/// The slot is released before the outcome is reported.
async fn process_item<P>(
    processor: Arc<P>,
    item: WorkItemId,
    permit: AdmissionPermit,
    timeout: Option<Duration>,
) -> (WorkItemId, ItemOutcome)
where
    P: Processor + ?Sized,
{
    let outcome = {
        let invocation = AssertUnwindSafe(processor.process(&item)).catch_unwind();
        let caught = match timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(caught) => Ok(caught),
                Err(_) => Err(limit),
            },
            None => Ok(invocation.await),
        };
        match caught {
            Ok(Ok(result)) => ItemOutcome::from(result),
            Ok(Err(payload)) => ItemOutcome::Panicked(panic_message(payload.as_ref())),
            Err(limit) => ItemOutcome::TimedOut(limit),
        }
    };

    permit.release();
    (item, outcome)
}

fn tally(
    summary: &mut CycleSummary,
    joined: std::result::Result<(WorkItemId, ItemOutcome), JoinError>,
) {
    match joined {
        Ok((_, ItemOutcome::Succeeded)) => summary.success_count += 1,
        Ok((item, outcome)) => {
            summary.error_count += 1;
            warn!(
                event = events::ITEM_FAILED,
                cycle = summary.cycle,
                item_id = %item,
                error = %outcome.error_message().unwrap_or_default(),
                "⚠️ REPROCESSING: Item processing failed"
            );
        }
        Err(join_error) => {
            summary.error_count += 1;
            error!(
                event = events::ITEM_FAILED,
                cycle = summary.cycle,
                error = %join_error,
                "❌ REPROCESSING: Item task did not complete"
            );
        }
    }
}

/// Sleep for `duration`; `true` when shutdown fired first
async fn sleep_or_shutdown(duration: Duration, shutdown: &ShutdownSignal) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.triggered() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
