//! Shared doubles for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reprocessor_core::config::ReprocessingConfig;
use reprocessor_core::reprocessing::{
    ClaimError, InMemoryWorkSource, ProcessingFailure, Processor, WorkItemId, WorkSource,
};

pub fn item_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("item-{i}")).collect()
}

/// Reference limits with a short empty-batch pause
pub fn loop_config(max_results_to_load: usize, max_concurrent: usize) -> ReprocessingConfig {
    ReprocessingConfig {
        max_results_to_load,
        max_concurrent,
        empty_poll_interval_ms: 5,
        ..ReprocessingConfig::default()
    }
}

/// Processor that records concurrency and resolves items in the work source
pub struct TrackingProcessor {
    source: Arc<InMemoryWorkSource>,
    failing: HashSet<WorkItemId>,
    panicking: HashSet<WorkItemId>,
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
    processed: Mutex<Vec<WorkItemId>>,
}

impl TrackingProcessor {
    pub fn new(source: Arc<InMemoryWorkSource>) -> Self {
        Self {
            source,
            failing: HashSet::new(),
            panicking: HashSet::new(),
            delay: Duration::from_millis(5),
            current: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            processed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<WorkItemId>,
    {
        self.failing = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn panicking<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<WorkItemId>,
    {
        self.panicking = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared view of the in-flight count
    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.current)
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> Vec<WorkItemId> {
        self.processed.lock().clone()
    }
}

/// Decrements the in-flight counter on every exit path, panics included
struct InFlightGuard<'a> {
    current: &'a AtomicUsize,
    completed: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for TrackingProcessor {
    async fn process(&self, item: &WorkItemId) -> Result<(), ProcessingFailure> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard {
            current: &self.current,
            completed: &self.completed,
        };

        tokio::time::sleep(self.delay).await;

        if self.panicking.contains(item) {
            panic!("processor crashed on {item}");
        }

        self.processed.lock().push(item.clone());
        // Failed or not, the processor records the terminal state
        self.source.mark_processed(item);

        if self.failing.contains(item) {
            Err(ProcessingFailure::new(format!("{item} is malformed")))
        } else {
            Ok(())
        }
    }
}

/// Work source wrapper that records every claim and checks nothing is in flight
pub struct GuardedWorkSource {
    inner: Arc<InMemoryWorkSource>,
    in_flight: Arc<AtomicUsize>,
    violations: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl GuardedWorkSource {
    pub fn new(inner: Arc<InMemoryWorkSource>, in_flight: Arc<AtomicUsize>) -> Self {
        Self {
            inner,
            in_flight,
            violations: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Claims issued while an item was still being processed
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

#[async_trait]
impl WorkSource for GuardedWorkSource {
    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItemId>, ClaimError> {
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let batch = self.inner.claim_batch(max_count).await?;
        self.batch_sizes.lock().push(batch.len());
        Ok(batch)
    }

    fn name(&self) -> &str {
        "guarded"
    }
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .is_ok()
}
