mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{loop_config, TrackingProcessor};
use proptest::prelude::*;
use reprocessor_core::admission::AdmissionController;
use reprocessor_core::reprocessing::{InMemoryWorkSource, ReprocessingLoop, WorkSource};
use reprocessor_core::shutdown::ShutdownSignal;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: in-flight holders never exceed the ceiling under contention
    #[test]
    fn admission_never_exceeds_ceiling(ceiling in 1usize..6, jobs in 1usize..40) {
        let peak = runtime().block_on(async move {
            let admission = AdmissionController::new(ceiling).unwrap();
            let mut handles = Vec::new();
            for _ in 0..jobs {
                let admission = admission.clone();
                handles.push(tokio::spawn(async move {
                    let permit = admission.acquire().await.unwrap();
                    tokio::task::yield_now().await;
                    permit.release();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(admission.in_flight(), 0);
            admission.peak_in_flight()
        });
        prop_assert!(peak <= ceiling, "peak {} exceeded ceiling {}", peak, ceiling);
    }

    /// Property: successive claims never hand out an item twice while leases hold
    #[test]
    fn claims_are_disjoint(items in 0usize..60, batch_sizes in prop::collection::vec(1usize..12, 1..20)) {
        let claimed = runtime().block_on(async move {
            let source = InMemoryWorkSource::with_items((0..items).map(|i| format!("r-{i}")));
            let mut claimed = Vec::new();
            for size in batch_sizes {
                let batch = source.claim_batch(size).await.unwrap();
                assert!(batch.len() <= size);
                claimed.extend(batch);
            }
            claimed
        });
        let unique: HashSet<_> = claimed.iter().cloned().collect();
        prop_assert_eq!(unique.len(), claimed.len());
        prop_assert!(claimed.len() <= items);
    }

    /// Property: success + error == N and error == F after one drain
    #[test]
    fn cycle_counters_add_up(total in 1usize..12, failures in prop::collection::hash_set(1usize..12, 0..6), ceiling in 1usize..4) {
        let failing: Vec<String> = failures
            .iter()
            .filter(|&&n| n <= total)
            .map(|n| format!("item-{n}"))
            .collect();
        let expected_failures = failing.len();

        let summary = runtime().block_on(async move {
            let source = Arc::new(InMemoryWorkSource::with_items(common::item_ids(total)));
            let processor = Arc::new(
                TrackingProcessor::new(source.clone())
                    .failing(failing)
                    .with_delay(Duration::from_millis(1)),
            );
            let reprocessing =
                ReprocessingLoop::new(source, processor.clone(), loop_config(total, ceiling)).unwrap();
            let summary = reprocessing
                .run_cycle(&ShutdownSignal::never())
                .await
                .unwrap()
                .unwrap();
            assert!(processor.peak() <= ceiling);
            summary
        });

        prop_assert_eq!(summary.batch_size, total);
        prop_assert_eq!(summary.success_count + summary.error_count, total);
        prop_assert_eq!(summary.error_count, expected_failures);
    }
}
