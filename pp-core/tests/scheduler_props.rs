use std::collections::HashMap;

use chrono::NaiveDate;
use pp_core::scheduler::BackfillScheduler;
use pp_core::types::{BackfillJob, BackfillOptions, DateRange, Granularity, JobId, ProviderId};
use proptest::prelude::*;
use pp_types::BackfillSchedulerConfig;

fn job_with_priority(job_id: u64, priority: i32) -> BackfillJob {
    BackfillJob {
        id: JobId(job_id),
        granularity: Granularity::Daily,
        symbols: vec![format!("SYM{job_id}")],
        range: DateRange {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        },
        preferred_providers: vec![ProviderId::new("only-provider")],
        options: BackfillOptions {
            batch_size_days: 30,
            max_retries: 3,
            priority,
        },
        progress: HashMap::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Any two admissible requests dequeue in ascending priority order,
    /// regardless of enqueue order, as long as neither is blocked by a
    /// concurrency limit.
    #[test]
    fn lower_priority_always_dequeues_before_higher(
        priorities in proptest::collection::hash_set(-1000i32..1000i32, 2..12),
    ) {
        let mut priorities: Vec<i32> = priorities.into_iter().collect();
        // Enqueue in an arbitrary (reversed) order to prove dequeue order
        // doesn't depend on insertion order.
        let enqueue_order = priorities.clone();

        let scheduler = BackfillScheduler::new(&BackfillSchedulerConfig {
            batch_size_days: 30,
            max_retries: 3,
            max_concurrent_requests: priorities.len() as u32,
            max_concurrent_per_provider: priorities.len() as u32,
        });

        for (idx, priority) in enqueue_order.iter().enumerate() {
            let job = job_with_priority(idx as u64, *priority);
            let mut gaps = HashMap::new();
            gaps.insert(job.symbols[0].clone(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
            scheduler.enqueue_job(&job, &gaps);
        }

        let mut dequeued_priorities = Vec::new();
        while let Some(request) = scheduler.try_dequeue_runnable() {
            dequeued_priorities.push(request.priority);
        }

        priorities.sort_unstable();
        prop_assert_eq!(dequeued_priorities, priorities);
    }
}
