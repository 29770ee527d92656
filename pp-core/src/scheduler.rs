//! Backfill scheduler (C6): priority-ordered dispatch of historical-bar
//! fetch requests across providers, with bounded global and per-provider
//! concurrency and a completion channel callers drain asynchronously.
//!
//! The queue itself never performs I/O: callers pull runnable requests with
//! [`BackfillScheduler::try_dequeue_runnable`], perform the fetch themselves,
//! and report the outcome back through
//! [`BackfillScheduler::complete_request`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use pp_types::BackfillSchedulerConfig;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::types::{BackfillJob, BackfillRequest, DateRange, JobId, ProviderId, RequestId, RequestStatus};

const COMPLETION_CHANNEL_CAPACITY: usize = 500;
const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Point-in-time counters for the scheduler's internal queues.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStatistics {
    /// Requests waiting for a free provider slot.
    pub pending: usize,
    /// Requests currently dispatched.
    pub in_flight: usize,
    /// Requests completed successfully over the scheduler's lifetime.
    pub completed: u64,
    /// Requests that terminally failed over the scheduler's lifetime.
    pub failed: u64,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    request: BackfillRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert priority (lower value = sooner) and
        // break ties by earlier sequence number so admission is FIFO.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Split a (possibly sparse) set of missing session dates into contiguous
/// ranges, each no wider than `batch_size_days`.
fn consolidate_gaps(mut dates: Vec<NaiveDate>, batch_size_days: u32) -> Vec<DateRange> {
    dates.sort();
    dates.dedup();
    let batch_size_days = i64::from(batch_size_days.max(1));
    let mut ranges = Vec::new();
    let mut iter = dates.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            let contiguous = (next - end).num_days() == 1;
            let within_batch = (next - start).num_days() < batch_size_days;
            if contiguous && within_batch {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        ranges.push(DateRange { from: start, to: end });
    }
    ranges
}

/// Substrings that mark a backfill error as terminal regardless of remaining
/// retries: the request itself is wrong, not the provider's momentary state.
const NON_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "not found",
    "404",
    "invalid symbol",
    "authentication failed",
    "403",
    "unauthorized",
    "401",
];

fn is_non_retryable(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    NON_RETRYABLE_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

/// `priority = basePriority + min(50, daysAgo/30) + 5*failedCount`, lower is
/// dispatched sooner.
fn compute_priority(base_priority: i32, range_to: NaiveDate, failed_count: u32, today: NaiveDate) -> i32 {
    let days_ago = (today - range_to).num_days().max(0);
    let recency_penalty = i32::try_from(days_ago / 30).unwrap_or(i32::MAX).min(50);
    base_priority + recency_penalty + 5 * i32::try_from(failed_count).unwrap_or(i32::MAX)
}

/// Thread-safe priority queue and dispatch tracker for backfill requests.
pub struct BackfillScheduler {
    batch_size_days: u32,
    max_concurrent_requests: u32,
    max_concurrent_per_provider: u32,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    in_flight: Mutex<HashMap<RequestId, BackfillRequest>>,
    active_per_provider: Mutex<HashMap<ProviderId, u32>>,
    cooldown_until: Mutex<HashMap<ProviderId, DateTime<Utc>>>,
    next_request_id: AtomicU64,
    next_seq: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    completions_tx: mpsc::Sender<BackfillRequest>,
    completions_rx: AsyncMutex<mpsc::Receiver<BackfillRequest>>,
}

impl BackfillScheduler {
    /// Construct an empty scheduler from its configuration.
    #[must_use]
    pub fn new(config: &BackfillSchedulerConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            batch_size_days: config.batch_size_days,
            max_concurrent_requests: config.max_concurrent_requests,
            max_concurrent_per_provider: config.max_concurrent_per_provider,
            queue: Mutex::new(BinaryHeap::new()),
            in_flight: Mutex::new(HashMap::new()),
            active_per_provider: Mutex::new(HashMap::new()),
            cooldown_until: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            completions_tx,
            completions_rx: AsyncMutex::new(completions_rx),
        }
    }

    /// Enqueue requests covering `job`'s gaps, one per consolidated date
    /// range per symbol. `gaps` maps each symbol to its missing session
    /// dates. Returns the ids of the requests created.
    pub fn enqueue_job(&self, job: &BackfillJob, gaps: &HashMap<String, Vec<NaiveDate>>) -> Vec<RequestId> {
        let today = Utc::now().date_naive();
        let batch_size_days = self.batch_size_days.min(job.options.batch_size_days).max(1);
        let mut ids = Vec::new();
        let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
        for symbol in &job.symbols {
            let Some(dates) = gaps.get(symbol) else {
                continue;
            };
            if dates.is_empty() {
                continue;
            }
            for range in consolidate_gaps(dates.clone(), batch_size_days) {
                let id = RequestId(self.next_request_id.fetch_add(1, AtomicOrdering::Relaxed));
                let priority = compute_priority(job.options.priority, range.to, 0, today);
                let request = BackfillRequest {
                    id,
                    job_id: job.id,
                    symbol: symbol.clone(),
                    from: range.from,
                    to: range.to,
                    granularity: job.granularity,
                    preferred_providers: job.preferred_providers.clone(),
                    assigned_provider: None,
                    priority,
                    max_retries: job.options.max_retries,
                    retry_count: 0,
                    status: RequestStatus::Pending,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    error: None,
                    bars_retrieved: 0,
                };
                let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                ids.push(id);
                queue.push(QueueEntry { priority, seq, request });
            }
        }
        ids
    }

    /// Pop the highest-priority request whose preferred provider still has a
    /// free concurrency slot, assign it to that provider, and mark it
    /// in-flight. Returns `None` if the queue is empty or every candidate is
    /// currently blocked by a concurrency limit.
    pub fn try_dequeue_runnable(&self) -> Option<BackfillRequest> {
        let mut in_flight = self.in_flight.lock().expect("scheduler in-flight lock poisoned");
        if in_flight.len() >= self.max_concurrent_requests as usize {
            return None;
        }
        let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
        let mut active = self
            .active_per_provider
            .lock()
            .expect("scheduler active-provider lock poisoned");
        let cooldowns = self.cooldown_until.lock().expect("scheduler cooldown lock poisoned");
        let now = Utc::now();

        let mut deferred = Vec::new();
        let mut picked = None;
        while let Some(entry) = queue.pop() {
            let provider = entry.request.preferred_providers.iter().copied().find(|p| {
                active.get(p).copied().unwrap_or(0) < self.max_concurrent_per_provider
                    && cooldowns.get(p).is_none_or(|until| now >= *until)
            });
            match provider {
                Some(provider) => {
                    let mut request = entry.request;
                    request.assigned_provider = Some(provider);
                    request.status = RequestStatus::InProgress;
                    request.started_at = Some(Utc::now());
                    *active.entry(provider).or_insert(0) += 1;
                    in_flight.insert(request.id, request.clone());
                    picked = Some(request);
                    break;
                }
                None => deferred.push(entry),
            }
        }
        for entry in deferred {
            queue.push(entry);
        }
        picked
    }

    /// Report the outcome of a dispatched request. On success, or once
    /// retries are exhausted, the terminal request is pushed onto the
    /// completion channel; otherwise it is requeued with an increased
    /// priority value (sooner requests still win, but repeated failures sink
    /// behind fresher work).
    ///
    /// Awaits if the completion channel is momentarily full rather than
    /// dropping the notification: callers are expected to keep draining
    /// [`Self::next_completed`].
    pub async fn complete_request(
        &self,
        request_id: RequestId,
        success: bool,
        error: Option<String>,
        bars_retrieved: u32,
    ) {
        let Some(mut request) = self
            .in_flight
            .lock()
            .expect("scheduler in-flight lock poisoned")
            .remove(&request_id)
        else {
            return;
        };
        if let Some(provider) = request.assigned_provider {
            let mut active = self
                .active_per_provider
                .lock()
                .expect("scheduler active-provider lock poisoned");
            if let Some(count) = active.get_mut(&provider) {
                *count = count.saturating_sub(1);
            }
        }
        request.completed_at = Some(Utc::now());
        request.bars_retrieved = bars_retrieved;

        if success {
            request.status = RequestStatus::Completed;
            self.completed.fetch_add(1, AtomicOrdering::Relaxed);
            let _ = self.completions_tx.send(request).await;
            return;
        }

        request.retry_count += 1;
        let non_retryable = error.as_deref().is_some_and(is_non_retryable);
        request.error = error;
        if non_retryable || request.retry_count >= request.max_retries {
            request.status = RequestStatus::Failed;
            self.failed.fetch_add(1, AtomicOrdering::Relaxed);
            let _ = self.completions_tx.send(request).await;
        } else {
            request.status = RequestStatus::Pending;
            request.assigned_provider = None;
            request.priority += 10;
            let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            self.queue.lock().expect("scheduler queue lock poisoned").push(QueueEntry {
                priority: request.priority,
                seq,
                request,
            });
        }
    }

    /// Record a 429-equivalent against `provider`, blocking it from
    /// `try_dequeue_runnable` admission until `cooldown` (default 60s)
    /// elapses. Cooperates with the rate-limit governor (C2): both register
    /// the same event independently, one gating scheduler admission, the
    /// other gating the provider's own request budget.
    pub fn record_provider_rate_limit_hit(&self, provider: ProviderId, cooldown: Option<Duration>) {
        let until = Utc::now()
            + chrono::Duration::from_std(cooldown.unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.cooldown_until
            .lock()
            .expect("scheduler cooldown lock poisoned")
            .insert(provider, until);
    }

    /// Mark every pending and in-flight request belonging to `job_id` as
    /// cancelled. In-flight HTTP calls are not interrupted; their eventual
    /// `complete_request` call simply lands on an already-cancelled request
    /// bookkeeping entry and is a no-op (the request was already removed from
    /// `in_flight` by this call).
    pub async fn cancel_job(&self, job_id: JobId) {
        let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
        let (remaining, cancelled): (Vec<QueueEntry>, Vec<QueueEntry>) = std::mem::take(&mut *queue)
            .into_iter()
            .map(|mut entry| {
                if entry.request.job_id == job_id {
                    entry.request.status = RequestStatus::Cancelled;
                }
                entry
            })
            .partition(|entry| entry.request.job_id != job_id);
        *queue = remaining.into_iter().collect();
        drop(queue);
        let mut cancelled: Vec<BackfillRequest> = cancelled.into_iter().map(|entry| entry.request).collect();

        let mut in_flight = self.in_flight.lock().expect("scheduler in-flight lock poisoned");
        let cancelled_ids: Vec<RequestId> = in_flight
            .values()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.id)
            .collect();
        for id in cancelled_ids {
            if let Some(mut request) = in_flight.remove(&id) {
                request.status = RequestStatus::Cancelled;
                cancelled.push(request);
            }
        }
        drop(in_flight);

        for request in cancelled {
            let _ = self.completions_tx.send(request).await;
        }
    }

    /// A point-in-time snapshot of queue depth and lifetime counters.
    pub fn get_statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            pending: self.queue.lock().expect("scheduler queue lock poisoned").len(),
            in_flight: self
                .in_flight
                .lock()
                .expect("scheduler in-flight lock poisoned")
                .len(),
            completed: self.completed.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
        }
    }

    /// Await the next terminal (completed, failed, or cancelled) request.
    /// Returns `None` once every sender has been dropped.
    pub async fn next_completed(&self) -> Option<BackfillRequest> {
        self.completions_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackfillOptions, Granularity};
    use std::collections::HashMap as Map;

    fn job(symbols: &[&str]) -> BackfillJob {
        BackfillJob {
            id: JobId(1),
            granularity: Granularity::Daily,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            range: DateRange {
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            },
            preferred_providers: vec![ProviderId::new("alpaca")],
            options: BackfillOptions::default(),
            progress: Map::new(),
        }
    }

    fn scheduler() -> BackfillScheduler {
        BackfillScheduler::new(&BackfillSchedulerConfig {
            batch_size_days: 30,
            max_retries: 3,
            max_concurrent_requests: 16,
            max_concurrent_per_provider: 2,
        })
    }

    #[test]
    fn consolidates_contiguous_gaps_and_splits_on_batch_width() {
        let dates: Vec<NaiveDate> = (1..=45)
            .map(|d| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(d - 1))
            .collect();
        let ranges = consolidate_gaps(dates, 30);
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].to - ranges[0].from).num_days(), 29);
    }

    #[test]
    fn enqueue_job_creates_one_request_per_range() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert(
            "AAPL".to_string(),
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            ],
        );
        let ids = sched.enqueue_job(&job(&["AAPL"]), &gaps);
        assert_eq!(ids.len(), 1);
        assert_eq!(sched.get_statistics().pending, 1);
    }

    #[test]
    fn dequeue_respects_per_provider_concurrency() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        gaps.insert("MSFT".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        gaps.insert("GOOG".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL", "MSFT", "GOOG"]), &gaps);

        assert!(sched.try_dequeue_runnable().is_some());
        assert!(sched.try_dequeue_runnable().is_some());
        assert!(sched.try_dequeue_runnable().is_none());
        assert_eq!(sched.get_statistics().in_flight, 2);
    }

    #[test]
    fn rate_limited_provider_is_skipped_until_cooldown_elapses() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL"]), &gaps);

        sched.record_provider_rate_limit_hit(ProviderId::new("alpaca"), Some(Duration::from_secs(60)));
        assert!(sched.try_dequeue_runnable().is_none());
        assert_eq!(sched.get_statistics().pending, 1);
    }

    #[tokio::test]
    async fn not_found_error_fails_terminally_without_consuming_retries() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL"]), &gaps);

        let req = sched.try_dequeue_runnable().unwrap();
        sched
            .complete_request(req.id, false, Some("symbol not found (404)".to_string()), 0)
            .await;

        assert_eq!(sched.get_statistics().failed, 1);
        assert_eq!(sched.get_statistics().pending, 0);
    }

    #[tokio::test]
    async fn failed_request_requeues_until_retries_exhausted() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL"]), &gaps);

        let req = sched.try_dequeue_runnable().unwrap();
        sched.complete_request(req.id, false, Some("timeout".to_string()), 0).await;
        assert_eq!(sched.get_statistics().pending, 1);

        let req = sched.try_dequeue_runnable().unwrap();
        sched.complete_request(req.id, false, Some("timeout".to_string()), 0).await;
        let req = sched.try_dequeue_runnable().unwrap();
        sched.complete_request(req.id, false, Some("timeout".to_string()), 0).await;

        assert_eq!(sched.get_statistics().failed, 1);
        assert_eq!(sched.get_statistics().pending, 0);
    }

    #[tokio::test]
    async fn retry_priority_increases_by_ten_each_attempt() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL"]), &gaps);

        let req = sched.try_dequeue_runnable().unwrap();
        let original_priority = req.priority;
        sched.complete_request(req.id, false, Some("timeout".to_string()), 0).await;

        let requeued = sched.try_dequeue_runnable().unwrap();
        assert_eq!(requeued.priority, original_priority + 10);
    }

    #[tokio::test]
    async fn cancel_job_marks_pending_requests_cancelled_and_surfaces_them() {
        let sched = scheduler();
        let mut gaps = Map::new();
        gaps.insert("AAPL".to_string(), vec![NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        sched.enqueue_job(&job(&["AAPL"]), &gaps);

        sched.cancel_job(JobId(1)).await;
        let completed = sched.next_completed().await.unwrap();
        assert_eq!(completed.status, RequestStatus::Cancelled);
        assert_eq!(sched.get_statistics().pending, 0);
    }
}
