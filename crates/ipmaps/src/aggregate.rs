//! Concurrent lease aggregation.
//!
//! Spawns one tokio task per IP range, all feeding a single bounded channel.
//! A semaphore limits concurrent lease-tool processes. The merge loop ends
//! when the channel closes, which happens once every task has dropped its
//! sender.

use std::sync::Arc;
use std::time::Duration;

use ipmaps_core::{CmCpeMap, IpRange, LeaseRecord};
use tokio::sync::{mpsc, Semaphore};

use crate::fetcher::{FetchEvent, FetchStats, LeaseError, LeaseSink, LeaseSource};

/// Tuning for one aggregation run.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Deadline for each range query.
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub channel_capacity: usize,
}

/// A range whose query failed. Its leases are absent from the result.
#[derive(Debug)]
pub struct RangeFailure {
    pub range: IpRange,
    pub error: LeaseError,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateStats {
    pub ranges: usize,
    pub succeeded: usize,
    /// Leases merged into the map.
    pub records: usize,
    /// Malformed rows skipped by successful queries.
    pub skipped: usize,
    /// Leases received from ranges that later failed.
    pub discarded: usize,
}

/// Merged leases plus every per-range failure.
#[derive(Debug, Default)]
pub struct LeaseAggregate {
    pub leases: CmCpeMap,
    pub failures: Vec<RangeFailure>,
    pub stats: AggregateStats,
}

impl LeaseAggregate {
    pub fn all_failed(&self) -> bool {
        self.stats.ranges > 0 && self.failures.len() == self.stats.ranges
    }
}

/// Query every range concurrently and merge the leases by MAC.
///
/// Aggregation is best-effort: a failing range is recorded in
/// `failures` and contributes no leases, while the other ranges are still
/// merged. Leases of a range are staged as they stream in and folded into
/// the map only when that range's query succeeds.
pub async fn aggregate_leases<S>(
    source: Arc<S>,
    ranges: &[IpRange],
    options: &AggregateOptions,
) -> LeaseAggregate
where
    S: LeaseSource,
{
    let (tx, mut rx) = mpsc::channel(options.channel_capacity.max(1));
    let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut handles = Vec::with_capacity(ranges.len());

    for (index, range) in ranges.iter().copied().enumerate() {
        let source = source.clone();
        let sink = LeaseSink::new(index, tx.clone());
        let permits = permits.clone();
        let timeout = options.timeout;

        let handle = tokio::spawn(async move {
            let result = run_fetch(source.as_ref(), &range, timeout, &sink, &permits).await;
            sink.finish(result).await;
        });
        handles.push(handle);
    }
    drop(tx);

    tracing::info!(ranges = ranges.len(), "Lease queries started");

    let mut aggregate = LeaseAggregate {
        stats: AggregateStats {
            ranges: ranges.len(),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut staged: Vec<Vec<LeaseRecord>> = vec![Vec::new(); ranges.len()];
    let mut finished = vec![false; ranges.len()];

    while let Some(event) = rx.recv().await {
        match event {
            FetchEvent::Lease { range, record } => {
                if let Some(batch) = staged.get_mut(range) {
                    batch.push(record);
                }
            }
            FetchEvent::Finished { range: index, result } => {
                let (Some(batch), Some(done)) = (staged.get_mut(index), finished.get_mut(index))
                else {
                    continue;
                };
                *done = true;
                let records = std::mem::take(batch);
                merge_range(&mut aggregate, ranges[index], records, result);
            }
        }
    }

    for (index, handle) in handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            tracing::error!(range = %ranges[index], error = %e, "Lease fetch task panicked");
            if !finished[index] {
                let discarded = staged.get(index).map_or(0, Vec::len);
                aggregate.stats.discarded += discarded;
                aggregate.failures.push(RangeFailure {
                    range: ranges[index],
                    error: LeaseError::Task(e.to_string()),
                });
            }
        }
    }

    aggregate
        .failures
        .sort_by_key(|f| u32::from(f.range.start()));

    tracing::info!(
        ranges = aggregate.stats.ranges,
        succeeded = aggregate.stats.succeeded,
        failed = aggregate.failures.len(),
        macs = aggregate.leases.len(),
        records = aggregate.stats.records,
        skipped = aggregate.stats.skipped,
        "Lease aggregation complete"
    );

    aggregate
}

async fn run_fetch<S>(
    source: &S,
    range: &IpRange,
    timeout: Duration,
    sink: &LeaseSink,
    permits: &Semaphore,
) -> Result<FetchStats, LeaseError>
where
    S: LeaseSource + ?Sized,
{
    let _permit = permits
        .acquire()
        .await
        .map_err(|e| LeaseError::Task(e.to_string()))?;
    source.fetch(range, timeout, sink).await
}

fn merge_range(
    aggregate: &mut LeaseAggregate,
    range: IpRange,
    records: Vec<LeaseRecord>,
    result: Result<FetchStats, LeaseError>,
) {
    match result {
        Ok(stats) => {
            tracing::debug!(
                range = %range,
                accepted = stats.accepted,
                skipped = stats.skipped,
                "Lease query complete"
            );
            aggregate.stats.succeeded += 1;
            aggregate.stats.records += records.len();
            aggregate.stats.skipped += stats.skipped;
            for record in records {
                aggregate.leases.insert(record);
            }
        }
        Err(error) => {
            tracing::warn!(
                range = %range,
                error = %error,
                discarded = records.len(),
                "Lease query failed"
            );
            aggregate.stats.discarded += records.len();
            aggregate.failures.push(RangeFailure { range, error });
        }
    }
}
