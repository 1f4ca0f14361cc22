//! Deadline-bounded vault work: record fetches, search and export.
//!
//! Vault reads are blocking (sled, file I/O, decryption) so they run on the blocking pool.
//! The caller is released at the deadline with `Timeout`; a shared flag tells the worker to
//! stop early and anything it gathered is dropped.

use crate::error::{PhaitError, PhaitResult};
use crate::vault::{Record, RecordFilter, VaultStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) async fn bounded_blocking<T, F>(
    operation: &'static str,
    budget: Duration,
    deadline: Instant,
    work: F,
) -> PhaitResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> PhaitResult<T> + Send + 'static,
{
    if Instant::now() >= deadline {
        return Err(PhaitError::Timeout { operation, budget });
    }
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);
    let result = tokio::time::timeout_at(
        tokio::time::Instant::from_std(deadline),
        tokio::task::spawn_blocking(move || work(&worker_cancel)),
    )
    .await;

    match result {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(PhaitError::Storage(format!(
            "{} worker panicked: {}",
            operation, join_err
        ))),
        Err(_) => {
            cancel.store(true, Ordering::SeqCst);
            tracing::warn!(
                target: "phait::sos",
                operation,
                budget_ms = budget.as_millis() as u64,
                "⏱️ vault work exceeded its budget; abandoned"
            );
            Err(PhaitError::Timeout { operation, budget })
        }
    }
}

fn cancelled(operation: &'static str, budget: Duration) -> PhaitError {
    PhaitError::Timeout { operation, budget }
}

/// Decrypt every record the filter selects, stopping early when cancelled.
pub(crate) fn fetch_records(
    store: &VaultStore,
    filter: RecordFilter,
    cancel: &AtomicBool,
    operation: &'static str,
    budget: Duration,
) -> PhaitResult<Vec<Record>> {
    let mut out = Vec::new();
    for id in store.list_records(filter) {
        if cancel.load(Ordering::SeqCst) {
            return Err(cancelled(operation, budget));
        }
        out.push(store.get_record(&id?)?);
    }
    Ok(out)
}

/// Records whose text contains every whitespace-separated term of `query`
/// (case-insensitive). `filter.limit` caps the number of matches.
pub(crate) fn search_records(
    store: &VaultStore,
    query: &str,
    filter: RecordFilter,
    cancel: &AtomicBool,
    budget: Duration,
) -> PhaitResult<Vec<Record>> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    let limit = filter.limit;
    let scan = RecordFilter {
        limit: None,
        ..filter
    };

    let mut hits = Vec::new();
    for id in store.list_records(scan) {
        if cancel.load(Ordering::SeqCst) {
            return Err(cancelled("search", budget));
        }
        if limit.is_some_and(|l| hits.len() >= l) {
            break;
        }
        let record = store.get_record(&id?)?;
        let text = record.searchable_text().to_lowercase();
        if terms.iter().all(|t| text.contains(t.as_str())) {
            hits.push(record);
        }
    }
    Ok(hits)
}
