//! Record stores
//!
//! Implementations of [`ObjectStore`](crate::domain::ObjectStore) plus the
//! conflict-retry helper every writer goes through.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use crate::domain::ports::ObjectStore;
use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tracing::debug;

/// Upper bound on time spent retrying a single conflicting write
pub const CONFLICT_RETRY_MAX_ELAPSED: Duration = Duration::from_secs(30);

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(CONFLICT_RETRY_MAX_ELAPSED),
        ..Default::default()
    }
}

/// Fetch `name`, apply `mutate`, and write it back, re-reading on CAS
/// conflicts until the write lands or the backoff gives up.
///
/// `mutate` returns whether it changed anything; when it returns `false`
/// no write is issued and the fetched object is returned as-is.
pub async fn retry_on_conflict<K, S, F>(store: &S, name: &str, mut mutate: F) -> Result<K>
where
    K: Clone + Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<bool>,
{
    let mut backoff = conflict_backoff();
    loop {
        let mut obj = store.get(name).await?;
        if !mutate(&mut obj)? {
            return Ok(obj);
        }

        match store.update(&obj).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => match backoff.next_backoff() {
                Some(delay) => {
                    debug!(name, ?delay, "conflicting update, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Like [`retry_on_conflict`] but treats a missing object as nothing to do
pub async fn retry_on_conflict_opt<K, S, F>(store: &S, name: &str, mutate: F) -> Result<Option<K>>
where
    K: Clone + Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<bool>,
{
    match retry_on_conflict(store, name, mutate).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
