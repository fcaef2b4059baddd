//! Domain Ports - Core trait definitions for the storage engine
//!
//! These traits define the boundaries between the engine and the host or
//! orchestrator. The engine core takes a [`Runtime`] carrying one
//! implementation of each, so tests can inject fakes.

use crate::crd::{Drive, Volume};
use crate::error::{Error, Result};
use crate::hardware::discovery::MountInfo;
use crate::labels::LabelSelector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Record Store Port
// =============================================================================

/// A change observed on a watched record
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Port for persisted records with optimistic concurrency.
///
/// `update` succeeds only when the object's resource version matches the
/// stored one and fails with [`Error::Conflict`] otherwise. `delete` of an
/// object holding finalizers only marks it for deletion; the object goes
/// away once an `update` removes its last finalizer.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch by name, failing with `NotFound`
    async fn get(&self, name: &str) -> Result<K>;

    /// Fetch by name, `None` if absent
    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List records matching `selector`
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Create a record, failing with `AlreadyExists` on name clash
    async fn create(&self, obj: &K) -> Result<K>;

    /// Compare-and-swap update of spec, status and metadata
    async fn update(&self, obj: &K) -> Result<K>;

    /// Request deletion by name
    async fn delete(&self, name: &str) -> Result<()>;

    /// Infinite stream of changes; begins with an `Added` for every
    /// existing record matching `selector`
    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

// =============================================================================
// Mount Port
// =============================================================================

/// Flags for a mount call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountFlags {
    pub bind: bool,
    pub read_only: bool,
}

impl MountFlags {
    pub fn bind() -> Self {
        Self {
            bind: true,
            read_only: false,
        }
    }

    pub fn read_only(mut self, ro: bool) -> Self {
        self.read_only = ro;
        self
    }
}

/// Flags for an unmount call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountFlags {
    pub force: bool,
    pub detach: bool,
    pub expire: bool,
}

/// Port for mount syscalls and the host mount table
pub trait Mounter: Send + Sync {
    /// Raw mount(2)
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> Result<()>;

    /// Raw umount2(2)
    fn unmount(&self, target: &Path, flags: UnmountFlags) -> Result<()>;

    /// Current mount table of the host
    fn mounts(&self) -> Result<Vec<MountInfo>>;
}

// =============================================================================
// Quota Port
// =============================================================================

/// Limits and usage of one XFS project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectQuota {
    pub hard_limit: u64,
    pub soft_limit: u64,
    pub used_bytes: u64,
}

/// Port for XFS project quotas
pub trait QuotaManager: Send + Sync {
    /// Tag `path` with `project_id` and set its hard block limit
    fn set_project_quota(
        &self,
        device: &Path,
        path: &Path,
        project_id: u32,
        hard_limit: u64,
    ) -> Result<()>;

    /// Current limits of a project; `None` when no limit is set
    fn get_project_quota(&self, device: &Path, project_id: u32) -> Result<Option<ProjectQuota>>;

    /// Clear the limits of a project
    fn remove_project_quota(&self, device: &Path, project_id: u32) -> Result<()>;
}

// =============================================================================
// Formatter Port
// =============================================================================

/// Port for filesystem creation
#[async_trait]
pub trait Formatter: Send + Sync {
    /// Create an XFS filesystem with the given UUID
    async fn format_xfs(&self, device: &Path, fs_uuid: &str, force: bool) -> Result<()>;
}

// =============================================================================
// Clock Port
// =============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DriveStoreRef = Arc<dyn ObjectStore<Drive>>;
pub type VolumeStoreRef = Arc<dyn ObjectStore<Volume>>;
pub type MounterRef = Arc<dyn Mounter>;
pub type QuotaManagerRef = Arc<dyn QuotaManager>;
pub type FormatterRef = Arc<dyn Formatter>;
pub type ClockRef = Arc<dyn Clock>;

// =============================================================================
// Runtime Handle
// =============================================================================

/// Default wall-clock limit for mount and format calls
pub const DEFAULT_SYSCALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Explicitly passed context for every engine component
#[derive(Clone)]
pub struct Runtime {
    pub drives: DriveStoreRef,
    pub volumes: VolumeStoreRef,
    pub mounter: MounterRef,
    pub quota: QuotaManagerRef,
    pub formatter: FormatterRef,
    pub clock: ClockRef,
    /// Hard limit for mount/format syscalls
    pub syscall_timeout: Duration,
}

impl Runtime {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run a blocking host call off the async runtime under the syscall
    /// timeout.
    pub async fn blocking<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.syscall_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Internal(format!(
                "{operation} task failed: {join_err}"
            ))),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                after: self.syscall_timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("syscall_timeout", &self.syscall_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime;
    use assert_matches::assert_matches;

    #[test]
    fn test_mount_flags_builder() {
        let flags = MountFlags::bind().read_only(true);
        assert!(flags.bind);
        assert!(flags.read_only);
        assert_eq!(MountFlags::default(), MountFlags { bind: false, read_only: false });
    }

    #[tokio::test]
    async fn test_blocking_times_out() {
        let (mut rt, _fakes) = runtime();
        rt.syscall_timeout = Duration::from_millis(20);

        let result = rt
            .blocking("mount", || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_blocking_returns_value() {
        let (rt, _fakes) = runtime();
        let value = rt.blocking("probe", || Ok(42)).await.unwrap();
        assert_eq!(value, 42);
    }
}
