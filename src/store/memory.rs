//! In-memory record store
//!
//! A [`ObjectStore`] backed by a `DashMap`, used in standalone mode and by
//! tests. It reproduces the orchestrator semantics the engine depends on:
//! resource-version CAS, finalizer-gated deletion, and label-filtered watch.

use crate::domain::ports::{ObjectStore, WatchEvent};
use crate::error::{Error, Result};
use crate::labels::LabelSelector;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the watch fan-out channel
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store for one record kind
pub struct MemoryStore<K> {
    objects: DashMap<String, K>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Arc::new(Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            events,
        })
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .get(name)
            .map(|o| o.value().clone())
            .ok_or_else(|| Error::not_found(&Self::kind(), name))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let mut items: Vec<K> = self
            .objects
            .iter()
            .filter(|o| selector.matches(o.value().labels()))
            .map(|o| o.value().clone())
            .collect();
        items.sort_by_key(|o| o.name_any());
        Ok(items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let created = match self.objects.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyExists {
                    kind: Self::kind(),
                    name,
                })
            }
            Entry::Vacant(slot) => {
                let mut created = obj.clone();
                let meta = created.meta_mut();
                meta.resource_version = Some(self.next_version());
                meta.uid = Some(uuid::Uuid::new_v4().to_string());
                meta.creation_timestamp = Some(Time(Utc::now()));
                meta.deletion_timestamp = None;
                slot.insert(created.clone());
                created
            }
        };
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let (updated, removed) = match self.objects.entry(name.clone()) {
            Entry::Vacant(_) => return Err(Error::not_found(&Self::kind(), name)),
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                if stored.resource_version() != obj.resource_version() {
                    return Err(Error::conflict(&Self::kind(), name));
                }

                let mut updated = obj.clone();
                let stored_meta = stored.meta().clone();
                let meta = updated.meta_mut();
                meta.uid = stored_meta.uid;
                meta.creation_timestamp = stored_meta.creation_timestamp;
                meta.deletion_timestamp = stored_meta.deletion_timestamp;
                meta.resource_version = Some(self.next_version());

                let finalized = updated.meta().deletion_timestamp.is_some()
                    && updated.finalizers().is_empty();
                if finalized {
                    slot.remove();
                } else {
                    slot.insert(updated.clone());
                }
                (updated, finalized)
            }
        };

        if removed {
            self.publish(WatchEvent::Deleted(updated.clone()));
        } else {
            self.publish(WatchEvent::Modified(updated.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let event = match self.objects.entry(name.to_string()) {
            Entry::Vacant(_) => return Err(Error::not_found(&Self::kind(), name)),
            Entry::Occupied(mut slot) => {
                if slot.get().finalizers().is_empty() {
                    WatchEvent::Deleted(slot.remove())
                } else if slot.get().meta().deletion_timestamp.is_some() {
                    return Ok(());
                } else {
                    let version = self.next_version();
                    let obj = slot.get_mut();
                    obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                    obj.meta_mut().resource_version = Some(version);
                    WatchEvent::Modified(obj.clone())
                }
            }
        };
        self.publish(event);
        Ok(())
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        // Subscribe before the snapshot so no change falls in between.
        let rx = self.events.subscribe();
        let selector = selector.clone();

        let mut initial: Vec<K> = self
            .objects
            .iter()
            .filter(|o| selector.matches(o.value().labels()))
            .map(|o| o.value().clone())
            .collect();
        initial.sort_by_key(|o| o.name_any());
        let initial = stream::iter(initial.into_iter().map(|o| Ok(WatchEvent::Added(o))));

        let live = stream::unfold((rx, selector), |(mut rx, selector)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if selector.matches(event.object().labels()) {
                            return Some((Ok(event), (rx, selector)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "watch receiver lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        initial.chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Drive, DriveSpec, DATA_PROTECTION_FINALIZER};
    use crate::labels::{set_label, LabelKey};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    fn drive(name: &str, node: &str) -> Drive {
        let mut d = Drive::new(name, DriveSpec::default());
        set_label(d.labels_mut(), LabelKey::NODE, node);
        d
    }

    #[tokio::test]
    async fn test_create_get_conflict() {
        let store = MemoryStore::<Drive>::new();
        let created = store.create(&drive("d1", "n1")).await.unwrap();
        assert!(created.resource_version().is_some());
        assert!(created.uid().is_some());

        assert_matches!(
            store.create(&drive("d1", "n1")).await,
            Err(Error::AlreadyExists { .. })
        );

        let mut first = store.get("d1").await.unwrap();
        let mut stale = first.clone();
        first.spec.owned = true;
        assert_ok!(store.update(&first).await);

        stale.spec.owned = false;
        let err = assert_err!(store.update(&stale).await);
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_respects_finalizers() {
        let store = MemoryStore::<Drive>::new();
        let mut d = drive("d1", "n1");
        d.add_finalizer(DATA_PROTECTION_FINALIZER);
        store.create(&d).await.unwrap();

        store.delete("d1").await.unwrap();
        let mut marked = store.get("d1").await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.remove_finalizer(DATA_PROTECTION_FINALIZER);
        store.update(&marked).await.unwrap();
        assert!(store.get("d1").await.unwrap_err().is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::<Drive>::new();
        store.create(&drive("a", "n1")).await.unwrap();
        store.create(&drive("b", "n2")).await.unwrap();

        let sel = LabelSelector::everything().with(LabelKey::NODE, "n2");
        let items = store.list(&sel).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name_any(), "b");

        assert_eq!(store.list(&LabelSelector::everything()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let store = MemoryStore::<Drive>::new();
        store.create(&drive("a", "n1")).await.unwrap();

        let sel = LabelSelector::everything().with(LabelKey::NODE, "n1");
        let mut events = store.watch(&sel);

        assert_matches!(events.next().await, Some(Ok(WatchEvent::Added(d))) if d.name_any() == "a");

        store.create(&drive("other", "n2")).await.unwrap();
        store.create(&drive("b", "n1")).await.unwrap();
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Added(d))) if d.name_any() == "b");

        store.delete("a").await.unwrap();
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Deleted(d))) if d.name_any() == "a");
    }
}
