//! Orchestrator-backed record store
//!
//! Wraps a cluster-scoped `kube::Api`. CAS comes from the API server's
//! resource-version check on `replace`; the status subresource is written
//! with a merge patch pinned to the version returned by that replace.

use crate::domain::ports::{ObjectStore, WatchEvent};
use crate::error::{Error, Result};
use crate::labels::LabelSelector;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// Record store over the orchestrator API
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn list_params(selector: &LabelSelector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        Ok(self.api.get(name).await?)
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let list = self.api.list(&list_params(selector)).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let created = self.api.create(&PostParams::default(), obj).await?;

        // Status is a subresource; create drops it.
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .filter(|s| !s.is_null());
        match status {
            Some(status) => self.patch_status(&created, status).await,
            None => Ok(created),
        }
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let replaced = self.api.replace(&name, &PostParams::default(), obj).await?;

        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .filter(|s| !s.is_null());
        match status {
            Some(status) if replaced.meta().deletion_timestamp.is_none()
                || !replaced.finalizers().is_empty() =>
            {
                self.patch_status(&replaced, status).await
            }
            _ => Ok(replaced),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let config = if selector.is_empty() {
            watcher::Config::default()
        } else {
            watcher::Config::default().labels(&selector.to_string())
        };

        watcher(self.api.clone(), config)
            .flat_map(|event| {
                let events: Vec<Result<WatchEvent<K>>> = match event {
                    Ok(watcher::Event::Applied(obj)) => vec![Ok(WatchEvent::Modified(obj))],
                    Ok(watcher::Event::Deleted(obj)) => vec![Ok(WatchEvent::Deleted(obj))],
                    Ok(watcher::Event::Restarted(objs)) => {
                        debug!(count = objs.len(), "watch restarted");
                        objs.into_iter().map(|o| Ok(WatchEvent::Added(o))).collect()
                    }
                    Err(e) => vec![Err(Error::Internal(format!("watch failed: {e}")))],
                };
                stream::iter(events)
            })
            .boxed()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    async fn patch_status(&self, current: &K, status: serde_json::Value) -> Result<K> {
        let name = current.name_any();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": status,
        });
        let patched = self
            .api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelKey;

    #[test]
    fn test_list_params_from_selector() {
        let params = list_params(&LabelSelector::everything());
        assert!(params.label_selector.is_none());

        let params = list_params(&LabelSelector::everything().with(LabelKey::NODE, "n1"));
        assert_eq!(
            params.label_selector.as_deref(),
            Some("directpv.min.io/node in (n1)")
        );
    }
}
