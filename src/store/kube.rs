//! Kubernetes Object Store
//!
//! [`ObjectStore`] adapter over `kube::Api`. Each store is bound to one scope:
//! a namespace for namespaced kinds, the whole cluster otherwise.

use crate::domain::ports::{LabelSelector, ListWatch, ObjectStore, Watch, WatchEvent, WatchEventType};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffer between the watch relay task and the consumer
const WATCH_BUFFER: usize = 256;

/// Upper bound on the delay between re-watch attempts
const MAX_REWATCH_DELAY: Duration = Duration::from_secs(30);

/// Object store backed by the Kubernetes API server
pub struct KubeStore<K> {
    api: Api<K>,
    kind: String,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Store over every object of a cluster-scoped kind
    pub fn cluster(client: Client) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
    {
        Self {
            api: Api::all(client),
            kind: K::kind(&()).to_string(),
        }
    }

    /// Store over the objects of a namespaced kind in `namespace`
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            kind: K::kind(&()).to_string(),
        }
    }

    fn map_write_error(&self, err: kube::Error, name: &str) -> Error {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: self.kind.clone(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }
}

/// Current collection resource version, used as the starting point of a watch
async fn current_resource_version<K>(api: &Api<K>) -> kube::Result<String>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let list = api.list(&ListParams::default().limit(1)).await?;
    Ok(list.metadata.resource_version.unwrap_or_default())
}

/// Forward a kube watch stream into `tx`, re-establishing it when the server
/// closes it. Returns once the receiving side is gone.
///
/// Raw `Api::watch` instead of `kube::runtime::watcher`: the watcher folds
/// Added and Modified into a single `Apply`, and handlers here need them apart.
async fn relay_watch<K>(
    api: Api<K>,
    kind: String,
    mut resource_version: String,
    mut stream: BoxStream<'static, kube::Result<KubeWatchEvent<K>>>,
    tx: mpsc::Sender<WatchEvent<K>>,
) where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        while let Some(item) = stream.next().await {
            let (event_type, object) = match item {
                Ok(KubeWatchEvent::Added(obj)) => (WatchEventType::Created, obj),
                Ok(KubeWatchEvent::Modified(obj)) => (WatchEventType::Updated, obj),
                Ok(KubeWatchEvent::Deleted(obj)) => (WatchEventType::Deleted, obj),
                Ok(KubeWatchEvent::Bookmark(bookmark)) => {
                    resource_version = bookmark.metadata.resource_version;
                    continue;
                }
                Ok(KubeWatchEvent::Error(status)) => {
                    if status.code == 410 {
                        debug!(kind = %kind, "Watch resource version expired, relisting");
                        resource_version.clear();
                    } else {
                        warn!(kind = %kind, code = status.code, message = %status.message, "Watch returned error");
                    }
                    break;
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Watch stream failed");
                    break;
                }
            };

            if let Some(rv) = object.resource_version() {
                resource_version = rv;
            }
            if tx.send(WatchEvent::new(event_type, object)).await.is_err() {
                return;
            }
        }

        let mut backoff = ExponentialBackoff {
            max_interval: MAX_REWATCH_DELAY,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        loop {
            if tx.is_closed() {
                return;
            }
            if resource_version.is_empty() {
                match current_resource_version(&api).await {
                    Ok(rv) => resource_version = rv,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Relist before re-watch failed");
                        tokio::time::sleep(backoff.next_backoff().unwrap_or(MAX_REWATCH_DELAY)).await;
                        continue;
                    }
                }
            }
            match api.watch(&WatchParams::default(), &resource_version).await {
                Ok(next) => {
                    debug!(kind = %kind, resource_version = %resource_version, "Watch re-established");
                    stream = next.boxed();
                    break;
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Re-watch failed");
                    if matches!(&e, kube::Error::Api(resp) if resp.code == 410) {
                        resource_version.clear();
                    }
                    tokio::time::sleep(backoff.next_backoff().unwrap_or(MAX_REWATCH_DELAY)).await;
                }
            }
        }
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn watch(&self) -> Result<Watch<K>> {
        let resource_version = current_resource_version(&self.api).await?;
        let stream = self
            .api
            .watch(&WatchParams::default(), &resource_version)
            .await?
            .boxed();

        info!(kind = %self.kind, resource_version = %resource_version, "Watch established");

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let relay = tokio::spawn(relay_watch(
            self.api.clone(),
            self.kind.clone(),
            resource_version,
            stream,
            tx,
        ));

        Ok(Watch::new(rx, move || relay.abort()))
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list_matching(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let params = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&selector.to_query())
        };
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| self.map_write_error(e, &name))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| self.map_write_error(e, &name))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        let body = serde_json::to_vec(obj)?;
        self.api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| self.map_write_error(e, &name))
    }
}
