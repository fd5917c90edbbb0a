//! Narrow read/write access to one kind of Kubernetes object.
//!
//! Reconcilers talk to the cluster through [`ObjectStore`] so that the same code
//! runs against [`kube::Api`] in production and against an in-memory store in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::client::is_not_found;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> kube::Result<Option<K>>;

    async fn list(&self) -> kube::Result<Vec<K>>;

    async fn create(&self, object: &K) -> kube::Result<K>;

    /// Full update, guarded by the `resourceVersion` carried by `object`.
    async fn replace(&self, name: &str, object: &K) -> kube::Result<K>;

    /// Requests deletion. An object that is already gone counts as deleted.
    async fn delete(&self, name: &str) -> kube::Result<()>;

    /// JSON merge patch (RFC 7386) of the main resource.
    async fn merge_patch(&self, name: &str, patch: serde_json::Value) -> kube::Result<K>;

    /// JSON merge patch of the status subresource.
    async fn merge_patch_status(&self, name: &str, patch: serde_json::Value) -> kube::Result<K>;
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> kube::Result<Option<K>> {
        Api::get_opt(self, name).await
    }

    async fn list(&self) -> kube::Result<Vec<K>> {
        Ok(Api::list(self, &ListParams::default()).await?.items)
    }

    async fn create(&self, object: &K) -> kube::Result<K> {
        Api::create(self, &PostParams::default(), object).await
    }

    async fn replace(&self, name: &str, object: &K) -> kube::Result<K> {
        Api::replace(self, name, &PostParams::default(), object).await
    }

    async fn delete(&self, name: &str) -> kube::Result<()> {
        match Api::delete(self, name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn merge_patch(&self, name: &str, patch: serde_json::Value) -> kube::Result<K> {
        Api::patch(self, name, &PatchParams::default(), &Patch::Merge(&patch)).await
    }

    async fn merge_patch_status(&self, name: &str, patch: serde_json::Value) -> kube::Result<K> {
        Api::patch_status(self, name, &PatchParams::default(), &Patch::Merge(&patch)).await
    }
}

/// Merge patch that replaces the finalizer list of an object.
///
/// An empty list is sent as `null`, which removes the field.
pub fn finalizers_patch(finalizers: &[String]) -> serde_json::Value {
    if finalizers.is_empty() {
        serde_json::json!({ "metadata": { "finalizers": null } })
    } else {
        serde_json::json!({ "metadata": { "finalizers": finalizers } })
    }
}
