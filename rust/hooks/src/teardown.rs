//! Releases everything the module owns so that uninstalling it does not leave
//! objects stuck behind finalizers.

use std::sync::Arc;

use csi_nfs_common::store::{finalizers_patch, ObjectStore};
use csi_nfs_crd::{snapshot::VolumeSnapshotClass, NFSStorageClass, ALLOWED_PROVISIONERS, NFS_PROVISIONER};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Secret},
    storage::v1::StorageClass,
};
use kube::{Api, Client, Resource, ResourceExt};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to list {kind} objects"))]
    List {
        source: kube::Error,
        kind: String,
    },

    #[snafu(display("failed to clear finalizers of {kind} {name}"))]
    ClearFinalizers {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name}"))]
    Delete {
        source: kube::Error,
        kind: String,
        name: String,
    },
}

pub struct Stores {
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub storage_classes: Arc<dyn ObjectStore<StorageClass>>,
    pub snapshot_classes: Arc<dyn ObjectStore<VolumeSnapshotClass>>,
    pub nfs_storage_classes: Arc<dyn ObjectStore<NFSStorageClass>>,
}

impl Stores {
    pub fn new(client: &Client, namespace: &str) -> Self {
        Self {
            secrets: Arc::new(Api::<Secret>::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(Api::<ConfigMap>::namespaced(client.clone(), namespace)),
            storage_classes: Arc::new(Api::<StorageClass>::all(client.clone())),
            snapshot_classes: Arc::new(Api::<VolumeSnapshotClass>::all(client.clone())),
            nfs_storage_classes: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
        }
    }
}

/// What happens to each matching object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposal {
    Release,
    ReleaseAndDelete,
}

/// Runs every step, continuing past failures. Returns the failures in order.
pub async fn run(stores: &Stores) -> Vec<Error> {
    let mut errors = Vec::new();

    dispose(stores.secrets.as_ref(), |_| true, Disposal::Release, &mut errors).await;
    dispose(stores.config_maps.as_ref(), |_| true, Disposal::Release, &mut errors).await;
    dispose(
        stores.storage_classes.as_ref(),
        |sc: &StorageClass| ALLOWED_PROVISIONERS.contains(&sc.provisioner.as_str()),
        Disposal::ReleaseAndDelete,
        &mut errors,
    )
    .await;
    dispose(
        stores.snapshot_classes.as_ref(),
        |vsc: &VolumeSnapshotClass| vsc.driver == NFS_PROVISIONER,
        Disposal::ReleaseAndDelete,
        &mut errors,
    )
    .await;
    dispose(
        stores.nfs_storage_classes.as_ref(),
        |_| true,
        Disposal::Release,
        &mut errors,
    )
    .await;

    errors
}

async fn dispose<K>(
    store: &dyn ObjectStore<K>,
    selected: impl Fn(&K) -> bool,
    disposal: Disposal,
    errors: &mut Vec<Error>,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let kind = K::kind(&()).into_owned();
    let objects = match store.list().await.context(ListSnafu { kind: &kind }) {
        Ok(objects) => objects,
        Err(error) => {
            tracing::error!(error = &error as &dyn std::error::Error, "teardown step failed");
            errors.push(error);
            return;
        }
    };

    for object in objects.iter().filter(|object| selected(object)) {
        let name = object.name_any();

        if !object.finalizers().is_empty() {
            tracing::info!(%kind, %name, "clearing finalizers");
            if let Err(error) = store
                .merge_patch(&name, finalizers_patch(&[]))
                .await
                .context(ClearFinalizersSnafu { kind: &kind, name: &name })
            {
                tracing::error!(error = &error as &dyn std::error::Error, "teardown step failed");
                errors.push(error);
                continue;
            }
        }

        if disposal == Disposal::ReleaseAndDelete {
            tracing::info!(%kind, %name, "deleting");
            if let Err(error) = store
                .delete(&name)
                .await
                .context(DeleteSnafu { kind: &kind, name: &name })
            {
                tracing::error!(error = &error as &dyn std::error::Error, "teardown step failed");
                errors.push(error);
            }
        }
    }
}
