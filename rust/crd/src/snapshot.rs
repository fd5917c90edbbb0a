//! Minimal typed views of the external-snapshotter API (`snapshot.storage.k8s.io/v1`).

use std::collections::BTreeMap;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, ClusterResourceScope};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ReclaimPolicy;

/// `VolumeSnapshotClass` keeps its fields at the top level instead of under `spec`,
/// so it is typed by hand rather than derived.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotClass {
    #[serde(default = "VolumeSnapshotClass::api_version_default")]
    pub api_version: String,
    #[serde(default = "VolumeSnapshotClass::kind_default")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub driver: String,
    pub deletion_policy: DeletionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

impl VolumeSnapshotClass {
    pub fn new(
        metadata: ObjectMeta,
        driver: impl Into<String>,
        deletion_policy: DeletionPolicy,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            api_version: Self::api_version_default(),
            kind: Self::kind_default(),
            metadata,
            driver: driver.into(),
            deletion_policy,
            parameters: Some(parameters),
        }
    }

    fn api_version_default() -> String {
        <Self as k8s_openapi::Resource>::API_VERSION.to_owned()
    }

    fn kind_default() -> String {
        <Self as k8s_openapi::Resource>::KIND.to_owned()
    }
}

impl k8s_openapi::Resource for VolumeSnapshotClass {
    const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
    const GROUP: &'static str = "snapshot.storage.k8s.io";
    const KIND: &'static str = "VolumeSnapshotClass";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "volumesnapshotclasses";
    type Scope = ClusterResourceScope;
}

impl k8s_openapi::Metadata for VolumeSnapshotClass {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
}

impl From<ReclaimPolicy> for DeletionPolicy {
    fn from(policy: ReclaimPolicy) -> Self {
        match policy {
            ReclaimPolicy::Delete => Self::Delete,
            ReclaimPolicy::Retain => Self::Retain,
        }
    }
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    namespaced,
    status = "VolumeSnapshotStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    #[serde(default)]
    pub source: VolumeSnapshotSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
}

impl VolumeSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.ready_to_use)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_snapshot_class_fields_are_top_level() {
        let vsc: VolumeSnapshotClass = serde_yaml::from_str(indoc! {"
            apiVersion: snapshot.storage.k8s.io/v1
            kind: VolumeSnapshotClass
            metadata:
              name: ex
            driver: nfs.csi.k8s.io
            deletionPolicy: Retain
            parameters:
              mountOptions: nfsvers=4.1
        "})
        .expect("valid snapshot class");

        assert_eq!(vsc.driver, "nfs.csi.k8s.io");
        assert_eq!(vsc.deletion_policy, DeletionPolicy::Retain);

        let json = serde_json::to_value(VolumeSnapshotClass::new(
            ObjectMeta::default(),
            "nfs.csi.k8s.io",
            DeletionPolicy::Delete,
            BTreeMap::new(),
        ))
        .unwrap();
        assert_eq!(json["apiVersion"], "snapshot.storage.k8s.io/v1");
        assert_eq!(json["kind"], "VolumeSnapshotClass");
    }

    #[test]
    fn test_snapshot_without_status_is_not_ready() {
        let snapshot: VolumeSnapshot = serde_yaml::from_str(indoc! {"
            apiVersion: snapshot.storage.k8s.io/v1
            kind: VolumeSnapshot
            metadata:
              name: snap
              namespace: default
            spec:
              source:
                persistentVolumeClaimName: data
        "})
        .expect("valid snapshot");

        assert!(!snapshot.is_ready());
        assert_eq!(
            snapshot.spec.source.persistent_volume_claim_name.as_deref(),
            Some("data")
        );
    }
}
