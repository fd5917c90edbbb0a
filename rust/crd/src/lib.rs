use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub mod module_config;
pub mod selector;
pub mod snapshot;
pub mod validation;

pub const APP_NAME: &str = "csi-nfs";
pub const OPERATOR_NAME: &str = "nfs-storage-class-controller";

/// Provisioner name of the NFS CSI driver, also the driver of derived snapshot classes.
pub const NFS_PROVISIONER: &str = "nfs.csi.k8s.io";
/// Provisioners whose storage classes belong to this module.
pub const ALLOWED_PROVISIONERS: &[&str] = &[NFS_PROVISIONER];

pub const FINALIZER: &str = "storage.deckhouse.io/nfs-storage-class-controller";
pub const MANAGED_BY_LABEL_KEY: &str = "storage.deckhouse.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = OPERATOR_NAME;
pub const VOLUME_SNAPSHOT_CLASS_ANNOTATION: &str = "storage.deckhouse.io/volume-snapshot-class";
pub const NODE_LABEL_KEY: &str = "storage.deckhouse.io/csi-nfs-node";
/// Set to `true` on derived storage classes whose declaration the module configuration rejects.
pub const MODULE_CONFIG_MISMATCH_LABEL_KEY: &str = "storage.deckhouse.io/does-not-match-moduleconfig";

pub const CREDENTIALS_SECRET_PREFIX: &str = "nfs-mount-options-for-";
pub const MOUNT_OPTIONS_KEY: &str = "mountOptions";
pub const VOLUME_CLEANUP_KEY: &str = "volumeCleanup";

pub const SERVER_PARAM_KEY: &str = "server";
pub const SHARE_PARAM_KEY: &str = "share";
pub const MOUNT_PERMISSIONS_PARAM_KEY: &str = "mountPermissions";
pub const PROVISIONER_SECRET_NAME_PARAM_KEY: &str = "csi.storage.k8s.io/provisioner-secret-name";
pub const PROVISIONER_SECRET_NAMESPACE_PARAM_KEY: &str =
    "csi.storage.k8s.io/provisioner-secret-namespace";

pub const STORAGE_PROVISIONER_ANNOTATION: &str = "volume.kubernetes.io/storage-provisioner";
pub const BETA_STORAGE_PROVISIONER_ANNOTATION: &str =
    "volume.beta.kubernetes.io/storage-provisioner";

pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "d8-csi-nfs";

/// Whether RPC-with-TLS support is compiled in.
pub const TLS_ENABLED: bool = cfg!(feature = "tls");

/// Name of the credentials `Secret` that belongs to the declaration `name`.
pub fn credentials_secret_name(name: &str) -> String {
    format!("{CREDENTIALS_SECRET_PREFIX}{name}")
}

/// Reverse of [`credentials_secret_name`].
pub fn declaration_name_for_secret(secret_name: &str) -> Option<&str> {
    secret_name
        .strip_prefix(CREDENTIALS_SECRET_PREFIX)
        .filter(|name| !name.is_empty())
}

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "storage.deckhouse.io",
    version = "v1alpha1",
    kind = "NFSStorageClass",
    plural = "nfsstorageclasses",
    shortname = "nsc",
    status = "NFSStorageClassStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NFSStorageClassSpec {
    pub connection: Connection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_options: Option<MountOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chmod_permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_cleanup: Option<String>,
    pub reclaim_policy: ReclaimPolicy,
    pub volume_binding_mode: VolumeBindingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_nodes: Option<WorkloadNodes>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub host: String,
    pub share: String,
    pub nfs_version: NfsVersion,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub mtls: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_mode: Option<MountMode>,
    /// Tenths of a second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retransmissions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadNodes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum NfsVersion {
    #[serde(rename = "3")]
    #[strum(serialize = "3")]
    V3,
    #[serde(rename = "4.1")]
    #[strum(serialize = "4.1")]
    V4_1,
    #[serde(rename = "4.2")]
    #[strum(serialize = "4.2")]
    V4_2,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MountMode {
    Hard,
    Soft,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum VolumeBindingMode {
    Immediate,
    WaitForFirstConsumer,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NFSStorageClassStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum Phase {
    Created,
    Failed,
}

impl NFSStorageClassStatus {
    pub fn created() -> Self {
        Self {
            phase: Some(Phase::Created),
            reason: Some(String::new()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            phase: Some(Phase::Failed),
            reason: Some(reason.into()),
        }
    }
}

impl NFSStorageClass {
    /// The node selector of this declaration, or the module default when none is set.
    pub fn effective_node_selector(&self) -> LabelSelector {
        self.spec
            .workload_nodes
            .as_ref()
            .and_then(|nodes| nodes.node_selector.clone())
            .unwrap_or_else(selector::default_node_selector)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
