//! Desired state of the objects materialized for one [`NFSStorageClass`].

use std::collections::BTreeMap;

use csi_nfs_crd::{
    credentials_secret_name,
    snapshot::{DeletionPolicy, VolumeSnapshotClass},
    NFSStorageClass, NFSStorageClassSpec, FINALIZER, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE, MOUNT_OPTIONS_KEY, MOUNT_PERMISSIONS_PARAM_KEY, NFS_PROVISIONER,
    PROVISIONER_SECRET_NAMESPACE_PARAM_KEY, PROVISIONER_SECRET_NAME_PARAM_KEY, SERVER_PARAM_KEY,
    SHARE_PARAM_KEY, TLS_ENABLED, VOLUME_CLEANUP_KEY, VOLUME_SNAPSHOT_CLASS_ANNOTATION,
};
use k8s_openapi::{
    api::{core::v1::Secret, storage::v1::StorageClass},
    ByteString,
};
use kube::{api::ObjectMeta, ResourceExt};

pub const SECRET_TYPE_OPAQUE: &str = "Opaque";

#[derive(Clone, Debug, PartialEq)]
pub struct DerivedResources {
    pub storage_class: StorageClass,
    pub secret: Secret,
    pub snapshot_class: VolumeSnapshotClass,
}

pub fn derive(nsc: &NFSStorageClass, controller_namespace: &str) -> DerivedResources {
    derive_with(nsc, controller_namespace, TLS_ENABLED)
}

pub fn derive_with(
    nsc: &NFSStorageClass,
    controller_namespace: &str,
    tls_enabled: bool,
) -> DerivedResources {
    let name = nsc.name_any();
    let mount_options = mount_options_with(&nsc.spec, tls_enabled);
    let joined = mount_options.join(",");

    DerivedResources {
        storage_class: build_storage_class(&name, &nsc.spec, controller_namespace, mount_options),
        secret: build_secret(&name, &nsc.spec, controller_namespace, &joined),
        snapshot_class: build_snapshot_class(&name, &nsc.spec, joined),
    }
}

/// The NFS mount options for `spec`, in the order the driver expects them.
pub fn mount_options_with(spec: &NFSStorageClassSpec, tls_enabled: bool) -> Vec<String> {
    let connection = &spec.connection;
    let mut options = vec![format!("nfsvers={}", connection.nfs_version)];

    if tls_enabled {
        if connection.mtls {
            options.push("xprtsec=mtls".to_owned());
        } else if connection.tls {
            options.push("xprtsec=tls".to_owned());
        }
    }

    if let Some(mount_options) = &spec.mount_options {
        if let Some(mode) = mount_options.mount_mode {
            options.push(mode.to_string());
        }
        if let Some(timeout) = mount_options.timeout.filter(|timeout| *timeout > 0) {
            options.push(format!("timeo={timeout}"));
        }
        if let Some(retrans) = mount_options.retransmissions.filter(|retrans| *retrans > 0) {
            options.push(format!("retrans={retrans}"));
        }
        match mount_options.read_only {
            Some(true) => options.push("ro".to_owned()),
            Some(false) => options.push("rw".to_owned()),
            None => {}
        }
    }

    options
}

fn managed_metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespace.map(str::to_owned),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL_KEY.to_owned(),
            MANAGED_BY_LABEL_VALUE.to_owned(),
        )])),
        finalizers: Some(vec![FINALIZER.to_owned()]),
        ..ObjectMeta::default()
    }
}

fn build_storage_class(
    name: &str,
    spec: &NFSStorageClassSpec,
    controller_namespace: &str,
    mount_options: Vec<String>,
) -> StorageClass {
    let mut parameters = BTreeMap::from([
        (SERVER_PARAM_KEY.to_owned(), spec.connection.host.clone()),
        (SHARE_PARAM_KEY.to_owned(), spec.connection.share.clone()),
        (
            PROVISIONER_SECRET_NAME_PARAM_KEY.to_owned(),
            credentials_secret_name(name),
        ),
        (
            PROVISIONER_SECRET_NAMESPACE_PARAM_KEY.to_owned(),
            controller_namespace.to_owned(),
        ),
    ]);
    if let Some(permissions) = spec.chmod_permissions.as_deref().filter(|p| !p.is_empty()) {
        parameters.insert(MOUNT_PERMISSIONS_PARAM_KEY.to_owned(), permissions.to_owned());
    }

    let mut metadata = managed_metadata(name, None);
    metadata.annotations = Some(BTreeMap::from([(
        VOLUME_SNAPSHOT_CLASS_ANNOTATION.to_owned(),
        name.to_owned(),
    )]));

    StorageClass {
        metadata,
        provisioner: NFS_PROVISIONER.to_owned(),
        parameters: Some(parameters),
        mount_options: Some(mount_options),
        reclaim_policy: Some(spec.reclaim_policy.to_string()),
        volume_binding_mode: Some(spec.volume_binding_mode.to_string()),
        allow_volume_expansion: Some(true),
        allowed_topologies: None,
    }
}

fn build_secret(
    name: &str,
    spec: &NFSStorageClassSpec,
    controller_namespace: &str,
    mount_options: &str,
) -> Secret {
    let mut data = BTreeMap::from([(
        MOUNT_OPTIONS_KEY.to_owned(),
        ByteString(mount_options.as_bytes().to_vec()),
    )]);
    if let Some(cleanup) = spec.volume_cleanup.as_deref().filter(|c| !c.is_empty()) {
        data.insert(
            VOLUME_CLEANUP_KEY.to_owned(),
            ByteString(cleanup.as_bytes().to_vec()),
        );
    }

    Secret {
        metadata: managed_metadata(&credentials_secret_name(name), Some(controller_namespace)),
        type_: Some(SECRET_TYPE_OPAQUE.to_owned()),
        data: Some(data),
        ..Secret::default()
    }
}

fn build_snapshot_class(name: &str, spec: &NFSStorageClassSpec, mount_options: String) -> VolumeSnapshotClass {
    VolumeSnapshotClass::new(
        managed_metadata(name, None),
        NFS_PROVISIONER,
        DeletionPolicy::from(spec.reclaim_policy),
        BTreeMap::from([(MOUNT_OPTIONS_KEY.to_owned(), mount_options)]),
    )
}
