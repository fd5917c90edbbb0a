//! Decides how to converge a live derived object onto its desired form.
//!
//! Pure functions only; applying the decision is up to the reconciler.

use std::collections::BTreeMap;

use csi_nfs_crd::{
    snapshot::VolumeSnapshotClass, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, NFS_PROVISIONER,
};
use k8s_openapi::api::{core::v1::Secret, storage::v1::StorageClass};
use kube::ResourceExt;
use snafu::Snafu;
use strum::IntoStaticStr;

#[derive(Clone, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    None,
    Create,
    UpdateInPlace,
    /// Delete the live object (after stripping its finalizers), then create.
    Recreate,
    Delete,
    /// The live object belongs to another provisioner and must not be touched.
    SkipForeign { owner: String },
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "foreign-secret: secret {name} has a different payload and is not managed by nfs-storage-class-controller"
    ))]
    ForeignSecret { name: String },
}

pub fn classify_storage_class(
    live: Option<&StorageClass>,
    desired: &StorageClass,
    deleting: bool,
) -> Action {
    let Some(live) = live else {
        return if deleting { Action::None } else { Action::Create };
    };
    if live.provisioner != NFS_PROVISIONER {
        return Action::SkipForeign {
            owner: live.provisioner.clone(),
        };
    }
    if deleting {
        return Action::Delete;
    }

    let immutable_changed = live.reclaim_policy != desired.reclaim_policy
        || live.volume_binding_mode != desired.volume_binding_mode
        || live.allow_volume_expansion != desired.allow_volume_expansion
        || live.parameters.clone().unwrap_or_default()
            != desired.parameters.clone().unwrap_or_default();
    if immutable_changed {
        return Action::Recreate;
    }

    let mutable_changed = live.mount_options.clone().unwrap_or_default()
        != desired.mount_options.clone().unwrap_or_default()
        || !contains_all(live.labels(), desired.labels())
        || !contains_all(live.annotations(), desired.annotations());
    if mutable_changed {
        Action::UpdateInPlace
    } else {
        Action::None
    }
}

pub fn classify_secret(
    live: Option<&Secret>,
    desired: &Secret,
    deleting: bool,
) -> Result<Action, Error> {
    let Some(live) = live else {
        return Ok(if deleting { Action::None } else { Action::Create });
    };
    let managed = is_managed(live.labels());
    if deleting {
        return Ok(if managed {
            Action::Delete
        } else {
            Action::SkipForeign {
                owner: "unmanaged".to_owned(),
            }
        });
    }

    let payload_changed =
        live.data.clone().unwrap_or_default() != desired.data.clone().unwrap_or_default();
    match (payload_changed, managed) {
        (true, false) => ForeignSecretSnafu {
            name: live.name_any(),
        }
        .fail(),
        (true, true) | (false, false) => Ok(Action::UpdateInPlace),
        (false, true) => Ok(Action::None),
    }
}

pub fn classify_snapshot_class(
    live: Option<&VolumeSnapshotClass>,
    desired: &VolumeSnapshotClass,
    deleting: bool,
) -> Action {
    let Some(live) = live else {
        return if deleting { Action::None } else { Action::Create };
    };
    if live.driver != NFS_PROVISIONER {
        return Action::SkipForeign {
            owner: live.driver.clone(),
        };
    }
    if deleting {
        return Action::Delete;
    }

    let changed = live.deletion_policy != desired.deletion_policy
        || live.parameters.clone().unwrap_or_default()
            != desired.parameters.clone().unwrap_or_default()
        || !contains_all(live.labels(), desired.labels())
        || !contains_all(live.annotations(), desired.annotations());
    if changed {
        Action::UpdateInPlace
    } else {
        Action::None
    }
}

fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str) == Some(MANAGED_BY_LABEL_VALUE)
}

/// Entries added to the live object by other agents are not a difference.
fn contains_all(live: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
    desired
        .iter()
        .all(|(key, value)| live.get(key) == Some(value))
}
