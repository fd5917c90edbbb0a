//! Flags derived storage classes whose declaration no longer passes validation
//! against the current module configuration.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use csi_nfs_common::{error_chain, signal::ShutdownSignal, store::ObjectStore};
use csi_nfs_crd::{
    module_config::{ModuleConfig, MODULE_CONFIG_NAME},
    validation, NFSStorageClass, MODULE_CONFIG_MISMATCH_LABEL_KEY, NFS_PROVISIONER,
};
use futures::StreamExt;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Api, Client, ResourceExt,
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

pub const MODULE_CONFIG_CONTROLLER_NAME: &str = "module-config";

const MISMATCH_LABEL_VALUE: &str = "true";

pub struct Ctx {
    pub module_configs: Arc<dyn ObjectStore<ModuleConfig>>,
    pub nfs_storage_classes: Arc<dyn ObjectStore<NFSStorageClass>>,
    pub storage_classes: Arc<dyn ObjectStore<StorageClass>>,
    pub requeue_interval: Duration,
}

impl Ctx {
    pub fn new(client: &Client, requeue_interval: Duration) -> Self {
        Self {
            module_configs: Arc::new(Api::<ModuleConfig>::all(client.clone())),
            nfs_storage_classes: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
            storage_classes: Arc::new(Api::<StorageClass>::all(client.clone())),
            requeue_interval,
        }
    }
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get the module configuration"))]
    GetModuleConfig { source: kube::Error },

    #[snafu(display("failed to list NFSStorageClasses"))]
    ListDeclarations { source: kube::Error },

    #[snafu(display("failed to list StorageClasses"))]
    ListStorageClasses { source: kube::Error },

    #[snafu(display("StorageClass {name} of NFSStorageClass {name} does not exist"))]
    MissingStorageClass { name: String },

    #[snafu(display("failed to update the labels of StorageClass {name}"))]
    UpdateLabels { source: kube::Error, name: String },

    #[snafu(display("{}", join_errors(errors)))]
    Several { errors: Vec<Error> },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|error| error_chain(error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn reconcile_module_config(mc: Arc<ModuleConfig>, ctx: Arc<Ctx>) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let module_config = ctx
        .module_configs
        .get_opt(&mc.name_any())
        .await
        .context(GetModuleConfigSnafu)?
        .unwrap_or_else(ModuleConfig::unset);

    let declarations = ctx
        .nfs_storage_classes
        .list()
        .await
        .context(ListDeclarationsSnafu)?;
    let storage_classes = ctx
        .storage_classes
        .list()
        .await
        .context(ListStorageClassesSnafu)?
        .into_iter()
        .map(|storage_class| (storage_class.name_any(), storage_class))
        .collect::<BTreeMap<_, _>>();

    let mut errors = Vec::new();
    for nsc in declarations.iter().filter(|nsc| !nsc.is_deleting()) {
        let name = nsc.name_any();
        let Some(storage_class) = storage_classes.get(&name) else {
            errors.push(Error::MissingStorageClass { name });
            continue;
        };
        if storage_class.provisioner != NFS_PROVISIONER {
            tracing::debug!(
                storage_class = %name,
                provisioner = %storage_class.provisioner,
                "skipping foreign StorageClass"
            );
            continue;
        }

        let mismatch = match validation::validate(&module_config, nsc) {
            Ok(()) => false,
            Err(error) => {
                tracing::info!(
                    nfs_storage_class = %name,
                    error = &error as &dyn std::error::Error,
                    "NFSStorageClass does not match the module configuration"
                );
                true
            }
        };
        if let Err(error) = set_mismatch_label(&*ctx.storage_classes, storage_class, mismatch).await
        {
            errors.push(error);
        }
    }

    match errors.len() {
        0 => Ok(Action::await_change()),
        1 => Err(errors.remove(0)),
        _ => SeveralSnafu { errors }.fail(),
    }
}

pub fn error_policy(_mc: Arc<ModuleConfig>, error: &Error, ctx: Arc<Ctx>) -> Action {
    tracing::warn!(
        error = error as &dyn std::error::Error,
        category = error.category(),
        "module configuration reconcile failed, requeueing"
    );
    Action::requeue(ctx.requeue_interval)
}

async fn set_mismatch_label(
    store: &dyn ObjectStore<StorageClass>,
    storage_class: &StorageClass,
    mismatch: bool,
) -> Result<()> {
    let labelled = storage_class
        .labels()
        .get(MODULE_CONFIG_MISMATCH_LABEL_KEY)
        .is_some_and(|value| value == MISMATCH_LABEL_VALUE);
    if labelled == mismatch {
        return Ok(());
    }

    let name = storage_class.name_any();
    let value = mismatch.then_some(MISMATCH_LABEL_VALUE);
    store
        .merge_patch(
            &name,
            serde_json::json!({
                "metadata": { "labels": { MODULE_CONFIG_MISMATCH_LABEL_KEY: value } }
            }),
        )
        .await
        .context(UpdateLabelsSnafu { name: &name })?;
    tracing::info!(storage_class = %name, mismatch, "updated module configuration label");
    Ok(())
}

/// Runs the controller until `shutdown` resolves.
pub async fn run(client: Client, ctx: Arc<Ctx>, shutdown: ShutdownSignal) {
    let only_module_config =
        watcher::Config::default().fields(&format!("metadata.name={MODULE_CONFIG_NAME}"));
    Controller::new(Api::<ModuleConfig>::all(client.clone()), only_module_config)
        // New declarations are checked against the configuration right away.
        .watches(
            Api::<NFSStorageClass>::all(client),
            watcher::Config::default(),
            |_| Some(ObjectRef::<ModuleConfig>::new(MODULE_CONFIG_NAME)),
        )
        .graceful_shutdown_on(shutdown)
        .run(reconcile_module_config, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(
                    controller = MODULE_CONFIG_CONTROLLER_NAME,
                    %object,
                    "reconciled ModuleConfig"
                ),
                Err(error) => tracing::debug!(
                    controller = MODULE_CONFIG_CONTROLLER_NAME,
                    error = &error as &dyn std::error::Error,
                    "ModuleConfig reconcile did not finish"
                ),
            }
        })
        .await;
}
