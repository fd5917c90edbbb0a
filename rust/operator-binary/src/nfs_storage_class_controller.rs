//! Reconciles each [`NFSStorageClass`] into its storage class, credentials secret and
//! volume snapshot class.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use csi_nfs_common::{
    error_chain,
    signal::ShutdownSignal,
    store::{finalizers_patch, ObjectStore},
};
use csi_nfs_crd::{
    declaration_name_for_secret,
    module_config::{ModuleConfig, MODULE_CONFIG_NAME},
    snapshot::VolumeSnapshotClass,
    validation, NFSStorageClass, NFSStorageClassStatus, FINALIZER, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE,
};
use futures::StreamExt;
use k8s_openapi::api::{core::v1::Secret, storage::v1::StorageClass};
use kube::{
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Api, Client, Resource, ResourceExt,
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    derivation::derive,
    diff::{self, classify_secret, classify_snapshot_class, classify_storage_class},
};

pub const NFS_STORAGE_CLASS_CONTROLLER_NAME: &str = "nfs-storage-class";

const STORAGE_CLASS: &str = "StorageClass";
const SECRET: &str = "Secret";
const VOLUME_SNAPSHOT_CLASS: &str = "VolumeSnapshotClass";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the reconciler reads or writes.
pub struct Stores {
    pub nfs_storage_classes: Arc<dyn ObjectStore<NFSStorageClass>>,
    pub module_configs: Arc<dyn ObjectStore<ModuleConfig>>,
    pub storage_classes: Arc<dyn ObjectStore<StorageClass>>,
    /// Scoped to the controller namespace.
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub snapshot_classes: Arc<dyn ObjectStore<VolumeSnapshotClass>>,
}

impl Stores {
    pub fn new(client: &Client, controller_namespace: &str) -> Self {
        Self {
            nfs_storage_classes: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
            module_configs: Arc::new(Api::<ModuleConfig>::all(client.clone())),
            storage_classes: Arc::new(Api::<StorageClass>::all(client.clone())),
            secrets: Arc::new(Api::<Secret>::namespaced(
                client.clone(),
                controller_namespace,
            )),
            snapshot_classes: Arc::new(Api::<VolumeSnapshotClass>::all(client.clone())),
        }
    }
}

pub struct Ctx {
    pub stores: Stores,
    pub controller_namespace: String,
    pub requeue_interval: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Ctx {
    pub fn new(
        stores: Stores,
        controller_namespace: impl Into<String>,
        requeue_interval: Duration,
    ) -> Self {
        Self {
            stores,
            controller_namespace: controller_namespace.into(),
            requeue_interval,
            failures: Mutex::default(),
        }
    }

    /// Records another consecutive failure of `name` and returns how long to wait.
    fn backoff(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(name.to_owned()).or_default();
        *attempt += 1;
        backoff_delay(*attempt, self.requeue_interval)
    }

    fn forget(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// `1s * 2^(attempt - 1)`, capped at `cap`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    INITIAL_BACKOFF.saturating_mul(1 << exponent).min(cap)
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get NFSStorageClass {name}"))]
    GetDeclaration { source: kube::Error, name: String },

    #[snafu(display("failed to update finalizers of NFSStorageClass {name}"))]
    UpdateFinalizers { source: kube::Error, name: String },

    #[snafu(display("failed to get the module configuration"))]
    GetModuleConfig { source: kube::Error },

    #[snafu(display("failed to get {kind} {name}"))]
    GetDerived {
        source: kube::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to apply {action} to {kind} {name}"))]
    ApplyDerived {
        source: kube::Error,
        kind: &'static str,
        name: String,
        action: &'static str,
    },

    #[snafu(display("failed to update status of NFSStorageClass {name}"))]
    UpdateStatus { source: kube::Error, name: String },

    #[snafu(display("{reconcile}; the status update failed as well: {status}"))]
    ReconcileAndStatus {
        reconcile: Box<Error>,
        status: Box<Error>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// What a successful pass left behind.
enum Outcome {
    Created,
    /// Rejected by the module configuration; waits for either side to change.
    Invalid(String),
    /// Some derived names are held by objects this controller does not own.
    Foreign(Vec<String>),
    /// Deletion finished and the finalizer is gone.
    Released,
}

impl Outcome {
    fn status(&self) -> Option<NFSStorageClassStatus> {
        match self {
            Self::Created => Some(NFSStorageClassStatus::created()),
            Self::Invalid(reason) => Some(NFSStorageClassStatus::failed(reason.clone())),
            Self::Foreign(reasons) => Some(NFSStorageClassStatus::failed(reasons.join("; "))),
            Self::Released => None,
        }
    }

    fn next(&self, requeue_interval: Duration) -> Action {
        match self {
            Self::Foreign(_) => Action::requeue(requeue_interval),
            Self::Created | Self::Invalid(_) | Self::Released => Action::await_change(),
        }
    }
}

pub async fn reconcile_nfs_storage_class(
    nsc: Arc<NFSStorageClass>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let name = nsc.name_any();
    let Some(nsc) = ctx
        .stores
        .nfs_storage_classes
        .get_opt(&name)
        .await
        .context(GetDeclarationSnafu { name: &name })?
    else {
        tracing::debug!("NFSStorageClass is gone, nothing to do");
        ctx.forget(&name);
        return Ok(Action::await_change());
    };

    let outcome = if nsc.is_deleting() {
        release(&nsc, &ctx).await
    } else {
        converge(&nsc, &ctx).await
    };

    let status = match &outcome {
        Ok(outcome) => outcome.status(),
        Err(error) => Some(NFSStorageClassStatus::failed(error_chain(error))),
    };
    let status_result = match status {
        Some(status) => update_status(&nsc, status, &ctx).await,
        None => Ok(()),
    };

    match (outcome, status_result) {
        (Ok(outcome), Ok(())) => {
            ctx.forget(&name);
            Ok(outcome.next(ctx.requeue_interval))
        }
        (Ok(_), Err(status_error)) => Err(status_error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(status_error)) => Err(Error::ReconcileAndStatus {
            reconcile: Box::new(error),
            status: Box::new(status_error),
        }),
    }
}

pub fn error_policy(nsc: Arc<NFSStorageClass>, error: &Error, ctx: Arc<Ctx>) -> Action {
    let delay = ctx.backoff(&nsc.name_any());
    tracing::warn!(
        error = error as &dyn std::error::Error,
        category = error.category(),
        ?delay,
        "reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

async fn converge(nsc: &NFSStorageClass, ctx: &Ctx) -> Result<Outcome> {
    let name = nsc.name_any();
    if !nsc.finalizers().iter().any(|finalizer| finalizer == FINALIZER) {
        let mut finalizers = nsc.finalizers().to_vec();
        finalizers.push(FINALIZER.to_owned());
        ctx.stores
            .nfs_storage_classes
            .merge_patch(&name, finalizers_patch(&finalizers))
            .await
            .context(UpdateFinalizersSnafu { name: &name })?;
    }

    let module_config = ctx
        .stores
        .module_configs
        .get_opt(MODULE_CONFIG_NAME)
        .await
        .context(GetModuleConfigSnafu)?
        .unwrap_or_else(ModuleConfig::unset);
    if let Err(error) = validation::validate(&module_config, nsc) {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "NFSStorageClass is not allowed by the module configuration"
        );
        return Ok(Outcome::Invalid(format!("{}: {error}", error.code())));
    }

    let foreign = sync_derived(nsc, ctx, false).await?;
    if foreign.is_empty() {
        Ok(Outcome::Created)
    } else {
        Ok(Outcome::Foreign(foreign))
    }
}

async fn release(nsc: &NFSStorageClass, ctx: &Ctx) -> Result<Outcome> {
    let name = nsc.name_any();
    // Foreign objects are left alone, they never block the declaration from going away.
    sync_derived(nsc, ctx, true).await?;

    if nsc.finalizers().iter().any(|finalizer| finalizer == FINALIZER) {
        let remaining = nsc
            .finalizers()
            .iter()
            .filter(|finalizer| *finalizer != FINALIZER)
            .cloned()
            .collect::<Vec<_>>();
        ctx.stores
            .nfs_storage_classes
            .merge_patch(&name, finalizers_patch(&remaining))
            .await
            .context(UpdateFinalizersSnafu { name: &name })?;
        tracing::info!("removed finalizer from deleted NFSStorageClass");
    }
    Ok(Outcome::Released)
}

/// Applies the classified action to each derived object in turn and returns the
/// reasons for every object that had to be skipped.
async fn sync_derived(nsc: &NFSStorageClass, ctx: &Ctx, deleting: bool) -> Result<Vec<String>> {
    let desired = derive(nsc, &ctx.controller_namespace);
    let mut skipped = Vec::new();

    let live = get_derived(
        &*ctx.stores.storage_classes,
        STORAGE_CLASS,
        &desired.storage_class.name_any(),
    )
    .await?;
    let action = classify_storage_class(live.as_ref(), &desired.storage_class, deleting);
    skipped.extend(
        converge_object(
            &*ctx.stores.storage_classes,
            STORAGE_CLASS,
            live,
            desired.storage_class,
            &action,
        )
        .await?,
    );

    let live = get_derived(&*ctx.stores.secrets, SECRET, &desired.secret.name_any()).await?;
    match classify_secret(live.as_ref(), &desired.secret, deleting) {
        Ok(action) => skipped.extend(
            converge_object(&*ctx.stores.secrets, SECRET, live, desired.secret, &action).await?,
        ),
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "leaving credentials secret untouched"
            );
            skipped.push(error.to_string());
        }
    }

    let live = get_derived(
        &*ctx.stores.snapshot_classes,
        VOLUME_SNAPSHOT_CLASS,
        &desired.snapshot_class.name_any(),
    )
    .await?;
    let action = classify_snapshot_class(live.as_ref(), &desired.snapshot_class, deleting);
    skipped.extend(
        converge_object(
            &*ctx.stores.snapshot_classes,
            VOLUME_SNAPSHOT_CLASS,
            live,
            desired.snapshot_class,
            &action,
        )
        .await?,
    );

    Ok(skipped)
}

async fn get_derived<K>(
    store: &dyn ObjectStore<K>,
    kind: &'static str,
    name: &str,
) -> Result<Option<K>>
where
    K: Clone + Send + Sync + 'static,
{
    store
        .get_opt(name)
        .await
        .context(GetDerivedSnafu { kind, name })
}

/// Performs `action` on one derived object. Returns the status reason when the
/// object is foreign and was skipped.
async fn converge_object<K>(
    store: &dyn ObjectStore<K>,
    kind: &'static str,
    live: Option<K>,
    desired: K,
    action: &diff::Action,
) -> Result<Option<String>>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let name = desired.name_any();
    let verb: &'static str = action.into();
    tracing::debug!(kind, %name, action = verb, "converging derived object");
    let context = ApplyDerivedSnafu {
        kind,
        name: &name,
        action: verb,
    };

    match action {
        diff::Action::None => {}
        diff::Action::SkipForeign { owner } => {
            tracing::warn!(kind, %name, %owner, "name is taken by a foreign object, leaving it alone");
            return Ok(Some(format!(
                "foreign-object: {kind} {name} is owned by {owner}"
            )));
        }
        diff::Action::Create => {
            store.create(&desired).await.context(context)?;
        }
        diff::Action::UpdateInPlace => match live {
            Some(live) => {
                store
                    .replace(&name, &carry_over(&live, desired))
                    .await
                    .context(context)?;
            }
            None => {
                store.create(&desired).await.context(context)?;
            }
        },
        diff::Action::Recreate => {
            strip_finalizers(store, &name, live.as_ref())
                .await
                .context(context)?;
            store.delete(&name).await.context(context)?;
            store.create(&desired).await.context(context)?;
        }
        diff::Action::Delete => {
            strip_finalizers(store, &name, live.as_ref())
                .await
                .context(context)?;
            store.delete(&name).await.context(context)?;
        }
    }
    Ok(None)
}

async fn strip_finalizers<K>(
    store: &dyn ObjectStore<K>,
    name: &str,
    live: Option<&K>,
) -> kube::Result<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    if live.is_some_and(|live| !live.finalizers().is_empty()) {
        store.merge_patch(name, finalizers_patch(&[])).await?;
    }
    Ok(())
}

/// The desired object, updated so that replacing `live` with it keeps what other
/// agents added and passes the optimistic concurrency check.
fn carry_over<K: Resource>(live: &K, mut desired: K) -> K {
    let live = live.meta();
    let meta = desired.meta_mut();
    meta.resource_version = live.resource_version.clone();
    meta.labels = Some(merged(live.labels.as_ref(), meta.labels.take()));
    meta.annotations = Some(merged(live.annotations.as_ref(), meta.annotations.take()));

    let mut finalizers = live.finalizers.clone().unwrap_or_default();
    for finalizer in meta.finalizers.take().unwrap_or_default() {
        if !finalizers.contains(&finalizer) {
            finalizers.push(finalizer);
        }
    }
    meta.finalizers = Some(finalizers);
    desired
}

fn merged(
    live: Option<&BTreeMap<String, String>>,
    desired: Option<BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = live.cloned().unwrap_or_default();
    merged.extend(desired.unwrap_or_default());
    merged
}

async fn update_status(
    nsc: &NFSStorageClass,
    status: NFSStorageClassStatus,
    ctx: &Ctx,
) -> Result<()> {
    if nsc.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let name = nsc.name_any();
    ctx.stores
        .nfs_storage_classes
        .merge_patch_status(&name, serde_json::json!({ "status": status }))
        .await
        .context(UpdateStatusSnafu { name })?;
    Ok(())
}

/// Runs the controller until `shutdown` resolves.
pub async fn run(client: Client, ctx: Arc<Ctx>, shutdown: ShutdownSignal) {
    let managed =
        watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL_KEY}={MANAGED_BY_LABEL_VALUE}"));
    let controller = Controller::new(
        Api::<NFSStorageClass>::all(client.clone()),
        watcher::Config::default(),
    );
    let declarations = controller.store();

    controller
        .watches(
            Api::<ModuleConfig>::all(client.clone()),
            watcher::Config::default().fields(&format!("metadata.name={MODULE_CONFIG_NAME}")),
            move |_| {
                declarations
                    .state()
                    .into_iter()
                    .map(|nsc| ObjectRef::from_obj(&*nsc))
            },
        )
        .watches(
            Api::<StorageClass>::all(client.clone()),
            managed.clone(),
            |storage_class| Some(ObjectRef::<NFSStorageClass>::new(&storage_class.name_any())),
        )
        .watches(
            Api::<Secret>::namespaced(client.clone(), &ctx.controller_namespace),
            managed.clone(),
            |secret| {
                let name = secret.name_any();
                declaration_name_for_secret(&name).map(ObjectRef::<NFSStorageClass>::new)
            },
        )
        .watches(
            Api::<VolumeSnapshotClass>::all(client),
            managed,
            |snapshot_class| {
                Some(ObjectRef::<NFSStorageClass>::new(&snapshot_class.name_any()))
            },
        )
        .graceful_shutdown_on(shutdown)
        .run(reconcile_nfs_storage_class, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(
                    controller = NFS_STORAGE_CLASS_CONTROLLER_NAME,
                    %object,
                    "reconciled NFSStorageClass"
                ),
                Err(error) => tracing::debug!(
                    controller = NFS_STORAGE_CLASS_CONTROLLER_NAME,
                    error = &error as &dyn std::error::Error,
                    "NFSStorageClass reconcile did not finish"
                ),
            }
        })
        .await;
}
