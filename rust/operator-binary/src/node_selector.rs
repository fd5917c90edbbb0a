//! Keeps the module node label on exactly the nodes selected by some declaration,
//! except for nodes that still carry NFS work, and moves module pods off nodes
//! that lost the label.
//!
//! Every tick reads one [`ClusterSnapshot`], computes a [`Plan`] from it without
//! touching the cluster, and then applies the plan.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use csi_nfs_common::{
    client::is_not_found, retry::retry_on_conflict, signal::ShutdownSignal, store::ObjectStore,
};
use csi_nfs_crd::{
    selector, snapshot::VolumeSnapshot, NFSStorageClass, NFS_PROVISIONER, NODE_LABEL_KEY,
    STORAGE_PROVISIONER_ANNOTATION,
};
use k8s_openapi::api::{
    coordination::v1::Lease,
    core::v1::{Node, PersistentVolumeClaim, Pod},
};
use kube::{Api, Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::time::MissedTickBehavior;

/// Lease held by the external-snapshotter sidecar of the active NFS controller pod.
pub const SNAPSHOTTER_LEASE_NAME: &str = "external-snapshotter-leader-nfs-csi-k8s-io";
pub const CONTROLLER_POD_LABEL_KEY: &str = "app";
pub const CONTROLLER_POD_LABEL_VALUE: &str = "csi-controller";

const CLAIM_PHASE_PENDING: &str = "Pending";

pub struct Ctx {
    pub nfs_storage_classes: Arc<dyn ObjectStore<NFSStorageClass>>,
    pub nodes: Arc<dyn ObjectStore<Node>>,
    /// Pods of all namespaces.
    pub pods: Arc<dyn ObjectStore<Pod>>,
    /// Pods of the controller namespace, used for deletion.
    pub module_pods: Arc<dyn ObjectStore<Pod>>,
    pub claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    pub snapshots: Arc<dyn ObjectStore<VolumeSnapshot>>,
    /// Leases of the controller namespace.
    pub leases: Arc<dyn ObjectStore<Lease>>,
    pub controller_namespace: String,
}

impl Ctx {
    pub fn new(client: &Client, controller_namespace: &str) -> Self {
        Self {
            nfs_storage_classes: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
            nodes: Arc::new(Api::<Node>::all(client.clone())),
            pods: Arc::new(Api::<Pod>::all(client.clone())),
            module_pods: Arc::new(Api::<Pod>::namespaced(client.clone(), controller_namespace)),
            claims: Arc::new(Api::<PersistentVolumeClaim>::all(client.clone())),
            snapshots: Arc::new(Api::<VolumeSnapshot>::all(client.clone())),
            leases: Arc::new(Api::<Lease>::namespaced(client.clone(), controller_namespace)),
            controller_namespace: controller_namespace.to_owned(),
        }
    }
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to list NFSStorageClasses"))]
    ListDeclarations { source: kube::Error },

    #[snafu(display("failed to list nodes"))]
    ListNodes { source: kube::Error },

    #[snafu(display("failed to list pods"))]
    ListPods { source: kube::Error },

    #[snafu(display("failed to list persistent volume claims"))]
    ListClaims { source: kube::Error },

    #[snafu(display("failed to list volume snapshots"))]
    ListSnapshots { source: kube::Error },

    #[snafu(display("failed to get the snapshotter leader lease"))]
    GetLease { source: kube::Error },

    #[snafu(display("failed to update the module label of node {node}"))]
    UpdateNodeLabel { source: kube::Error, node: String },

    #[snafu(display("failed to delete pod {pod}"))]
    DeletePod { source: kube::Error, pod: String },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// The cluster state one tick works on.
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub declarations: Vec<NFSStorageClass>,
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub claims: Vec<PersistentVolumeClaim>,
    pub snapshots: Vec<VolumeSnapshot>,
    /// Node running the active NFS controller, if the snapshotter lease names one.
    pub controller_node: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Protection {
    /// Pods on the node mount NFS-provisioned claims.
    NfsPods(Vec<String>),
    /// The active controller runs here and NFS snapshots or claims are still pending.
    PendingControllerWork,
    /// Some declaration's selector could not be evaluated, so the node may still be selected.
    UnevaluatedSelectors,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_label: BTreeSet<String>,
    pub to_unlabel: BTreeSet<String>,
    /// Labelled nodes outside every selector that keep the label for now.
    pub protected: BTreeMap<String, Protection>,
    /// `namespace/name` of module pods to delete.
    pub pods_to_delete: Vec<String>,
    /// Declarations left out of this tick because their selector is invalid.
    pub skipped_declarations: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_label.is_empty() && self.to_unlabel.is_empty() && self.pods_to_delete.is_empty()
    }
}

/// A declaration with an invalid selector is skipped. While any is skipped, no node
/// loses the label.
pub fn plan(snapshot: &ClusterSnapshot, controller_namespace: &str) -> Plan {
    let mut selectors = Vec::new();
    let mut skipped_declarations = Vec::new();
    for nsc in snapshot.declarations.iter().filter(|nsc| !nsc.is_deleting()) {
        let name = nsc.name_any();
        match selector::parse(&nsc.effective_node_selector()) {
            Ok(node_selector) => selectors.push(node_selector),
            Err(error) => {
                tracing::warn!(
                    nfs_storage_class = %name,
                    error = &error as &dyn std::error::Error,
                    "skipping NFSStorageClass with an invalid node selector"
                );
                skipped_declarations.push(name);
            }
        }
    }

    let selected = snapshot
        .nodes
        .iter()
        .filter(|node| {
            selectors
                .iter()
                .any(|node_selector| selector::selects(node_selector, node.metadata.labels.as_ref()))
        })
        .map(|node| node.name_any())
        .collect::<BTreeSet<_>>();

    let labelled = snapshot
        .nodes
        .iter()
        .filter(|node| node.labels().contains_key(NODE_LABEL_KEY))
        .map(|node| node.name_any())
        .collect::<BTreeSet<_>>();

    let nfs_claims = snapshot
        .claims
        .iter()
        .filter(|claim| is_nfs_claim(claim))
        .map(|claim| (claim.namespace().unwrap_or_default(), claim.name_any()))
        .collect::<BTreeSet<_>>();
    let removable = controller_removable(snapshot, &nfs_claims);

    let mut plan = Plan {
        to_label: selected.difference(&labelled).cloned().collect(),
        skipped_declarations,
        ..Plan::default()
    };
    for node in labelled.difference(&selected) {
        let nfs_pods = snapshot
            .pods
            .iter()
            .filter(|pod| pod_node(pod) == Some(node.as_str()) && uses_claim_from(pod, &nfs_claims))
            .map(pod_ref)
            .collect::<Vec<_>>();
        if !nfs_pods.is_empty() {
            plan.protected
                .insert(node.clone(), Protection::NfsPods(nfs_pods));
            continue;
        }

        let is_controller_node = snapshot.controller_node.as_deref() == Some(node.as_str());
        let hosts_controller = snapshot.pods.iter().any(|pod| {
            pod_node(pod) == Some(node.as_str()) && is_controller_pod(pod, controller_namespace)
        });
        if is_controller_node && hosts_controller && !removable {
            plan.protected
                .insert(node.clone(), Protection::PendingControllerWork);
            continue;
        }

        if !plan.skipped_declarations.is_empty() {
            plan.protected
                .insert(node.clone(), Protection::UnevaluatedSelectors);
            continue;
        }

        plan.to_unlabel.insert(node.clone());
    }

    let capable = selected
        .iter()
        .chain(plan.protected.keys())
        .map(String::as_str)
        .collect::<BTreeSet<_>>();
    plan.pods_to_delete = snapshot
        .pods
        .iter()
        .filter(|pod| pod.namespace().as_deref() == Some(controller_namespace))
        .filter(|pod| pod_node(pod).is_some_and(|node| !capable.contains(node)))
        .filter(|pod| !is_controller_pod(pod, controller_namespace) || removable)
        .map(pod_ref)
        .collect();

    plan
}

fn is_nfs_claim(claim: &PersistentVolumeClaim) -> bool {
    claim
        .annotations()
        .get(STORAGE_PROVISIONER_ANNOTATION)
        .is_some_and(|provisioner| provisioner == NFS_PROVISIONER)
}

/// The active controller may move only while no NFS snapshot or claim is waiting on it.
fn controller_removable(snapshot: &ClusterSnapshot, nfs_claims: &BTreeSet<(String, String)>) -> bool {
    let pending_snapshot = snapshot.snapshots.iter().any(|volume_snapshot| {
        !volume_snapshot.is_ready()
            && volume_snapshot
                .spec
                .source
                .persistent_volume_claim_name
                .as_ref()
                .is_some_and(|claim| {
                    nfs_claims.contains(&(
                        volume_snapshot.namespace().unwrap_or_default(),
                        claim.clone(),
                    ))
                })
    });
    let pending_claim = snapshot.claims.iter().any(|claim| {
        is_nfs_claim(claim)
            && claim
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                == Some(CLAIM_PHASE_PENDING)
    });
    if pending_snapshot || pending_claim {
        tracing::debug!(pending_snapshot, pending_claim, "NFS controller has pending work");
    }
    !pending_snapshot && !pending_claim
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|node| !node.is_empty())
}

fn uses_claim_from(pod: &Pod, claims: &BTreeSet<(String, String)>) -> bool {
    let namespace = pod.namespace().unwrap_or_default();
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .any(|source| claims.contains(&(namespace.clone(), source.claim_name.clone())))
}

fn is_controller_pod(pod: &Pod, controller_namespace: &str) -> bool {
    pod.namespace().as_deref() == Some(controller_namespace)
        && pod
            .labels()
            .get(CONTROLLER_POD_LABEL_KEY)
            .is_some_and(|value| value == CONTROLLER_POD_LABEL_VALUE)
}

fn pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Reads everything one tick needs.
pub async fn take_snapshot(ctx: &Ctx) -> Result<ClusterSnapshot, Error> {
    let snapshots = match ctx.snapshots.list().await {
        Ok(snapshots) => snapshots,
        Err(error) if is_not_found(&error) => {
            tracing::warn!("VolumeSnapshot API is not installed, assuming no snapshots");
            Vec::new()
        }
        Err(error) => return Err(error).context(ListSnapshotsSnafu),
    };
    let controller_node = ctx
        .leases
        .get_opt(SNAPSHOTTER_LEASE_NAME)
        .await
        .context(GetLeaseSnafu)?
        .and_then(|lease| lease.spec)
        .and_then(|spec| spec.holder_identity);

    Ok(ClusterSnapshot {
        declarations: ctx
            .nfs_storage_classes
            .list()
            .await
            .context(ListDeclarationsSnafu)?,
        nodes: ctx.nodes.list().await.context(ListNodesSnafu)?,
        pods: ctx.pods.list().await.context(ListPodsSnafu)?,
        claims: ctx.claims.list().await.context(ListClaimsSnafu)?,
        snapshots,
        controller_node,
    })
}

/// One full tick: snapshot, plan, apply.
pub async fn reconcile_nodes(ctx: &Ctx) -> Result<Plan, Error> {
    let snapshot = take_snapshot(ctx).await?;
    let plan = plan(&snapshot, &ctx.controller_namespace);

    for node in &plan.to_label {
        tracing::info!(%node, "adding module label");
        set_node_label(&*ctx.nodes, node, true)
            .await
            .context(UpdateNodeLabelSnafu { node })?;
    }
    for (node, protection) in &plan.protected {
        tracing::warn!(%node, ?protection, "node is no longer selected but keeps the module label");
    }
    for node in &plan.to_unlabel {
        tracing::info!(%node, "removing module label");
        set_node_label(&*ctx.nodes, node, false)
            .await
            .context(UpdateNodeLabelSnafu { node })?;
    }
    for pod in &plan.pods_to_delete {
        tracing::info!(%pod, "deleting module pod on a node without the module label");
        let name = pod.rsplit('/').next().unwrap_or(pod);
        ctx.module_pods
            .delete(name)
            .await
            .context(DeletePodSnafu { pod })?;
    }
    Ok(plan)
}

async fn set_node_label(store: &dyn ObjectStore<Node>, name: &str, present: bool) -> kube::Result<()> {
    retry_on_conflict(|| async move {
        let Some(mut node) = store.get_opt(name).await? else {
            return Ok(());
        };
        let labels = node.labels_mut();
        let changed = if present {
            labels.insert(NODE_LABEL_KEY.to_owned(), String::new()).as_deref() != Some("")
        } else {
            labels.remove(NODE_LABEL_KEY).is_some()
        };
        if changed {
            store.replace(name, &node).await?;
        }
        Ok(())
    })
    .await
}

/// Runs a tick every `interval` until `shutdown` resolves. A tick in progress is
/// abandoned on shutdown.
pub async fn run(ctx: Ctx, interval: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.clone() => return,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shutdown.clone() => return,
            result = reconcile_nodes(&ctx) => match result {
                Ok(plan) if plan.is_empty() => tracing::debug!("node selection is up to date"),
                Ok(plan) => tracing::info!(
                    labelled = plan.to_label.len(),
                    unlabelled = plan.to_unlabel.len(),
                    protected = plan.protected.len(),
                    deleted_pods = plan.pods_to_delete.len(),
                    skipped_declarations = plan.skipped_declarations.len(),
                    "reconciled node selection"
                ),
                Err(error) => tracing::error!(
                    error = &error as &dyn std::error::Error,
                    category = error.category(),
                    "failed to reconcile node selection"
                ),
            },
        }
    }
}
