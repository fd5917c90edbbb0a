//! The `filter` and `prioritize` extender verbs.
//!
//! A pod whose claims are provisioned by the NFS driver may only land on nodes
//! admitted by the node selectors of every NFSStorageClass backing those claims.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use csi_nfs_common::{http_error, store::ObjectStore};
use csi_nfs_crd::{
    selector, NFSStorageClass, BETA_STORAGE_PROVISIONER_ANNOTATION, NFS_PROVISIONER,
    STORAGE_PROVISIONER_ANNOTATION,
};
use k8s_openapi::api::{
    core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod},
    storage::v1::StorageClass,
};
use kube::{Api, ResourceExt};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

pub const NOT_SELECTED_REASON: &str = "node is not selected by user selectors";

/// Request body of both verbs, as sent by kube-scheduler.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExtenderArgs {
    pub pod: Option<Pod>,
    pub nodes: Option<NodeList>,
    #[serde(rename = "nodenames", alias = "nodeNames")]
    pub node_names: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<Node>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExtenderFilterResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    #[serde(rename = "nodenames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    #[serde(
        rename = "failedNodes",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub failed_nodes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

#[derive(Snafu, Debug)]
#[snafu(module)]
pub enum FilterError {
    #[snafu(display("unable to decode the request"))]
    ParseRequest { source: serde_json::Error },

    #[snafu(display("no pod in the request"))]
    MissingPod,

    #[snafu(display("no nodes provided"))]
    NoNodes,

    #[snafu(display("failed to get PersistentVolumeClaim {namespace}/{name}"))]
    GetClaim {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("found no PersistentVolumeClaim {namespace}/{name}"))]
    ClaimNotFound { namespace: String, name: String },

    #[snafu(display("PersistentVolumeClaim {namespace}/{name} has no storage class"))]
    ClaimWithoutStorageClass { namespace: String, name: String },

    #[snafu(display("failed to get StorageClass {name}"))]
    GetStorageClass { source: kube::Error, name: String },

    #[snafu(display("found no StorageClass {name}"))]
    StorageClassNotFound { name: String },

    #[snafu(display("failed to get PersistentVolume {name}"))]
    GetVolume { source: kube::Error, name: String },

    #[snafu(display("failed to get NFSStorageClass {name}"))]
    GetDeclaration { source: kube::Error, name: String },

    #[snafu(display("found no NFSStorageClass {name}"))]
    DeclarationNotFound { name: String },

    #[snafu(display("failed to list nodes"))]
    ListNodes { source: kube::Error },

    #[snafu(display("NFSStorageClass {name} has an invalid node selector"))]
    InvalidSelector {
        source: selector::Error,
        name: String,
    },
}

impl http_error::Error for FilterError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ParseRequest { .. } => StatusCode::BAD_REQUEST,
            Self::MissingPod => StatusCode::BAD_REQUEST,
            Self::NoNodes => StatusCode::BAD_REQUEST,
            Self::ClaimNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::GetClaim { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ClaimWithoutStorageClass { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GetStorageClass { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageClassNotFound { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GetVolume { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GetDeclaration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeclarationNotFound { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ListNodes { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidSelector { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Claims live in the pod's namespace, so they are looked up per request.
pub type ClaimStores =
    Box<dyn Fn(&str) -> Arc<dyn ObjectStore<PersistentVolumeClaim>> + Send + Sync>;

/// Read access to everything the filter consults.
pub struct Lookups {
    pub claims_in: ClaimStores,
    pub storage_classes: Arc<dyn ObjectStore<StorageClass>>,
    pub volumes: Arc<dyn ObjectStore<PersistentVolume>>,
    pub declarations: Arc<dyn ObjectStore<NFSStorageClass>>,
    pub nodes: Arc<dyn ObjectStore<Node>>,
}

impl Lookups {
    pub fn new(client: &kube::Client) -> Self {
        let claims_client = client.clone();
        Self {
            claims_in: Box::new(move |namespace: &str| {
                Arc::new(Api::<PersistentVolumeClaim>::namespaced(
                    claims_client.clone(),
                    namespace,
                )) as Arc<dyn ObjectStore<PersistentVolumeClaim>>
            }),
            storage_classes: Arc::new(Api::<StorageClass>::all(client.clone())),
            volumes: Arc::new(Api::<PersistentVolume>::all(client.clone())),
            declarations: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
            nodes: Arc::new(Api::<Node>::all(client.clone())),
        }
    }
}

/// Candidate nodes as the scheduler sent them: names only, or full objects.
enum Candidates {
    Names(Vec<String>),
    Nodes(Vec<Node>),
}

impl Candidates {
    fn from_args(node_names: Option<Vec<String>>, nodes: Option<NodeList>) -> Result<Self, FilterError> {
        match (node_names, nodes) {
            (Some(names), _) if !names.is_empty() => Ok(Self::Names(names)),
            (_, Some(nodes)) if !nodes.items.is_empty() => Ok(Self::Nodes(nodes.items)),
            _ => filter_error::NoNodesSnafu.fail(),
        }
    }

    fn names(&self) -> Vec<String> {
        match self {
            Self::Names(names) => names.clone(),
            Self::Nodes(nodes) => nodes.iter().map(|node| node.name_any()).collect(),
        }
    }

    /// Splits the candidates into passing and failed ones. `None` admits every node.
    fn into_result(self, admitted: Option<&BTreeSet<String>>) -> ExtenderFilterResult {
        let is_admitted = |name: &str| admitted.map_or(true, |admitted| admitted.contains(name));
        let mut node_names = Vec::new();
        let mut failed_nodes = BTreeMap::new();
        let mut reject = |name: String| {
            failed_nodes.insert(name, NOT_SELECTED_REASON.to_owned());
        };

        let nodes = match self {
            Self::Names(names) => {
                for name in names {
                    if is_admitted(&name) {
                        node_names.push(name);
                    } else {
                        reject(name);
                    }
                }
                None
            }
            Self::Nodes(nodes) => {
                let mut kept = Vec::new();
                for node in nodes {
                    let name = node.name_any();
                    if is_admitted(&name) {
                        node_names.push(name);
                        kept.push(node);
                    } else {
                        reject(name);
                    }
                }
                Some(NodeList { items: kept })
            }
        };

        ExtenderFilterResult {
            nodes,
            node_names: Some(node_names),
            failed_nodes,
        }
    }
}

pub fn parse_args(body: &[u8]) -> Result<ExtenderArgs, FilterError> {
    serde_json::from_slice(body).context(filter_error::ParseRequestSnafu)
}

pub async fn filter(lookups: &Lookups, args: ExtenderArgs) -> Result<ExtenderFilterResult, FilterError> {
    let pod = args.pod.context(filter_error::MissingPodSnafu)?;
    let candidates = Candidates::from_args(args.node_names, args.nodes)?;
    let pod_name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    let declarations = backing_declarations(lookups, &pod).await?;
    if declarations.is_empty() {
        tracing::debug!(pod = %pod_name, %namespace, "pod has no NFS volumes, passing every node");
        return Ok(candidates.into_result(None));
    }

    let nodes = lookups
        .nodes
        .list()
        .await
        .context(filter_error::ListNodesSnafu)?;
    let admitted = admitted_nodes(&declarations, &nodes)?;
    let result = candidates.into_result(Some(&admitted));
    tracing::debug!(
        pod = %pod_name,
        %namespace,
        passed = ?result.node_names,
        failed = result.failed_nodes.len(),
        "filtered nodes"
    );
    Ok(result)
}

/// Every candidate gets score 0.
pub fn prioritize(args: ExtenderArgs) -> Result<Vec<HostPriority>, FilterError> {
    args.pod.as_ref().context(filter_error::MissingPodSnafu)?;
    let candidates = Candidates::from_args(args.node_names, args.nodes)?;
    Ok(candidates
        .names()
        .into_iter()
        .map(|host| HostPriority { host, score: 0 })
        .collect())
}

/// Nodes matching the selectors of all `declarations`.
pub fn admitted_nodes(
    declarations: &[NFSStorageClass],
    nodes: &[Node],
) -> Result<BTreeSet<String>, FilterError> {
    let mut admitted: Option<BTreeSet<String>> = None;
    for declaration in declarations {
        let node_selector = declaration.effective_node_selector();
        let mut matching = BTreeSet::new();
        for node in nodes {
            let matches = selector::matches(&node_selector, node.metadata.labels.as_ref())
                .context(filter_error::InvalidSelectorSnafu {
                    name: declaration.name_any(),
                })?;
            if matches {
                matching.insert(node.name_any());
            }
        }
        admitted = Some(match admitted {
            None => matching,
            Some(previous) => previous.intersection(&matching).cloned().collect(),
        });
    }
    Ok(admitted.unwrap_or_default())
}

/// The NFSStorageClasses behind the pod's NFS-provisioned claims, one per claim.
async fn backing_declarations(
    lookups: &Lookups,
    pod: &Pod,
) -> Result<Vec<NFSStorageClass>, FilterError> {
    use filter_error::*;

    let namespace = pod.namespace().unwrap_or_default();
    let claims = (lookups.claims_in)(&namespace);
    let claim_names = pod
        .spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .map(|source| source.claim_name.as_str());

    let mut declarations = Vec::new();
    for claim_name in claim_names {
        let claim = claims
            .get_opt(claim_name)
            .await
            .context(GetClaimSnafu {
                namespace: &namespace,
                name: claim_name,
            })?
            .context(ClaimNotFoundSnafu {
                namespace: &namespace,
                name: claim_name,
            })?;

        let provisioner = claim_provisioner(lookups, &claim).await?;
        if provisioner.as_deref() != Some(NFS_PROVISIONER) {
            tracing::trace!(claim = claim_name, ?provisioner, "skipping claim of another provisioner");
            continue;
        }

        let storage_class_name = claim
            .spec
            .as_ref()
            .and_then(|spec| spec.storage_class_name.clone())
            .filter(|name| !name.is_empty())
            .context(ClaimWithoutStorageClassSnafu {
                namespace: &namespace,
                name: claim_name,
            })?;
        let storage_class = lookups
            .storage_classes
            .get_opt(&storage_class_name)
            .await
            .context(GetStorageClassSnafu {
                name: &storage_class_name,
            })?
            .context(StorageClassNotFoundSnafu {
                name: &storage_class_name,
            })?;

        let declaration_name = storage_class.name_any();
        let declaration = lookups
            .declarations
            .get_opt(&declaration_name)
            .await
            .context(GetDeclarationSnafu {
                name: &declaration_name,
            })?
            .context(DeclarationNotFoundSnafu {
                name: &declaration_name,
            })?;
        declarations.push(declaration);
    }
    Ok(declarations)
}

/// Provisioner of a claim: its annotations, then its storage class, then the
/// CSI driver of its bound volume.
async fn claim_provisioner(
    lookups: &Lookups,
    claim: &PersistentVolumeClaim,
) -> Result<Option<String>, FilterError> {
    use filter_error::*;

    let annotations = claim.annotations();
    let annotated = [
        STORAGE_PROVISIONER_ANNOTATION,
        BETA_STORAGE_PROVISIONER_ANNOTATION,
    ]
    .into_iter()
    .filter_map(|key| annotations.get(key))
    .find(|provisioner| !provisioner.is_empty());
    if let Some(provisioner) = annotated {
        return Ok(Some(provisioner.clone()));
    }

    let spec = claim.spec.as_ref();
    if let Some(name) = spec
        .and_then(|spec| spec.storage_class_name.as_deref())
        .filter(|name| !name.is_empty())
    {
        match lookups
            .storage_classes
            .get_opt(name)
            .await
            .context(GetStorageClassSnafu { name })?
        {
            Some(storage_class) if !storage_class.provisioner.is_empty() => {
                return Ok(Some(storage_class.provisioner));
            }
            Some(_) => {}
            None => tracing::warn!(
                storage_class = name,
                claim = %claim.name_any(),
                "StorageClass of claim not found"
            ),
        }
    }

    if let Some(name) = spec
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
    {
        match lookups
            .volumes
            .get_opt(name)
            .await
            .context(GetVolumeSnafu { name })?
        {
            Some(volume) => {
                return Ok(volume
                    .spec
                    .and_then(|spec| spec.csi)
                    .map(|csi| csi.driver));
            }
            None => tracing::warn!(
                volume = name,
                claim = %claim.name_any(),
                "PersistentVolume of claim not found"
            ),
        }
    }

    Ok(None)
}

pub async fn filter_nodes(
    State(lookups): State<Arc<Lookups>>,
    body: Bytes,
) -> Result<Json<ExtenderFilterResult>, http_error::JsonResponse<FilterError>> {
    let args = parse_args(&body)?;
    Ok(Json(filter(&lookups, args).await?))
}

pub async fn prioritize_nodes(
    body: Bytes,
) -> Result<Json<Vec<HostPriority>>, http_error::JsonResponse<FilterError>> {
    let args = parse_args(&body)?;
    Ok(Json(prioritize(args)?))
}

#[cfg(test)]
mod tests {
    use csi_nfs_common::{http_error::Error as _, store::memory::InMemoryStore};
    use csi_nfs_crd::{
        Connection, NFSStorageClassSpec, NfsVersion, ReclaimPolicy, VolumeBindingMode,
        WorkloadNodes,
    };
    use k8s_openapi::{
        api::core::v1::{
            CSIPersistentVolumeSource, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, Volume,
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
    };
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use super::*;

    const NAMESPACE: &str = "apps";

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn node(name: &str, pairs: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels(pairs)),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    fn declaration(name: &str, match_labels: Option<&[(&str, &str)]>) -> NFSStorageClass {
        NFSStorageClass::new(
            name,
            NFSStorageClassSpec {
                connection: Connection {
                    host: "10.0.0.1".to_owned(),
                    share: "/d".to_owned(),
                    nfs_version: NfsVersion::V4_1,
                    tls: false,
                    mtls: false,
                },
                mount_options: None,
                chmod_permissions: None,
                volume_cleanup: None,
                reclaim_policy: ReclaimPolicy::Delete,
                volume_binding_mode: VolumeBindingMode::Immediate,
                workload_nodes: match_labels.map(|pairs| WorkloadNodes {
                    node_selector: Some(LabelSelector {
                        match_labels: Some(labels(pairs)),
                        match_expressions: None,
                    }),
                }),
            },
        )
    }

    fn storage_class(name: &str, provisioner: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..ObjectMeta::default()
            },
            provisioner: provisioner.to_owned(),
            ..StorageClass::default()
        }
    }

    fn claim(name: &str, storage_class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: storage_class.map(str::to_owned),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        }
    }

    fn pod(claims: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app".to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                volumes: Some(
                    claims
                        .iter()
                        .map(|claim| Volume {
                            name: format!("vol-{claim}"),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: claim.to_string(),
                                read_only: None,
                            }),
                            ..Volume::default()
                        })
                        .collect(),
                ),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn args(pod: Pod, candidates: &[&str]) -> ExtenderArgs {
        ExtenderArgs {
            pod: Some(pod),
            nodes: None,
            node_names: Some(names(candidates)),
        }
    }

    struct Cluster {
        claims: Arc<InMemoryStore<PersistentVolumeClaim>>,
        storage_classes: Arc<InMemoryStore<StorageClass>>,
        volumes: Arc<InMemoryStore<PersistentVolume>>,
        declarations: Arc<InMemoryStore<NFSStorageClass>>,
        nodes: Arc<InMemoryStore<Node>>,
    }

    impl Cluster {
        fn lookups(&self) -> Lookups {
            let claims = self.claims.clone();
            Lookups {
                claims_in: Box::new(move |namespace: &str| {
                    if namespace == NAMESPACE {
                        claims.clone() as Arc<dyn ObjectStore<PersistentVolumeClaim>>
                    } else {
                        Arc::new(InMemoryStore::<PersistentVolumeClaim>::new())
                            as Arc<dyn ObjectStore<PersistentVolumeClaim>>
                    }
                }),
                storage_classes: self.storage_classes.clone(),
                volumes: self.volumes.clone(),
                declarations: self.declarations.clone(),
                nodes: self.nodes.clone(),
            }
        }
    }

    /// `sc1` admits `project=a`, `sc2` admits `role=r`, `sc3` has no selector,
    /// `other` belongs to another provisioner.
    fn cluster() -> Cluster {
        Cluster {
            claims: Arc::new(InMemoryStore::with_objects([
                claim("data1", Some("sc1")),
                claim("data2", Some("sc2")),
                claim("data3", Some("sc3")),
                claim("local", Some("other")),
            ])),
            storage_classes: Arc::new(InMemoryStore::with_objects([
                storage_class("sc1", NFS_PROVISIONER),
                storage_class("sc2", NFS_PROVISIONER),
                storage_class("sc3", NFS_PROVISIONER),
                storage_class("other", "local.csi.storage.deckhouse.io"),
            ])),
            volumes: Arc::new(InMemoryStore::new()),
            declarations: Arc::new(InMemoryStore::with_objects([
                declaration("sc1", Some(&[("project", "a")])),
                declaration("sc2", Some(&[("role", "r")])),
                declaration("sc3", None),
            ])),
            nodes: Arc::new(InMemoryStore::with_objects([
                node("n1", &[("project", "a"), ("role", "r")]),
                node("n2", &[("project", "a")]),
                node("n3", &[("role", "r")]),
                node("n4", &[]),
                node("linux", &[("kubernetes.io/os", "linux"), ("project", "a")]),
            ])),
        }
    }

    fn rejected(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|name| (name.to_string(), NOT_SELECTED_REASON.to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn test_selectors_of_all_claims_are_intersected() {
        let cluster = cluster();
        let result = filter(
            &cluster.lookups(),
            args(pod(&["data1", "data2"]), &["n1", "n2", "n3", "n4"]),
        )
        .await
        .unwrap();

        assert_eq!(result.node_names, Some(names(&["n1"])));
        assert_eq!(result.failed_nodes, rejected(&["n2", "n3", "n4"]));
        assert_eq!(result.nodes, None);
    }

    #[rstest]
    #[case::single_claim(&["data1"], &["n1", "n2", "linux"])]
    #[case::default_selector(&["data3"], &["linux"])]
    #[case::default_and_project(&["data1", "data3"], &["linux"])]
    #[case::disjoint(&["data2", "data3"], &[])]
    #[case::other_provisioner_ignored(&["data1", "local"], &["n1", "n2", "linux"])]
    #[tokio::test]
    async fn test_admitted_candidates(#[case] claims: &[&str], #[case] expected: &[&str]) {
        let cluster = cluster();
        let candidates = ["n1", "n2", "n3", "n4", "linux"];
        let result = filter(&cluster.lookups(), args(pod(claims), &candidates))
            .await
            .unwrap();

        assert_eq!(result.node_names, Some(names(expected)));
        assert_eq!(
            result.failed_nodes.len(),
            candidates.len() - expected.len()
        );
    }

    #[tokio::test]
    async fn test_pod_without_nfs_claims_passes_every_node() {
        let cluster = cluster();
        cluster.nodes.fail("list");

        for unrelated in [pod(&[]), pod(&["local"])] {
            let result = filter(&cluster.lookups(), args(unrelated, &["n4", "n1"]))
                .await
                .unwrap();
            assert_eq!(result.node_names, Some(names(&["n4", "n1"])));
            assert!(result.failed_nodes.is_empty());
        }
    }

    #[tokio::test]
    async fn test_full_node_objects_are_echoed() {
        let cluster = cluster();
        let result = filter(
            &cluster.lookups(),
            ExtenderArgs {
                pod: Some(pod(&["data1"])),
                nodes: Some(NodeList {
                    items: vec![node("n2", &[("project", "a")]), node("n3", &[])],
                }),
                node_names: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.node_names, Some(names(&["n2"])));
        assert_eq!(
            result.nodes,
            Some(NodeList {
                items: vec![node("n2", &[("project", "a")])]
            })
        );
        assert_eq!(result.failed_nodes, rejected(&["n3"]));
    }

    #[tokio::test]
    async fn test_provisioner_from_annotation_and_bound_volume() {
        let cluster = cluster();
        let mut annotated = claim("annotated", Some("sc2"));
        annotated.annotations_mut().insert(
            BETA_STORAGE_PROVISIONER_ANNOTATION.to_owned(),
            NFS_PROVISIONER.to_owned(),
        );
        let mut bound = claim("bound", Some("sc1"));
        bound.spec.as_mut().unwrap().volume_name = Some("pv-1".to_owned());
        cluster.claims.create(&annotated).await.unwrap();
        cluster.claims.create(&bound).await.unwrap();
        // sc1 is gone, so only the bound volume tells the provisioner
        cluster.storage_classes.delete("sc1").await.unwrap();
        cluster
            .volumes
            .create(&PersistentVolume {
                metadata: ObjectMeta {
                    name: Some("pv-1".to_owned()),
                    ..ObjectMeta::default()
                },
                spec: Some(PersistentVolumeSpec {
                    csi: Some(CSIPersistentVolumeSource {
                        driver: NFS_PROVISIONER.to_owned(),
                        volume_handle: "10.0.0.1#d#pv-1".to_owned(),
                        ..CSIPersistentVolumeSource::default()
                    }),
                    ..PersistentVolumeSpec::default()
                }),
                ..PersistentVolume::default()
            })
            .await
            .unwrap();

        let result = filter(&cluster.lookups(), args(pod(&["annotated"]), &["n1", "n2"]))
            .await
            .unwrap();
        assert_eq!(result.node_names, Some(names(&["n1"])));

        // The bound volume says NFS, but the storage class backing the claim is missing.
        let error = filter(&cluster.lookups(), args(pod(&["bound"]), &["n1"]))
            .await
            .unwrap_err();
        assert!(matches!(error, FilterError::StorageClassNotFound { .. }));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[rstest]
    #[case::missing_pod(ExtenderArgs { pod: None, nodes: None, node_names: Some(names(&["n1"])) })]
    #[case::missing_nodes(ExtenderArgs { pod: Some(pod(&["data1"])), nodes: None, node_names: None })]
    #[case::empty_nodes(ExtenderArgs { pod: Some(pod(&["data1"])), nodes: Some(NodeList::default()), node_names: Some(vec![]) })]
    #[case::missing_claim(args(pod(&["data9"]), &["n1"]))]
    #[tokio::test]
    async fn test_bad_requests(#[case] args: ExtenderArgs) {
        let cluster = cluster();
        let error = filter(&cluster.lookups(), args).await.unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_declaration_is_internal_error() {
        let cluster = cluster();
        cluster.declarations.delete("sc2").await.unwrap();
        let error = filter(&cluster.lookups(), args(pod(&["data2"]), &["n1"]))
            .await
            .unwrap_err();
        assert!(matches!(error, FilterError::DeclarationNotFound { .. }));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_api_failure_is_internal_error() {
        let cluster = cluster();
        cluster.claims.fail("get");
        let error = filter(&cluster.lookups(), args(pod(&["data1"]), &["n1"]))
            .await
            .unwrap_err();
        assert!(matches!(error, FilterError::GetClaim { .. }));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(
            serde_json::json!({
                "pod": { "metadata": { "name": "app", "namespace": NAMESPACE } },
                "nodenames": ["n1", "n2"],
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(args.node_names, Some(names(&["n1", "n2"])));
        assert_eq!(args.pod.unwrap().name_any(), "app");

        let error = parse_args(b"{not json").unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_result_wire_format() {
        let result = ExtenderFilterResult {
            nodes: None,
            node_names: Some(names(&["n1"])),
            failed_nodes: rejected(&["n2"]),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "nodenames": ["n1"],
                "failedNodes": { "n2": NOT_SELECTED_REASON },
            })
        );
    }

    #[test]
    fn test_prioritize_scores_zero() {
        let scores = prioritize(args(pod(&["data1"]), &["n1", "n2"])).unwrap();
        assert_eq!(
            scores,
            vec![
                HostPriority {
                    host: "n1".to_owned(),
                    score: 0
                },
                HostPriority {
                    host: "n2".to_owned(),
                    score: 0
                },
            ]
        );
        assert_eq!(
            serde_json::to_value(&scores[0]).unwrap(),
            serde_json::json!({ "host": "n1", "score": 0 })
        );
        assert!(matches!(
            prioritize(ExtenderArgs::default()),
            Err(FilterError::MissingPod)
        ));
    }

    #[test]
    fn test_invalid_selector() {
        let mut broken = declaration("broken", None);
        broken.spec.workload_nodes = Some(WorkloadNodes {
            node_selector: Some(LabelSelector {
                match_labels: None,
                match_expressions: Some(vec![
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                        key: "zone".to_owned(),
                        operator: "Near".to_owned(),
                        values: None,
                    },
                ]),
            }),
        });
        assert!(matches!(
            admitted_nodes(&[broken], &[node("n1", &[])]),
            Err(FilterError::InvalidSelector { .. })
        ));
    }
}
