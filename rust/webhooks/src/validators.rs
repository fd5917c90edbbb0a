//! Admission decisions for the three validated kinds.
//!
//! Deletes and objects that are already being deleted are always admitted.

use std::sync::Arc;

use axum::{extract::State, Json};
use csi_nfs_common::{error_chain, store::ObjectStore};
use csi_nfs_crd::{
    module_config::{ModuleConfig, MODULE_CONFIG_NAME},
    validation, NFSStorageClass,
};
use kube::{
    core::{
        admission::{
            AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
            Operation,
        },
        DynamicObject,
    },
    Api, Resource, ResourceExt,
};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to get ModuleConfig {name}"))]
    GetModuleConfig { source: kube::Error, name: String },

    #[snafu(display("failed to list NFSStorageClasses"))]
    ListDeclarations { source: kube::Error },
}

pub struct Ctx {
    pub module_configs: Arc<dyn ObjectStore<ModuleConfig>>,
    pub nfs_storage_classes: Arc<dyn ObjectStore<NFSStorageClass>>,
}

impl Ctx {
    pub fn new(client: &kube::Client) -> Self {
        Self {
            module_configs: Arc::new(Api::<ModuleConfig>::all(client.clone())),
            nfs_storage_classes: Arc::new(Api::<NFSStorageClass>::all(client.clone())),
        }
    }
}

/// The object under review, unless the request is exempt from validation.
fn object_to_validate<K>(request: &AdmissionRequest<K>) -> Option<&K>
where
    K: Resource,
{
    if request.operation == Operation::Delete {
        return None;
    }
    request
        .object
        .as_ref()
        .filter(|object| object.meta().deletion_timestamp.is_none())
}

fn deny(response: AdmissionResponse, error: &Error) -> AdmissionResponse {
    tracing::warn!(
        error = error as &dyn std::error::Error,
        "rejecting request that could not be validated"
    );
    response.deny(error_chain(error))
}

pub async fn admit_nfs_storage_class(
    ctx: &Ctx,
    request: &AdmissionRequest<NFSStorageClass>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(nsc) = object_to_validate(request) else {
        return response;
    };

    let module_config = match ctx
        .module_configs
        .get_opt(MODULE_CONFIG_NAME)
        .await
        .context(GetModuleConfigSnafu {
            name: MODULE_CONFIG_NAME,
        }) {
        Ok(module_config) => module_config.unwrap_or_else(ModuleConfig::unset),
        Err(error) => return deny(response, &error),
    };

    match validation::validate(&module_config, nsc) {
        Ok(()) => response,
        Err(error) => {
            tracing::info!(
                nfs_storage_class = %nsc.name_any(),
                code = error.code(),
                "rejecting NFSStorageClass"
            );
            response.deny(error.to_string())
        }
    }
}

/// Every existing NFSStorageClass has to stay valid under the incoming configuration.
pub async fn admit_module_config(
    ctx: &Ctx,
    request: &AdmissionRequest<ModuleConfig>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(module_config) = object_to_validate(request) else {
        return response;
    };
    if module_config.name_any() != MODULE_CONFIG_NAME {
        return response;
    }

    let declarations = match ctx
        .nfs_storage_classes
        .list()
        .await
        .context(ListDeclarationsSnafu)
    {
        Ok(declarations) => declarations,
        Err(error) => return deny(response, &error),
    };

    for nsc in &declarations {
        if let Err(error) = validation::validate(module_config, nsc) {
            tracing::info!(
                nfs_storage_class = %nsc.name_any(),
                code = error.code(),
                "rejecting ModuleConfig"
            );
            return response.deny(error.to_string());
        }
    }
    response
}

fn request_of<K>(review: AdmissionReview<K>) -> Result<AdmissionRequest<K>, AdmissionResponse>
where
    K: Resource,
{
    review
        .try_into()
        .map_err(|error: ConvertAdmissionReviewError| {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "invalid admission review"
            );
            AdmissionResponse::invalid(error.to_string())
        })
}

pub async fn nsc_validate(
    State(ctx): State<Arc<Ctx>>,
    Json(review): Json<AdmissionReview<NFSStorageClass>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match request_of(review) {
        Ok(request) => admit_nfs_storage_class(&ctx, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

pub async fn mc_validate(
    State(ctx): State<Arc<Ctx>>,
    Json(review): Json<AdmissionReview<ModuleConfig>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match request_of(review) {
        Ok(request) => admit_module_config(&ctx, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

/// StorageClass writes are admitted unconditionally.
pub async fn sc_validate(
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match request_of(review) {
        Ok(request) => AdmissionResponse::from(&request),
        Err(response) => response,
    };
    Json(response.into_review())
}

#[cfg(test)]
mod tests {
    use csi_nfs_common::store::memory::InMemoryStore;
    use csi_nfs_crd::{
        module_config::{ModuleConfigSpec, ModuleSettings},
        Connection, NFSStorageClassSpec, NfsVersion, ReclaimPolicy, VolumeBindingMode,
    };
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
    use rstest::rstest;
    use serde::Serialize;

    use super::*;

    fn declaration(name: &str, nfs_version: NfsVersion) -> NFSStorageClass {
        NFSStorageClass::new(
            name,
            NFSStorageClassSpec {
                connection: Connection {
                    host: "10.0.0.1".to_owned(),
                    share: "/d".to_owned(),
                    nfs_version,
                    tls: false,
                    mtls: false,
                },
                mount_options: None,
                chmod_permissions: None,
                volume_cleanup: None,
                reclaim_policy: ReclaimPolicy::Delete,
                volume_binding_mode: VolumeBindingMode::Immediate,
                workload_nodes: None,
            },
        )
    }

    fn module_config(v3support: Option<bool>) -> ModuleConfig {
        ModuleConfig::new(
            MODULE_CONFIG_NAME,
            ModuleConfigSpec {
                enabled: Some(true),
                version: Some(1),
                settings: ModuleSettings {
                    v3support,
                    ..ModuleSettings::default()
                },
            },
        )
    }

    fn ctx(module_configs: Vec<ModuleConfig>, declarations: Vec<NFSStorageClass>) -> Ctx {
        Ctx {
            module_configs: Arc::new(InMemoryStore::with_objects(module_configs)),
            nfs_storage_classes: Arc::new(InMemoryStore::with_objects(declarations)),
        }
    }

    /// An AdmissionReview as the API server sends it.
    fn request<K>(operation: &str, object: Option<&K>, old_object: Option<&K>) -> AdmissionRequest<K>
    where
        K: Resource<DynamicType = ()> + Serialize + serde::de::DeserializeOwned,
    {
        let name = object
            .or(old_object)
            .map(|object| object.name_any())
            .unwrap_or_default();
        let review = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": K::group(&()), "version": K::version(&()), "kind": K::kind(&()) },
                "resource": { "group": K::group(&()), "version": K::version(&()), "resource": K::plural(&()) },
                "name": name,
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            },
        });
        serde_json::from_value::<AdmissionReview<K>>(review)
            .unwrap()
            .try_into()
            .unwrap()
    }

    #[rstest]
    #[case::v3_enabled(Some(true), NfsVersion::V3, true)]
    #[case::v3_disabled(Some(false), NfsVersion::V3, false)]
    #[case::v3_missing(None, NfsVersion::V3, false)]
    #[case::v4_without_v3(Some(false), NfsVersion::V4_1, true)]
    #[tokio::test]
    async fn test_nfs_storage_class_against_module_config(
        #[case] v3support: Option<bool>,
        #[case] nfs_version: NfsVersion,
        #[case] allowed: bool,
    ) {
        let ctx = ctx(vec![module_config(v3support)], vec![]);
        let nsc = declaration("ex", nfs_version);
        let response = admit_nfs_storage_class(&ctx, &request("CREATE", Some(&nsc), None)).await;

        assert_eq!(response.allowed, allowed);
        if !allowed {
            assert!(response.result.message.contains("nfsVersion is set to 3"));
        }
    }

    #[tokio::test]
    async fn test_missing_module_config_counts_as_unset() {
        let ctx = ctx(vec![], vec![]);
        let nsc = declaration("ex", NfsVersion::V3);
        let response = admit_nfs_storage_class(&ctx, &request("UPDATE", Some(&nsc), Some(&nsc))).await;

        assert!(!response.allowed);
        assert!(response.result.message.contains("the v3support parameter is missing"));
    }

    #[tokio::test]
    async fn test_deletes_bypass_validation() {
        let ctx = ctx(vec![module_config(Some(false))], vec![]);
        let nsc = declaration("ex", NfsVersion::V3);

        let response = admit_nfs_storage_class(&ctx, &request("DELETE", None, Some(&nsc))).await;
        assert!(response.allowed);

        let mut deleting = nsc.clone();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let response =
            admit_nfs_storage_class(&ctx, &request("UPDATE", Some(&deleting), Some(&nsc))).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_module_config_lookup_failure_is_denied() {
        let module_configs = Arc::new(InMemoryStore::<ModuleConfig>::new());
        module_configs.fail("get");
        let ctx = Ctx {
            module_configs: module_configs.clone(),
            nfs_storage_classes: Arc::new(InMemoryStore::<NFSStorageClass>::new()),
        };
        let nsc = declaration("ex", NfsVersion::V4_1);
        let response = admit_nfs_storage_class(&ctx, &request("CREATE", Some(&nsc), None)).await;

        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .starts_with("failed to get ModuleConfig csi-nfs: "));
    }

    #[tokio::test]
    async fn test_module_config_must_keep_declarations_valid() {
        let ctx = ctx(
            vec![],
            vec![
                declaration("v4", NfsVersion::V4_2),
                declaration("v3", NfsVersion::V3),
            ],
        );

        let disabling = module_config(Some(false));
        let response = admit_module_config(&ctx, &request("UPDATE", Some(&disabling), None)).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("NFSStorageClass: v3"));

        let enabling = module_config(Some(true));
        let response = admit_module_config(&ctx, &request("UPDATE", Some(&enabling), None)).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_module_config_exemptions() {
        let ctx = ctx(vec![], vec![declaration("v3", NfsVersion::V3)]);
        let disabling = module_config(Some(false));

        let response = admit_module_config(&ctx, &request("DELETE", None, Some(&disabling))).await;
        assert!(response.allowed);

        let mut deleting = disabling.clone();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let response = admit_module_config(&ctx, &request("UPDATE", Some(&deleting), None)).await;
        assert!(response.allowed);

        let other_module = ModuleConfig::new("sds-node-configurator", ModuleConfigSpec::default());
        let response = admit_module_config(&ctx, &request("CREATE", Some(&other_module), None)).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_declaration_list_failure_is_denied() {
        let declarations = Arc::new(InMemoryStore::<NFSStorageClass>::new());
        declarations.fail("list");
        let ctx = Ctx {
            module_configs: Arc::new(InMemoryStore::<ModuleConfig>::new()),
            nfs_storage_classes: declarations.clone(),
        };
        let response =
            admit_module_config(&ctx, &request("UPDATE", Some(&module_config(None)), None)).await;

        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .starts_with("failed to list NFSStorageClasses: "));
    }
}
