//! The Deckhouse `ModuleConfig` of this module.
//!
//! Only the settings the controllers act on are typed, everything else is kept
//! as raw JSON so that round-trips through the API do not lose fields.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Name of the singleton `ModuleConfig` object of this module.
pub const MODULE_CONFIG_NAME: &str = "csi-nfs";

#[derive(Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleConfig",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default)]
    pub settings: ModuleSettings,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v3support: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_parameters: Option<TlsParameters>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls: Option<MtlsParameters>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl ModuleConfig {
    /// Stand-in used while the module configuration does not exist yet.
    pub fn unset() -> Self {
        Self::new(MODULE_CONFIG_NAME, ModuleConfigSpec::default())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_unknown_settings_are_kept() {
        let mc: ModuleConfig = serde_yaml::from_str(indoc! {"
            apiVersion: deckhouse.io/v1alpha1
            kind: ModuleConfig
            metadata:
              name: csi-nfs
            spec:
              enabled: true
              version: 1
              settings:
                v3support: true
                tlsParameters:
                  ca: Y2E=
                  mtls:
                    clientCert: Y2VydA==
                logLevel: DEBUG
        "})
        .expect("valid module config");

        let settings = &mc.spec.settings;
        assert_eq!(settings.v3support, Some(true));
        let tls = settings.tls_parameters.as_ref().unwrap();
        assert_eq!(tls.ca.as_deref(), Some("Y2E="));
        assert_eq!(
            tls.mtls.as_ref().unwrap().client_cert.as_deref(),
            Some("Y2VydA==")
        );
        assert_eq!(tls.mtls.as_ref().unwrap().client_key, None);
        assert_eq!(
            settings.other.get("logLevel"),
            Some(&serde_json::Value::String("DEBUG".to_owned()))
        );
    }
}
