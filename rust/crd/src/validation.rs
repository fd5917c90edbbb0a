//! Cross-checks of an [`NFSStorageClass`] against the module configuration.
//!
//! Used by the declaration reconciler, the module-configuration reconciler and
//! the admission webhooks, so all three agree on what is admissible.

use kube::ResourceExt;
use snafu::Snafu;

use crate::{module_config::ModuleConfig, NFSStorageClass, NfsVersion, TLS_ENABLED};

#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum ValidationError {
    #[snafu(display(
        "ModuleConfig: {module_config} (the v3support parameter is {state}); NFSStorageClass: {storage_class} (nfsVersion is set to 3); Such a combination of parameters is not allowed"
    ))]
    V3Disabled {
        module_config: String,
        storage_class: String,
        state: &'static str,
    },

    #[snafu(display(
        "RPC-with-TLS related parameters are not allowed because feature TLSEnabled: false"
    ))]
    TlsNotSupported,

    #[snafu(display(
        "ModuleConfig: {module_config} ({problem}); NFSStorageClass: {storage_class} (tls or mtls is enabled); Such a combination of parameters is not allowed"
    ))]
    MissingCa {
        module_config: String,
        storage_class: String,
        problem: &'static str,
    },

    #[snafu(display(
        "ModuleConfig: {module_config} ({problem}); NFSStorageClass: {storage_class} (mtls is enabled); Such a combination of parameters is not allowed"
    ))]
    MissingMtlsMaterial {
        module_config: String,
        storage_class: String,
        problem: &'static str,
    },
}

impl ValidationError {
    /// Stable machine-readable code, used as the prefix of status reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::V3Disabled { .. } => "v3-disabled",
            Self::TlsNotSupported => "tls-not-supported",
            Self::MissingCa { .. } => "missing-ca",
            Self::MissingMtlsMaterial { .. } => "missing-mtls-material",
        }
    }
}

pub fn validate(module_config: &ModuleConfig, nsc: &NFSStorageClass) -> Result<(), ValidationError> {
    validate_with(module_config, nsc, TLS_ENABLED)
}

/// Rules are evaluated in order and the first failure is returned.
pub fn validate_with(
    module_config: &ModuleConfig,
    nsc: &NFSStorageClass,
    tls_enabled: bool,
) -> Result<(), ValidationError> {
    let settings = &module_config.spec.settings;
    let connection = &nsc.spec.connection;
    let mc_name = || module_config.name_any();
    let nsc_name = || nsc.name_any();

    if connection.nfs_version == NfsVersion::V3 {
        let state = match settings.v3support {
            None => Some("missing"),
            Some(false) => Some("disabled"),
            Some(true) => None,
        };
        if let Some(state) = state {
            return V3DisabledSnafu {
                module_config: mc_name(),
                storage_class: nsc_name(),
                state,
            }
            .fail();
        }
    }

    if !tls_enabled {
        if connection.tls || connection.mtls || settings.tls_parameters.is_some() {
            return TlsNotSupportedSnafu.fail();
        }
        return Ok(());
    }

    if !(connection.tls || connection.mtls) {
        return Ok(());
    }

    let Some(tls_parameters) = &settings.tls_parameters else {
        return MissingCaSnafu {
            module_config: mc_name(),
            storage_class: nsc_name(),
            problem: "the tlsParameters parameter is missing",
        }
        .fail();
    };
    if is_blank(tls_parameters.ca.as_deref()) {
        return MissingCaSnafu {
            module_config: mc_name(),
            storage_class: nsc_name(),
            problem: "the tlsParameters.ca parameter is either missing or has a zero length",
        }
        .fail();
    }

    if connection.mtls {
        let Some(mtls) = &tls_parameters.mtls else {
            return MissingMtlsMaterialSnafu {
                module_config: mc_name(),
                storage_class: nsc_name(),
                problem: "the tlsParameters.mtls parameter is missing",
            }
            .fail();
        };
        if is_blank(mtls.client_cert.as_deref()) {
            return MissingMtlsMaterialSnafu {
                module_config: mc_name(),
                storage_class: nsc_name(),
                problem: "the tlsParameters.mtls.clientCert parameter is either missing or has a zero length",
            }
            .fail();
        }
        if is_blank(mtls.client_key.as_deref()) {
            return MissingMtlsMaterialSnafu {
                module_config: mc_name(),
                storage_class: nsc_name(),
                problem: "the tlsParameters.mtls.clientKey parameter is either missing or has a zero length",
            }
            .fail();
        }
    }

    Ok(())
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, str::is_empty)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        module_config::{ModuleConfigSpec, ModuleSettings, MtlsParameters, TlsParameters},
        Connection, NFSStorageClassSpec, ReclaimPolicy, VolumeBindingMode,
    };

    fn declaration(nfs_version: NfsVersion, tls: bool, mtls: bool) -> NFSStorageClass {
        NFSStorageClass::new(
            "ex",
            NFSStorageClassSpec {
                connection: Connection {
                    host: "10.0.0.1".to_owned(),
                    share: "/d".to_owned(),
                    nfs_version,
                    tls,
                    mtls,
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

    fn module_config(settings: ModuleSettings) -> ModuleConfig {
        ModuleConfig::new(
            "csi-nfs",
            ModuleConfigSpec {
                settings,
                ..ModuleConfigSpec::default()
            },
        )
    }

    fn tls_parameters(ca: Option<&str>, cert: Option<&str>, key: Option<&str>) -> TlsParameters {
        TlsParameters {
            ca: ca.map(str::to_owned),
            mtls: (cert.is_some() || key.is_some()).then(|| MtlsParameters {
                client_cert: cert.map(str::to_owned),
                client_key: key.map(str::to_owned),
            }),
        }
    }

    #[rstest]
    #[case::missing(None, Some("v3-disabled"))]
    #[case::disabled(Some(false), Some("v3-disabled"))]
    #[case::enabled(Some(true), None)]
    fn test_v3_requires_support(#[case] v3support: Option<bool>, #[case] code: Option<&str>) {
        let mc = module_config(ModuleSettings {
            v3support,
            ..ModuleSettings::default()
        });
        let result = validate_with(&mc, &declaration(NfsVersion::V3, false, false), true);
        assert_eq!(result.err().map(|err| err.code()), code);
    }

    #[test]
    fn test_v3_disabled_message() {
        let err = validate_with(
            &module_config(ModuleSettings::default()),
            &declaration(NfsVersion::V3, false, false),
            true,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "ModuleConfig: csi-nfs (the v3support parameter is missing); NFSStorageClass: ex (nfsVersion is set to 3); Such a combination of parameters is not allowed"
        );
    }

    #[rstest]
    #[case::plain(false, false, None, None)]
    #[case::tls_requested(true, false, None, Some("tls-not-supported"))]
    #[case::mtls_requested(false, true, None, Some("tls-not-supported"))]
    #[case::parameters_present(false, false, Some(tls_parameters(Some("ca"), None, None)), Some("tls-not-supported"))]
    fn test_tls_compiled_out(
        #[case] tls: bool,
        #[case] mtls: bool,
        #[case] parameters: Option<TlsParameters>,
        #[case] code: Option<&str>,
    ) {
        let mc = module_config(ModuleSettings {
            tls_parameters: parameters,
            ..ModuleSettings::default()
        });
        let result = validate_with(&mc, &declaration(NfsVersion::V4_1, tls, mtls), false);
        assert_eq!(result.err().map(|err| err.code()), code);
    }

    #[rstest]
    #[case::no_parameters(true, false, None, Some("missing-ca"))]
    #[case::empty_ca(true, false, Some(tls_parameters(Some(""), None, None)), Some("missing-ca"))]
    #[case::tls_ok(true, false, Some(tls_parameters(Some("ca"), None, None)), None)]
    #[case::mtls_without_material(false, true, Some(tls_parameters(Some("ca"), None, None)), Some("missing-mtls-material"))]
    #[case::mtls_missing_key(false, true, Some(tls_parameters(Some("ca"), Some("cert"), None)), Some("missing-mtls-material"))]
    #[case::mtls_empty_cert(false, true, Some(tls_parameters(Some("ca"), Some(""), Some("key"))), Some("missing-mtls-material"))]
    #[case::mtls_ok(false, true, Some(tls_parameters(Some("ca"), Some("cert"), Some("key"))), None)]
    #[case::mtls_missing_ca_first(false, true, Some(tls_parameters(None, Some("cert"), Some("key"))), Some("missing-ca"))]
    fn test_tls_rules(
        #[case] tls: bool,
        #[case] mtls: bool,
        #[case] parameters: Option<TlsParameters>,
        #[case] code: Option<&str>,
    ) {
        let mc = module_config(ModuleSettings {
            tls_parameters: parameters,
            ..ModuleSettings::default()
        });
        let result = validate_with(&mc, &declaration(NfsVersion::V4_2, tls, mtls), true);
        assert_eq!(result.err().map(|err| err.code()), code);
    }

    #[test]
    fn test_mtls_missing_client_key_message() {
        let mc = module_config(ModuleSettings {
            tls_parameters: Some(tls_parameters(Some("ca"), Some("cert"), None)),
            ..ModuleSettings::default()
        });
        let err = validate_with(&mc, &declaration(NfsVersion::V4_1, false, true), true).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingMtlsMaterial {
                module_config: "csi-nfs".to_owned(),
                storage_class: "ex".to_owned(),
                problem: "the tlsParameters.mtls.clientKey parameter is either missing or has a zero length",
            }
        );
    }

    #[test]
    fn test_v3_checked_before_tls() {
        let err = validate_with(
            &module_config(ModuleSettings::default()),
            &declaration(NfsVersion::V3, true, true),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "v3-disabled");
    }
}
