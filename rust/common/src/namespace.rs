use std::path::Path;

pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Resolves the namespace the controller lives in.
///
/// Order: the explicit value (flag or `CONTROLLER_NAMESPACE`), the service account
/// namespace file, then `default`.
pub fn resolve_controller_namespace(explicit: Option<String>, default: &str) -> String {
    let from_file = std::fs::read_to_string(Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE)).ok();
    choose_namespace(explicit, from_file, default)
}

fn choose_namespace(explicit: Option<String>, from_file: Option<String>, default: &str) -> String {
    [explicit, from_file]
        .into_iter()
        .flatten()
        .map(|namespace| namespace.trim().to_owned())
        .find(|namespace| !namespace.is_empty())
        .unwrap_or_else(|| default.to_owned())
}
