pub mod client;
pub mod http_error;
pub mod leader;
pub mod logging;
pub mod namespace;
pub mod retry;
pub mod server;
pub mod signal;
pub mod store;

/// Logs the identity of the running binary, first thing after logging is up.
pub fn print_startup_string(
    pkg_description: &str,
    pkg_version: &str,
    target: &str,
    built_time: &str,
    rustc_version: &str,
) {
    tracing::info!(
        "Starting {} version {}, built for {} by {} at {}",
        pkg_description,
        pkg_version,
        target,
        rustc_version,
        built_time
    );
}

/// Renders `error` followed by its chain of sources, separated by `: `.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
