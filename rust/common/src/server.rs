use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;

use crate::signal::ShutdownSignal;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid listen address {address:?}"))]
    ParseAddress {
        source: std::net::AddrParseError,
        address: String,
    },

    #[snafu(display("failed to load TLS certificate {cert_file:?} and key {key_file:?}"))]
    LoadCertificate {
        source: std::io::Error,
        cert_file: String,
        key_file: String,
    },

    #[snafu(display("failed to bind listener"))]
    BindListener { source: std::io::Error },

    #[snafu(display("failed to get listener address"))]
    GetListenerAddr { source: std::io::Error },

    #[snafu(display("failed to run server"))]
    RunServer { source: std::io::Error },
}

/// `/healthz` and `/readyz` probes, answering `ok` while the process serves requests.
pub fn health_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Parses a listen address, accepting the `:port` shorthand for all interfaces.
pub fn parse_listen_address(address: &str) -> Result<SocketAddr, Error> {
    let candidate = match address.strip_prefix(':') {
        Some(port) => format!("{}:{port}", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        None => address.to_owned(),
    };
    candidate.parse().context(ParseAddressSnafu { address })
}

/// Serves `app` over plain HTTP until `shutdown` resolves.
pub async fn serve(app: Router, address: SocketAddr, shutdown: ShutdownSignal) -> Result<(), Error> {
    let listener = TcpListener::bind(address)
        .await
        .context(BindListenerSnafu)?;
    let address = listener.local_addr().context(GetListenerAddrSnafu)?;
    tracing::info!(%address, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context(RunServerSnafu)
}

/// Serves `app` over HTTPS with the PEM encoded certificate chain and key until
/// `shutdown` resolves.
pub async fn serve_tls(
    app: Router,
    address: SocketAddr,
    cert_file: &Path,
    key_file: &Path,
    shutdown: ShutdownSignal,
) -> Result<(), Error> {
    let config = RustlsConfig::from_pem_file(cert_file, key_file)
        .await
        .context(LoadCertificateSnafu {
            cert_file: cert_file.display().to_string(),
            key_file: key_file.display().to_string(),
        })?;

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.await;
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
        }
    });

    tracing::info!(%address, "listening (tls)");
    axum_server::bind_rustls(address, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context(RunServerSnafu)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(":8000", "0.0.0.0:8000")]
    #[case("127.0.0.1:8443", "127.0.0.1:8443")]
    #[case("[::1]:8081", "[::1]:8081")]
    fn test_parse_listen_address(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(
            parse_listen_address(input).unwrap(),
            expected.parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_listen_address_rejects_garbage() {
        assert!(parse_listen_address("localhost").is_err());
    }
}
