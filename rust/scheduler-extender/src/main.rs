mod config;
mod filter;

use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use csi_nfs_common::{
    client::create_client,
    server::{self, health_routes, parse_listen_address},
    signal::shutdown_requested,
};
use snafu::{ResultExt, Snafu};

use crate::{
    config::{Config, PartialConfig},
    filter::Lookups,
};

const MAX_REQUEST_BODY_BYTES: usize = 10 << 20;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(clap::Parser)]
#[clap(about, author)]
pub struct Args {
    /// YAML config file with the keys listen, log-level, cert-file, key-file
    /// and health-probe-bind-address
    #[clap(long, env)]
    config: Option<PathBuf>,

    /// HTTPS listen address of the extender verbs
    #[clap(long, env)]
    listen: Option<String>,

    #[clap(long, env)]
    log_level: Option<String>,

    #[clap(long, env)]
    tls_cert_file: Option<PathBuf>,

    #[clap(long, env)]
    tls_key_file: Option<PathBuf>,

    #[clap(long, env)]
    health_probe_bind_address: Option<String>,
}

impl Args {
    fn overrides(&self) -> PartialConfig {
        PartialConfig {
            listen: self.listen.clone(),
            log_level: self.log_level.clone(),
            cert_file: self.tls_cert_file.clone(),
            key_file: self.tls_key_file.clone(),
            health_probe_bind_address: self.health_probe_bind_address.clone(),
        }
    }
}

#[derive(Snafu, Debug)]
enum StartupError {
    #[snafu(display("failed to load configuration"))]
    LoadConfig { source: config::Error },

    #[snafu(display("failed to initialize logging"))]
    InitLogging {
        source: csi_nfs_common::logging::Error,
    },

    #[snafu(display("failed to register shutdown handler"))]
    RegisterShutdown {
        source: csi_nfs_common::signal::Error,
    },

    #[snafu(display("failed to initialize Kubernetes client"))]
    InitKube {
        source: csi_nfs_common::client::Error,
    },

    #[snafu(display("failed to parse listen address"))]
    ParseListenAddr { source: server::Error },

    #[snafu(display("failed to run server"))]
    RunServer { source: server::Error },
}

fn routes(lookups: Arc<Lookups>) -> Router {
    Router::new()
        .route("/scheduler/filter", post(filter::filter_nodes))
        .route("/scheduler/prioritize", post(filter::prioritize_nodes))
        .route("/status", get(|| async { "ok" }))
        .merge(health_routes::<Arc<Lookups>>())
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(lookups)
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let args = Args::parse();

    let from_file = match &args.config {
        Some(path) => PartialConfig::load(path).await.context(LoadConfigSnafu)?,
        None => PartialConfig::default(),
    };
    let config = Config::from(args.overrides().or(from_file));

    csi_nfs_common::logging::initialize_logging_with(
        &config.log_level,
        csi_nfs_common::logging::LogFormat::from_env(),
    )
    .context(InitLoggingSnafu)?;
    csi_nfs_common::print_startup_string(
        built_info::PKG_DESCRIPTION,
        built_info::PKG_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    let shutdown = shutdown_requested().context(RegisterShutdownSnafu)?;
    let client = create_client().await.context(InitKubeSnafu)?;
    let app = routes(Arc::new(Lookups::new(&client)));

    let listen = parse_listen_address(&config.listen).context(ParseListenAddrSnafu)?;
    let extender = server::serve_tls(
        app,
        listen,
        &config.cert_file,
        &config.key_file,
        shutdown.clone(),
    );

    match &config.health_probe_bind_address {
        Some(address) => {
            let address = parse_listen_address(address).context(ParseListenAddrSnafu)?;
            let probes = server::serve(health_routes(), address, shutdown);
            futures::future::try_join(extender, probes)
                .await
                .context(RunServerSnafu)?;
        }
        None => extender.await.context(RunServerSnafu)?,
    }

    Ok(())
}
