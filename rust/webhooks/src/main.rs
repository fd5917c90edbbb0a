mod validators;

use std::{path::PathBuf, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use csi_nfs_common::{
    client::create_client,
    server::{self, parse_listen_address},
    signal::shutdown_requested,
};
use csi_nfs_crd::TLS_ENABLED;
use snafu::{ResultExt, Snafu};

use crate::validators::Ctx;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(clap::Parser)]
#[clap(about, author)]
pub struct Args {
    #[clap(long, env)]
    tls_cert_file: PathBuf,

    #[clap(long, env)]
    tls_key_file: PathBuf,

    #[clap(long, env, default_value = ":8443")]
    listen: String,
}

#[derive(Snafu, Debug)]
enum StartupError {
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

fn routes(ctx: Arc<Ctx>) -> Router {
    Router::new()
        .route("/nsc-validate", post(validators::nsc_validate))
        .route("/mc-validate", post(validators::mc_validate))
        .route("/sc-validate", post(validators::sc_validate))
        .route("/healthz", get(|| async { "Ok." }))
        .with_state(ctx)
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let args = Args::parse();

    csi_nfs_common::logging::initialize_logging("LOG_LEVEL", "info").context(InitLoggingSnafu)?;
    csi_nfs_common::print_startup_string(
        built_info::PKG_DESCRIPTION,
        built_info::PKG_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );
    tracing::info!(tls_enabled = TLS_ENABLED, "feature flags");

    let shutdown = shutdown_requested().context(RegisterShutdownSnafu)?;
    let client = create_client().await.context(InitKubeSnafu)?;
    let listen = parse_listen_address(&args.listen).context(ParseListenAddrSnafu)?;

    server::serve_tls(
        routes(Arc::new(Ctx::new(&client))),
        listen,
        &args.tls_cert_file,
        &args.tls_key_file,
        shutdown,
    )
    .await
    .context(RunServerSnafu)
}
