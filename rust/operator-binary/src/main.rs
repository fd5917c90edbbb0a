use std::{sync::Arc, time::Duration};

use clap::Parser;
use csi_nfs_common::{
    client::create_client,
    leader::LeaderElector,
    namespace::resolve_controller_namespace,
    server::{self, health_routes, parse_listen_address},
    signal::shutdown_requested,
};
use csi_nfs_crd::{NFSStorageClass, DEFAULT_CONTROLLER_NAMESPACE};
use kube::CustomResourceExt;
use snafu::{ResultExt, Snafu};

mod derivation;
mod diff;
mod module_config_controller;
mod nfs_storage_class_controller;
mod node_selector;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Lease that elects the replica driving the reconcilers.
const LEADER_LEASE_NAME: &str = "d8-controller";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the NFSStorageClass CustomResourceDefinition as YAML
    Crd,

    /// Run the controller
    Run(ControllerRun),
}

#[derive(clap::Parser)]
struct ControllerRun {
    /// Namespace of the module, holding the credentials secrets and the leader lease.
    /// Defaults to the namespace of the service account, then `d8-csi-nfs`.
    #[clap(long, env)]
    controller_namespace: Option<String>,

    #[clap(long, env, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Upper bound of the retry backoff and the recheck interval, in seconds.
    #[clap(long, env, default_value_t = 10)]
    requeue_interval: u64,

    /// Period of the node selector reconciliation, in seconds.
    #[clap(long, env, default_value_t = 10)]
    node_selector_interval: u64,
}

#[derive(Snafu, Debug)]
enum StartupError {
    #[snafu(display("failed to serialize the CustomResourceDefinition"))]
    SerializeCrd { source: serde_yaml::Error },

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

    #[snafu(display("invalid health probe address"))]
    HealthProbeAddress { source: server::Error },

    #[snafu(display("failed to run health probe server"))]
    RunHealthServer { source: server::Error },

    #[snafu(display("health probe server task failed"))]
    JoinHealthServer { source: tokio::task::JoinError },

    #[snafu(display("lost leadership"))]
    Leadership {
        source: csi_nfs_common::leader::Error,
    },
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            let crd = serde_yaml::to_string(&NFSStorageClass::crd()).context(SerializeCrdSnafu)?;
            print!("{crd}");
        }
        Command::Run(run) => {
            csi_nfs_common::logging::initialize_logging("LOG_LEVEL", "debug")
                .context(InitLoggingSnafu)?;
            csi_nfs_common::print_startup_string(
                built_info::PKG_DESCRIPTION,
                built_info::PKG_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            run_controller(run).await?;
        }
    };

    Ok(())
}

async fn run_controller(run: ControllerRun) -> Result<(), StartupError> {
    let controller_namespace =
        resolve_controller_namespace(run.controller_namespace, DEFAULT_CONTROLLER_NAMESPACE);
    let requeue_interval = Duration::from_secs(run.requeue_interval);
    let node_selector_interval = Duration::from_secs(run.node_selector_interval);
    tracing::info!(%controller_namespace, ?requeue_interval, ?node_selector_interval, "configured");

    let shutdown = shutdown_requested().context(RegisterShutdownSnafu)?;
    let client = create_client().await.context(InitKubeSnafu)?;

    let health_address =
        parse_listen_address(&run.health_probe_bind_address).context(HealthProbeAddressSnafu)?;
    let health = tokio::spawn(server::serve(
        health_routes(),
        health_address,
        shutdown.clone(),
    ));

    let elector = LeaderElector::new(
        client.clone(),
        &controller_namespace,
        LEADER_LEASE_NAME,
        LeaderElector::default_identity(),
    );
    if elector.acquire(shutdown.clone()).await {
        let nfs_storage_classes = nfs_storage_class_controller::run(
            client.clone(),
            Arc::new(nfs_storage_class_controller::Ctx::new(
                nfs_storage_class_controller::Stores::new(&client, &controller_namespace),
                controller_namespace.clone(),
                requeue_interval,
            )),
            shutdown.clone(),
        );
        let module_config = module_config_controller::run(
            client.clone(),
            Arc::new(module_config_controller::Ctx::new(&client, requeue_interval)),
            shutdown.clone(),
        );
        let node_selector = node_selector::run(
            node_selector::Ctx::new(&client, &controller_namespace),
            node_selector_interval,
            shutdown.clone(),
        );

        tokio::select! {
            _ = futures::future::join3(nfs_storage_classes, module_config, node_selector) => {
                tracing::info!("controllers stopped");
            }
            error = elector.hold() => {
                return Err(error).context(LeadershipSnafu);
            }
        }
    }

    health
        .await
        .context(JoinHealthServerSnafu)?
        .context(RunHealthServerSnafu)
}
