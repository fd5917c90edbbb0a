mod teardown;

use clap::Parser;
use csi_nfs_common::{client::create_client, namespace::resolve_controller_namespace};
use csi_nfs_crd::DEFAULT_CONTROLLER_NAMESPACE;
use snafu::{ResultExt, Snafu};

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(clap::Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Releases and removes module-owned objects before the module is uninstalled
    Teardown {
        /// Module namespace holding the credentials secrets
        #[clap(long, env)]
        controller_namespace: Option<String>,
    },
}

#[derive(Snafu, Debug)]
enum StartupError {
    #[snafu(display("failed to initialize logging"))]
    InitLogging {
        source: csi_nfs_common::logging::Error,
    },

    #[snafu(display("failed to initialize Kubernetes client"))]
    InitKube {
        source: csi_nfs_common::client::Error,
    },

    #[snafu(display("teardown finished with {failed} failed step(s)"))]
    Teardown { failed: usize },
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let opts = Opts::parse();

    csi_nfs_common::logging::initialize_logging("LOG_LEVEL", "info").context(InitLoggingSnafu)?;
    csi_nfs_common::print_startup_string(
        built_info::PKG_DESCRIPTION,
        built_info::PKG_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    match opts.cmd {
        Command::Teardown {
            controller_namespace,
        } => {
            let namespace =
                resolve_controller_namespace(controller_namespace, DEFAULT_CONTROLLER_NAMESPACE);
            let client = create_client().await.context(InitKubeSnafu)?;

            tracing::info!(%namespace, "releasing module objects");
            let errors = teardown::run(&teardown::Stores::new(&client, &namespace)).await;
            if !errors.is_empty() {
                return TeardownSnafu {
                    failed: errors.len(),
                }
                .fail();
            }
            tracing::info!("teardown complete");
        }
    }

    Ok(())
}
