use futures::{
    future::{self, BoxFuture, Shared},
    pin_mut, FutureExt,
};
use snafu::{ResultExt, Snafu};

/// Cloneable future that resolves once shutdown has been requested.
pub type ShutdownSignal = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to register SIGTERM handler"))]
    RegisterSigterm { source: std::io::Error },
}

/// Resolves on ctrl-c or SIGTERM.
///
/// The SIGTERM handler is registered before this returns, so a SIGTERM arriving
/// before the signal is first awaited is not lost.
pub fn shutdown_requested() -> Result<ShutdownSignal, Error> {
    let ctrl_c = tokio::signal::ctrl_c().map(|_| ());
    #[cfg(unix)]
    let requested = {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context(RegisterSigtermSnafu)?;
        async move {
            let sigterm = sigterm.recv().map(|_| ());
            pin_mut!(ctrl_c, sigterm);
            future::select(ctrl_c, sigterm).await;
            tracing::info!("shutdown requested");
        }
    };
    #[cfg(not(unix))]
    let requested = async move {
        ctrl_c.await;
        tracing::info!("shutdown requested");
    };
    Ok(requested.boxed().shared())
}
