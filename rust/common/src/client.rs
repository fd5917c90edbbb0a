use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to infer Kubernetes client configuration"))]
    InferConfig { source: kube::config::InferConfigError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },
}

/// Builds a client from the in-cluster environment, falling back to the local kubeconfig.
pub async fn create_client() -> Result<kube::Client, Error> {
    let config = kube::Config::infer().await.context(InferConfigSnafu)?;
    kube::Client::try_from(config).context(CreateClientSnafu)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

/// Builds an API status error, as returned by the API server.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_owned(),
        message: message.into(),
        reason: reason.to_owned(),
        code,
    })
}
