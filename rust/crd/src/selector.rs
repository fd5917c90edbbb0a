//! Label selector evaluation against node labels.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{ParseExpressionError, Selector, SelectorExt};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_NODE_SELECTOR_KEY: &str = "kubernetes.io/os";
pub const DEFAULT_NODE_SELECTOR_VALUE: &str = "linux";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid label selector"))]
    InvalidSelector { source: ParseExpressionError },
}

/// Selector used for declarations without `workloadNodes.nodeSelector`.
pub fn default_node_selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            DEFAULT_NODE_SELECTOR_KEY.to_owned(),
            DEFAULT_NODE_SELECTOR_VALUE.to_owned(),
        )])),
        match_expressions: None,
    }
}

pub fn parse(selector: &LabelSelector) -> Result<Selector, Error> {
    Selector::try_from(selector.clone()).context(InvalidSelectorSnafu)
}

/// Whether a node with `labels` is selected. An empty selector matches everything.
pub fn selects(selector: &Selector, labels: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    selector.matches(labels.unwrap_or(&empty))
}

/// Evaluates `selector` the way the API server does for label selectors.
pub fn matches(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<bool, Error> {
    Ok(selects(&parse(selector)?, labels))
}
