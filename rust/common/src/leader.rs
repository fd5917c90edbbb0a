//! Leader election on a `coordination.k8s.io/v1` Lease.

use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use snafu::{ResultExt, Snafu};

use crate::{client::is_conflict, signal::ShutdownSignal};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read lease {lease}"))]
    GetLease { source: kube::Error, lease: String },

    #[snafu(display("failed to write lease {lease}"))]
    WriteLease { source: kube::Error, lease: String },

    #[snafu(display("leadership of lease {lease} lost"))]
    LeadershipLost { lease: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Nobody holds a live lease, take it over.
    Acquire,
    /// We already hold it, extend it.
    Renew,
    /// Someone else holds a lease that has not expired.
    HeldBy(String),
}

/// Decides what to do with the lease as observed at `now`.
pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(spec) = spec else {
        return LeaseDecision::Acquire;
    };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder == identity {
        return LeaseDecision::Renew;
    }
    if holder.is_empty() {
        return LeaseDecision::Acquire;
    }
    let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(seconds)) => {
            *renewed + k8s_openapi::chrono::Duration::seconds(i64::from(seconds)) < now
        }
        _ => true,
    };
    if expired {
        LeaseDecision::Acquire
    } else {
        LeaseDecision::HeldBy(holder.to_owned())
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_owned(),
            identity,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    /// `<hostname>_<random>`, unique per process like client-go's default identity.
    pub fn default_identity() -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned());
        format!("{host}_{}", uuid::Uuid::new_v4())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One acquire-or-renew round. Returns whether we hold the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let lease = self.api.get_opt(&self.lease_name).await.context(GetLeaseSnafu {
            lease: &self.lease_name,
        })?;

        let decision = decide(
            lease.as_ref().and_then(|lease| lease.spec.as_ref()),
            &self.identity,
            now,
        );
        if let LeaseDecision::HeldBy(holder) = &decision {
            tracing::debug!(lease = %self.lease_name, %holder, "lease is held by another replica");
            return Ok(false);
        }

        let previous = lease.as_ref().and_then(|lease| lease.spec.clone()).unwrap_or_default();
        let acquire_time = match decision {
            LeaseDecision::Renew => previous.acquire_time.clone(),
            _ => Some(MicroTime(now)),
        };
        let transitions = match decision {
            LeaseDecision::Acquire if lease.is_some() => previous.lease_transitions.unwrap_or(0) + 1,
            _ => previous.lease_transitions.unwrap_or(0),
        };
        let spec = LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time,
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..previous
        };

        let result = match lease {
            Some(mut lease) => {
                lease.spec = Some(spec);
                self.api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(spec),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
        };
        match result {
            Ok(_) => Ok(true),
            Err(error) if is_conflict(&error) => Ok(false),
            Err(source) => Err(Error::WriteLease {
                source,
                lease: self.lease_name.clone(),
            }),
        }
    }

    /// Blocks until this replica holds the lease. Returns `false` if shutdown came first.
    pub async fn acquire(&self, shutdown: ShutdownSignal) -> bool {
        tracing::info!(lease = %self.lease_name, identity = %self.identity, "waiting for leadership");
        let acquired = async {
            loop {
                match self.try_acquire_or_renew().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(error) => tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to acquire lease"
                    ),
                }
                tokio::time::sleep(self.retry_period).await;
            }
        };
        tokio::select! {
            _ = acquired => {
                tracing::info!(lease = %self.lease_name, "became leader");
                true
            }
            _ = shutdown => false,
        }
    }

    /// Keeps renewing the lease. Only returns when leadership is lost, i.e. when
    /// the lease could not be renewed within the renew deadline.
    pub async fn hold(&self) -> Error {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    return Error::LeadershipLost {
                        lease: self.lease_name.clone(),
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to renew lease"
                    );
                    if last_renewal.elapsed() > self.renew_deadline {
                        return error;
                    }
                }
            }
        }
    }
}
