//! Token authentication and namespace authorization.

use std::sync::Arc;

use snapmeta_cluster::ClusterOps;

use crate::error::GatewayError;

/// Prefix the cluster guarantees on every service-account username. No other
/// user class can carry it.
pub const SERVICE_ACCOUNT_USERNAME_PREFIX: &str = "system:serviceaccount:";

/// Checks that a caller's bearer token authenticates a service account in the
/// namespace it wants to read from. Reviews are never cached.
pub struct Authenticator {
    cluster: Arc<dyn ClusterOps>,
    audience: String,
}

impl Authenticator {
    pub fn new(cluster: Arc<dyn ClusterOps>, audience: impl Into<String>) -> Self {
        Self {
            cluster,
            audience: audience.into(),
        }
    }

    pub async fn authenticate(&self, token: &str, namespace: &str) -> Result<(), GatewayError> {
        let outcome = self
            .cluster
            .review_token(token, &self.audience)
            .await
            .map_err(|e| GatewayError::TokenReviewFailed(e.to_string()))?;

        if !outcome.authenticated {
            return Err(GatewayError::InvalidUser);
        }

        // Username shape: system:serviceaccount:<namespace>:<name>.
        let Some(rest) = outcome.username.strip_prefix(SERVICE_ACCOUNT_USERNAME_PREFIX) else {
            return Err(GatewayError::InvalidUser);
        };
        match rest.split_once(':') {
            Some((ns, name)) if ns == namespace && !name.is_empty() => Ok(()),
            _ => Err(GatewayError::InvalidUser),
        }
    }
}
