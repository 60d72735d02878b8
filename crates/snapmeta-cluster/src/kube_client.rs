//! [`ClusterOps`] implemented against a live API server.

use std::collections::BTreeMap;

use k8s_openapi::api::authentication::v1::{
    SelfSubjectReview, TokenRequest, TokenRequestSpec, TokenReview, TokenReviewSpec,
};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams};
use kube::Client;

use crate::ops::{ClusterError, ClusterOps, SecretRef, TokenReviewOutcome};
use crate::types::{SnapshotMetadataService, SnapshotMetadataServiceSpec, VolumeSnapshot, VolumeSnapshotContent};

// Well-known VolumeSnapshotClass parameter keys naming the snapshotter
// secret. The values are opaque to the gateway and forwarded unchanged.
const SECRET_NAME_PARAM: &str = "csi.storage.k8s.io/snapshotter-secret-name";
const SECRET_NAMESPACE_PARAM: &str = "csi.storage.k8s.io/snapshotter-secret-namespace";

/// Cluster access backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn snapshot_class_resource() -> ApiResource {
        let gvk = GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass");
        ApiResource::from_gvk_with_plural(&gvk, "volumesnapshotclasses")
    }
}

fn api_err(err: kube::Error) -> ClusterError {
    ClusterError::Api(err.to_string())
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ClusterError> {
        Api::<VolumeSnapshot>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(api_err)
    }

    async fn volume_snapshot_content(
        &self,
        name: &str,
    ) -> Result<VolumeSnapshotContent, ClusterError> {
        Api::<VolumeSnapshotContent>::all(self.client.clone())
            .get(name)
            .await
            .map_err(api_err)
    }

    async fn snapshot_class_secret_ref(
        &self,
        class_name: &str,
    ) -> Result<Option<SecretRef>, ClusterError> {
        // VolumeSnapshotClass keeps its fields at the top level rather than
        // under a spec, so it is read as a dynamic object.
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &Self::snapshot_class_resource());
        let class = api.get(class_name).await.map_err(api_err)?;

        let params = class.data.get("parameters").and_then(|v| v.as_object());
        let name = params
            .and_then(|m| m.get(SECRET_NAME_PARAM))
            .and_then(|v| v.as_str());
        let namespace = params
            .and_then(|m| m.get(SECRET_NAMESPACE_PARAM))
            .and_then(|v| v.as_str());

        match (name, namespace) {
            (None, None) => Ok(None),
            (Some(name), Some(namespace)) => Ok(Some(SecretRef {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })),
            _ => Err(ClusterError::Api(format!(
                "VolumeSnapshotClass {class_name} has an incomplete secret reference"
            ))),
        }
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(api_err)?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    async fn metadata_service(
        &self,
        driver: &str,
    ) -> Result<SnapshotMetadataServiceSpec, ClusterError> {
        let sms = Api::<SnapshotMetadataService>::all(self.client.clone())
            .get(driver)
            .await
            .map_err(api_err)?;
        Ok(sms.spec)
    }

    async fn review_token(
        &self,
        token: &str,
        audience: &str,
    ) -> Result<TokenReviewOutcome, ClusterError> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: Some(vec![audience.to_string()]),
            },
            ..Default::default()
        };

        let created = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await
            .map_err(api_err)?;

        let status = created.status.unwrap_or_default();
        Ok(TokenReviewOutcome {
            authenticated: status.authenticated.unwrap_or(false),
            username: status.user.and_then(|u| u.username).unwrap_or_default(),
        })
    }

    async fn current_username(&self) -> Result<String, ClusterError> {
        let review = Api::<SelfSubjectReview>::all(self.client.clone())
            .create(&PostParams::default(), &SelfSubjectReview::default())
            .await
            .map_err(api_err)?;

        Ok(review
            .status
            .and_then(|s| s.user_info)
            .and_then(|u| u.username)
            .unwrap_or_default())
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audience: &str,
        expiry_secs: i64,
    ) -> Result<String, ClusterError> {
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![audience.to_string()],
                expiration_seconds: Some(expiry_secs),
                ..Default::default()
            },
            ..Default::default()
        };

        let body = serde_json::to_vec(&request)
            .map_err(|e| ClusterError::Api(format!("failed to encode TokenRequest: {e}")))?;

        let minted: TokenRequest = Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .create_subresource("token", name, &PostParams::default(), body)
            .await
            .map_err(api_err)?;

        minted
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ClusterError::Api(format!("no token issued for ServiceAccount {namespace}/{name}"))
            })
    }
}
