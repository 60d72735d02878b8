//! In-memory [`ClusterOps`] for tests.
//!
//! Objects are registered up front; per-name failures are injected with the
//! `fail_*` methods. Every trait call is appended to an ordered log so tests
//! can assert the lookup sequence of the code under test.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::ops::{ClusterError, ClusterOps, SecretRef, TokenReviewOutcome};
use crate::types::{
    SnapshotMetadataServiceSpec, VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSpec,
    VolumeSnapshotContentStatus, VolumeSnapshotSource, VolumeSnapshotSpec, VolumeSnapshotStatus,
};

/// Parameters of a token minted through the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub namespace: String,
    pub name: String,
    pub audience: String,
    pub expiry_secs: i64,
}

#[derive(Default)]
struct State {
    snapshots: HashMap<(String, String), VolumeSnapshot>,
    snapshot_errors: HashMap<String, String>,
    contents: HashMap<String, VolumeSnapshotContent>,
    content_errors: HashMap<String, String>,
    classes: HashMap<String, Option<SecretRef>>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    secrets_error: Option<String>,
    services: HashMap<String, SnapshotMetadataServiceSpec>,
    reviews: HashMap<String, TokenReviewOutcome>,
    review_error: Option<String>,
    username: Option<String>,
    issued_token: String,
    grants: Vec<TokenGrant>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&self, snapshot: VolumeSnapshot) {
        let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
        let name = snapshot.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .snapshots
            .insert((namespace, name), snapshot);
    }

    /// Make reads of the named snapshot fail with `message`.
    pub fn fail_snapshot(&self, name: &str, message: &str) {
        self.state
            .lock()
            .snapshot_errors
            .insert(name.to_string(), message.to_string());
    }

    pub fn add_content(&self, content: VolumeSnapshotContent) {
        let name = content.metadata.name.clone().unwrap_or_default();
        self.state.lock().contents.insert(name, content);
    }

    pub fn fail_content(&self, name: &str, message: &str) {
        self.state
            .lock()
            .content_errors
            .insert(name.to_string(), message.to_string());
    }

    pub fn add_class(&self, name: &str, secret_ref: Option<SecretRef>) {
        self.state.lock().classes.insert(name.to_string(), secret_ref);
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.state
            .lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Make all secret reads fail with `message`.
    pub fn fail_secrets(&self, message: &str) {
        self.state.lock().secrets_error = Some(message.to_string());
    }

    pub fn add_metadata_service(&self, driver: &str, spec: SnapshotMetadataServiceSpec) {
        self.state.lock().services.insert(driver.to_string(), spec);
    }

    /// Register the review outcome for a specific token value.
    pub fn add_token(&self, token: &str, outcome: TokenReviewOutcome) {
        self.state.lock().reviews.insert(token.to_string(), outcome);
    }

    pub fn fail_token_review(&self, message: &str) {
        self.state.lock().review_error = Some(message.to_string());
    }

    pub fn set_username(&self, username: &str) {
        self.state.lock().username = Some(username.to_string());
    }

    /// Token value returned by [`ClusterOps::create_service_account_token`].
    pub fn set_issued_token(&self, token: &str) {
        self.state.lock().issued_token = token.to_string();
    }

    /// Tokens minted so far, in order.
    pub fn grants(&self) -> Vec<TokenGrant> {
        self.state.lock().grants.clone()
    }

    /// Ordered log of trait calls, e.g. `"volume_snapshot:ns/snap-1"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

/// A ready-to-use snapshot bound to `content_name`, sourced from `claim`.
pub fn ready_snapshot(
    namespace: &str,
    name: &str,
    content_name: &str,
    claim: &str,
) -> VolumeSnapshot {
    let mut vs = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim.to_string()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: None,
        },
    );
    vs.metadata.namespace = Some(namespace.to_string());
    vs.status = Some(VolumeSnapshotStatus {
        ready_to_use: Some(true),
        bound_volume_snapshot_content_name: Some(content_name.to_string()),
    });
    vs
}

/// A ready-to-use content for `driver` exposing `handle`.
pub fn ready_content(
    name: &str,
    driver: &str,
    handle: &str,
    class_name: Option<&str>,
) -> VolumeSnapshotContent {
    let mut vsc = VolumeSnapshotContent::new(
        name,
        VolumeSnapshotContentSpec {
            driver: driver.to_string(),
            volume_snapshot_class_name: class_name.map(str::to_string),
        },
    );
    vsc.status = Some(VolumeSnapshotContentStatus {
        ready_to_use: Some(true),
        snapshot_handle: Some(handle.to_string()),
    });
    vsc
}

#[async_trait::async_trait]
impl ClusterOps for FakeCluster {
    async fn volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ClusterError> {
        self.record(format!("volume_snapshot:{namespace}/{name}"));
        let state = self.state.lock();
        if let Some(msg) = state.snapshot_errors.get(name) {
            return Err(ClusterError::Api(msg.clone()));
        }
        state
            .snapshots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::Api(format!("volumesnapshots \"{name}\" not found")))
    }

    async fn volume_snapshot_content(
        &self,
        name: &str,
    ) -> Result<VolumeSnapshotContent, ClusterError> {
        self.record(format!("volume_snapshot_content:{name}"));
        let state = self.state.lock();
        if let Some(msg) = state.content_errors.get(name) {
            return Err(ClusterError::Api(msg.clone()));
        }
        state
            .contents
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::Api(format!("volumesnapshotcontents \"{name}\" not found")))
    }

    async fn snapshot_class_secret_ref(
        &self,
        class_name: &str,
    ) -> Result<Option<SecretRef>, ClusterError> {
        self.record(format!("snapshot_class_secret_ref:{class_name}"));
        self.state
            .lock()
            .classes
            .get(class_name)
            .cloned()
            .ok_or_else(|| {
                ClusterError::Api(format!("volumesnapshotclasses \"{class_name}\" not found"))
            })
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError> {
        self.record(format!("secret_data:{namespace}/{name}"));
        let state = self.state.lock();
        if let Some(msg) = &state.secrets_error {
            return Err(ClusterError::Api(msg.clone()));
        }
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::Api(format!("secrets \"{name}\" not found")))
    }

    async fn metadata_service(
        &self,
        driver: &str,
    ) -> Result<SnapshotMetadataServiceSpec, ClusterError> {
        self.record(format!("metadata_service:{driver}"));
        self.state.lock().services.get(driver).cloned().ok_or_else(|| {
            ClusterError::Api(format!("snapshotmetadataservices \"{driver}\" not found"))
        })
    }

    async fn review_token(
        &self,
        token: &str,
        audience: &str,
    ) -> Result<TokenReviewOutcome, ClusterError> {
        self.record(format!("review_token:{audience}"));
        let state = self.state.lock();
        if let Some(msg) = &state.review_error {
            return Err(ClusterError::Api(msg.clone()));
        }
        // An unknown token reviews as unauthenticated, like the real API.
        Ok(state.reviews.get(token).cloned().unwrap_or_default())
    }

    async fn current_username(&self) -> Result<String, ClusterError> {
        self.record("current_username".to_string());
        self.state
            .lock()
            .username
            .clone()
            .ok_or_else(|| ClusterError::Api("self subject review unavailable".to_string()))
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audience: &str,
        expiry_secs: i64,
    ) -> Result<String, ClusterError> {
        self.record(format!("create_service_account_token:{namespace}/{name}"));
        let mut state = self.state.lock();
        state.grants.push(TokenGrant {
            namespace: namespace.to_string(),
            name: name.to_string(),
            audience: audience.to_string(),
            expiry_secs,
        });
        Ok(state.issued_token.clone())
    }
}
