//! Access to the externally owned records the gateway works from.
//!
//! The control plane owns cluster, addon, credential and account records.
//! The gateway only reads them, except for targeted writes of health state
//! (addon annotations and conditions) and of its own serving certificate
//! secret. Every component receives the store as an injected
//! [`SharedRecordStore`].
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use snafu::Snafu;

pub mod kubernetes;
pub mod memory;

pub use self::{kubernetes::KubeStore, memory::MemoryStore};

pub type SharedRecordStore = Arc<dyn RecordStore>;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("{kind} {key:?} not found"))]
    NotFound { kind: &'static str, key: String },

    #[snafu(display("{kind} {key:?} was modified concurrently"))]
    Conflict { kind: &'static str, key: String },

    #[snafu(display("failed to access {kind} {key:?}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync>,
        kind: &'static str,
        key: String,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A registered cluster (the `ManagedCluster` object).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterRecord {
    pub name: String,
    pub client_configs: Vec<ClientConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: String,
    pub ca_bundle: Option<Vec<u8>>,
}

/// An addon installed for one cluster (the `ManagedClusterAddOn` object).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddonRecord {
    /// Namespace of the record, equal to the cluster name.
    pub cluster: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<Condition>,
    pub resource_version: Option<String>,
}

impl AddonRecord {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.status)
    }

    /// Inserts or replaces the condition of the same type. The transition
    /// time only moves when the status flips.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                let last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    condition.last_transition_time.clone()
                };
                *existing = Condition {
                    last_transition_time,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    /// RFC 3339 timestamp.
    pub last_transition_time: String,
}

/// A secret: per-cluster credentials or the gateway's serving certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretRecord {
    pub namespace: String,
    pub name: String,
    pub type_: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub resource_version: Option<String>,
}

impl SecretRecord {
    /// Non-empty data entry.
    pub fn data(&self, key: &str) -> Option<&[u8]> {
        self.data
            .get(key)
            .map(Vec::as_slice)
            .filter(|value| !value.is_empty())
    }
}

/// A platform account an identity can be mapped onto.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountRecord {
    pub name: String,
    pub uid: String,
    pub username: String,
    /// Groups per organisation id.
    pub groups: BTreeMap<String, Vec<String>>,
    pub extra: BTreeMap<String, Vec<String>>,
    /// Name of the broker service account allowed to act for this account.
    pub impersonator: Option<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_cluster(&self, name: &str) -> Result<ClusterRecord>;

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>>;

    async fn get_addon(&self, cluster: &str, name: &str) -> Result<AddonRecord>;

    /// All addon records with the given name, across clusters.
    async fn list_addons(&self, name: &str) -> Result<Vec<AddonRecord>>;

    /// Writes the annotations of an addon record. Fails with
    /// [`StoreError::Conflict`] if the resource version is stale.
    async fn update_addon(&self, addon: &AddonRecord) -> Result<AddonRecord>;

    /// Writes the conditions of an addon record, with the same conflict
    /// semantics as [`RecordStore::update_addon`].
    async fn update_addon_status(&self, addon: &AddonRecord) -> Result<AddonRecord>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord>;

    /// Fails with [`StoreError::Conflict`] if the secret already exists.
    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord>;

    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord>;

    async fn get_account(&self, name: &str) -> Result<AccountRecord>;

    async fn list_accounts_by_impersonator(&self, impersonator: &str)
    -> Result<Vec<AccountRecord>>;
}
