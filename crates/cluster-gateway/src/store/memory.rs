//! An in-process [`RecordStore`], used by tests and by embedders which do not
//! talk to a control plane.
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use snafu::{OptionExt, ensure};
use tokio::sync::RwLock;

use super::{
    AccountRecord, AddonRecord, ClusterRecord, ConflictSnafu, NotFoundSnafu, RecordStore, Result,
    SecretRecord,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    clusters: RwLock<BTreeMap<String, ClusterRecord>>,
    addons: RwLock<BTreeMap<(String, String), AddonRecord>>,
    secrets: RwLock<BTreeMap<(String, String), SecretRecord>>,
    accounts: RwLock<BTreeMap<String, AccountRecord>>,
    resource_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub async fn insert_cluster(&self, cluster: ClusterRecord) {
        self.clusters
            .write()
            .await
            .insert(cluster.name.clone(), cluster);
    }

    pub async fn remove_cluster(&self, name: &str) {
        self.clusters.write().await.remove(name);
    }

    /// Stores the addon as is, assigning a fresh resource version.
    pub async fn insert_addon(&self, mut addon: AddonRecord) {
        addon.resource_version = Some(self.next_resource_version());
        self.addons
            .write()
            .await
            .insert((addon.cluster.clone(), addon.name.clone()), addon);
    }

    pub async fn insert_secret(&self, mut secret: SecretRecord) {
        secret.resource_version = Some(self.next_resource_version());
        self.secrets
            .write()
            .await
            .insert((secret.namespace.clone(), secret.name.clone()), secret);
    }

    pub async fn insert_account(&self, account: AccountRecord) {
        self.accounts
            .write()
            .await
            .insert(account.name.clone(), account);
    }

    /// Number of successful writes so far. Lets tests assert that an
    /// operation was a no-op.
    pub fn write_count(&self) -> u64 {
        self.resource_version.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<ClusterRecord> {
        self.clusters
            .read()
            .await
            .get(name)
            .cloned()
            .context(NotFoundSnafu {
                kind: "ManagedCluster",
                key: name,
            })
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        Ok(self.clusters.read().await.values().cloned().collect())
    }

    async fn get_addon(&self, cluster: &str, name: &str) -> Result<AddonRecord> {
        self.addons
            .read()
            .await
            .get(&(cluster.to_owned(), name.to_owned()))
            .cloned()
            .context(NotFoundSnafu {
                kind: "ManagedClusterAddOn",
                key: format!("{cluster}/{name}"),
            })
    }

    async fn list_addons(&self, name: &str) -> Result<Vec<AddonRecord>> {
        Ok(self
            .addons
            .read()
            .await
            .values()
            .filter(|addon| addon.name == name)
            .cloned()
            .collect())
    }

    async fn update_addon(&self, addon: &AddonRecord) -> Result<AddonRecord> {
        self.write_addon(addon, |stored, addon| {
            stored.annotations = addon.annotations.clone();
        })
        .await
    }

    async fn update_addon_status(&self, addon: &AddonRecord) -> Result<AddonRecord> {
        self.write_addon(addon, |stored, addon| {
            stored.conditions = addon.conditions.clone();
        })
        .await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord> {
        self.secrets
            .read()
            .await
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .context(NotFoundSnafu {
                kind: "Secret",
                key: format!("{namespace}/{name}"),
            })
    }

    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord> {
        let mut secrets = self.secrets.write().await;
        let key = (secret.namespace.clone(), secret.name.clone());
        ensure!(
            !secrets.contains_key(&key),
            ConflictSnafu {
                kind: "Secret",
                key: format!("{}/{}", secret.namespace, secret.name),
            }
        );

        let mut created = secret.clone();
        created.resource_version = Some(self.next_resource_version());
        secrets.insert(key, created.clone());
        Ok(created)
    }

    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord> {
        let mut secrets = self.secrets.write().await;
        let display_key = format!("{}/{}", secret.namespace, secret.name);
        let stored = secrets
            .get_mut(&(secret.namespace.clone(), secret.name.clone()))
            .context(NotFoundSnafu {
                kind: "Secret",
                key: display_key.clone(),
            })?;
        ensure!(
            secret.resource_version.is_none() || secret.resource_version == stored.resource_version,
            ConflictSnafu {
                kind: "Secret",
                key: display_key,
            }
        );

        let mut updated = secret.clone();
        updated.resource_version = Some(self.next_resource_version());
        *stored = updated.clone();
        Ok(updated)
    }

    async fn get_account(&self, name: &str) -> Result<AccountRecord> {
        self.accounts
            .read()
            .await
            .get(name)
            .cloned()
            .context(NotFoundSnafu {
                kind: "Account",
                key: name,
            })
    }

    async fn list_accounts_by_impersonator(
        &self,
        impersonator: &str,
    ) -> Result<Vec<AccountRecord>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .filter(|account| account.impersonator.as_deref() == Some(impersonator))
            .cloned()
            .collect())
    }
}

impl MemoryStore {
    async fn write_addon(
        &self,
        addon: &AddonRecord,
        apply: impl FnOnce(&mut AddonRecord, &AddonRecord),
    ) -> Result<AddonRecord> {
        let mut addons = self.addons.write().await;
        let display_key = format!("{}/{}", addon.cluster, addon.name);
        let stored = addons
            .get_mut(&(addon.cluster.clone(), addon.name.clone()))
            .context(NotFoundSnafu {
                kind: "ManagedClusterAddOn",
                key: display_key.clone(),
            })?;
        ensure!(
            addon.resource_version.is_none() || addon.resource_version == stored.resource_version,
            ConflictSnafu {
                kind: "ManagedClusterAddOn",
                key: display_key,
            }
        );

        apply(stored, addon);
        stored.resource_version = Some(self.next_resource_version());
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addon() -> AddonRecord {
        AddonRecord {
            cluster: "c1".to_owned(),
            name: "cluster-gateway".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_addon_update_conflicts() {
        let store = MemoryStore::new();
        store.insert_addon(addon()).await;

        let mut first = store.get_addon("c1", "cluster-gateway").await.unwrap();
        let mut second = first.clone();

        first.annotations.insert("a".to_owned(), "1".to_owned());
        store.update_addon(&first).await.unwrap();

        second.annotations.insert("a".to_owned(), "2".to_owned());
        let err = store.update_addon(&second).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");

        let stored = store.get_addon("c1", "cluster-gateway").await.unwrap();
        assert_eq!(stored.annotations["a"], "1");
    }

    #[tokio::test]
    async fn status_update_leaves_annotations_alone() {
        let store = MemoryStore::new();
        let mut initial = addon();
        initial.annotations.insert("keep".to_owned(), "me".to_owned());
        store.insert_addon(initial).await;

        let mut record = store.get_addon("c1", "cluster-gateway").await.unwrap();
        record.annotations.clear();
        record.conditions.push(super::super::Condition {
            type_: "Available".to_owned(),
            status: true,
            ..Default::default()
        });
        let updated = store.update_addon_status(&record).await.unwrap();

        assert_eq!(updated.annotations["keep"], "me");
        assert!(updated.is_condition_true("Available"));
    }

    #[tokio::test]
    async fn creating_existing_secret_conflicts() {
        let store = MemoryStore::new();
        let secret = SecretRecord {
            namespace: "ns".to_owned(),
            name: "tls".to_owned(),
            ..Default::default()
        };

        store.create_secret(&secret).await.unwrap();
        let err = store.create_secret(&secret).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
    }

    #[tokio::test]
    async fn accounts_are_filtered_by_impersonator() {
        let store = MemoryStore::new();
        for (name, impersonator) in [("a", Some("broker")), ("b", None), ("c", Some("other"))] {
            store
                .insert_account(AccountRecord {
                    name: name.to_owned(),
                    impersonator: impersonator.map(str::to_owned),
                    ..Default::default()
                })
                .await;
        }

        let accounts = store.list_accounts_by_impersonator("broker").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "a");
    }
}
