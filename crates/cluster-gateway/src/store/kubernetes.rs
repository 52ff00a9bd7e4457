//! [`RecordStore`] backed by the Kubernetes API of the hub cluster.
//!
//! Secrets are accessed through their typed API. The Open Cluster Management
//! kinds and the platform `Account` kind are not part of `k8s-openapi`, so
//! they are read as [`DynamicObject`]s and only the fields the gateway needs
//! are extracted.
use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use k8s_openapi::{ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
};
use serde_json::{Value, json};
use snafu::OptionExt;
use tracing::instrument;

use super::{
    AccountRecord, AddonRecord, ClientConfig, ClusterRecord, Condition, NotFoundSnafu,
    RecordStore, Result, SecretRecord, StoreError,
};

/// Label on `Account` objects naming the broker service account allowed to
/// act for them.
pub const LABEL_KEY_ACCOUNT_IMPERSONATOR: &str = "authentication.k8s.appscode.com/impersonator";

const FIELD_MANAGER: &str = "cluster-gateway";

fn managed_cluster_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cluster.open-cluster-management.io", "v1", "ManagedCluster"),
        "managedclusters",
    )
}

/// The `ManagedClusterAddOn` kind, whose namespace names the cluster.
pub fn managed_cluster_addon_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(
            "addon.open-cluster-management.io",
            "v1alpha1",
            "ManagedClusterAddOn",
        ),
        "managedclusteraddons",
    )
}

fn account_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("authentication.k8s.appscode.com", "v1alpha1", "Account"),
        "accounts",
    )
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    managed_clusters: ApiResource,
    addons: ApiResource,
    accounts: ApiResource,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            managed_clusters: managed_cluster_resource(),
            addons: managed_cluster_addon_resource(),
            accounts: account_resource(),
        }
    }

    fn addon_api(&self, cluster: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), cluster, &self.addons)
    }

    /// Merge patch which only applies if the object still has the given
    /// resource version.
    async fn patch_addon(
        &self,
        addon: &AddonRecord,
        patch: Value,
        status: bool,
    ) -> Result<AddonRecord> {
        let key = format!("{}/{}", addon.cluster, addon.name);
        let api = self.addon_api(&addon.cluster);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_owned()),
            ..PatchParams::default()
        };
        let patch = Patch::Merge(&patch);
        let result = if status {
            api.patch_status(&addon.name, &params, &patch).await
        } else {
            api.patch(&addon.name, &params, &patch).await
        };

        result
            .map(|object| addon_from_object(&addon.cluster, object))
            .map_err(|source| map_kube_error(source, "ManagedClusterAddOn", key))
    }
}

/// Translates API errors into the store's taxonomy.
fn map_kube_error(source: kube::Error, kind: &'static str, key: String) -> StoreError {
    match &source {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound { kind, key },
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict { kind, key },
        _ => StoreError::Backend {
            source: Box::new(source),
            kind,
            key,
        },
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, Vec<String>> {
    value
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .map(|(key, values)| (key.clone(), string_list(Some(values))))
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn cluster_from_object(object: DynamicObject) -> ClusterRecord {
    let client_configs = object
        .data
        .pointer("/spec/managedClusterClientConfigs")
        .and_then(Value::as_array)
        .map(|configs| {
            configs
                .iter()
                .map(|config| ClientConfig {
                    url: str_field(config, "/url").unwrap_or_default().to_owned(),
                    ca_bundle: str_field(config, "/caBundle")
                        .and_then(|bundle| STANDARD.decode(bundle).ok())
                        .filter(|bundle| !bundle.is_empty()),
                })
                .collect()
        })
        .unwrap_or_default();

    ClusterRecord {
        name: object.name_any(),
        client_configs,
    }
}

fn addon_from_object(cluster: &str, object: DynamicObject) -> AddonRecord {
    let conditions = object
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions
                .iter()
                .map(|condition| Condition {
                    type_: str_field(condition, "/type").unwrap_or_default().to_owned(),
                    status: str_field(condition, "/status") == Some("True"),
                    reason: str_field(condition, "/reason").unwrap_or_default().to_owned(),
                    message: str_field(condition, "/message").unwrap_or_default().to_owned(),
                    last_transition_time: str_field(condition, "/lastTransitionTime")
                        .unwrap_or_default()
                        .to_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    AddonRecord {
        cluster: object.namespace().unwrap_or_else(|| cluster.to_owned()),
        name: object.name_any(),
        annotations: object.annotations().clone(),
        conditions,
        resource_version: object.resource_version(),
    }
}

fn account_from_object(object: DynamicObject) -> AccountRecord {
    let spec = object.data.get("spec").cloned().unwrap_or(Value::Null);
    AccountRecord {
        name: object.name_any(),
        uid: str_field(&spec, "/uid").unwrap_or_default().to_owned(),
        username: str_field(&spec, "/username").unwrap_or_default().to_owned(),
        groups: string_map(spec.get("groups")),
        extra: string_map(spec.get("extra")),
        impersonator: object.labels().get(LABEL_KEY_ACCOUNT_IMPERSONATOR).cloned(),
    }
}

fn secret_from_object(secret: Secret) -> SecretRecord {
    SecretRecord {
        namespace: secret.namespace().unwrap_or_default(),
        name: secret.name_any(),
        type_: secret.type_.clone(),
        labels: secret.labels().clone(),
        annotations: secret.annotations().clone(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, ByteString(value))| (key, value))
            .collect(),
        resource_version: secret.metadata.resource_version,
    }
}

fn secret_to_object(secret: &SecretRecord) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret.name.clone()),
            namespace: Some(secret.namespace.clone()),
            labels: Some(secret.labels.clone()).filter(|labels| !labels.is_empty()),
            annotations: Some(secret.annotations.clone())
                .filter(|annotations| !annotations.is_empty()),
            resource_version: secret.resource_version.clone(),
            ..ObjectMeta::default()
        },
        type_: secret.type_.clone(),
        data: Some(
            secret
                .data
                .iter()
                .map(|(key, value)| (key.clone(), ByteString(value.clone())))
                .collect(),
        ),
        ..Secret::default()
    }
}

#[async_trait]
impl RecordStore for KubeStore {
    #[instrument(skip(self))]
    async fn get_cluster(&self, name: &str) -> Result<ClusterRecord> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.managed_clusters);
        let object = api
            .get_opt(name)
            .await
            .map_err(|source| map_kube_error(source, "ManagedCluster", name.to_owned()))?
            .context(NotFoundSnafu {
                kind: "ManagedCluster",
                key: name,
            })?;
        Ok(cluster_from_object(object))
    }

    #[instrument(skip(self))]
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.managed_clusters);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|source| map_kube_error(source, "ManagedCluster", String::new()))?;
        Ok(list.items.into_iter().map(cluster_from_object).collect())
    }

    #[instrument(skip(self))]
    async fn get_addon(&self, cluster: &str, name: &str) -> Result<AddonRecord> {
        let key = format!("{cluster}/{name}");
        let object = self
            .addon_api(cluster)
            .get_opt(name)
            .await
            .map_err(|source| map_kube_error(source, "ManagedClusterAddOn", key.clone()))?
            .context(NotFoundSnafu {
                kind: "ManagedClusterAddOn",
                key,
            })?;
        Ok(addon_from_object(cluster, object))
    }

    #[instrument(skip(self))]
    async fn list_addons(&self, name: &str) -> Result<Vec<AddonRecord>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.addons);
        let params = ListParams::default().fields(&format!("metadata.name={name}"));
        let list = api
            .list(&params)
            .await
            .map_err(|source| map_kube_error(source, "ManagedClusterAddOn", name.to_owned()))?;
        Ok(list
            .items
            .into_iter()
            .map(|object| addon_from_object("", object))
            .collect())
    }

    #[instrument(skip(self, addon), fields(addon.cluster = %addon.cluster, addon.name = %addon.name))]
    async fn update_addon(&self, addon: &AddonRecord) -> Result<AddonRecord> {
        let patch = json!({
            "metadata": {
                "resourceVersion": addon.resource_version,
                "annotations": addon.annotations,
            }
        });
        self.patch_addon(addon, patch, false).await
    }

    #[instrument(skip(self, addon), fields(addon.cluster = %addon.cluster, addon.name = %addon.name))]
    async fn update_addon_status(&self, addon: &AddonRecord) -> Result<AddonRecord> {
        let conditions: Vec<Value> = addon
            .conditions
            .iter()
            .map(|condition| {
                json!({
                    "type": condition.type_,
                    "status": if condition.status { "True" } else { "False" },
                    "reason": condition.reason,
                    "message": condition.message,
                    "lastTransitionTime": condition.last_transition_time,
                })
            })
            .collect();
        let patch = json!({
            "metadata": { "resourceVersion": addon.resource_version },
            "status": { "conditions": conditions },
        });
        self.patch_addon(addon, patch, true).await
    }

    #[instrument(skip(self))]
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord> {
        let key = format!("{namespace}/{name}");
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|source| map_kube_error(source, "Secret", key.clone()))?
            .context(NotFoundSnafu { kind: "Secret", key })?;
        Ok(secret_from_object(secret))
    }

    #[instrument(skip(self, secret), fields(secret.namespace = %secret.namespace, secret.name = %secret.name))]
    async fn create_secret(&self, secret: &SecretRecord) -> Result<SecretRecord> {
        let key = format!("{}/{}", secret.namespace, secret.name);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        let mut object = secret_to_object(secret);
        object.metadata.resource_version = None;
        api.create(&PostParams::default(), &object)
            .await
            .map(secret_from_object)
            .map_err(|source| map_kube_error(source, "Secret", key))
    }

    #[instrument(skip(self, secret), fields(secret.namespace = %secret.namespace, secret.name = %secret.name))]
    async fn update_secret(&self, secret: &SecretRecord) -> Result<SecretRecord> {
        let key = format!("{}/{}", secret.namespace, secret.name);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        api.replace(&secret.name, &PostParams::default(), &secret_to_object(secret))
            .await
            .map(secret_from_object)
            .map_err(|source| map_kube_error(source, "Secret", key))
    }

    #[instrument(skip(self))]
    async fn get_account(&self, name: &str) -> Result<AccountRecord> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.accounts);
        let object = api
            .get_opt(name)
            .await
            .map_err(|source| map_kube_error(source, "Account", name.to_owned()))?
            .context(NotFoundSnafu {
                kind: "Account",
                key: name,
            })?;
        Ok(account_from_object(object))
    }

    #[instrument(skip(self))]
    async fn list_accounts_by_impersonator(
        &self,
        impersonator: &str,
    ) -> Result<Vec<AccountRecord>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.accounts);
        let params =
            ListParams::default().labels(&format!("{LABEL_KEY_ACCOUNT_IMPERSONATOR}={impersonator}"));
        let list = api
            .list(&params)
            .await
            .map_err(|source| map_kube_error(source, "Account", impersonator.to_owned()))?;
        Ok(list.items.into_iter().map(account_from_object).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn managed_cluster_client_config_is_extracted() {
        let object = dynamic(json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedCluster",
            "metadata": { "name": "c1" },
            "spec": {
                "managedClusterClientConfigs": [
                    { "url": "https://c1.example:6443", "caBundle": STANDARD.encode("ca") },
                    { "url": "https://backup.example:6443" },
                ],
            },
        }));

        let cluster = cluster_from_object(object);
        assert_eq!(cluster.name, "c1");
        assert_eq!(cluster.client_configs.len(), 2);
        assert_eq!(cluster.client_configs[0].ca_bundle.as_deref(), Some(b"ca".as_slice()));
        assert_eq!(cluster.client_configs[1].ca_bundle, None);
    }

    #[test]
    fn addon_conditions_are_extracted() {
        let object = dynamic(json!({
            "apiVersion": "addon.open-cluster-management.io/v1alpha1",
            "kind": "ManagedClusterAddOn",
            "metadata": {
                "name": "cluster-proxy",
                "namespace": "c1",
                "resourceVersion": "7",
                "annotations": { "a": "b" },
            },
            "status": {
                "conditions": [
                    { "type": "Available", "status": "True", "reason": "Up", "message": "", "lastTransitionTime": "2024-01-01T00:00:00Z" },
                ],
            },
        }));

        let addon = addon_from_object("ignored", object);
        assert_eq!(addon.cluster, "c1");
        assert_eq!(addon.resource_version.as_deref(), Some("7"));
        assert!(addon.is_condition_true("Available"));
        assert_eq!(addon.annotations["a"], "b");
    }

    #[test]
    fn account_spec_is_extracted() {
        let object = dynamic(json!({
            "apiVersion": "authentication.k8s.appscode.com/v1alpha1",
            "kind": "Account",
            "metadata": {
                "name": "alice",
                "labels": { LABEL_KEY_ACCOUNT_IMPERSONATOR: "broker" },
            },
            "spec": {
                "uid": "1",
                "username": "alice",
                "groups": { "42": ["team"] },
                "extra": { "k": ["v"] },
            },
        }));

        let account = account_from_object(object);
        assert_eq!(account.impersonator.as_deref(), Some("broker"));
        assert_eq!(account.groups["42"], vec!["team".to_owned()]);
        assert_eq!(account.extra["k"], vec!["v".to_owned()]);
    }

    #[test]
    fn secret_conversion_keeps_data() {
        let record = SecretRecord {
            namespace: "ns".to_owned(),
            name: "s".to_owned(),
            type_: Some("kubernetes.io/tls".to_owned()),
            data: BTreeMap::from([("tls.crt".to_owned(), b"pem".to_vec())]),
            ..Default::default()
        };

        let converted = secret_from_object(secret_to_object(&record));
        assert_eq!(converted, record);
    }
}
