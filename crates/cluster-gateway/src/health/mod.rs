//! Continuous probing of every cluster reachable through the gateway.
//!
//! The outcome is written back onto the gateway's addon record of the
//! cluster: as the healthy annotations, and mirrored onto the addon's
//! `Available` condition. Both are only written when they change.
use std::{sync::Arc, time::Duration};

use axum::body::Body;
use futures_util::StreamExt;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Limited};
use kube::{
    Api, Client, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::{self, Action},
        watcher,
    },
};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, instrument, warn};

use crate::{
    constants::{
        ADDON_NAME, ANNOTATION_KEY_HEALTHY, ANNOTATION_KEY_HEALTHY_REASON,
        CONDITION_TYPE_AVAILABLE, HEALTHZ_EXPECTED_BODY, HEALTHZ_PATH, UNHEALTHY_REQUEUE_DELAY,
    },
    resolver::{ResolveError, Resolver},
    store::{
        AddonRecord, Condition, SharedRecordStore, StoreError,
        kubernetes::managed_cluster_addon_resource,
    },
    transport::{TransportBuilder, TransportError},
};

/// Upper bound of a liveness body which is read.
const MAX_PROBE_BODY_SIZE: usize = 64 * 1024;

/// Unhealthy reasons taken from a response body are cut to this length.
const MAX_REASON_LENGTH: usize = 256;

const REASON_PROBED: &str = "SuccessfullyProbedHealthz";
const REASON_PROBE_FAILED: &str = "FailedProbingHealthz";
const MESSAGE_PROBED: &str = "Returned OK";

#[derive(Debug, Snafu)]
pub enum ProbeError {
    #[snafu(display("failed to resolve cluster"))]
    Resolve { source: ResolveError },

    #[snafu(display("failed to create transport"))]
    BuildTransport { source: TransportError },

    #[snafu(display("failed to build liveness request"))]
    BuildRequest { source: http::Error },

    #[snafu(display("failed to send liveness request"))]
    Send { source: TransportError },

    #[snafu(display("failed to read liveness response"))]
    ReadBody {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Snafu)]
pub enum HealthError {
    #[snafu(display("failed to read addon record of cluster {cluster:?}"))]
    ReadAddon { source: StoreError, cluster: String },

    #[snafu(display("failed to update health annotations of cluster {cluster:?}"))]
    UpdateAnnotations { source: StoreError, cluster: String },

    #[snafu(display("failed to update addon condition of cluster {cluster:?}"))]
    UpdateCondition { source: StoreError, cluster: String },
}

/// Reachability of one cluster as last observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub reason: String,
}

impl HealthRecord {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: String::new(),
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: reason.into(),
        }
    }

    /// The recorded health, unhealthy if nothing was recorded yet.
    pub fn from_addon(addon: &AddonRecord) -> Self {
        Self::recorded(addon).unwrap_or_default()
    }

    /// The recorded health, [`None`] if the addon was never probed.
    pub fn recorded(addon: &AddonRecord) -> Option<Self> {
        let healthy = addon.annotations.get(ANNOTATION_KEY_HEALTHY)?;
        Some(Self {
            healthy: healthy == "true",
            reason: addon
                .annotations
                .get(ANNOTATION_KEY_HEALTHY_REASON)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn write_to(&self, addon: &mut AddonRecord) {
        addon
            .annotations
            .insert(ANNOTATION_KEY_HEALTHY.to_owned(), self.healthy.to_string());
        addon
            .annotations
            .insert(ANNOTATION_KEY_HEALTHY_REASON.to_owned(), self.reason.clone());
    }

    fn available_condition(&self) -> Condition {
        let (reason, message) = if self.healthy {
            (REASON_PROBED, MESSAGE_PROBED.to_owned())
        } else if self.reason.is_empty() {
            (REASON_PROBE_FAILED, "Unknown".to_owned())
        } else {
            (REASON_PROBE_FAILED, self.reason.clone())
        };

        Condition {
            type_: CONDITION_TYPE_AVAILABLE.to_owned(),
            status: self.healthy,
            reason: reason.to_owned(),
            message,
            last_transition_time: now(),
        }
    }
}

fn now() -> String {
    format!("{:.0}", jiff::Timestamp::now())
}

/// The error message followed by the messages of all its sources.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        message.push_str(": ");
        message.push_str(&error.to_string());
        source = error.source();
    }
    message
}

fn next_action(observed: &HealthRecord) -> Action {
    if observed.healthy {
        Action::await_change()
    } else {
        Action::requeue(UNHEALTHY_REQUEUE_DELAY)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub struct HealthProber {
    store: SharedRecordStore,
    resolver: Arc<Resolver>,
    transports: Arc<TransportBuilder>,
}

impl HealthProber {
    pub fn new(
        store: SharedRecordStore,
        resolver: Arc<Resolver>,
        transports: Arc<TransportBuilder>,
    ) -> Self {
        Self {
            store,
            resolver,
            transports,
        }
    }

    /// Requests the liveness path of the cluster with the gateway's own
    /// credential. Only an exact `ok` with status 200 is healthy.
    pub async fn probe(&self, cluster: &str) -> HealthRecord {
        match self.request_liveness(cluster).await {
            Ok((status, body)) if status == StatusCode::OK && body == HEALTHZ_EXPECTED_BODY => {
                HealthRecord::healthy()
            }
            Ok((status, body)) => {
                let body = String::from_utf8_lossy(&body);
                let body = truncate(body.trim(), MAX_REASON_LENGTH);
                if body.is_empty() {
                    HealthRecord::unhealthy(format!("unexpected status {status}"))
                } else {
                    HealthRecord::unhealthy(body)
                }
            }
            Err(err) => HealthRecord::unhealthy(error_chain(&err)),
        }
    }

    async fn request_liveness(
        &self,
        cluster: &str,
    ) -> Result<(StatusCode, bytes::Bytes), ProbeError> {
        let resolved = self
            .resolver
            .resolve(cluster)
            .await
            .context(ResolveSnafu)?;
        let transport = self
            .transports
            .build(&resolved, None)
            .await
            .context(BuildTransportSnafu)?;

        let uri = transport
            .request_uri(HEALTHZ_PATH, None)
            .context(BuildTransportSnafu)?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .context(BuildRequestSnafu)?;

        let response = transport.send(request).await.context(SendSnafu)?;
        let status = response.status();
        let body = Limited::new(response.into_body(), MAX_PROBE_BODY_SIZE)
            .collect()
            .await
            .context(ReadBodySnafu)?
            .to_bytes();

        Ok((status, body))
    }

    /// Probes the cluster and records the outcome on its addon record.
    #[instrument(name = "reconcile_cluster_health", skip(self, cluster), fields(cluster.name = %cluster))]
    pub async fn reconcile(&self, cluster: &str) -> Result<Action, HealthError> {
        let observed = self.probe(cluster).await;
        if !observed.healthy {
            info!(reason = %observed.reason, "cluster unhealthy");
        }

        let addon = match self.store.get_addon(cluster, ADDON_NAME).await {
            Ok(addon) => addon,
            Err(err) if err.is_not_found() => {
                debug!("addon record is gone, skipping");
                return Ok(Action::await_change());
            }
            Err(err) => return Err(err).context(ReadAddonSnafu { cluster }),
        };

        let Some(addon) = self.record_annotations(addon, &observed).await? else {
            return Ok(next_action(&observed));
        };
        self.record_condition(addon, &observed).await?;

        Ok(next_action(&observed))
    }

    /// Returns the updated addon record, or [`None`] if a concurrent writer
    /// won.
    async fn record_annotations(
        &self,
        mut addon: AddonRecord,
        observed: &HealthRecord,
    ) -> Result<Option<AddonRecord>, HealthError> {
        if HealthRecord::recorded(&addon).as_ref() == Some(observed) {
            return Ok(Some(addon));
        }

        info!(healthy = observed.healthy, "updating cluster health");
        observed.write_to(&mut addon);
        match self.store.update_addon(&addon).await {
            Ok(updated) => Ok(Some(updated)),
            Err(err) if err.is_conflict() => {
                debug!("addon record was modified concurrently, skipping");
                Ok(None)
            }
            Err(err) => Err(err).context(UpdateAnnotationsSnafu {
                cluster: &addon.cluster,
            }),
        }
    }

    async fn record_condition(
        &self,
        mut addon: AddonRecord,
        observed: &HealthRecord,
    ) -> Result<(), HealthError> {
        if addon.condition(CONDITION_TYPE_AVAILABLE).is_some()
            && addon.is_condition_true(CONDITION_TYPE_AVAILABLE) == observed.healthy
        {
            return Ok(());
        }

        info!(healthy = observed.healthy, "updating addon availability");
        addon.set_condition(observed.available_condition());
        match self.store.update_addon_status(&addon).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                debug!("addon record was modified concurrently, skipping");
                Ok(())
            }
            Err(err) => Err(err).context(UpdateConditionSnafu {
                cluster: &addon.cluster,
            }),
        }
    }

    /// Watches the gateway's addon objects and reconciles the health of
    /// their clusters until SIGINT or SIGTERM is received. Every cluster is
    /// additionally reconciled each `resync_interval`, with at most `workers`
    /// reconciliations in flight.
    pub async fn run(self, client: Client, resync_interval: Duration, workers: usize) {
        let resource = managed_cluster_addon_resource();
        let addons = Api::<DynamicObject>::all_with(client, &resource);
        let watcher_config =
            watcher::Config::default().fields(&format!("metadata.name={ADDON_NAME}"));
        let controller_config = controller::Config::default()
            .concurrency(u16::try_from(workers.max(1)).unwrap_or(u16::MAX));

        let mut resync = tokio::time::interval(resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Controller::new_with(addons, watcher_config, resource)
            .with_config(controller_config)
            .reconcile_all_on(IntervalStream::new(resync).map(|_| ()))
            .shutdown_on_signal()
            .run(reconcile_addon, error_policy, Arc::new(self))
            .for_each(|result| async move {
                match result {
                    Ok((addon, _)) => debug!(
                        cluster.name = addon.namespace.as_deref().unwrap_or_default(),
                        "reconciled cluster health"
                    ),
                    Err(err) => warn!(
                        error = &err as &dyn std::error::Error,
                        "cluster health reconciliation failed"
                    ),
                }
            })
            .await;
    }
}

/// The namespace of a gateway addon object names its cluster.
async fn reconcile_addon(
    addon: Arc<DynamicObject>,
    prober: Arc<HealthProber>,
) -> Result<Action, HealthError> {
    match addon.namespace() {
        Some(cluster) => prober.reconcile(&cluster).await,
        None => Ok(Action::await_change()),
    }
}

fn error_policy(
    addon: Arc<DynamicObject>,
    error: &HealthError,
    _prober: Arc<HealthProber>,
) -> Action {
    warn!(
        error = error as &dyn std::error::Error,
        cluster.name = %addon.namespace().unwrap_or_default(),
        "failed to reconcile cluster health"
    );
    Action::requeue(UNHEALTHY_REQUEUE_DELAY)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::store::MemoryStore;

    fn prober() -> Arc<HealthProber> {
        let store: SharedRecordStore = Arc::new(MemoryStore::new());
        Arc::new(HealthProber::new(
            store.clone(),
            Arc::new(Resolver::new(store, false)),
            Arc::new(TransportBuilder::new(None)),
        ))
    }

    fn addon_object(cluster: Option<&str>) -> Arc<DynamicObject> {
        let object = DynamicObject::new(ADDON_NAME, &managed_cluster_addon_resource());
        Arc::new(match cluster {
            Some(cluster) => object.within(cluster),
            None => object,
        })
    }

    fn addon(annotations: &[(&str, &str)]) -> AddonRecord {
        AddonRecord {
            cluster: "c1".to_owned(),
            name: ADDON_NAME.to_owned(),
            annotations: annotations
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn unprobed_addon_has_no_record() {
        let addon = addon(&[]);
        assert_eq!(HealthRecord::recorded(&addon), None);
        assert_eq!(HealthRecord::from_addon(&addon), HealthRecord::unhealthy(""));
    }

    #[test]
    fn reads_recorded_health() {
        let addon = addon(&[
            (ANNOTATION_KEY_HEALTHY, "false"),
            (ANNOTATION_KEY_HEALTHY_REASON, "connection refused"),
        ]);
        assert_eq!(
            HealthRecord::from_addon(&addon),
            HealthRecord::unhealthy("connection refused")
        );
    }

    #[rstest]
    #[case(HealthRecord::healthy(), true, REASON_PROBED, MESSAGE_PROBED)]
    #[case(HealthRecord::unhealthy("fail"), false, REASON_PROBE_FAILED, "fail")]
    #[case(HealthRecord::unhealthy(""), false, REASON_PROBE_FAILED, "Unknown")]
    fn mirrors_health_onto_condition(
        #[case] record: HealthRecord,
        #[case] status: bool,
        #[case] reason: &str,
        #[case] message: &str,
    ) {
        let condition = record.available_condition();
        assert_eq!(condition.type_, CONDITION_TYPE_AVAILABLE);
        assert_eq!(condition.status, status);
        assert_eq!(condition.reason, reason);
        assert_eq!(condition.message, message);
    }

    #[rstest]
    #[case::healthy(HealthRecord::healthy(), Action::await_change())]
    #[case::unhealthy(
        HealthRecord::unhealthy("fail"),
        Action::requeue(Duration::from_secs(5))
    )]
    fn requeues_unhealthy_clusters(#[case] observed: HealthRecord, #[case] expected: Action) {
        assert_eq!(next_action(&observed), expected);
    }

    #[rstest]
    #[case::cluster_scoped(None)]
    #[case::removed_cluster(Some("c9"))]
    #[tokio::test]
    async fn addon_without_cluster_awaits_change(#[case] cluster: Option<&str>) {
        let action = reconcile_addon(addon_object(cluster), prober()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn failed_reconciliation_is_retried() {
        let error = HealthError::ReadAddon {
            source: StoreError::NotFound {
                kind: "ManagedClusterAddOn",
                key: "c1".to_owned(),
            },
            cluster: "c1".to_owned(),
        };
        let action = error_policy(addon_object(Some("c1")), &error, prober());
        assert_eq!(action, Action::requeue(UNHEALTHY_REQUEUE_DELAY));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("ok", 5), "ok");
        assert_eq!(truncate("äää", 3), "ä");
    }

    #[test]
    fn serializes_as_status_surface() {
        let json = serde_json::to_value(HealthRecord::unhealthy("fail")).unwrap();
        assert_eq!(json, serde_json::json!({ "healthy": false, "reason": "fail" }));
    }
}
