use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, instrument, warn};

use super::{
    AUTHENTICATED_GROUP, Exchange, Identity, IdentityKind, Impersonation, Projection,
    SERVICE_ACCOUNTS_GROUP, rules::ExchangeRule,
};
use crate::{
    constants::{EXTRA_KEY_ORG_ID, RESERVED_EXTRA_PREFIX},
    store::{AccountRecord, SharedRecordStore},
};

/// Evaluates the rule sets in order: per-cluster rules first, then global
/// rules, first match wins. Without a match the caller's own identity is
/// passed through.
pub fn exchange(
    identity: &Identity,
    cluster: &str,
    cluster_rules: &[ExchangeRule],
    global_rules: &[ExchangeRule],
) -> Exchange {
    match_rules(identity, cluster, cluster_rules, global_rules).unwrap_or_else(|| Exchange {
        rule: None,
        projection: Projection::Impersonate(passthrough(identity)),
    })
}

fn match_rules(
    identity: &Identity,
    cluster: &str,
    cluster_rules: &[ExchangeRule],
    global_rules: &[ExchangeRule],
) -> Option<Exchange> {
    cluster_rules
        .iter()
        .chain(global_rules)
        .find(|rule| rule.matches(identity, cluster))
        .map(|rule| Exchange {
            rule: Some(rule.name.clone()),
            projection: rule.projection().clone(),
        })
}

/// Extras of the caller, minus the claims the backend's token authenticator
/// reserves for service accounts.
fn passthrough_extra(identity: &Identity) -> BTreeMap<String, Vec<String>> {
    identity
        .extra
        .iter()
        .filter(|(key, _)| !identity.is_service_account() || !key.starts_with(RESERVED_EXTRA_PREFIX))
        .map(|(key, values)| (key.clone(), values.clone()))
        .collect()
}

fn passthrough(identity: &Identity) -> Impersonation {
    Impersonation {
        username: identity.username.clone(),
        uid: identity.uid.clone(),
        groups: identity.groups.clone(),
        extra: passthrough_extra(identity),
    }
}

/// Computes the identity a request is presented with, consulting the
/// platform accounts when no rule matches.
#[derive(Clone)]
pub struct IdentityExchanger {
    store: SharedRecordStore,
    global_rules: Arc<[ExchangeRule]>,
    broker_namespace: String,
}

impl IdentityExchanger {
    pub fn new(
        store: SharedRecordStore,
        global_rules: Vec<ExchangeRule>,
        broker_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            global_rules: global_rules.into(),
            broker_namespace: broker_namespace.into(),
        }
    }

    #[instrument(
        skip(self, identity, cluster_rules),
        fields(identity.username = %identity.username),
    )]
    pub async fn exchange(
        &self,
        identity: &Identity,
        cluster: &str,
        cluster_rules: &[ExchangeRule],
    ) -> Exchange {
        if let Some(exchange) = match_rules(identity, cluster, cluster_rules, &self.global_rules) {
            info!(rule = exchange.rule.as_deref(), "identity exchanged by proxy configuration rule");
            return exchange;
        }

        let delegated = match &identity.kind {
            IdentityKind::ServiceAccount { namespace, name } => {
                self.delegate_broker(namespace, name).await
            }
            IdentityKind::User => self.project_account(identity).await,
        };

        Exchange {
            rule: None,
            projection: Projection::Impersonate(
                delegated.unwrap_or_else(|| passthrough(identity)),
            ),
        }
    }

    /// A broker service account in the broker namespace acts for exactly one
    /// account. Zero or several candidates fall through to passthrough.
    async fn delegate_broker(&self, namespace: &str, name: &str) -> Option<Impersonation> {
        if namespace != self.broker_namespace || name.contains(':') {
            return None;
        }

        let accounts = match self.store.list_accounts_by_impersonator(name).await {
            Ok(accounts) => accounts,
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    broker = name,
                    "failed to look up accounts for broker"
                );
                return None;
            }
        };

        let [account] = accounts.as_slice() else {
            debug!(
                broker = name,
                candidates = accounts.len(),
                "broker does not map to exactly one account"
            );
            return None;
        };

        Some(broker_projection(account))
    }

    /// Applies the account named like the caller, if there is one.
    async fn project_account(&self, identity: &Identity) -> Option<Impersonation> {
        match self.store.get_account(&identity.username).await {
            Ok(account) => Some(account_projection(identity, &account)),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to look up account of caller"
                );
                None
            }
        }
    }
}

fn broker_projection(account: &AccountRecord) -> Impersonation {
    let mut groups = vec![
        AUTHENTICATED_GROUP.to_owned(),
        SERVICE_ACCOUNTS_GROUP.to_owned(),
    ];
    let parts: Vec<&str> = account.username.splitn(4, ':').collect();
    if let [_, _, namespace, _] = parts.as_slice() {
        groups.push(format!("{SERVICE_ACCOUNTS_GROUP}:{namespace}"));
    }

    Impersonation {
        username: account.username.clone(),
        uid: account.uid.clone(),
        groups,
        extra: account.extra.clone(),
    }
}

/// The account's extras win over the caller's. Groups come from the
/// account's mapping for the organisation the caller acts for; an
/// organisation the account does not belong to is dropped.
fn account_projection(identity: &Identity, account: &AccountRecord) -> Impersonation {
    let mut extra = passthrough_extra(identity);
    extra.extend(
        account
            .extra
            .iter()
            .map(|(key, values)| (key.clone(), values.clone())),
    );

    let org_id = match extra.get(EXTRA_KEY_ORG_ID).map(Vec::as_slice) {
        Some([org_id]) => Some(org_id.clone()),
        _ => None,
    };

    let mut groups = Vec::new();
    if let Some(org_id) = org_id {
        match account.groups.get(&org_id) {
            Some(org_groups) => {
                groups.extend(org_groups.iter().cloned());
                groups.push(format!("ace.org.{org_id}"));
            }
            None => {
                extra.remove(EXTRA_KEY_ORG_ID);
            }
        }
    }

    Impersonation {
        username: account.username.clone(),
        uid: account.uid.clone(),
        groups,
        extra,
    }
}
