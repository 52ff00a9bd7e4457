//! Caller identities and their translation into the identity the gateway
//! impersonates towards a backend cluster.
//!
//! An inbound request carries an [`Identity`], parsed once when the request
//! is authenticated. Before the request is forwarded, the
//! [`IdentityExchanger`] turns it into an [`Exchange`]: either the gateway
//! acts with its own (privileged) credential, or it impersonates a
//! [`Impersonation`] computed from the configured rules, from a platform
//! account, or from the caller itself.
use std::collections::BTreeMap;

use crate::constants::SERVICE_ACCOUNT_USER_PREFIX;

mod exchange;
pub mod rules;

pub use exchange::*;

pub const ANONYMOUS_USER: &str = "system:anonymous";
pub const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";
pub const SERVICE_ACCOUNTS_GROUP: &str = "system:serviceaccounts";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    ServiceAccount { namespace: String, name: String },
}

/// The authenticated caller of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub kind: IdentityKind,
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        uid: impl Into<String>,
        groups: Vec<String>,
        extra: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let username = username.into();
        Self {
            kind: IdentityKind::parse(&username),
            username,
            uid: uid.into(),
            groups,
            extra,
        }
    }

    pub fn user(username: impl Into<String>) -> Self {
        Self::new(username, "", Vec::new(), BTreeMap::new())
    }

    pub fn anonymous() -> Self {
        Self::new(
            ANONYMOUS_USER,
            "",
            vec![UNAUTHENTICATED_GROUP.to_owned()],
            BTreeMap::new(),
        )
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.extra.insert(key.into(), values);
        self
    }

    pub fn is_service_account(&self) -> bool {
        matches!(self.kind, IdentityKind::ServiceAccount { .. })
    }
}

impl IdentityKind {
    /// Service accounts authenticate as `system:serviceaccount:<ns>:<name>`.
    fn parse(username: &str) -> Self {
        username
            .strip_prefix(SERVICE_ACCOUNT_USER_PREFIX)
            .and_then(|rest| rest.split_once(':'))
            .map_or(Self::User, |(namespace, name)| Self::ServiceAccount {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })
    }
}

/// The identity asserted towards a backend through impersonation headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Impersonation {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Impersonation {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }
}

/// How a request is presented to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Projection {
    /// The gateway's own credential without impersonation.
    Privileged,
    Impersonate(Impersonation),
}

/// Outcome of an identity exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    /// Name of the rule that matched, [`None`] when no rule did.
    pub rule: Option<String>,
    pub projection: Projection,
}

impl Exchange {
    pub fn matched(&self) -> bool {
        self.rule.is_some()
    }

    pub fn impersonation(&self) -> Option<&Impersonation> {
        match &self.projection {
            Projection::Privileged => None,
            Projection::Impersonate(impersonation) => Some(impersonation),
        }
    }
}
