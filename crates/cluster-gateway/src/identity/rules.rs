//! Identity exchange rules, as written in `ClusterGatewayProxyConfiguration`
//! documents.
//!
//! ```yaml
//! apiVersion: gateway.open-cluster-management.io/v1alpha1
//! kind: ClusterGatewayProxyConfiguration
//! spec:
//!   clientIdentityExchanger:
//!     rules:
//!       - name: admins
//!         type: PrivilegedIdentityExchanger
//!         source:
//!           group: platform-admins
//!       - name: viewers
//!         type: StaticMappingIdentityExchanger
//!         source:
//!           userPattern: "dev-.*"
//!         target:
//!           user: viewer
//!           groups: [viewers]
//! ```
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{Identity, Impersonation, Projection};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read proxy configuration from {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse proxy configuration"))]
    ParseDocument { source: serde_yaml::Error },

    #[snafu(display("rule {rule:?} has an invalid {field} {pattern:?}"))]
    InvalidPattern {
        source: regex::Error,
        rule: String,
        field: &'static str,
        pattern: String,
    },

    #[snafu(display("static mapping rule {rule:?} has no target"))]
    MissingTarget { rule: String },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGatewayProxyConfiguration {
    #[serde(default)]
    pub spec: ProxyConfigurationSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigurationSpec {
    #[serde(default)]
    pub client_identity_exchanger: ClientIdentityExchanger,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientIdentityExchanger {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuleDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub type_: ExchangeType,

    #[serde(default)]
    pub source: SourceDefinition,

    pub target: Option<TargetDefinition>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ExchangeType {
    PrivilegedIdentityExchanger,
    StaticMappingIdentityExchanger,
}

/// Every field that is set must match.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDefinition {
    pub user: Option<String>,
    pub group: Option<String>,
    pub uid: Option<String>,
    pub cluster: Option<String>,
    pub user_pattern: Option<String>,
    pub group_pattern: Option<String>,
    pub cluster_pattern: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TargetDefinition {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub uid: String,
}

/// A compiled rule.
#[derive(Clone, Debug)]
pub struct ExchangeRule {
    pub name: String,
    source: SourceMatcher,
    projection: Projection,
}

#[derive(Clone, Debug, Default)]
struct SourceMatcher {
    user: Option<String>,
    group: Option<String>,
    uid: Option<String>,
    cluster: Option<String>,
    user_pattern: Option<Regex>,
    group_pattern: Option<Regex>,
    cluster_pattern: Option<Regex>,
}

impl ExchangeRule {
    pub fn compile(definition: RuleDefinition) -> Result<Self> {
        let RuleDefinition {
            name,
            type_,
            source,
            target,
        } = definition;

        let projection = match type_ {
            ExchangeType::PrivilegedIdentityExchanger => Projection::Privileged,
            ExchangeType::StaticMappingIdentityExchanger => {
                let target = target.context(MissingTargetSnafu { rule: name.clone() })?;
                Projection::Impersonate(Impersonation {
                    username: target.user,
                    uid: target.uid,
                    groups: target.groups,
                    extra: Default::default(),
                })
            }
        };

        let source = SourceMatcher {
            user_pattern: compile_pattern(&name, "userPattern", source.user_pattern)?,
            group_pattern: compile_pattern(&name, "groupPattern", source.group_pattern)?,
            cluster_pattern: compile_pattern(&name, "clusterPattern", source.cluster_pattern)?,
            user: source.user,
            group: source.group,
            uid: source.uid,
            cluster: source.cluster,
        };

        Ok(Self {
            name,
            source,
            projection,
        })
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn matches(&self, identity: &Identity, cluster: &str) -> bool {
        let source = &self.source;
        let any_group = |predicate: &dyn Fn(&str) -> bool| {
            identity.groups.iter().any(|group| predicate(group))
        };

        source.user.as_ref().is_none_or(|user| *user == identity.username)
            && source.uid.as_ref().is_none_or(|uid| *uid == identity.uid)
            && source.cluster.as_ref().is_none_or(|c| c == cluster)
            && source
                .group
                .as_ref()
                .is_none_or(|expected| any_group(&|group: &str| group == expected))
            && source
                .user_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(&identity.username))
            && source
                .group_pattern
                .as_ref()
                .is_none_or(|pattern| any_group(&|group: &str| pattern.is_match(group)))
            && source
                .cluster_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(cluster))
    }
}

/// Patterns must match the whole value.
fn compile_pattern(
    rule: &str,
    field: &'static str,
    pattern: Option<String>,
) -> Result<Option<Regex>> {
    pattern
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$")).context(InvalidPatternSnafu {
                rule,
                field,
                pattern,
            })
        })
        .transpose()
}

/// Parses and compiles a configuration document. When `cluster` is given,
/// every rule is scoped to that cluster, replacing whatever source cluster
/// the document names.
pub fn parse_rules(document: &str, cluster: Option<&str>) -> Result<Vec<ExchangeRule>> {
    if document.trim().is_empty() {
        return Ok(Vec::new());
    }

    let configuration: ClusterGatewayProxyConfiguration =
        serde_yaml::from_str(document).context(ParseDocumentSnafu)?;

    configuration
        .spec
        .client_identity_exchanger
        .rules
        .into_iter()
        .map(|mut definition| {
            if let Some(cluster) = cluster {
                definition.source.cluster = Some(cluster.to_owned());
            }
            ExchangeRule::compile(definition)
        })
        .collect()
}

/// Loads the global rules.
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<Vec<ExchangeRule>> {
    let path = path.as_ref();
    let document = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse_rules(&document, None)
}
