//! Authorization of proxied requests against the path they target on the
//! backend cluster.
use async_trait::async_trait;
use http::Method;
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes as ReviewResourceAttributes, SubjectAccessReview,
    SubjectAccessReviewSpec,
};
use kube::{Api, Client, api::PostParams};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::identity::Identity;

#[derive(Debug, Snafu)]
pub enum AuthorizeError {
    #[snafu(display("failed to create subject access review"))]
    CreateReview { source: kube::Error },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceAttributes {
    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub verb: String,
}

/// What a request does, in the terms the backend authorizes it in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestAttributes {
    Resource(ResourceAttributes),
    NonResource { path: String, verb: String },
}

impl RequestAttributes {
    /// Parses a backend path the way the Kubernetes API server does. `api` is
    /// the group-less legacy prefix, `apis` carries a group.
    pub fn parse(method: &Method, path: &str, query: Option<&str>) -> Self {
        let method_verb = method.as_str().to_lowercase();
        let non_resource = || Self::NonResource {
            path: if path.is_empty() { "/" } else { path }.to_owned(),
            verb: method_verb.clone(),
        };

        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (api_group, api_version, mut rest) = match parts.as_slice() {
            ["api", version, rest @ ..] if !rest.is_empty() => ("", *version, rest),
            ["apis", group, version, rest @ ..] if !rest.is_empty() => (*group, *version, rest),
            _ => return non_resource(),
        };

        let mut verb = match *method {
            Method::POST => "create",
            Method::GET | Method::HEAD => "get",
            Method::PUT => "update",
            Method::PATCH => "patch",
            Method::DELETE => "delete",
            _ => method_verb.as_str(),
        }
        .to_owned();

        if rest.first() == Some(&"watch") {
            verb = "watch".to_owned();
            rest = &rest[1..];
        }

        let mut namespace = "";
        if let ["namespaces", ns, tail @ ..] = rest {
            namespace = *ns;
            if !tail.is_empty() && !matches!(tail[0], "status" | "finalize") {
                rest = tail;
            }
        }

        let resource = rest.first().copied().unwrap_or_default();
        let name = rest.get(1).copied().unwrap_or_default();
        let subresource = rest.get(2).copied().unwrap_or_default();

        if name.is_empty() {
            let watching = query.is_some_and(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .any(|(key, value)| key == "watch" && (value == "true" || value == "1"))
            });
            let collection_verb = match (verb.as_str(), watching) {
                ("get", true) => Some("watch"),
                ("get", false) => Some("list"),
                ("delete", _) => Some("deletecollection"),
                _ => None,
            };
            if let Some(collection_verb) = collection_verb {
                verb = collection_verb.to_owned();
            }
        }

        Self::Resource(ResourceAttributes {
            namespace: namespace.to_owned(),
            api_group: api_group.to_owned(),
            api_version: api_version.to_owned(),
            resource: resource.to_owned(),
            subresource: subresource.to_owned(),
            name: name.to_owned(),
            verb,
        })
    }

    pub fn verb(&self) -> &str {
        match self {
            Self::Resource(attributes) => &attributes.verb,
            Self::NonResource { verb, .. } => verb,
        }
    }

    /// Resource name used to label metrics, empty for non-resource requests.
    pub fn resource(&self) -> &str {
        match self {
            Self::Resource(attributes) => &attributes.resource,
            Self::NonResource { .. } => "",
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        identity: &Identity,
        attributes: &RequestAttributes,
    ) -> Result<Decision, AuthorizeError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAllow;

#[async_trait]
impl Authorizer for AlwaysAllow {
    async fn authorize(&self, _: &Identity, _: &RequestAttributes) -> Result<Decision, AuthorizeError> {
        Ok(Decision::Allow)
    }
}

/// Delegates decisions to the hub cluster with `SubjectAccessReview`s.
#[derive(Clone)]
pub struct SubjectAccessReviewAuthorizer {
    client: Client,
}

impl SubjectAccessReviewAuthorizer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    #[instrument(
        name = "review_subject_access",
        skip(self, identity),
        fields(identity.username = %identity.username),
    )]
    async fn authorize(
        &self,
        identity: &Identity,
        attributes: &RequestAttributes,
    ) -> Result<Decision, AuthorizeError> {
        let review = subject_access_review(identity, attributes);
        let review = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await
            .context(CreateReviewSnafu)?;

        let status = review.status.unwrap_or_default();
        if status.allowed {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::Deny {
                reason: status.reason.unwrap_or_default(),
            })
        }
    }
}

fn subject_access_review(
    identity: &Identity,
    attributes: &RequestAttributes,
) -> SubjectAccessReview {
    let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_owned());

    let (resource_attributes, non_resource_attributes) = match attributes {
        RequestAttributes::Resource(attributes) => (
            Some(ReviewResourceAttributes {
                group: Some(attributes.api_group.clone()),
                version: non_empty(&attributes.api_version),
                resource: non_empty(&attributes.resource),
                subresource: non_empty(&attributes.subresource),
                namespace: non_empty(&attributes.namespace),
                name: non_empty(&attributes.name),
                verb: Some(attributes.verb.clone()),
                ..Default::default()
            }),
            None,
        ),
        RequestAttributes::NonResource { path, verb } => (
            None,
            Some(NonResourceAttributes {
                path: Some(path.clone()),
                verb: Some(verb.clone()),
            }),
        ),
    };

    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(identity.username.clone()),
            uid: non_empty(&identity.uid),
            groups: Some(identity.groups.clone()),
            extra: Some(identity.extra.clone()),
            resource_attributes,
            non_resource_attributes,
        },
        ..Default::default()
    }
}
