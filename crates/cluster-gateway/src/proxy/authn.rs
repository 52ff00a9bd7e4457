//! Caller identity as asserted by the front proxy through request headers.
use std::collections::BTreeMap;

use http::HeaderMap;

use crate::identity::Identity;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_UID_HEADER: &str = "x-remote-uid";
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";
pub const REMOTE_EXTRA_HEADER_PREFIX: &str = "x-remote-extra-";

/// Connection-level marker: the peer presented a client certificate signed
/// by the request header CA.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerVerified(pub bool);

/// Reads the caller identity. Headers are only trusted on verified
/// connections, any other request is anonymous.
pub fn identity_from_headers(headers: &HeaderMap, peer: PeerVerified) -> Identity {
    if !peer.0 {
        return Identity::anonymous();
    }

    let Some(username) = header_str(headers, REMOTE_USER_HEADER).filter(|user| !user.is_empty())
    else {
        return Identity::anonymous();
    };

    let uid = header_str(headers, REMOTE_UID_HEADER).unwrap_or_default();
    let groups = headers
        .get_all(REMOTE_GROUP_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .collect();

    let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(REMOTE_EXTRA_HEADER_PREFIX) else {
            continue;
        };
        let Ok(value) = value.to_str() else {
            continue;
        };
        extra
            .entry(unescape_extra_key(key))
            .or_default()
            .push(value.to_owned());
    }

    Identity::new(username, uid, groups, extra)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn unescape_extra_key(key: &str) -> String {
    url::form_urlencoded::parse(key.as_bytes())
        .next()
        .map_or_else(|| key.to_owned(), |(key, _)| key.to_lowercase())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::identity::{ANONYMOUS_USER, IdentityKind};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn reads_identity_on_verified_connections() {
        let headers = headers(&[
            ("X-Remote-User", "system:serviceaccount:ns:broker"),
            ("X-Remote-Uid", "u-1"),
            ("X-Remote-Group", "system:serviceaccounts"),
            ("X-Remote-Group", "system:authenticated"),
            ("X-Remote-Extra-Ace.appscode.com%2forg-id", "7"),
            ("X-Remote-Extra-Scopes", "a"),
            ("X-Remote-Extra-Scopes", "b"),
        ]);

        let identity = identity_from_headers(&headers, PeerVerified(true));
        assert_eq!(
            identity.kind,
            IdentityKind::ServiceAccount {
                namespace: "ns".to_owned(),
                name: "broker".to_owned()
            }
        );
        assert_eq!(identity.uid, "u-1");
        assert_eq!(
            identity.groups,
            ["system:serviceaccounts", "system:authenticated"]
        );
        assert_eq!(identity.extra["ace.appscode.com/org-id"], ["7"]);
        assert_eq!(identity.extra["scopes"], ["a", "b"]);
    }

    #[test]
    fn unverified_connections_are_anonymous() {
        let headers = headers(&[("X-Remote-User", "admin"), ("X-Remote-Group", "system:masters")]);

        let identity = identity_from_headers(&headers, PeerVerified(false));
        assert_eq!(identity.username, ANONYMOUS_USER);
        assert!(!identity.groups.contains(&"system:masters".to_owned()));
    }

    #[test]
    fn missing_user_is_anonymous() {
        let identity = identity_from_headers(&HeaderMap::new(), PeerVerified(true));
        assert_eq!(identity, Identity::anonymous());
    }
}
