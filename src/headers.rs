//! Typed headers for the mirror protocol.

use headers::{Header, HeaderName};
use http::HeaderValue;

pub static X_REMOTE_REGISTRY: HeaderName = HeaderName::from_static("x-remote-registry");

/// The upstream registry host the caller would have contacted. Required on
/// every `/v2` request; the path alone does not carry it.
pub struct XRemoteRegistry(pub String);

impl Header for XRemoteRegistry {
    fn name() -> &'static HeaderName {
        &X_REMOTE_REGISTRY
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .to_string();

        Ok(Self(value))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

pub static X_MIRROR: HeaderName = HeaderName::from_static("x-mirror");

/// Marks a request as a mirror request. Always downgraded to `false` before
/// a request is forwarded to a peer.
pub struct XMirror(pub bool);

impl Header for XMirror {
    fn name() -> &'static HeaderName {
        &X_MIRROR
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .parse()
            .map_err(|_| headers::Error::invalid())?;

        Ok(Self(value))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = if self.0 {
            HeaderValue::from_static("true")
        } else {
            HeaderValue::from_static("false")
        };
        values.extend(std::iter::once(value));
    }
}

pub static X_EXTERNAL: HeaderName = HeaderName::from_static("x-external");

/// Marks a mirror request as originating outside the cluster overlay, in
/// which case this node may resolve to itself.
pub struct XExternal(pub bool);

impl Header for XExternal {
    fn name() -> &'static HeaderName {
        &X_EXTERNAL
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .parse()
            .map_err(|_| headers::Error::invalid())?;

        Ok(Self(value))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = if self.0 {
            HeaderValue::from_static("true")
        } else {
            HeaderValue::from_static("false")
        };
        values.extend(std::iter::once(value));
    }
}

#[cfg(test)]
mod tests {
    use axum::headers::HeaderMapExt;
    use http::HeaderMap;

    use super::*;

    #[test]
    fn mirror_header_round_trip() {
        let mut map = HeaderMap::new();
        map.typed_insert(XMirror(true));
        assert_eq!(map.get(&X_MIRROR).unwrap(), "true");
        assert!(map.typed_get::<XMirror>().unwrap().0);

        map.typed_insert(XMirror(false));
        assert_eq!(map.get(&X_MIRROR).unwrap(), "false");
        assert!(!map.typed_get::<XMirror>().unwrap().0);
    }

    #[test]
    fn malformed_mirror_header_is_rejected() {
        let mut map = HeaderMap::new();
        map.insert(&X_MIRROR, HeaderValue::from_static("yes please"));
        assert!(map.typed_get::<XMirror>().is_none());
    }

    #[test]
    fn remote_registry_header_round_trip() {
        let mut map = HeaderMap::new();
        map.typed_insert(XRemoteRegistry("docker.io".to_string()));
        assert_eq!(map.typed_get::<XRemoteRegistry>().unwrap().0, "docker.io");
    }
}
