use crate::errors::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use url::{Origin, Url};
use uuid::Uuid;

/// Stable, file-name safe identifier of a security origin (`scheme_host_port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OriginId(String);

impl OriginId {
    /// Derives the identifier from a tuple origin. Opaque origins have no storage.
    pub fn from_origin(origin: &Origin) -> Result<Self, StorageError> {
        match origin {
            Origin::Tuple(scheme, host, port) => {
                Ok(Self(format!("{}_{}_{}", scheme, sanitize_host(&host.to_string()), port)))
            }
            Origin::Opaque(_) => Err(StorageError::InvalidOrigin(origin.ascii_serialization())),
        }
    }

    pub fn from_url(url: &Url) -> Result<Self, StorageError> {
        Self::from_origin(&url.origin())
    }

    /// Accepts an already-derived identifier, e.g. one read back from a file name.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let valid = !s.is_empty()
            && s != "."
            && s != ".."
            && !s.contains(['/', '\\', '\0']);
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(StorageError::InvalidOrigin(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// IPv6 hosts are serialized with brackets and colons; neither belongs in a file name.
fn sanitize_host(host: &str) -> String {
    host.chars()
        .filter(|c| *c != '[' && *c != ']')
        .map(|c| if c == ':' { '.' } else { c })
        .collect()
}

/// Opaque identity of one client connection (one per renderer process).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-local identifier of a storage area map. Only unique per connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AreaId(pub u64);

impl Display for AreaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a session storage namespace (one per browsing-context group).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(pub u64);

impl Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered observer of a storage area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Listener {
    pub connection: ConnectionId,
    pub area_id: AreaId,
}

impl Listener {
    pub fn new(connection: ConnectionId, area_id: AreaId) -> Self {
        Self { connection, area_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> String {
        OriginId::from_url(&Url::parse(s).expect("valid URL"))
            .unwrap()
            .as_str()
            .to_string()
    }

    #[test]
    fn origin_id_uses_scheme_host_and_effective_port() {
        assert_eq!(id("https://example.com/path?q=1#frag"), "https_example.com_443");
        assert_eq!(id("http://sub.example.com:8080/"), "http_sub.example.com_8080");
    }

    #[test]
    fn same_origin_urls_map_to_same_id() {
        assert_eq!(id("https://example.com/a"), id("https://example.com:443/b"));
        assert_ne!(id("https://example.com"), id("http://example.com"));
    }

    #[test]
    fn ipv6_host_is_file_name_safe() {
        let s = id("http://[2001:db8::1]:8080/");
        assert!(!s.contains(['[', ']', ':', '/']));
        assert!(s.ends_with("_8080"));
    }

    #[test]
    fn opaque_origin_is_rejected() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(matches!(
            OriginId::from_url(&url),
            Err(StorageError::InvalidOrigin(_))
        ));
    }

    #[test]
    fn parse_rejects_path_like_identifiers() {
        assert!(OriginId::parse("https_example.com_443").is_ok());
        assert!(OriginId::parse("").is_err());
        assert!(OriginId::parse("..").is_err());
        assert!(OriginId::parse("a/b").is_err());
        assert!(OriginId::parse("a\\b").is_err());
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
