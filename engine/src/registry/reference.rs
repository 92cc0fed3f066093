//! Registry reference parsing.
//!
//! Parses references like `docker://10.0.2.2:5000/machine/install:1.0.0`
//! into structured components.

use machina_core::{MachinaError, Result};

/// URL scheme prefixes stripped before parsing.
const SCHEME_PREFIXES: [&str; 3] = ["docker://", "http://", "https://"];

/// Parsed registry reference: address, repository name, and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRef {
    /// Registry address (e.g., "10.0.2.2:5000")
    pub addr: String,
    /// Repository name (e.g., "machine/install")
    pub name: String,
    /// Version tag (e.g., "1.0.0")
    pub tag: String,
}

impl RegistryRef {
    /// Parse a reference string.
    ///
    /// Accepts `docker://`, `http://`, or `https://` prefixed references as
    /// well as bare `host:port/name:tag` strings.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = drop_scheme_prefix(reference.trim());

        let (addr, rest) = reference.split_once('/').ok_or_else(|| {
            MachinaError::MalformedData(format!(
                "failed parsing registry reference: no '/' in {reference:?}"
            ))
        })?;

        let (name, tag) = rest.rsplit_once(':').ok_or_else(|| {
            MachinaError::MalformedData(format!(
                "failed parsing registry reference: no ':' tag in {reference:?}"
            ))
        })?;

        if addr.is_empty() || name.is_empty() || tag.is_empty() {
            return Err(MachinaError::MalformedData(format!(
                "incomplete registry reference {reference:?}"
            )));
        }

        Ok(Self {
            addr: addr.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Display for RegistryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.addr, self.name, self.tag)
    }
}

/// Strip a known URL scheme prefix, if present.
pub(crate) fn drop_scheme_prefix(reference: &str) -> &str {
    for prefix in SCHEME_PREFIXES {
        if let Some(rest) = reference.strip_prefix(prefix) {
            return rest;
        }
    }
    reference
}

/// Drop the algorithm prefix from a digest string (`sha256:abc` -> `abc`).
pub fn drop_hash_alg(digest: &str) -> &str {
    match digest.split_once(':') {
        Some((_, hex)) => hex,
        None => digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_prefixed() {
        let r = RegistryRef::parse("docker://10.0.2.2:5000/machine/install:1.0.0").unwrap();
        assert_eq!(r.addr, "10.0.2.2:5000");
        assert_eq!(r.name, "machine/install");
        assert_eq!(r.tag, "1.0.0");
    }

    #[test]
    fn test_parse_bare() {
        let r = RegistryRef::parse("127.0.0.1:18080/os/busybox-squashfs:1.0").unwrap();
        assert_eq!(r.addr, "127.0.0.1:18080");
        assert_eq!(r.name, "os/busybox-squashfs");
        assert_eq!(r.tag, "1.0");
    }

    #[test]
    fn test_parse_http_prefixed() {
        let r = RegistryRef::parse("http://registry.local:5000/machina/images:2").unwrap();
        assert_eq!(r.addr, "registry.local:5000");
        assert_eq!(r.tag, "2");
    }

    #[test]
    fn test_parse_missing_slash() {
        assert!(RegistryRef::parse("10.0.2.2:5000").is_err());
    }

    #[test]
    fn test_parse_missing_tag() {
        assert!(RegistryRef::parse("10.0.2.2:5000/machine/install").is_err());
    }

    #[test]
    fn test_parse_empty() {
        assert!(RegistryRef::parse("").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let r = RegistryRef::parse("docker://10.0.2.2:5000/machine/install:1.0.0").unwrap();
        assert_eq!(r.to_string(), "10.0.2.2:5000/machine/install:1.0.0");
    }

    #[test]
    fn test_drop_hash_alg() {
        assert_eq!(drop_hash_alg("sha256:abc123"), "abc123");
        assert_eq!(drop_hash_alg("abc123"), "abc123");
    }
}
