//! Resource identity.

use crate::error::KeyError;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a resource: `namespace/name`, or `name` for
/// cluster-scoped objects.
///
/// Cheap to clone. Identifies both the mirror entry and the queue slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    /// Builds a key from its parts.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}").into()),
            _ => Self(name.into()),
        }
    }

    /// Derives the key of an object from its metadata.
    ///
    /// Works on the final state carried by a deletion notification as well,
    /// since only namespace and name are consulted.
    pub fn for_object<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let name = obj.meta().name.as_deref().ok_or(KeyError::MissingName)?;
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        Ok(Self::new(obj.namespace().as_deref(), name))
    }

    /// Parses a key produced by [`ResourceKey::new`].
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let key = Self(raw.into());
        key.split()?;
        Ok(key)
    }

    /// Splits the key into `(namespace, name)`.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        match self.0.split_once('/') {
            None if !self.0.is_empty() => Ok((None, self.as_str())),
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok((Some(ns), name)),
            _ => Err(KeyError::Malformed(self.0.to_string())),
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(raw: &str) -> Self {
        Self(raw.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_namespaced_key() {
        let deploy = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ResourceKey::for_object(&deploy).unwrap();
        assert_eq!(key.as_str(), "prod/web");
        assert_eq!(key.split().unwrap(), (Some("prod"), "web"));
    }

    #[test]
    fn test_cluster_scoped_key() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ResourceKey::for_object(&ns).unwrap();
        assert_eq!(key.to_string(), "kube-system");
        assert_eq!(key.split().unwrap(), (None, "kube-system"));
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let deploy = Deployment::default();
        assert_eq!(ResourceKey::for_object(&deploy), Err(KeyError::MissingName));
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(ResourceKey::parse("a/b/c").is_err());
        assert!(ResourceKey::parse("/name").is_err());
        assert!(ResourceKey::parse("").is_err());
        assert_eq!(ResourceKey::parse("ns/foo").unwrap(), ResourceKey::new(Some("ns"), "foo"));
    }
}
