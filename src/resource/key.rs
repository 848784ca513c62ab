use std::fmt;

/// Identifies a document in the resource database. The empty group denotes
/// the core API group; an empty namespace in a reference is resolved against
/// the referring document's namespace before lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds a key from the `apiVersion` field, which carries `group/version`
    /// for non-core resources and a bare version for core ones.
    pub fn from_api_version(
        api_version: &str,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let group = match api_version.split_once('/') {
            Some((group, _version)) => group,
            None => "",
        };
        Self::new(group, kind, namespace, name)
    }

    /// Resolves an empty namespace against the referrer's namespace.
    pub fn resolved_in(mut self, referrer_namespace: &str) -> Self {
        if self.namespace.is_empty() {
            self.namespace = referrer_namespace.to_string();
        }
        self
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}.{}/{}/{}",
                self.kind, self.group, self.namespace, self.name
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_from_api_version() {
        let key = ResourceKey::from_api_version("helm.toolkit.fluxcd.io/v2", "HelmRelease", "a", "r");
        assert_eq!(key.group, "helm.toolkit.fluxcd.io");

        let core = ResourceKey::from_api_version("v1", "ConfigMap", "a", "values");
        assert_eq!(core.group, "");
    }

    #[test]
    fn test_namespace_resolution() {
        let key = ResourceKey::new("", "Secret", "", "creds").resolved_in("team-a");
        assert_eq!(key.namespace, "team-a");

        let explicit = ResourceKey::new("", "Secret", "infra", "creds").resolved_in("team-a");
        assert_eq!(explicit.namespace, "infra");
    }

    #[test]
    fn test_display() {
        let core = ResourceKey::new("", "ConfigMap", "a", "values");
        assert_eq!(core.to_string(), "ConfigMap/a/values");

        let grouped = ResourceKey::new("source.toolkit.fluxcd.io", "HelmRepository", "a", "repo");
        assert_eq!(
            grouped.to_string(),
            "HelmRepository.source.toolkit.fluxcd.io/a/repo"
        );
    }
}
