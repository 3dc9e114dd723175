//! Version-tagged cache namespaces.

use std::fmt;
use std::str::FromStr;

use semver::Version;

use crate::ServiceWorkerError;

/// Cache name of the form `<app-name>-v<semver>`, e.g. `calc-v1.0.0`.
///
/// Bumping the version is the only way to invalidate everything a previous
/// release cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheNamespace {
    app: String,
    version: Version,
}

impl CacheNamespace {
    /// Create a namespace from an app name and a semver string.
    pub fn new(app: &str, version: &str) -> Result<Self, ServiceWorkerError> {
        let app = app.trim();
        if app.is_empty() {
            return Err(ServiceWorkerError::Config(
                "app name must not be empty".to_string(),
            ));
        }
        let version = Version::parse(version.strip_prefix('v').unwrap_or(version))
            .map_err(|e| ServiceWorkerError::Config(format!("invalid version {version:?}: {e}")))?;
        Ok(Self {
            app: app.to_string(),
            version,
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.app, self.version)
    }
}

impl FromStr for CacheNamespace {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, version) = s.rsplit_once("-v").ok_or_else(|| {
            ServiceWorkerError::Config(format!("{s:?} is not of the form <app>-v<version>"))
        })?;
        Self::new(app, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let ns = CacheNamespace::new("hesaplayicilar", "1.0.0").unwrap();
        assert_eq!(ns.to_string(), "hesaplayicilar-v1.0.0");
        assert_eq!(ns.app(), "hesaplayicilar");
        assert_eq!(ns.version(), &Version::new(1, 0, 0));
    }

    #[test]
    fn test_parse_uses_last_separator() {
        let ns: CacheNamespace = "my-vault-app-v2.1.0-beta.1".parse().unwrap();
        assert_eq!(ns.app(), "my-vault-app");
        assert_eq!(ns.version().to_string(), "2.1.0-beta.1");
        assert_eq!(ns.to_string(), "my-vault-app-v2.1.0-beta.1");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("calc".parse::<CacheNamespace>().is_err());
        assert!("calc-vnext".parse::<CacheNamespace>().is_err());
        assert!(CacheNamespace::new("  ", "1.0.0").is_err());
        assert!(CacheNamespace::new("calc", "vv1.0.0").is_err());
        assert_eq!(
            CacheNamespace::new("calc", "v1.0.0").unwrap(),
            CacheNamespace::new("calc", "1.0.0").unwrap()
        );
    }

    #[test]
    fn test_versions_differ() {
        let v1 = CacheNamespace::new("calc", "1.0.0").unwrap();
        let v2 = CacheNamespace::new("calc", "v1.0.1").unwrap();
        assert_ne!(v1, v2);
        assert!(v2.version() > v1.version());
    }
}
