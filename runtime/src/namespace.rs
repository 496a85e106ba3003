//! Namespaces: isolated tenants under one state root
//!
//! Each namespace is a directory holding its own instances, signals,
//! version decisions and schedules, plus a `namespace.json` descriptor.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Namespace that exists without registration
pub const DEFAULT_NAMESPACE: &str = "default";

/// Descriptor file inside a namespace directory
pub const NAMESPACE_FILE: &str = "namespace.json";

/// Retention applied when a namespace is registered without one
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Error type for namespace management
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("namespace already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid namespace name: {0:?}")]
    InvalidName(String),

    #[error("namespace not registered: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for namespace management
pub type NamespaceResult<T> = Result<T, NamespaceError>;

/// Registered namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub retention_days: u32,
    pub registered_at: DateTime<Utc>,
}

impl NamespaceInfo {
    fn default_namespace() -> Self {
        Self {
            name: DEFAULT_NAMESPACE.to_string(),
            description: "Default namespace".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            registered_at: Utc::now(),
        }
    }

    /// How long closed instances are kept.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Registers and lists namespaces under a state root.
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    root: PathBuf,
}

impl NamespaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a new namespace. Retention of zero or less means the default.
    pub fn register(
        &self,
        name: &str,
        description: &str,
        retention_days: i64,
    ) -> NamespaceResult<NamespaceInfo> {
        validate_name(name)?;
        let dir = self.root.join(name);
        let descriptor = dir.join(NAMESPACE_FILE);
        if descriptor.is_file() {
            return Err(NamespaceError::AlreadyRegistered(name.to_string()));
        }

        let retention_days = if retention_days <= 0 {
            DEFAULT_RETENTION_DAYS
        } else {
            u32::try_from(retention_days).unwrap_or(u32::MAX)
        };
        let info = NamespaceInfo {
            name: name.to_string(),
            description: description.to_string(),
            retention_days,
            registered_at: Utc::now(),
        };

        std::fs::create_dir_all(&dir)?;
        std::fs::write(&descriptor, serde_json::to_vec_pretty(&info)?)?;
        info!(namespace = name, retention_days, "Namespace registered");
        Ok(info)
    }

    /// Descriptor for `name`. The default namespace always resolves.
    pub fn info(&self, name: &str) -> NamespaceResult<NamespaceInfo> {
        let descriptor = self.root.join(name).join(NAMESPACE_FILE);
        match std::fs::read(&descriptor) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if name == DEFAULT_NAMESPACE {
                    Ok(NamespaceInfo::default_namespace())
                } else {
                    Err(NamespaceError::NotFound(name.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All registered namespaces plus `default`, sorted by name.
    pub fn list(&self) -> NamespaceResult<Vec<NamespaceInfo>> {
        let mut namespaces = Vec::new();
        if self.root.is_dir() {
            for entry in std::fs::read_dir(&self.root)? {
                let path = entry?.path().join(NAMESPACE_FILE);
                if path.is_file() {
                    namespaces.push(serde_json::from_slice::<NamespaceInfo>(&std::fs::read(
                        &path,
                    )?)?);
                }
            }
        }
        if !namespaces.iter().any(|ns| ns.name == DEFAULT_NAMESPACE) {
            namespaces.push(NamespaceInfo::default_namespace());
        }
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }
}

fn validate_name(name: &str) -> NamespaceResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(NamespaceError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_list() {
        let tmp = TempDir::new().unwrap();
        let manager = NamespaceManager::new(tmp.path());

        let info = manager.register("payments", "Payment escalations", 30).unwrap();
        assert_eq!(info.retention_days, 30);

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["default".to_string(), "payments".to_string()]);
    }

    #[test]
    fn test_non_positive_retention_defaults() {
        let tmp = TempDir::new().unwrap();
        let manager = NamespaceManager::new(tmp.path());
        assert_eq!(manager.register("a", "", 0).unwrap().retention_days, 7);
        assert_eq!(manager.register("b", "", -3).unwrap().retention_days, 7);
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let tmp = TempDir::new().unwrap();
        let manager = NamespaceManager::new(tmp.path());
        manager.register("payments", "", 7).unwrap();
        assert!(matches!(
            manager.register("payments", "", 7),
            Err(NamespaceError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            manager.register("../up", "", 7),
            Err(NamespaceError::InvalidName(_))
        ));
    }

    #[test]
    fn test_default_namespace_always_resolves() {
        let tmp = TempDir::new().unwrap();
        let manager = NamespaceManager::new(tmp.path());
        assert_eq!(manager.info("default").unwrap().retention_days, 7);
        assert!(matches!(
            manager.info("unknown"),
            Err(NamespaceError::NotFound(_))
        ));
    }
}
