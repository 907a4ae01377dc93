//! Versioned on-disk model registry.
//!
//! Artifacts live in one directory as `model_v<X>.<Y>.<Z>.json` with a
//! `metrics_v<X>.<Y>.<Z>.json` sidecar. The greatest live semver tuple is
//! "current". Rollback renames both files with a reserved suffix instead
//! of deleting, so the next-greatest version takes over.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::models::now_ts;
use crate::risk::gbm::Gbm;

pub const ROLLED_BACK_SUFFIX: &str = ".rolledback";
pub const MISSING_VERSION: &str = "missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBump {
    Major,
    Minor,
    Patch,
}

pub type VersionTuple = (u64, u64, u64);

/// Parse `v0.10.2` into a numeric tuple. Sorting happens on the tuple, not
/// the string, so v0.10.0 > v0.2.0.
pub fn parse_version(tag: &str) -> Option<VersionTuple> {
    let clean = tag.trim().trim_start_matches('v');
    let clean = clean.split('-').next()?;
    let mut parts = clean.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

pub fn format_version(v: VersionTuple) -> String {
    format!("v{}.{}.{}", v.0, v.1, v.2)
}

pub fn bump_version(current: &str, bump: VersionBump) -> String {
    let Some((major, minor, patch)) = parse_version(current) else {
        return "v0.1.0".to_string();
    };
    match bump {
        VersionBump::Major => format_version((major + 1, 0, 0)),
        VersionBump::Minor => format_version((major, minor + 1, 0)),
        VersionBump::Patch => format_version((major, minor, patch + 1)),
    }
}

pub struct ModelRegistry {
    dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("model_{version}.json"))
    }

    fn metrics_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("metrics_{version}.json"))
    }

    /// Live (non-rolled-back) versions found on disk, ascending.
    pub fn live_versions(&self) -> Vec<VersionTuple> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut versions: Vec<VersionTuple> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let stem = name
                    .strip_prefix("model_")?
                    .strip_suffix(".json")?;
                parse_version(stem)
            })
            .collect();
        versions.sort_unstable();
        versions
    }

    /// Tag of the current model, or the "missing" sentinel.
    pub fn current_version(&self) -> String {
        self.live_versions()
            .last()
            .map(|&v| format_version(v))
            .unwrap_or_else(|| MISSING_VERSION.to_string())
    }

    /// Path of the current model artifact, if any.
    pub fn latest_file(&self) -> Option<PathBuf> {
        let version = self.current_version();
        if version == MISSING_VERSION {
            return None;
        }
        Some(self.model_path(&version))
    }

    /// Deserialize the current classifier. `None` means rules mode.
    pub fn load_current(&self) -> CoreResult<Option<(Gbm, String)>> {
        let version = self.current_version();
        if version == MISSING_VERSION {
            return Ok(None);
        }
        let raw = fs::read_to_string(self.model_path(&version))?;
        let model: Gbm = serde_json::from_str(&raw)?;
        Ok(Some((model, version)))
    }

    /// Stored metrics document for a version, if readable.
    pub fn load_metrics(&self, version: &str) -> Option<Value> {
        let raw = fs::read_to_string(self.metrics_path(version)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Write a new model + metrics sidecar at the next version tag.
    pub fn publish(
        &self,
        model: &Gbm,
        metrics: &Value,
        bump: VersionBump,
    ) -> CoreResult<String> {
        let version = bump_version(&self.current_version(), bump);

        let mut doc = metrics.clone();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("version".to_string(), Value::String(version.clone()));
            obj.insert("trained_at".to_string(), Value::String(now_ts()));
        }

        fs::write(
            self.model_path(&version),
            serde_json::to_string(model)?,
        )?;
        fs::write(
            self.metrics_path(&version),
            serde_json::to_string_pretty(&doc)?,
        )?;

        info!(version = %version, dir = %self.dir.display(), "published model artifact");
        Ok(version)
    }

    /// Retire a version by renaming its files with the reserved suffix.
    /// Returns false (and does nothing) when the version is unknown or it
    /// is the only live version left.
    pub fn rollback(&self, version: &str) -> CoreResult<bool> {
        let Some(target) = parse_version(version) else {
            return Ok(false);
        };
        let live = self.live_versions();
        if live.len() < 2 || !live.contains(&target) {
            warn!(version, live = live.len(), "rollback refused");
            return Ok(false);
        }

        let model = self.model_path(version);
        let metrics = self.metrics_path(version);
        fs::rename(&model, retired_path(&model))?;
        if metrics.exists() {
            fs::rename(&metrics, retired_path(&metrics))?;
        }

        info!(
            version,
            now_current = %self.current_version(),
            "model rolled back"
        );
        Ok(true)
    }
}

fn retired_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ROLLED_BACK_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::gbm::GbmParams;
    use tempfile::tempdir;

    fn toy_model() -> Gbm {
        let x = vec![vec![0.1], vec![0.2], vec![0.8], vec![0.9]];
        let y = vec![0u8, 0, 1, 1];
        Gbm::fit(
            &x,
            &y,
            &GbmParams {
                n_estimators: 3,
                min_child_weight: 0.0,
                ..GbmParams::default()
            },
        )
    }

    #[test]
    fn test_version_parse_and_bump() {
        assert_eq!(parse_version("v0.2.0"), Some((0, 2, 0)));
        assert_eq!(parse_version("v0.0.0-rules"), Some((0, 0, 0)));
        assert_eq!(parse_version("garbage"), None);
        assert_eq!(bump_version("v0.2.0", VersionBump::Minor), "v0.3.0");
        assert_eq!(bump_version("v0.2.3", VersionBump::Patch), "v0.2.4");
        assert_eq!(bump_version("v1.9.9", VersionBump::Major), "v2.0.0");
        assert_eq!(bump_version(MISSING_VERSION, VersionBump::Minor), "v0.1.0");
    }

    #[test]
    fn test_numeric_tuple_ordering_beats_string_order() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let model = toy_model();
        let metrics = serde_json::json!({"f1": 0.9});

        // Publish up to v0.10.0 via nine minor bumps.
        for _ in 0..10 {
            registry
                .publish(&model, &metrics, VersionBump::Minor)
                .unwrap();
        }
        assert_eq!(registry.current_version(), "v0.10.0");
    }

    #[test]
    fn test_empty_registry_is_missing() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        assert_eq!(registry.current_version(), MISSING_VERSION);
        assert!(registry.latest_file().is_none());
        assert!(registry.load_current().unwrap().is_none());
    }

    #[test]
    fn test_publish_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let model = toy_model();
        let version = registry
            .publish(&model, &serde_json::json!({"f1": 0.8}), VersionBump::Minor)
            .unwrap();
        assert_eq!(version, "v0.1.0");

        let (loaded, loaded_version) = registry.load_current().unwrap().unwrap();
        assert_eq!(loaded_version, "v0.1.0");
        assert_eq!(
            loaded.predict_proba(&[0.85]),
            model.predict_proba(&[0.85])
        );

        let metrics = registry.load_metrics(&version).unwrap();
        assert_eq!(metrics["f1"], 0.8);
        assert_eq!(metrics["version"], "v0.1.0");
    }

    #[test]
    fn test_rollback_renames_and_reverts_current() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let model = toy_model();
        let metrics = serde_json::json!({"f1": 0.8});

        let v1 = registry.publish(&model, &metrics, VersionBump::Minor).unwrap();
        let v2 = registry.publish(&model, &metrics, VersionBump::Minor).unwrap();
        assert_eq!(registry.current_version(), v2);

        assert!(registry.rollback(&v2).unwrap());
        assert_eq!(registry.current_version(), v1);

        // Nothing deleted: the retired files are still on disk.
        let retired = dir.path().join(format!("model_{v2}.json{ROLLED_BACK_SUFFIX}"));
        assert!(retired.exists());
        assert!(!dir.path().join(format!("model_{v2}.json")).exists());
    }

    #[test]
    fn test_rollback_refused_for_single_version() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let model = toy_model();
        let v1 = registry
            .publish(&model, &serde_json::json!({}), VersionBump::Minor)
            .unwrap();

        assert!(!registry.rollback(&v1).unwrap());
        assert_eq!(registry.current_version(), v1);
        assert!(!registry.rollback("v9.9.9").unwrap());
    }
}
