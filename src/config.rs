//! Operator Configuration
//!
//! Settings come from an optional YAML file with command line flags (and
//! their environment variables) layered on top.

use crate::controller::{ControllerOptions, ReconcilerConfig};
use crate::crd::ENABLE_RBD_STATS_DEFAULT;
use crate::domain::ports::LabelSelector;
use crate::error::{Error, Result};
use crate::event::DEFAULT_RESYNC_INTERVAL;
use crate::operator::OperatorSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Configuration File
// =============================================================================

/// Complete operator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Provider scheme this operator serves
    pub provider: String,
    /// Cluster id prefixed to backend pool names
    pub cluster_id: String,
    /// Namespace of the Rook resources
    pub rook_namespace: String,
    /// CSI driver of the published classes
    pub csi_driver_name: String,
    /// `k=v,k2=v2` selector for advertised VolumeClasses
    pub volume_class_selector: String,
    /// `enableRBDStats` on created block pools
    pub enable_rbd_stats: bool,
    /// Full relist period, e.g. `30s`, `5m`, `1h`
    pub resync_interval: String,
    /// Concurrent reconcile workers
    pub workers: usize,
    /// VolumePool announced at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce_pool: Option<String>,
    /// Replication of the announced pool
    pub announce_replication: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let reconciler = ReconcilerConfig::default();
        Self {
            provider: reconciler.provider,
            cluster_id: reconciler.cluster_id,
            rook_namespace: reconciler.rook_namespace,
            csi_driver_name: reconciler.csi_driver_name,
            volume_class_selector: String::new(),
            enable_rbd_stats: ENABLE_RBD_STATS_DEFAULT,
            resync_interval: "1h".to_string(),
            workers: crate::controller::runner::DEFAULT_WORKERS,
            announce_pool: None,
            announce_replication: 3,
        }
    }
}

/// Values given on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub provider: Option<String>,
    pub cluster_id: Option<String>,
    pub rook_namespace: Option<String>,
    pub csi_driver_name: Option<String>,
    pub volume_class_selector: Option<String>,
    pub enable_rbd_stats: Option<bool>,
    pub resync_interval: Option<String>,
    pub workers: Option<usize>,
    pub announce_pool: Option<String>,
    pub announce_replication: Option<u32>,
}

impl OperatorConfig {
    /// Read a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Layer command line values over this configuration
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = overrides.$field {
                    self.$field = value;
                })*
            };
        }
        apply!(
            provider,
            cluster_id,
            rook_namespace,
            csi_driver_name,
            volume_class_selector,
            enable_rbd_stats,
            resync_interval,
            workers,
            announce_replication,
        );
        if overrides.announce_pool.is_some() {
            self.announce_pool = overrides.announce_pool;
        }
        self
    }

    /// Check the configuration and derive the runtime settings
    pub fn settings(&self) -> Result<OperatorSettings> {
        for (field, value) in [
            ("provider", &self.provider),
            ("clusterId", &self.cluster_id),
            ("rookNamespace", &self.rook_namespace),
            ("csiDriverName", &self.csi_driver_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("{} must not be empty", field)));
            }
        }
        if self.provider.contains("://") {
            return Err(Error::Configuration(format!(
                "provider must be a bare scheme, got {:?}",
                self.provider
            )));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.announce_pool.is_some() && self.announce_replication == 0 {
            return Err(Error::Configuration("announceReplication must be at least 1".into()));
        }

        let volume_class_selector = LabelSelector::parse(&self.volume_class_selector)?;
        let resync_interval = match parse_duration(&self.resync_interval)? {
            d if d.is_zero() => DEFAULT_RESYNC_INTERVAL,
            d => d,
        };

        Ok(OperatorSettings {
            reconciler: ReconcilerConfig {
                provider: self.provider.clone(),
                cluster_id: self.cluster_id.clone(),
                rook_namespace: self.rook_namespace.clone(),
                csi_driver_name: self.csi_driver_name.clone(),
                volume_class_selector,
                enable_rbd_stats: self.enable_rbd_stats,
            },
            controller: ControllerOptions {
                workers: self.workers,
                ..Default::default()
            },
            resync_interval,
        })
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h`; a bare number means seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::DurationParse(format!("invalid duration {:?}", s)))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        other => Err(Error::DurationParse(format!("unknown unit {:?} in {:?}", other, s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));

        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("10d"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = OperatorConfig::default().settings().unwrap();
        assert_eq!(settings.reconciler.provider, "ceph");
        assert_eq!(settings.resync_interval, DEFAULT_RESYNC_INTERVAL);
        assert!(settings.reconciler.volume_class_selector.is_empty());
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "clusterId: c1\nvolumeClassSelector: suitable-for=testing\nresyncInterval: 5m\nworkers: 4"
        )
        .unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_id, "c1");
        assert_eq!(config.rook_namespace, "rook-ceph");

        let config = config.with_overrides(ConfigOverrides {
            workers: Some(8),
            announce_pool: Some("pool-a".into()),
            ..Default::default()
        });
        let settings = config.settings().unwrap();
        assert_eq!(settings.controller.workers, 8);
        assert_eq!(settings.resync_interval, Duration::from_secs(300));
        assert_eq!(config.announce_pool.as_deref(), Some("pool-a"));
        assert!(settings
            .reconciler
            .volume_class_selector
            .matches(&[("suitable-for".to_string(), "testing".to_string())].into()));
    }

    #[test]
    fn test_invalid_settings() {
        let mut config = OperatorConfig::default();
        config.provider = "ceph://pool".into();
        assert_matches!(config.settings(), Err(Error::Configuration(_)));

        let mut config = OperatorConfig::default();
        config.volume_class_selector = "broken".into();
        assert_matches!(config.settings(), Err(Error::SelectorParse(_)));

        let mut config = OperatorConfig::default();
        config.workers = 0;
        assert_matches!(config.settings(), Err(Error::Configuration(_)));

        assert_matches!(OperatorConfig::from_yaml("workers: [1"), Err(Error::YamlParse(_)));
    }
}
