use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::environment::EnvParams;
use crate::registration::RegisterParams;
use crate::segmentation::ObjectParams;
use crate::tracker::TrackParams;

const CHECKPOINT_FORMAT: &str = "%Y%m%d-%H:%M:%S";

/// Every tunable of the pipeline in one place, handed to each component at
/// construction. Background threads receive copies of what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    pub track: TrackParams,
    pub env: EnvParams,
    pub object: ObjectParams,
    pub register: RegisterParams,
    /// Root of the checkpointed configuration tree; empty means the
    /// current directory
    pub config_dir: PathBuf,
    /// Checkpoint to read from: a literal directory name or `latest`
    pub read_check_point: Option<String>,
}

impl ProcessConfig {
    pub fn load(path: &Path) -> Result<ProcessConfig> {
        let config = ProcessConfig::default();
        debug!("created init config object {:?}", config);

        match std::fs::read_to_string(path) {
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "config file not found, will create a blank one at {}",
                        path.display()
                    );
                    Ok(config)
                } else {
                    Err(anyhow!("failed to load config from disk: {e}"))
                }
            }
            Ok(s) => {
                info!("loaded config from \"{}\"", path.display());
                serde_json::from_str::<ProcessConfig>(&s)
                    .map_err(|e| anyhow!("failed to parse config data: {e}"))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(path, text)?;
        info!("wrote config to {}", path.display());
        Ok(())
    }

    /// Resolve a config file name against the configured checkpoint.
    pub fn config_file_name(&self, file_name: &str) -> PathBuf {
        let base = match &self.read_check_point {
            Some(name) => resolve_checkpoint(&self.config_dir, name, 0)
                .unwrap_or_else(|| self.config_dir.clone()),
            None => self.config_dir.clone(),
        };
        base.join(file_name)
    }
}

pub fn checkpoint_dir_name(timestamp_ms: u64) -> String {
    let datetime = DateTime::from_timestamp((timestamp_ms / 1000) as i64, 0).unwrap_or_default();
    datetime.format(CHECKPOINT_FORMAT).to_string()
}

fn parse_checkpoint_name(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, CHECKPOINT_FORMAT).ok()
}

/// Create a checkpoint directory for `timestamp_ms` under the config dir.
pub fn create_checkpoint(config_dir: &Path, timestamp_ms: u64) -> Result<PathBuf> {
    let dir = config_dir.join(checkpoint_dir_name(timestamp_ms));
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Pick a checkpoint directory by literal name, or for `latest` the newest
/// whose timestamp is at or before `query_timestamp_ms` (0 = any).
pub fn resolve_checkpoint(
    config_dir: &Path,
    name: &str,
    query_timestamp_ms: u64,
) -> Option<PathBuf> {
    if name != "latest" {
        let dir = config_dir.join(name);
        return dir.is_dir().then_some(dir);
    }

    let query = if query_timestamp_ms == 0 {
        None
    } else {
        DateTime::from_timestamp((query_timestamp_ms / 1000) as i64, 0).map(|dt| dt.naive_utc())
    };

    let mut best: Option<(NaiveDateTime, PathBuf)> = None;
    let entries = std::fs::read_dir(config_dir).ok()?;
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(stamp) = file_name.to_str().and_then(parse_checkpoint_name) else {
            continue;
        };
        if let Some(query) = query {
            if stamp > query {
                continue;
            }
        }
        if best.as_ref().map(|(b, _)| stamp > *b).unwrap_or(true) {
            best = Some((stamp, entry.path()));
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ProcessConfig::default();
        config.track.unite_distance = 0.9;
        config.env.scan_sec = 20.0;
        config.object.max_distance = 0.4;
        config.save(&path).unwrap();

        let loaded = ProcessConfig::load(&path).unwrap();
        assert!((loaded.track.unite_distance - 0.9).abs() < 1e-6);
        assert!((loaded.env.scan_sec - 20.0).abs() < 1e-6);
        assert!((loaded.object.max_distance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn config_uses_documented_key_names() {
        let config = ProcessConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["track"].get("uniteDistance").is_some());
        assert!(json["track"].get("latentLifeTime").is_some());
        assert!(json["track"].get("distance2D").is_some());
        assert!(json["env"].get("filterMinDistance").is_some());
        assert!(json["object"].get("maxDistance").is_some());
        assert!(json["register"].get("markerMatchDifference").is_some());
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig::load(&dir.path().join("nope.json")).unwrap();
        assert!((config.track.track_distance - 1.2).abs() < 1e-6);
    }

    #[test]
    fn checkpoint_resolution_picks_newest_before_query() {
        let dir = tempfile::tempdir().unwrap();
        let older = 1_600_000_000_000u64;
        let newer = 1_700_000_000_000u64;
        let older_dir = create_checkpoint(dir.path(), older).unwrap();
        let newer_dir = create_checkpoint(dir.path(), newer).unwrap();

        // latest with no bound
        let picked = resolve_checkpoint(dir.path(), "latest", 0).unwrap();
        assert_eq!(picked, newer_dir);

        // bounded by a timestamp between the two
        let picked = resolve_checkpoint(dir.path(), "latest", older + 1_000).unwrap();
        assert_eq!(picked, older_dir);

        // literal name
        let name = checkpoint_dir_name(older);
        let picked = resolve_checkpoint(dir.path(), &name, 0).unwrap();
        assert_eq!(picked, older_dir);
    }
}
