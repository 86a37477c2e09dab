use std::path::Path;

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use log::info;
use serde::{Deserialize, Serialize};

/// Named device groups loaded from JSON: a map of
/// `group -> { member: "device" }`. The `all` group is implicit and always
/// contains every known device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceGroups {
    #[serde(flatten)]
    groups: IndexMap<String, IndexMap<String, String>>,
}

impl DeviceGroups {
    pub fn add_device(&mut self, group_name: &str, device_name: &str) {
        let group = self.groups.entry(group_name.to_string()).or_default();
        group.insert(device_name.to_string(), "device".to_string());
    }

    pub fn remove_device(&mut self, group_name: &str, device_name: &str) {
        if let Some(group) = self.groups.get_mut(group_name) {
            group.shift_remove(device_name);
            if group.is_empty() {
                self.groups.shift_remove(group_name);
            }
        }
    }

    pub fn remove_device_everywhere(&mut self, device_name: &str) {
        self.groups.retain(|_, group| {
            group.shift_remove(device_name);
            !group.is_empty()
        });
    }

    pub fn remove_group(&mut self, group_name: &str) {
        self.groups.shift_remove(group_name);
    }

    pub fn rename_group(&mut self, old_name: &str, new_name: &str) {
        if let Some(members) = self.groups.shift_remove(old_name) {
            self.groups.insert(new_name.to_string(), members);
        }
    }

    pub fn rename_device(&mut self, old_name: &str, new_name: &str) {
        for group in self.groups.values_mut() {
            if let Some(value) = group.shift_remove(old_name) {
                group.insert(new_name.to_string(), value);
            }
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(|k| k.as_str()).collect()
    }

    pub fn contains(&self, group_name: &str, device_name: &str) -> bool {
        if group_name == "all" {
            return self
                .groups
                .values()
                .any(|group| group.contains_key(device_name));
        }
        self.groups
            .get(group_name)
            .map(|group| group.contains_key(device_name))
            .unwrap_or(false)
    }

    /// Member list of a group; `all` collects every device once.
    pub fn devices(&self, group_name: &str) -> Vec<String> {
        if group_name == "all" {
            let mut devices = Vec::new();
            for group in self.groups.values() {
                for device in group.keys() {
                    if !devices.contains(device) {
                        devices.push(device.clone());
                    }
                }
            }
            return devices;
        }
        self.groups
            .get(group_name)
            .map(|group| group.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn read(path: &Path, report_error: bool) -> Result<DeviceGroups> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("reading device groups file {}", path.display());
                serde_json::from_str(&text)
                    .map_err(|e| anyhow!("failed to parse groups file {}: {e}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !report_error => {
                Ok(DeviceGroups::default())
            }
            Err(e) => Err(anyhow!(
                "failed to read device groups file {}: {e}",
                path.display()
            )),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!("writing device groups file {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");

        let mut groups = DeviceGroups::default();
        groups.add_device("foyer", "lidar0");
        groups.add_device("foyer", "lidar1");
        groups.add_device("stage", "lidar2");
        groups.write(&path).unwrap();

        let loaded = DeviceGroups::read(&path, true).unwrap();
        assert_eq!(loaded.devices("foyer"), vec!["lidar0", "lidar1"]);
        assert!(loaded.contains("stage", "lidar2"));
    }

    #[test]
    fn all_group_is_implicit() {
        let mut groups = DeviceGroups::default();
        groups.add_device("a", "dev0");
        groups.add_device("b", "dev1");
        groups.add_device("b", "dev0");

        let mut all = groups.devices("all");
        all.sort();
        assert_eq!(all, vec!["dev0", "dev1"]);
        assert!(groups.contains("all", "dev1"));
    }

    #[test]
    fn missing_file_is_silent_when_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(DeviceGroups::read(&missing, false).is_ok());
        assert!(DeviceGroups::read(&missing, true).is_err());
    }

    #[test]
    fn rename_device_touches_all_groups() {
        let mut groups = DeviceGroups::default();
        groups.add_device("a", "old");
        groups.add_device("b", "old");
        groups.rename_device("old", "new");
        assert!(groups.contains("a", "new"));
        assert!(groups.contains("b", "new"));
        assert!(!groups.contains("a", "old"));
    }
}
