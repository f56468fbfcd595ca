//! Atomic YAML persistence for the tenant document: write to a temp sibling
//! file, then rename over the original so readers never observe a partial
//! write.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::TenantConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub tenants: Vec<TenantConfig>,
}

impl PersistedDocument {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let doc: Self = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        Ok(doc)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let yaml = serde_yaml::to_string(self)?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, yaml)
            .map_err(|e| anyhow::anyhow!("writing temp config {}: {e}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| anyhow::anyhow!("renaming temp config into place: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet};

    fn sample_tenant() -> TenantConfig {
        TenantConfig {
            tenant_id: "tenant1".into(),
            uid: 1001,
            gid: 1001,
            api_key: "test_key_1".into(),
            max_overlays: 4,
            max_buffers: 10,
            max_memory_mb: 64,
            allowed_bitstreams: HashSet::from(["base.bit".to_string()]),
            allowed_address_ranges: vec![(0xA000_0000, 0x1_0000)],
            allowed_pr_zones: HashSet::from([0]),
        }
    }

    #[test]
    fn round_trips_through_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let doc = PersistedDocument {
            tenants: vec![sample_tenant()],
        };
        doc.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("yaml.tmp").exists());

        let loaded = PersistedDocument::load(&path).unwrap();
        assert_eq!(loaded.tenants.len(), 1);
        assert_eq!(loaded.tenants[0].tenant_id, "tenant1");
        assert_eq!(loaded.tenants[0].allowed_address_ranges, vec![(0xA000_0000, 0x1_0000)]);
    }
}
