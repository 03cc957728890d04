use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use keygate_common::ProxySettingsPatch;
use keygate_pool::Group;

/// Bootstrap file: groups with their key material, plus optional settings
/// overrides. Group CRUD at runtime belongs to the admin panel, not here.
#[derive(Debug, Default, Deserialize)]
pub struct BootstrapFile {
    #[serde(default)]
    pub settings: Option<ProxySettingsPatch>,
    #[serde(default)]
    pub groups: Vec<BootstrapGroup>,
}

#[derive(Debug, Deserialize)]
pub struct BootstrapGroup {
    #[serde(flatten)]
    pub group: Group,
    #[serde(default)]
    pub keys: Vec<String>,
}

pub fn load(path: &str) -> Result<BootstrapFile> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(%path, "bootstrap file missing; starting with no groups");
            return Ok(BootstrapFile::default());
        }
        Err(err) => return Err(err).with_context(|| format!("read bootstrap file {path}")),
    };
    serde_json::from_slice(&raw).with_context(|| format!("parse bootstrap file {path}"))
}
