use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use log::{debug, warn};

use drm_policy::{FileSource, ReconcileConfig, Settings};

pub const DEFAULT_CONFIG_PATH: &str = "drm-policy.yaml";

/**
    Where reconciliation settings are read from.
*/
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /**
        YAML settings file. Any setting can also be given as a
        DRM_POLICY_<NAME> environment variable, which wins over the file.
        Template and certificate paths are relative to this file.
    */
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<ReconcileConfig> {
        let mut settings = read_settings(&self.config)?;
        settings
            .merge_env(std::env::vars())
            .context("invalid environment override")?;
        settings
            .resolve(&DiskFiles::relative_to(&self.config))
            .context("invalid configuration")
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    match std::fs::read_to_string(path) {
        Ok(yaml) => {
            parse_settings(&yaml).with_context(|| format!("failed to parse {}", path.display()))
        }
        // Only the default file is optional; an explicit path must exist.
        Err(e) if e.kind() == io::ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {
            warn!("{DEFAULT_CONFIG_PATH} not found, using environment settings only");
            Ok(Settings::default())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn parse_settings(yaml: &str) -> Result<Settings> {
    if yaml.trim().is_empty() {
        return Ok(Settings::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

/**
    Reads setting-referenced files from disk, relative to a base directory.
*/
pub struct DiskFiles {
    base: PathBuf,
}

impl DiskFiles {
    pub fn relative_to(config: &Path) -> Self {
        Self {
            base: config.parent().map(Path::to_path_buf).unwrap_or_default(),
        }
    }

    fn locate(&self, path: &Path) -> PathBuf {
        // Absolute paths replace the base when joined.
        self.base.join(path)
    }
}

impl FileSource for DiskFiles {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let path = self.locate(path);
        debug!("Reading {}", path.display());
        std::fs::read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = self.locate(path);
        debug!("Reading {}", path.display());
        std::fs::read(path)
    }
}
