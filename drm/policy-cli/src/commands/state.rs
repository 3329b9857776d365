use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use drm_policy::MemoryService;

/**
    Load a local service state file, or start empty if it does not exist.
    `host` only applies to a new state.
*/
pub fn load_state(path: &Path, host: &str) -> Result<MemoryService> {
    match std::fs::read_to_string(path) {
        Ok(json) => MemoryService::from_json(&json)
            .with_context(|| format!("failed to parse state file {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No state at {}, starting empty", path.display());
            Ok(MemoryService::with_key_delivery_host(host))
        }
        Err(e) => Err(e).with_context(|| format!("failed to read state file {}", path.display())),
    }
}

/** Owner read/write only: the state holds key values in clear. */
#[cfg(unix)]
const STATE_FILE_MODE: u32 = 0o600;

pub fn save_state(path: &Path, service: &MemoryService) -> Result<()> {
    let json = service.to_json().context("failed to serialize state")?;
    write_private(path, json.as_bytes())
        .with_context(|| format!("failed to write state file {}", path.display()))?;
    info!("Saved state to {}", path.display());
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(STATE_FILE_MODE);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation; tighten files left by older runs.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(STATE_FILE_MODE))?;
    }
    file.write_all(contents)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_policy::MediaKeyService;

    #[test]
    fn missing_state_starts_empty_with_host() {
        let dir = tempfile::tempdir().unwrap();
        let service = load_state(&dir.path().join("state.json"), "kd.example").unwrap();
        let state = service.snapshot();
        assert_eq!(state.key_delivery_host(), "kd.example");
        assert_eq!(state.authorization_policy_names().count(), 0);
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let service = MemoryService::new();
        service.create_authorization_policy("p").await.unwrap();

        save_state(&path, &service).unwrap();
        let loaded = load_state(&path, "ignored.example").unwrap();

        assert_eq!(loaded.snapshot(), service.snapshot());
    }

    #[cfg(unix)]
    #[test]
    fn saved_state_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.json");
        let existing = dir.path().join("existing.json");
        std::fs::write(&existing, "{}").unwrap();
        std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o644)).unwrap();

        for path in [&fresh, &existing] {
            save_state(path, &MemoryService::new()).unwrap();
            let mode = std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{} has mode {mode:o}", path.display());
        }
        assert!(load_state(&existing, "h").is_ok());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_state(&path, "h").is_err());
    }
}
