use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MIN_PARALLEL_DOWNLOADS: usize = 1;
pub const MAX_PARALLEL_DOWNLOADS: usize = 8;
pub const MIN_PARALLEL_EXTRACTIONS: usize = 1;
pub const MAX_PARALLEL_EXTRACTIONS: usize = 4;
pub const MIN_DOWNLOAD_TIMEOUT_S: u64 = 60;
pub const MAX_DOWNLOAD_TIMEOUT_S: u64 = 600;

fn default_mod_manager_version() -> String {
    "v2.4.4".to_string()
}

fn default_parallel_downloads() -> usize {
    4
}

fn default_parallel_extractions() -> usize {
    2
}

fn default_download_timeout_s() -> u64 {
    300
}

fn default_check_hashes() -> bool {
    true
}

fn default_delete_external_dlls() -> bool {
    true
}

/// Immutable input for a single install run. Serializes to a flat key/value
/// document so the UI layer can persist it alongside its own settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Anomaly installation directory.
    pub anomaly_path: PathBuf,
    /// Modpack root (ModOrganizer, mods/, profiles/, cloned repos).
    pub modpack_path: PathBuf,
    /// Cache directory for downloaded archives.
    pub cache_path: PathBuf,

    /// ModOrganizer release tag to install, e.g. "v2.4.4".
    #[serde(default = "default_mod_manager_version")]
    pub mod_manager_version: String,

    #[serde(default)]
    pub preserve_user_config: bool,
    #[serde(default)]
    pub force_repo_refetch: bool,
    #[serde(default = "default_check_hashes")]
    pub check_hashes: bool,
    #[serde(default = "default_delete_external_dlls")]
    pub delete_external_dlls: bool,

    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,
    #[serde(default = "default_parallel_extractions")]
    pub parallel_extractions: usize,
    #[serde(default = "default_download_timeout_s")]
    pub download_timeout_s: u64,
}

impl InstallerConfig {
    pub fn new(anomaly_path: PathBuf, modpack_path: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            anomaly_path,
            modpack_path,
            cache_path,
            mod_manager_version: default_mod_manager_version(),
            preserve_user_config: false,
            force_repo_refetch: false,
            check_hashes: true,
            delete_external_dlls: true,
            parallel_downloads: default_parallel_downloads(),
            parallel_extractions: default_parallel_extractions(),
            download_timeout_s: default_download_timeout_s(),
        }
    }

    /// Rejects configurations the installer must not run with. Writability of
    /// the paths is probed later, during preflight, once directories exist.
    pub fn validate(&self) -> Result<(), String> {
        for (name, path) in [
            ("anomaly_path", &self.anomaly_path),
            ("modpack_path", &self.modpack_path),
            ("cache_path", &self.cache_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(format!("{} is not set", name));
            }
        }

        if !(MIN_PARALLEL_DOWNLOADS..=MAX_PARALLEL_DOWNLOADS).contains(&self.parallel_downloads) {
            return Err(format!(
                "parallel_downloads must be between {} and {}, got {}",
                MIN_PARALLEL_DOWNLOADS, MAX_PARALLEL_DOWNLOADS, self.parallel_downloads
            ));
        }

        if !(MIN_PARALLEL_EXTRACTIONS..=MAX_PARALLEL_EXTRACTIONS)
            .contains(&self.parallel_extractions)
        {
            return Err(format!(
                "parallel_extractions must be between {} and {}, got {}",
                MIN_PARALLEL_EXTRACTIONS, MAX_PARALLEL_EXTRACTIONS, self.parallel_extractions
            ));
        }

        if !(MIN_DOWNLOAD_TIMEOUT_S..=MAX_DOWNLOAD_TIMEOUT_S).contains(&self.download_timeout_s) {
            return Err(format!(
                "download_timeout_s must be between {} and {}, got {}",
                MIN_DOWNLOAD_TIMEOUT_S, MAX_DOWNLOAD_TIMEOUT_S, self.download_timeout_s
            ));
        }

        if self.mod_manager_version.trim().is_empty() {
            return Err("mod_manager_version is not set".to_string());
        }

        Ok(())
    }
}
