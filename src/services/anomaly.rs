use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

use super::archive::{ArchiveError, ArchiveExtractor, ExtractProgress};
use super::moddb::{ModDbClient, ModDbError};
use crate::utils::download::ByteProgress;
use crate::utils::fsx;

/// Fixed ModDB pages for S.T.A.L.K.E.R. Anomaly 1.5.3.
pub const ANOMALY_INFO_URL: &str =
    "https://www.moddb.com/mods/stalker-anomaly/downloads/stalker-anomaly-153";
pub const ANOMALY_DOWNLOAD_URL: &str = "https://www.moddb.com/downloads/start/277404";
pub const ANOMALY_ARCHIVE_NAME: &str = "stalker-anomaly-153.7z";

/// Subfolders that identify the game directory inside the extracted archive.
const REQUIRED_DIRS: [&str; 4] = ["bin", "gamedata", "appdata", "tools"];

/// At least one of these must exist under `bin/` for a valid installation.
const GAME_EXECUTABLES: [&str; 3] = ["AnomalyDX9.exe", "AnomalyDX11.exe", "AnomalyDX11AVX.exe"];

const USER_CONFIG_RELPATH: &str = "appdata/user.ltx";

/// Overlay injector files removed when `delete_external_dlls` is set.
const OVERLAY_FILES: [&str; 4] = ["dxgi.dll", "d3d9.dll", "d3d11.dll", "ReShade.ini"];

const SCREENMODE_FULLSCREEN: &str = "rs_screenmode fullscreen";
const SCREENMODE_BORDERLESS: &str = "rs_screenmode borderless";

#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("Anomaly download failed: {0}")]
    Download(#[from] ModDbError),
    #[error("Anomaly extraction failed: {0}")]
    Extraction(#[from] ArchiveError),
    #[error("Could not locate the game directory in the extracted archive")]
    GameDirNotFound,
    #[error("Anomaly installation failed verification after extraction")]
    VerificationFailed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads, extracts and patches the base game.
pub struct AnomalyInstaller {
    moddb: ModDbClient,
    extractor: ArchiveExtractor,
}

impl AnomalyInstaller {
    pub fn new(timeout: Duration, check_hashes: bool) -> Self {
        Self {
            moddb: ModDbClient::new(timeout, check_hashes),
            extractor: ArchiveExtractor::new(),
        }
    }

    /// A valid installation has a known executable under `bin/` and the
    /// user config file in place.
    pub fn verify(anomaly_path: &Path) -> bool {
        let bin = anomaly_path.join("bin");
        if !bin.is_dir() {
            return false;
        }
        let has_executable = GAME_EXECUTABLES
            .iter()
            .any(|executable| bin.join(executable).is_file());
        if !has_executable {
            log::warn!("No Anomaly executable found in {}", bin.display());
            return false;
        }
        if !anomaly_path.join(USER_CONFIG_RELPATH).is_file() {
            log::warn!("user.ltx missing under {}", anomaly_path.display());
            return false;
        }
        true
    }

    pub async fn install(
        &self,
        anomaly_path: &Path,
        cache_path: &Path,
        download_progress: Option<&ByteProgress>,
        extract_progress: Option<Arc<ExtractProgress>>,
        skip_if_valid: bool,
        preserve_user_config: bool,
        wine_mode: bool,
        delete_external_dlls: bool,
    ) -> Result<(), AnomalyError> {
        if skip_if_valid && Self::verify(anomaly_path) {
            log::info!("Valid Anomaly installation found, skipping");
            return Ok(());
        }

        tokio::fs::create_dir_all(cache_path).await?;
        let archive_path = cache_path.join(ANOMALY_ARCHIVE_NAME);

        log::info!("Downloading S.T.A.L.K.E.R. Anomaly 1.5.3");
        self.moddb
            .fetch_mod(
                Some(ANOMALY_INFO_URL),
                ANOMALY_DOWNLOAD_URL,
                &archive_path,
                None,
                download_progress,
            )
            .await?;

        self.extract_into_place(&archive_path, anomaly_path, extract_progress)
            .await?;

        if !Self::verify(anomaly_path) {
            return Err(AnomalyError::VerificationFailed);
        }

        if !preserve_user_config {
            patch_user_config(anomaly_path, wine_mode)?;
        }
        if delete_external_dlls {
            remove_overlay_files(anomaly_path);
        }

        log::info!("Anomaly installation complete");
        Ok(())
    }

    /// Extracts next to the final location, finds the nested game directory
    /// and renames it into place, so a crash never leaves a half-written
    /// tree at `anomaly_path` itself.
    async fn extract_into_place(
        &self,
        archive_path: &Path,
        anomaly_path: &Path,
        extract_progress: Option<Arc<ExtractProgress>>,
    ) -> Result<(), AnomalyError> {
        let parent = anomaly_path.parent().unwrap_or(Path::new("."));
        let dir_name = anomaly_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "Anomaly".to_string());
        let temp_dir = parent.join(format!("{}_temp", dir_name));

        fsx::remove_dir_if_exists(&temp_dir)?;

        log::info!("Extracting Anomaly to {}", temp_dir.display());
        self.extractor
            .extract(archive_path, &temp_dir, extract_progress)
            .await?;

        let game_dir = find_game_directory(&temp_dir).ok_or(AnomalyError::GameDirNotFound)?;

        if anomaly_path.exists() {
            log::warn!(
                "Removing existing Anomaly installation at {}",
                anomaly_path.display()
            );
            std::fs::remove_dir_all(anomaly_path)?;
        }

        fsx::move_dir(&game_dir, anomaly_path)?;
        fsx::remove_dir_if_exists(&temp_dir)?;
        Ok(())
    }
}

/// First directory (the extraction root included) whose children cover the
/// required game subfolders.
pub fn find_game_directory(extract_root: &Path) -> Option<PathBuf> {
    let is_game_dir =
        |path: &Path| REQUIRED_DIRS.iter().all(|name| path.join(name).is_dir());

    if is_game_dir(extract_root) {
        return Some(extract_root.to_path_buf());
    }

    WalkDir::new(extract_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .find(|path| is_game_dir(path))
}

/// Applies the single screen-mode substitution to `user.ltx`. Wine cannot
/// reliably drive exclusive fullscreen, so borderless is forced there.
pub fn patch_user_config(anomaly_path: &Path, wine_mode: bool) -> Result<(), AnomalyError> {
    let user_config = anomaly_path.join(USER_CONFIG_RELPATH);
    if !user_config.is_file() {
        log::warn!("user.ltx not found, skipping patch");
        return Ok(());
    }

    if !wine_mode {
        return Ok(());
    }

    let content = std::fs::read_to_string(&user_config)?;
    let patched = content.replace(SCREENMODE_FULLSCREEN, SCREENMODE_BORDERLESS);
    if patched != content {
        std::fs::write(&user_config, patched)?;
        log::info!("Patched user.ltx for borderless mode");
    }
    Ok(())
}

fn remove_overlay_files(anomaly_path: &Path) {
    for location in [anomaly_path.to_path_buf(), anomaly_path.join("bin")] {
        for name in OVERLAY_FILES {
            let candidate = location.join(name);
            if candidate.is_file() {
                match std::fs::remove_file(&candidate) {
                    Ok(()) => log::info!("Removed overlay file {}", candidate.display()),
                    Err(e) => log::warn!("Could not remove {}: {}", candidate.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold_game_dir(root: &Path) {
        for dir in REQUIRED_DIRS {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        std::fs::write(root.join("bin/AnomalyDX11.exe"), b"exe").unwrap();
        std::fs::write(root.join("appdata/user.ltx"), b"rs_screenmode fullscreen\n").unwrap();
    }

    #[test]
    fn verify_accepts_complete_installation() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());
        assert!(AnomalyInstaller::verify(dir.path()));
    }

    #[test]
    fn verify_rejects_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());
        std::fs::remove_file(dir.path().join("bin/AnomalyDX11.exe")).unwrap();
        assert!(!AnomalyInstaller::verify(dir.path()));
    }

    #[test]
    fn verify_rejects_missing_user_config() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());
        std::fs::remove_file(dir.path().join("appdata/user.ltx")).unwrap();
        assert!(!AnomalyInstaller::verify(dir.path()));
    }

    #[test]
    fn finds_nested_game_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Anomaly-1.5.3/Anomaly");
        scaffold_game_dir(&nested);
        assert_eq!(find_game_directory(dir.path()), Some(nested));
    }

    #[test]
    fn game_directory_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("just/files")).unwrap();
        assert_eq!(find_game_directory(dir.path()), None);
    }

    #[test]
    fn wine_patch_swaps_screen_mode() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());

        patch_user_config(dir.path(), true).unwrap();
        let content = std::fs::read_to_string(dir.path().join("appdata/user.ltx")).unwrap();
        assert!(content.contains("rs_screenmode borderless"));
        assert!(!content.contains("rs_screenmode fullscreen"));
    }

    #[test]
    fn windows_mode_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());

        patch_user_config(dir.path(), false).unwrap();
        let content = std::fs::read_to_string(dir.path().join("appdata/user.ltx")).unwrap();
        assert!(content.contains("rs_screenmode fullscreen"));
    }

    #[test]
    fn overlay_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        scaffold_game_dir(dir.path());
        std::fs::write(dir.path().join("bin/dxgi.dll"), b"x").unwrap();
        std::fs::write(dir.path().join("ReShade.ini"), b"x").unwrap();

        remove_overlay_files(dir.path());
        assert!(!dir.path().join("bin/dxgi.dll").exists());
        assert!(!dir.path().join("ReShade.ini").exists());
    }
}
