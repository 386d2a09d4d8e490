use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::archive::{ArchiveError, ArchiveExtractor, ExtractProgress};
use crate::models::manifest::ModRecord;
use crate::utils::download::{ByteProgress, DownloadError, DownloadManager};

pub const MO2_RELEASE_BASE_URL: &str =
    "https://github.com/ModOrganizer2/modorganizer/releases/download";

/// Profile the installer creates and activates.
pub const PROFILE_NAME: &str = "G.A.M.M.A";

const MO2_EXECUTABLE: &str = "ModOrganizer.exe";
const REQUIRED_LIBRARIES: [&str; 2] = ["uibase.dll", "helper.dll"];
const PORTABLE_SENTINEL: &str = "portable.txt";

#[derive(Error, Debug)]
pub enum Mo2Error {
    #[error("ModOrganizer download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("ModOrganizer extraction failed: {0}")]
    Extraction(#[from] ArchiveError),
    #[error("ModOrganizer installation failed verification after extraction")]
    VerificationFailed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetches a ModOrganizer release, unpacks it into the modpack root and
/// writes the portable-mode configuration.
pub struct ModOrganizerSetup {
    downloader: DownloadManager,
    extractor: ArchiveExtractor,
}

impl ModOrganizerSetup {
    pub fn new(timeout: Duration, check_hashes: bool) -> Self {
        Self {
            downloader: DownloadManager::new(timeout, check_hashes),
            extractor: ArchiveExtractor::new(),
        }
    }

    /// Release archive URL for a version tag such as "v2.4.4".
    pub fn release_url(version: &str) -> String {
        format!(
            "{}/{}/Mod.Organizer-{}.7z",
            MO2_RELEASE_BASE_URL,
            version,
            version.trim_start_matches('v')
        )
    }

    pub fn verify(mo2_root: &Path) -> bool {
        if !mo2_root.join(MO2_EXECUTABLE).is_file() {
            return false;
        }
        REQUIRED_LIBRARIES
            .iter()
            .all(|library| mo2_root.join(library).is_file())
    }

    pub async fn install(
        &self,
        mo2_root: &Path,
        anomaly_path: &Path,
        cache_path: &Path,
        version: &str,
        download_progress: Option<&ByteProgress>,
        extract_progress: Option<Arc<ExtractProgress>>,
        skip_if_valid: bool,
    ) -> Result<(), Mo2Error> {
        if skip_if_valid && Self::verify(mo2_root) {
            log::info!("Valid ModOrganizer installation found, skipping");
            return Ok(());
        }

        tokio::fs::create_dir_all(cache_path).await?;
        let archive_path = cache_path.join(format!("Mod.Organizer-{}.7z", version));

        log::info!("Downloading ModOrganizer {}", version);
        self.downloader
            .fetch(
                &Self::release_url(version),
                &archive_path,
                None,
                download_progress,
            )
            .await?;

        log::info!("Extracting ModOrganizer to {}", mo2_root.display());
        self.extractor
            .extract(&archive_path, mo2_root, extract_progress)
            .await?;

        if !Self::verify(mo2_root) {
            return Err(Mo2Error::VerificationFailed);
        }

        self.configure(mo2_root, anomaly_path)?;
        log::info!("ModOrganizer installation complete");
        Ok(())
    }

    /// Portable sentinel, profile skeleton and root configuration. All
    /// outputs are deterministic given the inputs.
    pub fn configure(&self, mo2_root: &Path, anomaly_path: &Path) -> Result<(), Mo2Error> {
        std::fs::write(mo2_root.join(PORTABLE_SENTINEL), b"")?;

        let profile_dir = mo2_root.join("profiles").join(PROFILE_NAME);
        std::fs::create_dir_all(&profile_dir)?;
        std::fs::write(profile_dir.join("profile.ini"), profile_ini())?;

        let modlist = profile_dir.join("modlist.txt");
        if !modlist.exists() {
            std::fs::write(&modlist, b"")?;
        }

        std::fs::write(
            mo2_root.join("ModOrganizer.ini"),
            root_ini(anomaly_path),
        )?;
        Ok(())
    }
}

fn profile_ini() -> String {
    "[General]\n\
     LocalSaves=true\n\
     LocalSettings=true\n\
     AutomaticArchiveInvalidation=true\n"
        .to_string()
}

fn root_ini(anomaly_path: &Path) -> String {
    let game_path = anomaly_path
        .canonicalize()
        .unwrap_or_else(|_| anomaly_path.to_path_buf());
    format!(
        "[General]\n\
         gamePath={}\n\
         gameName=S.T.A.L.K.E.R. Anomaly\n\
         selected_profile={}\n\
         language=en\n\
         \n\
         [Settings]\n\
         check_for_updates=false\n\
         compact_downloads=true\n\
         hide_api_counter=true\n",
        game_path.display(),
        PROFILE_NAME
    )
}

/// Writes the ordered enabled-list for the profile. Separators keep their
/// manifest position as `*<name>_separator`; enabled mods that survived the
/// pipeline get `+`, disabled mods `-`, and failed mods are left out.
pub fn write_enabled_list(
    profile_dir: &Path,
    records: &[ModRecord],
    failed: &HashSet<String>,
) -> io::Result<()> {
    let mut lines = String::new();
    for record in records {
        match record {
            ModRecord::Separator { name } => {
                lines.push_str(&format!("*{}_separator\n", name));
            }
            ModRecord::Downloadable(mod_record) => {
                if !mod_record.enabled {
                    lines.push_str(&format!("-{}\n", mod_record.display_name));
                } else if !failed.contains(&mod_record.display_name) {
                    lines.push_str(&format!("+{}\n", mod_record.display_name));
                }
            }
        }
    }

    std::fs::create_dir_all(profile_dir)?;
    std::fs::write(profile_dir.join("modlist.txt"), lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::manifest::MakerList;

    #[test]
    fn release_url_strips_tag_prefix() {
        assert_eq!(
            ModOrganizerSetup::release_url("v2.4.4"),
            "https://github.com/ModOrganizer2/modorganizer/releases/download/v2.4.4/Mod.Organizer-2.4.4.7z"
        );
    }

    #[test]
    fn verify_requires_executable_and_libraries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!ModOrganizerSetup::verify(dir.path()));

        std::fs::write(dir.path().join("ModOrganizer.exe"), b"x").unwrap();
        std::fs::write(dir.path().join("uibase.dll"), b"x").unwrap();
        assert!(!ModOrganizerSetup::verify(dir.path()));

        std::fs::write(dir.path().join("helper.dll"), b"x").unwrap();
        assert!(ModOrganizerSetup::verify(dir.path()));
    }

    #[test]
    fn configure_writes_portable_profile_and_root_ini() {
        let mo2_root = tempfile::tempdir().unwrap();
        let anomaly = tempfile::tempdir().unwrap();

        let setup = ModOrganizerSetup::new(Duration::from_secs(60), true);
        setup.configure(mo2_root.path(), anomaly.path()).unwrap();

        assert!(mo2_root.path().join("portable.txt").exists());
        assert_eq!(
            std::fs::metadata(mo2_root.path().join("portable.txt"))
                .unwrap()
                .len(),
            0
        );

        let profile_dir = mo2_root.path().join("profiles").join(PROFILE_NAME);
        let profile = std::fs::read_to_string(profile_dir.join("profile.ini")).unwrap();
        assert!(profile.contains("LocalSaves=true"));
        assert!(profile.contains("LocalSettings=true"));
        assert!(profile.contains("AutomaticArchiveInvalidation=true"));
        assert!(profile_dir.join("modlist.txt").exists());

        let root = std::fs::read_to_string(mo2_root.path().join("ModOrganizer.ini")).unwrap();
        assert!(root.contains("gameName=S.T.A.L.K.E.R. Anomaly"));
        assert!(root.contains(&format!("selected_profile={}", PROFILE_NAME)));
        assert!(root.contains("check_for_updates=false"));
    }

    #[test]
    fn enabled_list_orders_and_filters_records() {
        let maker = "=== CORE ===\n\
https://www.moddb.com/downloads/start/1\t0\t.zip\tMod A\n\
https://www.moddb.com/downloads/start/2\t0\t.zip\tMod B\n\
https://www.moddb.com/downloads/start/3\t0\t.zip\tMod C\n";
        let order = crate::models::manifest::OrderList::parse("+Mod A\n+Mod B\n-Mod C\n");
        let list = MakerList::parse(maker, Some(&order));

        let failed: HashSet<String> = ["Mod B".to_string()].into();
        let profile = tempfile::tempdir().unwrap();
        write_enabled_list(profile.path(), &list.records, &failed).unwrap();

        let content = std::fs::read_to_string(profile.path().join("modlist.txt")).unwrap();
        assert_eq!(content, "*=== CORE ===_separator\n+Mod A\n-Mod C\n");
    }
}
