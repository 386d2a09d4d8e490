use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use walkdir::WalkDir;

use super::archive::{detect_mod_root, ArchiveExtractor};
use super::fomod;
use super::installer::CancelHandle;
use super::moddb::ModDbClient;
use crate::models::manifest::{
    separator_dir_name, separator_meta_ini, DownloadableMod, ModRecord, ModSource,
};
use crate::utils::download::DownloadManager;
use crate::utils::fsx;
use crate::utils::hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Download,
    Install,
}

/// Progress and outcome notifications sent to the coordinator, which owns
/// the installation state. Workers never touch the state themselves.
#[derive(Debug)]
pub enum PipelineEvent {
    DownloadStarted {
        name: String,
    },
    DownloadProgress {
        name: String,
        downloaded: u64,
        total: u64,
    },
    Downloaded {
        name: String,
    },
    Installed {
        name: String,
    },
    SeparatorCreated {
        name: String,
    },
    ModFailed {
        name: String,
        stage: PipelineStage,
        reason: String,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub downloaded: usize,
    pub installed: usize,
    pub separators: usize,
    pub failed: Vec<String>,
    pub cancelled: bool,
}

enum FetchOutcome {
    Fetched(DownloadableMod, PathBuf),
    Failed(String),
    Skipped,
}

enum InstallOutcome {
    Installed,
    Failed(String),
    Skipped,
}

/// Two bounded fan-out stages (downloads, then extract-and-install) followed
/// by sequential separator materialisation. One mod failing never aborts the
/// run; failures are reported per record.
#[derive(Clone)]
pub struct ModPipeline {
    moddb: Arc<ModDbClient>,
    downloader: Arc<DownloadManager>,
    extractor: Arc<ArchiveExtractor>,
    parallel_downloads: usize,
    parallel_extractions: usize,
    check_hashes: bool,
}

impl ModPipeline {
    pub fn new(
        timeout: Duration,
        check_hashes: bool,
        parallel_downloads: usize,
        parallel_extractions: usize,
    ) -> Self {
        Self {
            moddb: Arc::new(ModDbClient::new(timeout, check_hashes)),
            downloader: Arc::new(DownloadManager::new(timeout, check_hashes)),
            extractor: Arc::new(ArchiveExtractor::new()),
            parallel_downloads: parallel_downloads.max(1),
            parallel_extractions: parallel_extractions.max(1),
            check_hashes,
        }
    }

    pub async fn run(
        self,
        records: Vec<ModRecord>,
        cache_dir: PathBuf,
        mods_dir: PathBuf,
        large_files_dir: PathBuf,
        cancel: CancelHandle,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> PipelineSummary {
        let mut summary = PipelineSummary::default();

        let downloadable: Vec<DownloadableMod> = records
            .iter()
            .filter_map(|record| match record {
                ModRecord::Downloadable(mod_record) if mod_record.enabled => {
                    Some(mod_record.clone())
                }
                _ => None,
            })
            .collect();

        log::info!(
            "Pipeline: {} mods to download ({} workers), {} extract workers",
            downloadable.len(),
            self.parallel_downloads,
            self.parallel_extractions
        );

        // Stage 1: downloads.
        let download_permits = Arc::new(Semaphore::new(self.parallel_downloads));
        let fetches = downloadable.into_iter().map(|mod_record| {
            let permits = download_permits.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            let pipeline = self.clone();
            let cache_dir = cache_dir.clone();
            let large_files_dir = large_files_dir.clone();

            async move {
                let _permit = permits.acquire().await.unwrap();
                if cancel.is_cancelled() {
                    return FetchOutcome::Skipped;
                }
                let name = mod_record.display_name.clone();
                let _ = events.send(PipelineEvent::DownloadStarted { name: name.clone() });

                match pipeline
                    .fetch_one(&mod_record, &cache_dir, &large_files_dir, &events)
                    .await
                {
                    Ok(archive) => {
                        let _ = events.send(PipelineEvent::Downloaded { name });
                        FetchOutcome::Fetched(mod_record, archive)
                    }
                    Err(reason) => {
                        log::error!("Failed to download {}: {}", name, reason);
                        let _ = events.send(PipelineEvent::ModFailed {
                            name: name.clone(),
                            stage: PipelineStage::Download,
                            reason,
                        });
                        FetchOutcome::Failed(name)
                    }
                }
            }
        });

        let mut fetched = Vec::new();
        for outcome in join_all(fetches).await {
            match outcome {
                FetchOutcome::Fetched(mod_record, archive) => fetched.push((mod_record, archive)),
                FetchOutcome::Failed(name) => summary.failed.push(name),
                FetchOutcome::Skipped => {}
            }
        }
        summary.downloaded = fetched.len();

        // Stage 2: extraction and installation.
        let install_permits = Arc::new(Semaphore::new(self.parallel_extractions));
        let installs = fetched.into_iter().map(|(mod_record, archive)| {
            let permits = install_permits.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            let pipeline = self.clone();
            let mods_dir = mods_dir.clone();

            async move {
                let _permit = permits.acquire().await.unwrap();
                if cancel.is_cancelled() {
                    return InstallOutcome::Skipped;
                }
                let name = mod_record.display_name.clone();

                match pipeline
                    .install_one(&mod_record, &archive, &mods_dir, &events)
                    .await
                {
                    Ok(()) => {
                        let _ = events.send(PipelineEvent::Installed { name });
                        InstallOutcome::Installed
                    }
                    Err(reason) => {
                        log::error!("Failed to install {}: {}", name, reason);
                        let _ = events.send(PipelineEvent::ModFailed {
                            name: name.clone(),
                            stage: PipelineStage::Install,
                            reason,
                        });
                        InstallOutcome::Failed(name)
                    }
                }
            }
        });

        for outcome in join_all(installs).await {
            match outcome {
                InstallOutcome::Installed => summary.installed += 1,
                InstallOutcome::Failed(name) => summary.failed.push(name),
                InstallOutcome::Skipped => {}
            }
        }

        // Stage 3: separators, in manifest order.
        let separators: Vec<String> = records
            .iter()
            .filter_map(|record| match record {
                ModRecord::Separator { name } => Some(name.clone()),
                _ => None,
            })
            .collect();

        for (index, name) in separators.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            match create_separator(&mods_dir, index, &name) {
                Ok(()) => {
                    summary.separators += 1;
                    let _ = events.send(PipelineEvent::SeparatorCreated { name });
                }
                Err(e) => {
                    let _ = events.send(PipelineEvent::ModFailed {
                        name: name.clone(),
                        stage: PipelineStage::Install,
                        reason: e.to_string(),
                    });
                    summary.failed.push(name);
                }
            }
        }

        summary.cancelled = cancel.is_cancelled();
        summary
    }

    /// Produces a local archive for the record: via ModDB scraping, a direct
    /// fetch, or a lookup in the large-files checkout. Returns the path the
    /// install stage should extract.
    async fn fetch_one(
        &self,
        mod_record: &DownloadableMod,
        cache_dir: &Path,
        large_files_dir: &Path,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<PathBuf, String> {
        let dest = mod_record.cache_path(cache_dir);
        let name = mod_record.display_name.clone();
        let events = events.clone();
        let progress = move |downloaded: u64, total: u64| {
            let _ = events.send(PipelineEvent::DownloadProgress {
                name: name.clone(),
                downloaded,
                total,
            });
        };

        match mod_record.source {
            ModSource::ModDbMirror => self
                .moddb
                .fetch_mod(
                    mod_record.info_url.as_deref(),
                    &mod_record.url,
                    &dest,
                    mod_record.expected_md5.as_deref(),
                    Some(&progress),
                )
                .await
                .map_err(|e| e.to_string())?,
            ModSource::CodeHostArchive => self
                .downloader
                .fetch(
                    &mod_record.url,
                    &dest,
                    mod_record.expected_md5.as_deref(),
                    Some(&progress),
                )
                .await
                .map_err(|e| e.to_string())?,
            ModSource::LargeFileRepo => {
                return self.resolve_large_file(mod_record, large_files_dir).await;
            }
        }

        Ok(dest)
    }

    /// Large-file records ship inside the cloned repository instead of being
    /// downloaded; find the archive there by filename.
    async fn resolve_large_file(
        &self,
        mod_record: &DownloadableMod,
        large_files_dir: &Path,
    ) -> Result<PathBuf, String> {
        let filename = mod_record.archive_name();
        let found = WalkDir::new(large_files_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .find(|entry| entry.file_name().to_string_lossy() == filename)
            .map(|entry| entry.into_path())
            .ok_or_else(|| {
                format!(
                    "archive '{}' not found in {}",
                    filename,
                    large_files_dir.display()
                )
            })?;

        if self.check_hashes {
            if let Some(expected) = mod_record.expected_md5.as_deref() {
                let matches = hash::verify_md5(&found, expected)
                    .await
                    .map_err(|e| e.to_string())?;
                if !matches {
                    // The checkout is the user's data; report, don't delete.
                    return Err(format!("hash mismatch for {}", found.display()));
                }
            }
        }

        Ok(found)
    }

    async fn install_one(
        &self,
        mod_record: &DownloadableMod,
        archive: &Path,
        mods_dir: &Path,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<(), String> {
        let scratch = tempfile::tempdir().map_err(|e| e.to_string())?;
        self.extractor
            .extract(archive, scratch.path(), None)
            .await
            .map_err(|e| e.to_string())?;

        let mod_dir = mods_dir.join(&mod_record.display_name);
        let record = mod_record.clone();
        let extracted_root = scratch.path().to_path_buf();
        let target = mod_dir.clone();

        let warnings =
            tokio::task::spawn_blocking(move || apply_install_strategy(&record, &extracted_root, &target))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;

        for message in warnings {
            let _ = events.send(PipelineEvent::Warning { message });
        }

        std::fs::write(mod_dir.join("meta.ini"), mod_record.meta_ini()).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Picks the installation strategy in fixed order: FOMOD directives, then
/// the instruction string, then layout auto-detection (whole tree verbatim
/// when the layout is ambiguous).
fn apply_install_strategy(
    mod_record: &DownloadableMod,
    extracted_root: &Path,
    mod_dir: &Path,
) -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(mod_dir)?;

    let module_config = extracted_root.join(fomod::MODULE_CONFIG_RELPATH);
    if module_config.is_file() {
        let directives = fomod::parse_module_config(&module_config);
        if !directives.is_empty() {
            log::debug!(
                "Installing {} from {} FOMOD directives",
                mod_record.display_name,
                directives.len()
            );
            return fomod::apply_directives(&directives, extracted_root, mod_dir);
        }
        // An unreadable or empty script falls through to auto-detection.
    }

    if mod_record.has_instructions() {
        let mut warnings = Vec::new();
        for folder in mod_record.instruction_folders() {
            let source = extracted_root.join(folder);
            if !source.is_dir() {
                warnings.push(format!(
                    "{}: instruction folder '{}' not found in archive",
                    mod_record.display_name, folder
                ));
                continue;
            }
            fsx::copy_dir_contents(&source, mod_dir)?;
        }
        return Ok(warnings);
    }

    let source = detect_mod_root(extracted_root).unwrap_or_else(|| extracted_root.to_path_buf());
    fsx::copy_dir_contents(&source, mod_dir)?;
    Ok(Vec::new())
}

fn create_separator(mods_dir: &Path, index: usize, name: &str) -> std::io::Result<()> {
    let dir = mods_dir.join(separator_dir_name(index, name));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("meta.ini"), separator_meta_ini())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::manifest::MakerList;
    use std::io::Write;

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn downloadable(name: &str, instructions: &str, archive: &str) -> DownloadableMod {
        DownloadableMod {
            url: "https://www.moddb.com/downloads/start/1".into(),
            instructions: instructions.into(),
            patch_suffix: ".zip".into(),
            display_name: name.into(),
            info_url: None,
            archive_filename: Some(archive.into()),
            expected_md5: None,
            source: ModSource::ModDbMirror,
            enabled: true,
        }
    }

    fn pipeline() -> ModPipeline {
        ModPipeline::new(Duration::from_secs(60), true, 2, 1)
    }

    #[tokio::test]
    async fn cached_mod_installs_without_network() {
        // S2: the archive is already in the cache with a matching digest, so
        // the run needs no HTTP at all.
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let archive = cache.path().join("mod_a.zip");
        make_zip(
            &archive,
            &[("gamedata/", b"" as &[u8]), ("gamedata/a.ltx", b"a")],
        );
        let digest = crate::utils::hash::compute_md5(&archive).await.unwrap();

        let mut record = downloadable("Mod A - Author", "0", "mod_a.zip");
        record.expected_md5 = Some(digest);
        let records = vec![ModRecord::Downloadable(record)];

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                records,
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.installed, 1);
        assert!(summary.failed.is_empty());
        assert!(mods.path().join("Mod A - Author/gamedata/a.ltx").exists());
        let meta =
            std::fs::read_to_string(mods.path().join("Mod A - Author/meta.ini")).unwrap();
        assert!(meta.contains("version=Mod A - Author"));

        let mut saw_installed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PipelineEvent::Installed { .. }) {
                saw_installed = true;
            }
        }
        assert!(saw_installed);
    }

    #[tokio::test]
    async fn separator_only_manifest_materialises_directories() {
        // S1: no downloads, just indexed separator directories.
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let list = MakerList::parse("=== CORE ===\n=== UI ===\n", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                list.records,
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.installed, 0);
        assert_eq!(summary.separators, 2);
        assert!(mods
            .path()
            .join("000-=== CORE ===_separator/meta.ini")
            .exists());
        assert!(mods
            .path()
            .join("001-=== UI ===_separator/meta.ini")
            .exists());
    }

    #[tokio::test]
    async fn instruction_strategy_copies_named_folders_only() {
        // S3: only addon1 and addon2 end up in the mod directory.
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let archive = cache.path().join("mod_c.zip");
        make_zip(
            &archive,
            &[
                ("addon1/gamedata/a.ltx", b"a" as &[u8]),
                ("addon2/gamedata/b.ltx", b"b"),
                ("notes/readme.txt", b"n"),
            ],
        );

        let record = downloadable("Mod C", "addon1:addon2", "mod_c.zip");
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                vec![ModRecord::Downloadable(record)],
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.installed, 1);
        let mod_dir = mods.path().join("Mod C");
        assert!(mod_dir.join("gamedata/a.ltx").exists());
        assert!(mod_dir.join("gamedata/b.ltx").exists());
        assert!(!mod_dir.join("notes").exists());
        assert!(!mod_dir.join("addon1").exists());
    }

    #[tokio::test]
    async fn fomod_strategy_overrides_auto_detection() {
        // S4: directives place folders under gamedata/ even though the
        // archive layout alone would not.
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let module_config = r#"<config>
  <requiredInstallFiles>
    <folder source="textures" destination="gamedata/textures"/>
    <folder source="configs" destination="gamedata/configs"/>
  </requiredInstallFiles>
</config>"#;

        let archive = cache.path().join("mod_d.zip");
        make_zip(
            &archive,
            &[
                ("fomod/ModuleConfig.xml", module_config.as_bytes()),
                ("textures/wall.dds", b"t" as &[u8]),
                ("configs/weapon.ltx", b"c"),
            ],
        );

        let record = downloadable("Mod D", "0", "mod_d.zip");
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                vec![ModRecord::Downloadable(record)],
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.installed, 1);
        let mod_dir = mods.path().join("Mod D");
        assert!(mod_dir.join("gamedata/textures/wall.dds").exists());
        assert!(mod_dir.join("gamedata/configs/weapon.ltx").exists());
        // The raw archive folders were not copied verbatim.
        assert!(!mod_dir.join("fomod").exists());
        assert!(!mod_dir.join("textures").exists());
    }

    #[tokio::test]
    async fn ambiguous_layout_copies_whole_tree() {
        // S6: neither folder holds gamedata, so the tree is taken verbatim.
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let archive = cache.path().join("mod_e.zip");
        make_zip(
            &archive,
            &[
                ("folder1/data.txt", b"1" as &[u8]),
                ("folder2/data.txt", b"2"),
            ],
        );

        let record = downloadable("Mod E", "0", "mod_e.zip");
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                vec![ModRecord::Downloadable(record)],
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.installed, 1);
        assert!(mods.path().join("Mod E/folder1/data.txt").exists());
        assert!(mods.path().join("Mod E/folder2/data.txt").exists());
    }

    #[tokio::test]
    async fn large_file_records_resolve_from_checkout() {
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let shipped = large.path().join("weapons/pack.zip");
        std::fs::create_dir_all(shipped.parent().unwrap()).unwrap();
        make_zip(&shipped, &[("gamedata/w.ltx", b"w" as &[u8])]);

        let mut record = downloadable("Weapon Pack", "0", "pack.zip");
        record.url = "https://github.com/Grokitach/gamma_large_files_v2".into();
        record.source = ModSource::LargeFileRepo;

        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                vec![ModRecord::Downloadable(record)],
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.installed, 1);
        assert!(mods.path().join("Weapon Pack/gamedata/w.ltx").exists());
        // The shipped archive stays where the checkout put it.
        assert!(shipped.exists());
    }

    #[tokio::test]
    async fn missing_large_file_is_a_per_mod_failure() {
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let mut record = downloadable("Ghost Pack", "0", "ghost.zip");
        record.url = "https://github.com/Grokitach/gamma_large_files_v2".into();
        record.source = ModSource::LargeFileRepo;

        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                vec![ModRecord::Downloadable(record)],
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                CancelHandle::new(),
                tx,
            )
            .await;

        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.installed, 0);
        assert_eq!(summary.failed, vec!["Ghost Pack".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_pipeline_skips_work() {
        let cache = tempfile::tempdir().unwrap();
        let mods = tempfile::tempdir().unwrap();
        let large = tempfile::tempdir().unwrap();

        let cancel = CancelHandle::new();
        cancel.cancel();

        let list = MakerList::parse("=== CORE ===\n", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = pipeline()
            .run(
                list.records,
                cache.path().to_path_buf(),
                mods.path().to_path_buf(),
                large.path().to_path_buf(),
                cancel,
                tx,
            )
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.separators, 0);
    }
}
