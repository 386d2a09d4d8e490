use anyhow::anyhow;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::anomaly::{AnomalyInstaller, ANOMALY_ARCHIVE_NAME};
use super::mod_organizer::{self, ModOrganizerSetup, PROFILE_NAME};
use super::mod_pipeline::{ModPipeline, PipelineEvent, PipelineSummary};
use super::repos::{self, DEFINITIONS_REPO_DIR, DEFINITION_REPOS, LARGE_FILES_REPO_DIR};
use crate::models::config::InstallerConfig;
use crate::models::manifest::{MakerList, ModRecord, OrderList};
use crate::models::state::{InstallationPhase, InstallationState};

const REQUIRED_FREE_BYTES: u64 = 100 * 1024 * 1024 * 1024;

const ORDER_LIST_FILENAME: &str = "modlist.txt";
const MAKER_LIST_FILENAME: &str = "modpack_maker_list.txt";
const VERSION_STAMP_FILENAME: &str = "version.txt";

/// Cooperative cancellation shared with pipeline workers; checked between
/// units and before each network round-trip.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer invoked with a consistent snapshot after every state change.
pub type StateObserver = Box<dyn Fn(&InstallationState) + Send + Sync>;

/// State plus observer behind one lock: whoever mutates does so atomically
/// with the notification, so observers never see torn snapshots and never
/// run concurrently.
struct StateHub {
    state: Mutex<InstallationState>,
    observer: Option<StateObserver>,
}

impl StateHub {
    fn update<F: FnOnce(&mut InstallationState)>(&self, apply: F) {
        let mut state = self.state.lock().unwrap();
        apply(&mut state);
        if let Some(observer) = &self.observer {
            observer(&state);
        }
    }

    fn snapshot(&self) -> InstallationState {
        self.state.lock().unwrap().clone()
    }
}

enum Abort {
    Cancelled,
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Abort {
    fn from(error: anyhow::Error) -> Self {
        Self::Fatal(error)
    }
}

/// Wine shows up either through its environment variables or simply by not
/// being on Windows at all.
pub fn detect_wine() -> bool {
    const WINE_VARS: [&str; 4] = ["WINE", "WINEPREFIX", "WINEDLLPATH", "WINELOADER"];
    if WINE_VARS
        .iter()
        .any(|name| std::env::var_os(name).is_some())
    {
        return true;
    }
    !cfg!(target_os = "windows")
}

/// Drives a complete install run through its phases: preflight, base game,
/// mod manager, definition repos, the mod pipeline, patching, configuration
/// and the final version stamp.
pub struct GammaInstaller {
    config: InstallerConfig,
    hub: Arc<StateHub>,
    cancel: CancelHandle,
}

impl GammaInstaller {
    pub fn new(config: InstallerConfig, observer: Option<StateObserver>) -> Self {
        Self {
            config,
            hub: Arc::new(StateHub {
                state: Mutex::new(InstallationState::default()),
                observer,
            }),
            cancel: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> InstallationState {
        self.hub.snapshot()
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Runs the whole installation. Returns `true` on `Completed`; failure
    /// detail is reachable through the final state snapshot.
    pub async fn install(&self) -> bool {
        if let Err(reason) = self.config.validate() {
            self.hub.update(|state| {
                state.errors.push(format!("Invalid configuration: {}", reason));
                state.phase = InstallationPhase::Failed;
            });
            return false;
        }

        self.hub.update(|state| {
            *state = InstallationState::default();
            state.start_time = Some(Utc::now());
        });

        match self.run_phases().await {
            Ok(()) => {
                self.hub.update(|state| {
                    state.end_time = Some(Utc::now());
                    state.phase = InstallationPhase::Completed;
                    state.current_operation = "Installation complete".to_string();
                    state.advance_overall_progress(1.0);
                });
                let state = self.hub.snapshot();
                log::info!(
                    "GAMMA installation complete in {}",
                    InstallationState::format_duration(state.elapsed_seconds())
                );
                true
            }
            Err(Abort::Cancelled) => {
                self.hub.update(|state| {
                    state.end_time = Some(Utc::now());
                    state.phase = InstallationPhase::Cancelled;
                    state.current_operation = "Installation cancelled".to_string();
                });
                log::warn!("GAMMA installation cancelled");
                false
            }
            Err(Abort::Fatal(error)) => {
                self.hub.update(|state| {
                    state.end_time = Some(Utc::now());
                    state.phase = InstallationPhase::Failed;
                    state.errors.push(format!("Installation failed: {}", error));
                });
                log::error!("GAMMA installation failed: {}", error);
                false
            }
        }
    }

    fn set_phase(&self, phase: InstallationPhase, operation: &str, overall: f64) {
        self.hub.update(|state| {
            state.phase = phase;
            state.phase_progress = 0.0;
            state.current_operation = operation.to_string();
            state.advance_overall_progress(overall);
        });
    }

    fn add_error(&self, message: String) {
        log::error!("{}", message);
        self.hub.update(|state| state.errors.push(message.clone()));
    }

    fn add_warning(&self, message: String) {
        log::warn!("{}", message);
        self.hub
            .update(|state| state.warnings.push(message.clone()));
    }

    fn ensure_not_cancelled(&self) -> Result<(), Abort> {
        if self.cancel.is_cancelled() {
            Err(Abort::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_phases(&self) -> Result<(), Abort> {
        let wine_mode = detect_wine();
        log::info!("Starting GAMMA installation (wine mode: {})", wine_mode);

        self.preflight()?;
        self.ensure_not_cancelled()?;

        self.install_base_game(wine_mode).await?;
        self.ensure_not_cancelled()?;

        self.install_mod_manager().await?;
        self.ensure_not_cancelled()?;

        self.sync_definitions().await?;
        self.ensure_not_cancelled()?;

        let (records, summary) = self.run_mod_pipeline().await?;
        if summary.cancelled {
            return Err(Abort::Cancelled);
        }
        if !summary.failed.is_empty() {
            self.add_warning(format!("{} mods failed to install", summary.failed.len()));
        }

        self.apply_modpack_patches(wine_mode)?;
        self.ensure_not_cancelled()?;

        self.configure_mod_manager(&records, &summary)?;
        self.finalize().await?;
        Ok(())
    }

    fn preflight(&self) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::CheckingRequirements,
            "Checking system requirements...",
            0.0,
        );

        let mut failed = false;

        match crate::utils::fsx::available_disk_space(&self.config.modpack_path) {
            Some(free) if free < REQUIRED_FREE_BYTES => {
                self.add_error(format!(
                    "Insufficient disk space: {:.1} GiB free, need at least {} GiB",
                    free as f64 / (1024.0 * 1024.0 * 1024.0),
                    REQUIRED_FREE_BYTES / (1024 * 1024 * 1024)
                ));
                failed = true;
            }
            Some(free) => {
                log::info!(
                    "Disk space OK: {:.1} GiB free",
                    free as f64 / (1024.0 * 1024.0 * 1024.0)
                );
            }
            None => {
                self.add_warning(format!(
                    "Could not determine free space for {}",
                    self.config.modpack_path.display()
                ));
            }
        }

        for (name, path) in [
            ("anomaly_path", &self.config.anomaly_path),
            ("modpack_path", &self.config.modpack_path),
            ("cache_path", &self.config.cache_path),
        ] {
            if let Err(e) = crate::utils::fsx::probe_writable(path) {
                self.add_error(format!("{} is not writable ({}): {}", name, path.display(), e));
                failed = true;
            }
        }

        if !repos::git_available() {
            self.add_error("git is not installed or not in PATH".to_string());
            failed = true;
        }

        if failed {
            return Err(Abort::Fatal(anyhow!("requirements check failed")));
        }
        log::info!("Requirements check passed");
        Ok(())
    }

    async fn install_base_game(&self, wine_mode: bool) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::DownloadingAnomaly,
            "Downloading S.T.A.L.K.E.R. Anomaly 1.5.3...",
            0.05,
        );

        let installer = AnomalyInstaller::new(
            Duration::from_secs(self.config.download_timeout_s),
            self.config.check_hashes,
        );

        let hub = self.hub.clone();
        let download_progress = move |downloaded: u64, total: u64| {
            let ratio = if total > 0 {
                downloaded as f64 / total as f64
            } else {
                0.0
            };
            hub.update(|state| {
                state.current_file = Some(ANOMALY_ARCHIVE_NAME.to_string());
                state.current_file_size = (total > 0).then_some(total);
                state.current_file_progress = ratio;
                state.phase_progress = ratio;
                state.current_operation = format!(
                    "Downloading Anomaly... ({} / {} MB)",
                    downloaded / (1024 * 1024),
                    total / (1024 * 1024)
                );
                state.advance_overall_progress(0.05 + ratio * 0.05);
            });
        };

        let hub = self.hub.clone();
        let extract_progress = move |done: usize, total: usize| {
            let ratio = if total > 0 {
                done as f64 / total as f64
            } else {
                0.0
            };
            hub.update(|state| {
                state.phase = InstallationPhase::ExtractingAnomaly;
                state.phase_progress = ratio;
                state.current_operation =
                    format!("Extracting Anomaly... ({} / {} files)", done, total);
                state.advance_overall_progress(0.10 + ratio * 0.05);
            });
        };

        installer
            .install(
                &self.config.anomaly_path,
                &self.config.cache_path,
                Some(&download_progress),
                Some(Arc::new(extract_progress)),
                true,
                self.config.preserve_user_config,
                wine_mode,
                self.config.delete_external_dlls,
            )
            .await
            .map_err(|e| anyhow!("Base game installation failed: {}", e))?;
        Ok(())
    }

    async fn install_mod_manager(&self) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::DownloadingModManager,
            "Downloading ModOrganizer...",
            0.15,
        );

        let setup = ModOrganizerSetup::new(
            Duration::from_secs(self.config.download_timeout_s),
            self.config.check_hashes,
        );

        let hub = self.hub.clone();
        let version = self.config.mod_manager_version.clone();
        let download_progress = move |downloaded: u64, total: u64| {
            let ratio = if total > 0 {
                downloaded as f64 / total as f64
            } else {
                0.0
            };
            hub.update(|state| {
                state.current_file = Some(format!("Mod.Organizer-{}.7z", version));
                state.current_file_size = (total > 0).then_some(total);
                state.current_file_progress = ratio;
                state.phase_progress = ratio;
                state.current_operation = format!(
                    "Downloading ModOrganizer... ({} / {} MB)",
                    downloaded / (1024 * 1024),
                    total / (1024 * 1024)
                );
                state.advance_overall_progress(0.15 + ratio * 0.03);
            });
        };

        let hub = self.hub.clone();
        let extract_progress = move |done: usize, total: usize| {
            let ratio = if total > 0 {
                done as f64 / total as f64
            } else {
                0.0
            };
            hub.update(|state| {
                state.phase_progress = ratio;
                state.current_operation =
                    format!("Extracting ModOrganizer... ({} / {} files)", done, total);
                state.advance_overall_progress(0.18 + ratio * 0.02);
            });
        };

        setup
            .install(
                &self.config.modpack_path,
                &self.config.anomaly_path,
                &self.config.cache_path,
                &self.config.mod_manager_version,
                Some(&download_progress),
                Some(Arc::new(extract_progress)),
                true,
            )
            .await
            .map_err(|e| anyhow!("Mod manager installation failed: {}", e))?;
        Ok(())
    }

    async fn sync_definitions(&self) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::DownloadingDefinitions,
            "Syncing modpack definitions...",
            0.20,
        );

        let total = DEFINITION_REPOS.len();
        for (index, (name, url)) in DEFINITION_REPOS.iter().enumerate() {
            self.ensure_not_cancelled()?;
            self.hub.update(|state| {
                state.current_operation = format!("Syncing {}...", name);
                state.phase_progress = index as f64 / total as f64;
            });

            repos::sync_repo(
                &self.config.modpack_path,
                name,
                url,
                self.config.force_repo_refetch,
            )
            .await
            .map_err(|e| anyhow!("Repository sync failed: {}", e))?;

            self.hub.update(|state| {
                let done = (index + 1) as f64 / total as f64;
                state.phase_progress = done;
                state.advance_overall_progress(0.20 + done * 0.05);
            });
        }
        Ok(())
    }

    fn manifest_dir(&self) -> PathBuf {
        let repo = self.config.modpack_path.join(DEFINITIONS_REPO_DIR);
        let nested = repo.join("G.A.M.M.A").join("modpack_data");
        if nested.is_dir() {
            nested
        } else {
            repo
        }
    }

    async fn run_mod_pipeline(&self) -> Result<(Vec<ModRecord>, PipelineSummary), Abort> {
        self.set_phase(
            InstallationPhase::DownloadingMods,
            "Parsing mod lists...",
            0.25,
        );

        let manifest_dir = self.manifest_dir();
        let order_path = manifest_dir.join(ORDER_LIST_FILENAME);
        let maker_path = manifest_dir.join(MAKER_LIST_FILENAME);

        let order_content = std::fs::read_to_string(&order_path)
            .map_err(|e| anyhow!("Cannot read {}: {}", order_path.display(), e))?;
        let maker_content = std::fs::read_to_string(&maker_path)
            .map_err(|e| anyhow!("Cannot read {}: {}", maker_path.display(), e))?;

        let order = OrderList::parse(&order_content);
        let maker = MakerList::parse(&maker_content, Some(&order));
        for warning in &maker.warnings {
            self.add_warning(format!("Maker list: {}", warning));
        }

        let total_mods = maker.enabled_downloadables().count();
        log::info!(
            "Parsed {} records, {} enabled mods",
            maker.records.len(),
            total_mods
        );
        self.hub.update(|state| state.total_mods = total_mods);

        let mods_dir = self.config.modpack_path.join("mods");
        std::fs::create_dir_all(&mods_dir)
            .map_err(|e| anyhow!("Cannot create {}: {}", mods_dir.display(), e))?;

        let pipeline = ModPipeline::new(
            Duration::from_secs(self.config.download_timeout_s),
            self.config.check_hashes,
            self.config.parallel_downloads,
            self.config.parallel_extractions,
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pipeline_task = tokio::spawn(pipeline.run(
            maker.records.clone(),
            self.config.cache_path.clone(),
            mods_dir,
            self.config.modpack_path.join(LARGE_FILES_REPO_DIR),
            self.cancel.clone(),
            events_tx,
        ));

        while let Some(event) = events_rx.recv().await {
            self.apply_pipeline_event(event, total_mods);
        }

        let summary = pipeline_task
            .await
            .map_err(|e| anyhow!("Mod pipeline task failed: {}", e))?;
        Ok((maker.records, summary))
    }

    fn apply_pipeline_event(&self, event: PipelineEvent, total_mods: usize) {
        let fraction = |count: usize| {
            if total_mods > 0 {
                count as f64 / total_mods as f64
            } else {
                1.0
            }
        };

        match event {
            PipelineEvent::DownloadStarted { name } => {
                self.hub.update(|state| {
                    state.current_file = Some(name);
                    state.current_file_progress = 0.0;
                    state.current_file_size = None;
                });
            }
            PipelineEvent::DownloadProgress {
                name,
                downloaded,
                total,
            } => {
                self.hub.update(|state| {
                    state.current_file = Some(name);
                    state.current_file_size = (total > 0).then_some(total);
                    state.current_file_progress = if total > 0 {
                        downloaded as f64 / total as f64
                    } else {
                        0.0
                    };
                });
            }
            PipelineEvent::Downloaded { name } => {
                self.hub.update(|state| {
                    state.downloaded_mods += 1;
                    let done = fraction(state.downloaded_mods);
                    state.phase_progress = done;
                    state.current_operation = format!(
                        "Downloaded {} ({}/{})",
                        name, state.downloaded_mods, total_mods
                    );
                    state.advance_overall_progress(0.25 + done * 0.35);
                });
            }
            PipelineEvent::Installed { name } => {
                self.hub.update(|state| {
                    state.phase = InstallationPhase::ExtractingMods;
                    state.installed_mods += 1;
                    let done = fraction(state.installed_mods);
                    state.phase_progress = done;
                    state.current_operation =
                        format!("Installed {} ({}/{})", name, state.installed_mods, total_mods);
                    state.advance_overall_progress(0.60 + done * 0.25);
                });
            }
            PipelineEvent::SeparatorCreated { name } => {
                self.hub.update(|state| {
                    state.current_operation = format!("Created separator {}", name);
                });
            }
            PipelineEvent::ModFailed {
                name,
                stage,
                reason,
            } => {
                self.hub.update(|state| {
                    state.warnings.push(format!(
                        "{} failed during {:?}: {}",
                        name, stage, reason
                    ));
                    state.failed_mods.push(name);
                });
            }
            PipelineEvent::Warning { message } => {
                self.add_warning(message);
            }
        }
    }

    /// Copies the patch overlay shipped in the definitions repo over the
    /// game directory, then re-applies the screen-mode substitution that the
    /// overlay may have clobbered.
    fn apply_modpack_patches(&self, wine_mode: bool) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::PatchingAnomaly,
            "Applying modpack patches...",
            0.85,
        );

        let patches_dir = self
            .config
            .modpack_path
            .join(DEFINITIONS_REPO_DIR)
            .join("G.A.M.M.A")
            .join("modpack_patches");

        if !patches_dir.is_dir() {
            self.add_warning(format!(
                "Patches directory not found at {}",
                patches_dir.display()
            ));
            return Ok(());
        }

        let user_config = self.config.anomaly_path.join("appdata").join("user.ltx");
        if user_config.is_file() {
            std::fs::copy(&user_config, user_config.with_extension("ltx.bak"))
                .map_err(|e| anyhow!("Cannot back up user.ltx: {}", e))?;
        }

        crate::utils::fsx::copy_dir_contents(&patches_dir, &self.config.anomaly_path)
            .map_err(|e| anyhow!("Failed to apply modpack patches: {}", e))?;

        if !self.config.preserve_user_config {
            super::anomaly::patch_user_config(&self.config.anomaly_path, wine_mode)
                .map_err(|e| anyhow!("Failed to patch user.ltx: {}", e))?;
        }

        log::info!("Modpack patches applied");
        Ok(())
    }

    fn configure_mod_manager(
        &self,
        records: &[ModRecord],
        summary: &PipelineSummary,
    ) -> Result<(), Abort> {
        self.set_phase(
            InstallationPhase::ConfiguringModManager,
            "Configuring ModOrganizer...",
            0.88,
        );

        let profile_dir = self.config.modpack_path.join("profiles").join(PROFILE_NAME);
        let failed: HashSet<String> = summary.failed.iter().cloned().collect();

        mod_organizer::write_enabled_list(&profile_dir, records, &failed)
            .map_err(|e| anyhow!("Failed to write mod list: {}", e))?;

        self.hub
            .update(|state| state.advance_overall_progress(0.90));
        Ok(())
    }

    async fn finalize(&self) -> Result<(), Abort> {
        self.set_phase(InstallationPhase::Finalizing, "Writing version stamp...", 0.95);

        let repo_dir = self.config.modpack_path.join(DEFINITIONS_REPO_DIR);
        let version = repos::describe_tag(&repo_dir)
            .await
            .unwrap_or_else(|| "unknown".to_string());

        let stamp_path = self.config.modpack_path.join(VERSION_STAMP_FILENAME);
        std::fs::write(&stamp_path, &version)
            .map_err(|e| anyhow!("Cannot write {}: {}", stamp_path.display(), e))?;

        log::info!("Installed modpack version: {}", version);
        Ok(())
    }
}
