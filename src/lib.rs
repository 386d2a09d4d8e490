//! Installer library for the G.A.M.M.A. modpack on S.T.A.L.K.E.R. Anomaly.
//!
//! The UI hands an [`InstallerConfig`] to a [`GammaInstaller`], registers a
//! state observer and calls [`GammaInstaller::install`]; everything else
//! (base game, ModOrganizer, definition repos, the parallel mod pipeline)
//! happens behind that single entry point.

pub mod models;
pub mod services;
pub mod utils;

pub use models::config::InstallerConfig;
pub use models::manifest::{DownloadableMod, MakerList, ModRecord, ModSource, OrderList};
pub use models::state::{InstallationPhase, InstallationState};
pub use services::installer::{detect_wine, CancelHandle, GammaInstaller, StateObserver};

/// Initializes logging for binaries and test harnesses embedding the
/// installer. Use `RUST_LOG` to override (e.g. `RUST_LOG=debug`).
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cfg!(debug_assertions) {
            "debug"
        } else {
            "info"
        },
    ))
    .try_init();
}
