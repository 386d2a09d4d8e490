use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;

/// Directory that marks game content inside a mod tree.
pub const GAME_CONTENT_DIR: &str = "gamedata";

/// Top-level folders a mod may ship next to (or instead of) `gamedata`.
const MOD_CONTENT_DIRS: [&str; 3] = ["appdata", "db", "gamedata"];

const SEVENZIP_MAGIC: [u8; 6] = [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Unknown,
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("Failed to extract {archive}: {reason}")]
    ExtractionFailed { archive: PathBuf, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress observer fed with `(files_done, total_files)`.
pub type ExtractProgress = dyn Fn(usize, usize) + Send + Sync;

/// Detects the archive format from magic bytes, falling back to the file
/// extension when the magic is ambiguous. Pure in the file bytes + suffix.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, ArchiveError> {
    let mut magic = [0u8; 6];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut magic)?;

    if read >= 2 && &magic[..2] == b"PK" {
        return Ok(ArchiveFormat::Zip);
    }
    if read >= 3 && &magic[..3] == b"Rar" {
        return Ok(ArchiveFormat::Rar);
    }
    if read == 6 && magic == SEVENZIP_MAGIC {
        return Ok(ArchiveFormat::SevenZip);
    }

    let format = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .as_deref()
    {
        Some("zip") => ArchiveFormat::Zip,
        Some("rar") => ArchiveFormat::Rar,
        Some("7z") => ArchiveFormat::SevenZip,
        _ => ArchiveFormat::Unknown,
    };
    Ok(format)
}

/// Extracts ZIP and 7Z archives natively; RAR has no mature native codec, so
/// it falls through to an external `7z` binary when one is on PATH.
pub struct ArchiveExtractor {
    seven_zip_binary: Option<PathBuf>,
}

impl ArchiveExtractor {
    pub fn new() -> Self {
        let seven_zip_binary = which::which("7z").or_else(|_| which::which("7za")).ok();
        if seven_zip_binary.is_none() {
            log::debug!("No external 7z binary on PATH; RAR archives will fail to extract");
        }
        Self { seven_zip_binary }
    }

    /// Extracts `archive` into `dest`, creating it if absent. The progress
    /// observer fires at least once per completed file and exactly once with
    /// `(total, total)` on success.
    pub async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        progress: Option<Arc<ExtractProgress>>,
    ) -> Result<(), ArchiveError> {
        let format = detect_format(archive)?;
        log::debug!(
            "Extracting {} ({:?}) to {}",
            archive.display(),
            format,
            dest.display()
        );

        let archive = archive.to_path_buf();
        let archive_for_err = archive.clone();
        let dest = dest.to_path_buf();
        let seven_zip = self.seven_zip_binary.clone();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)?;
            match format {
                ArchiveFormat::Zip => extract_zip(&archive, &dest, progress.as_deref()),
                ArchiveFormat::SevenZip => extract_7z(&archive, &dest, progress.as_deref()),
                ArchiveFormat::Rar => {
                    extract_with_7z_binary(seven_zip.as_deref(), &archive, &dest, progress.as_deref())
                }
                ArchiveFormat::Unknown => Err(ArchiveError::UnsupportedFormat(archive.clone())),
            }
        })
        .await
        .map_err(|e| ArchiveError::ExtractionFailed {
            archive: archive_for_err,
            reason: format!("extraction task panicked: {}", e),
        })?
    }
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    progress: Option<&ExtractProgress>,
) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ArchiveError::ExtractionFailed {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    let total = zip.len();
    for index in 0..total {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ArchiveError::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: e.to_string(),
            })?;

        let Some(relative) = entry.enclosed_name().map(|p| p.to_owned()) else {
            return Err(ArchiveError::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: format!("entry '{}' escapes the destination", entry.name()),
            });
        };
        let outpath = dest.join(relative);

        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }

        if let Some(progress) = progress {
            progress(index + 1, total);
        }
    }

    // The last loop iteration already reported (total, total); only an empty
    // archive still owes the completion call.
    if total == 0 {
        if let Some(progress) = progress {
            progress(0, 0);
        }
    }
    Ok(())
}

fn extract_7z(
    archive: &Path,
    dest: &Path,
    progress: Option<&ExtractProgress>,
) -> Result<(), ArchiveError> {
    let sevenz_err = |e: sevenz_rust::Error| ArchiveError::ExtractionFailed {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = sevenz_rust::SevenZReader::open(archive, sevenz_rust::Password::empty())
        .map_err(sevenz_err)?;

    let total = reader
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .count();

    let mut done = 0usize;
    reader
        .for_each_entries(|entry, entry_reader| {
            let Some(outpath) = enclosed_entry_path(dest, entry.name()) else {
                return Err(std::io::Error::other(format!(
                    "entry '{}' escapes the destination",
                    entry.name()
                ))
                .into());
            };

            if entry.is_directory() {
                std::fs::create_dir_all(&outpath)?;
                return Ok(true);
            }

            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(entry_reader, &mut outfile)?;

            done += 1;
            if let Some(progress) = progress {
                progress(done, total);
            }
            Ok(true)
        })
        .map_err(sevenz_err)?;

    // Empty archives never reach the per-file report above.
    if total == 0 {
        if let Some(progress) = progress {
            progress(0, 0);
        }
    }
    Ok(())
}

/// Entry names come from the archive; refuse anything that would land
/// outside `dest`.
fn enclosed_entry_path(dest: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        None
    } else {
        Some(dest.join(relative))
    }
}

fn extract_with_7z_binary(
    seven_zip: Option<&Path>,
    archive: &Path,
    dest: &Path,
    progress: Option<&ExtractProgress>,
) -> Result<(), ArchiveError> {
    let Some(seven_zip) = seven_zip else {
        return Err(ArchiveError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason: "no 7z binary found on PATH".to_string(),
        });
    };

    let listed_total = list_7z_file_count(seven_zip, archive);

    let mut out_arg = OsString::from("-o");
    out_arg.push(dest.as_os_str());

    // -bb1 makes the binary print one "- <name>" line per extracted entry.
    let mut child = std::process::Command::new(seven_zip)
        .arg("x")
        .arg("-y")
        .arg("-bb1")
        .arg(out_arg)
        .arg(archive)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut done = 0usize;
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            if !line.starts_with("- ") {
                continue;
            }
            done += 1;
            if let Some(progress) = progress {
                match listed_total {
                    Some(total) => progress(done.min(total), total),
                    None => progress(done, 0),
                }
            }
        }
    }

    let mut stderr_text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut stderr_text)?;
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(ArchiveError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason: stderr_text.trim().to_string(),
        });
    }

    if let Some(progress) = progress {
        let total = listed_total.unwrap_or_else(|| count_files(dest));
        let already_complete = matches!(listed_total, Some(t) if t > 0 && done >= t);
        if !already_complete {
            progress(total, total);
        }
    }
    Ok(())
}

/// Entry count via `7z l -ba`: one row per entry, with 'D' leading the
/// attribute column on directories. `None` when the listing cannot be run
/// or parsed.
fn list_7z_file_count(seven_zip: &Path, archive: &Path) -> Option<usize> {
    let output = std::process::Command::new(seven_zip)
        .arg("l")
        .arg("-ba")
        .arg(archive)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let mut count = 0usize;
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_date), Some(_time), Some(attributes)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !attributes.starts_with('D') {
            count += 1;
        }
    }
    Some(count)
}

fn count_files(dest: &Path) -> usize {
    walkdir::WalkDir::new(dest)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

/// Finds the directory inside an extracted tree that should become the mod
/// root. Rules are evaluated in order; `None` means the layout is ambiguous
/// and the whole tree is taken verbatim.
pub fn detect_mod_root(root: &Path) -> Option<PathBuf> {
    if root.join(GAME_CONTENT_DIR).is_dir() {
        return Some(root.to_path_buf());
    }

    let subdirs: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    if subdirs.len() == 1 && subdirs[0].join(GAME_CONTENT_DIR).is_dir() {
        return Some(subdirs[0].clone());
    }

    if MOD_CONTENT_DIRS
        .iter()
        .any(|name| root.join(name).is_dir())
    {
        return Some(root.to_path_buf());
    }

    None
}
