use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Where a downloadable record's bytes come from, classified by URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModSource {
    /// ModDB download page behind the mirror indirection.
    ModDbMirror,
    /// Stable archive URL on a code-hosting site.
    CodeHostArchive,
    /// Archive shipped inside the cloned large-files repository.
    LargeFileRepo,
}

impl ModSource {
    pub fn classify(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        if lower.contains("moddb") {
            Some(Self::ModDbMirror)
        } else if lower.contains("github") {
            Some(Self::CodeHostArchive)
        } else if lower.contains("gamma_large_files") {
            Some(Self::LargeFileRepo)
        } else {
            None
        }
    }
}

/// A mod that has to be fetched and laid out under the mods root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadableMod {
    pub url: String,
    /// "0" for no special directives, else colon-separated source folders.
    pub instructions: String,
    /// Archive extension hint (".zip", ".rar", ".7z") or empty.
    pub patch_suffix: String,
    /// Display name with author, also the mod directory name.
    pub display_name: String,
    pub info_url: Option<String>,
    pub archive_filename: Option<String>,
    pub expected_md5: Option<String>,
    pub source: ModSource,
    pub enabled: bool,
}

impl DownloadableMod {
    /// Filename the archive is cached (or shipped) under.
    pub fn archive_name(&self) -> String {
        self.archive_filename
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                self.url
                    .rsplit('/')
                    .next()
                    .unwrap_or(self.url.as_str())
                    .to_string()
            })
    }

    /// Cached archive location for this record.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.archive_name())
    }

    pub fn has_instructions(&self) -> bool {
        !self.instructions.is_empty() && self.instructions != "0"
    }

    /// Source folders named by the instruction string.
    pub fn instruction_folders(&self) -> Vec<&str> {
        self.instructions
            .split(':')
            .map(str::trim)
            .filter(|folder| !folder.is_empty())
            .collect()
    }

    /// meta.ini content consumed by ModOrganizer.
    pub fn meta_ini(&self) -> String {
        format!(
            "[General]\n\
             gameName=stalkeranomaly\n\
             modid=0\n\
             ignoredversion={name}\n\
             version={name}\n\
             installationFile={name}\n\
             url={url}\n\
             hasCustomURL=true\n\
             color=@Variant(\\0\\0\\0\\x43\\0\\xff\\xff\\0\\0\\0\\0\\0\\0\\0\\0)\n\
             tracked=0\n\
             \n\
             [installedFiles]\n\
             1\\modid=0\n\
             1\\fileid=0\n\
             size=1\n",
            name = self.display_name,
            url = self.info_url.as_deref().unwrap_or(&self.url),
        )
    }
}

/// One line of the maker list: either a visual separator or a mod to install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModRecord {
    Separator { name: String },
    Downloadable(DownloadableMod),
}

impl ModRecord {
    pub fn display_name(&self) -> &str {
        match self {
            Self::Separator { name } => name,
            Self::Downloadable(mod_record) => &mod_record.display_name,
        }
    }

    pub fn is_separator(&self) -> bool {
        matches!(self, Self::Separator { .. })
    }

    /// Re-emits the record in the maker-list grammar. Parsing the result
    /// yields an equal record.
    pub fn to_tsv_line(&self) -> String {
        match self {
            Self::Separator { name } => name.clone(),
            Self::Downloadable(mod_record) => {
                let mut fields = vec![
                    mod_record.url.clone(),
                    mod_record.instructions.clone(),
                    mod_record.patch_suffix.clone(),
                    mod_record.display_name.clone(),
                ];
                let trailing = [
                    mod_record.info_url.clone(),
                    mod_record.archive_filename.clone(),
                    mod_record.expected_md5.clone(),
                ];
                // Optional fields are positional; keep earlier ones (as empty)
                // whenever a later one is present.
                if let Some(last) = trailing.iter().rposition(Option::is_some) {
                    for field in trailing.iter().take(last + 1) {
                        fields.push(field.clone().unwrap_or_default());
                    }
                }
                fields.join("\t")
            }
        }
    }
}

/// Separator directory name under the mods root, e.g. `003-Weapons_separator`.
pub fn separator_dir_name(index: usize, name: &str) -> String {
    format!("{:03}-{}_separator", index, name)
}

/// meta.ini content marking a directory as a ModOrganizer separator.
pub fn separator_meta_ini() -> String {
    "[General]\n\
     gameName=stalkeranomaly\n\
     modid=0\n\
     version=\n\
     newestVersion=\n\
     category=-1\n\
     installationFile=\n\
     repository=\n"
        .to_string()
}

/// Enabled/disabled flags and separator order from the order list
/// (`modlist.txt` inside the definitions repository).
#[derive(Debug, Clone, Default)]
pub struct OrderList {
    pub enabled: HashSet<String>,
    pub separators: Vec<String>,
}

impl OrderList {
    pub fn parse(content: &str) -> Self {
        let mut list = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('+') {
                list.enabled.insert(name.trim().to_string());
            } else if let Some(name) = line.strip_prefix('*') {
                list.separators.push(name.trim().to_string());
            }
            // '-' lines and anything unrecognized carry no flags to collect.
        }
        list
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Parsed maker list plus the per-line diagnostics that did not abort the
/// parse.
#[derive(Debug, Clone, Default)]
pub struct MakerList {
    pub records: Vec<ModRecord>,
    pub warnings: Vec<String>,
}

impl MakerList {
    /// Parses the tab-separated maker list. `order` resolves enabled flags;
    /// without it every downloadable record is enabled (full install).
    pub fn parse(content: &str, order: Option<&OrderList>) -> Self {
        let mut list = Self::default();

        for (line_number, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            match parse_maker_line(line, order) {
                Ok(ParsedLine {
                    record,
                    extra_fields,
                }) => {
                    if extra_fields > 0 {
                        list.warnings.push(format!(
                            "line {}: ignoring {} unrecognized trailing field(s) for '{}'",
                            line_number + 1,
                            extra_fields,
                            record.display_name()
                        ));
                    }
                    list.records.push(record);
                }
                Err(reason) => {
                    list.warnings
                        .push(format!("line {}: {}", line_number + 1, reason));
                }
            }
        }

        list
    }

    pub fn enabled_downloadables(&self) -> impl Iterator<Item = &DownloadableMod> {
        self.records.iter().filter_map(|record| match record {
            ModRecord::Downloadable(mod_record) if mod_record.enabled => Some(mod_record),
            _ => None,
        })
    }
}

struct ParsedLine {
    record: ModRecord,
    extra_fields: usize,
}

fn parse_maker_line(line: &str, order: Option<&OrderList>) -> Result<ParsedLine, String> {
    let fields: Vec<&str> = line.split('\t').collect();

    if fields.len() == 1 {
        return Ok(ParsedLine {
            record: ModRecord::Separator {
                name: fields[0].trim().to_string(),
            },
            extra_fields: 0,
        });
    }

    let url = fields[0].trim().to_string();
    let source =
        ModSource::classify(&url).ok_or_else(|| format!("unknown mod source for URL '{}'", url))?;

    let optional = |index: usize| -> Option<String> {
        fields
            .get(index)
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
    };

    let display_name = fields
        .get(3)
        .map(|field| field.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("record for '{}' has no display name", url))?;

    let enabled = match order {
        Some(order) => order.is_enabled(&display_name),
        None => true,
    };

    Ok(ParsedLine {
        record: ModRecord::Downloadable(DownloadableMod {
            url,
            instructions: fields.get(1).map(|f| f.trim()).unwrap_or("0").to_string(),
            patch_suffix: fields.get(2).map(|f| f.trim()).unwrap_or("").to_string(),
            display_name,
            info_url: optional(4),
            archive_filename: optional(5),
            expected_md5: optional(6).map(|hash| hash.to_lowercase()),
            source,
            enabled,
        }),
        extra_fields: fields.len().saturating_sub(7),
    })
}
