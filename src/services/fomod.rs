use quick_xml::events::Event;
use quick_xml::Reader;
use std::io;
use std::path::Path;

use crate::utils::fsx;

/// Relative location of the install script inside an extracted archive.
pub const MODULE_CONFIG_RELPATH: &str = "fomod/ModuleConfig.xml";

/// A single source-to-destination copy order from a FOMOD install script.
/// An empty destination means the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FomodDirective {
    pub source: String,
    pub destination: String,
}

/// Reads the install script at `path` and returns its copy directives in
/// document order. Any parse failure yields an empty list; the caller falls
/// back to layout auto-detection.
pub fn parse_module_config(path: &Path) -> Vec<FomodDirective> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Could not read FOMOD config {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match parse_directives(&content) {
        Ok(directives) => directives,
        Err(e) => {
            log::warn!("Invalid FOMOD config {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Collects every `folder` element in the document, wherever it appears.
pub fn parse_directives(xml: &str) -> Result<Vec<FomodDirective>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut directives = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(element) | Event::Empty(element)
                if element.local_name().as_ref() == b"folder" =>
            {
                let mut source = None;
                let mut destination = String::new();
                for attribute in element.attributes().flatten() {
                    let value = attribute.unescape_value()?.into_owned();
                    match attribute.key.local_name().as_ref() {
                        b"source" => source = Some(value),
                        b"destination" => destination = value,
                        _ => {}
                    }
                }
                if let Some(source) = source.filter(|source| !source.is_empty()) {
                    directives.push(FomodDirective {
                        source,
                        destination,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(directives)
}

/// Copies each directive's source folder contents into the install root.
/// Missing sources are reported as warnings, not errors.
pub fn apply_directives(
    directives: &[FomodDirective],
    extracted_root: &Path,
    install_root: &Path,
) -> io::Result<Vec<String>> {
    let mut warnings = Vec::new();

    for directive in directives {
        let source = extracted_root.join(&directive.source);
        let dest = if directive.destination.is_empty() {
            install_root.to_path_buf()
        } else {
            install_root.join(&directive.destination)
        };

        if !source.exists() {
            warnings.push(format!(
                "FOMOD source '{}' not found in archive",
                directive.source
            ));
            continue;
        }

        std::fs::create_dir_all(&dest)?;
        if source.is_dir() {
            fsx::copy_dir_contents(&source, &dest)?;
        } else {
            std::fs::copy(&source, dest.join(source.file_name().unwrap_or_default()))?;
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE_CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<config xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <moduleName>Example</moduleName>
  <requiredInstallFiles>
    <folder source="textures" destination="gamedata/textures" />
    <folder source="configs" destination="gamedata/configs"/>
    <folder source="core" destination="" />
    <folder source="" destination="ignored" />
  </requiredInstallFiles>
</config>"#;

    #[test]
    fn parses_folder_directives_in_order() {
        let directives = parse_directives(MODULE_CONFIG).unwrap();
        assert_eq!(
            directives,
            vec![
                FomodDirective {
                    source: "textures".into(),
                    destination: "gamedata/textures".into()
                },
                FomodDirective {
                    source: "configs".into(),
                    destination: "gamedata/configs".into()
                },
                FomodDirective {
                    source: "core".into(),
                    destination: String::new()
                },
            ]
        );
    }

    #[test]
    fn malformed_xml_yields_no_directives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ModuleConfig.xml");
        std::fs::write(&path, "<config><folder source=\"a\"").unwrap();
        assert!(parse_module_config(&path).is_empty());
    }

    #[test]
    fn applies_directives_and_reports_missing_sources() {
        let extracted = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(extracted.path().join("textures")).unwrap();
        std::fs::write(extracted.path().join("textures/wall.dds"), b"t").unwrap();

        let directives = vec![
            FomodDirective {
                source: "textures".into(),
                destination: "gamedata/textures".into(),
            },
            FomodDirective {
                source: "missing".into(),
                destination: "gamedata/missing".into(),
            },
        ];

        let warnings = apply_directives(&directives, extracted.path(), install.path()).unwrap();
        assert!(install
            .path()
            .join("gamedata/textures/wall.dds")
            .exists());
        assert!(!install.path().join("gamedata/missing").exists());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("missing"));
    }

    #[test]
    fn empty_destination_targets_install_root() {
        let extracted = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(extracted.path().join("core/gamedata")).unwrap();
        std::fs::write(extracted.path().join("core/gamedata/x.ltx"), b"x").unwrap();

        let directives = vec![FomodDirective {
            source: "core".into(),
            destination: String::new(),
        }];

        apply_directives(&directives, extracted.path(), install.path()).unwrap();
        assert!(install.path().join("gamedata/x.ltx").exists());
    }
}
