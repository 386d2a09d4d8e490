use std::io;
use std::path::Path;
use sysinfo::Disks;
use walkdir::WalkDir;

/// Copies the contents of `source` into `dest`, creating directories as
/// needed. Existing files are overwritten.
pub fn copy_dir_contents(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves a directory into place, preferring an atomic rename and falling
/// back to copy-and-delete when the rename crosses filesystems.
pub fn move_dir(source: &Path, dest: &Path) -> io::Result<()> {
    match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::create_dir_all(dest)?;
            copy_dir_contents(source, dest)?;
            std::fs::remove_dir_all(source)
        }
    }
}

/// Creates `path` if needed and proves it is writable by touching and
/// removing a sentinel file.
pub fn probe_writable(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    let sentinel = path.join(".write_test");
    std::fs::write(&sentinel, b"")?;
    std::fs::remove_file(&sentinel)
}

/// Free bytes on the volume holding `path`, by longest mount-point match.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(src.path().join("gamedata/configs")).unwrap();
        std::fs::write(src.path().join("gamedata/configs/a.ltx"), b"a").unwrap();
        std::fs::write(src.path().join("readme.txt"), b"hi").unwrap();

        copy_dir_contents(src.path(), dst.path()).unwrap();

        assert!(dst.path().join("gamedata/configs/a.ltx").exists());
        assert!(dst.path().join("readme.txt").exists());
    }

    #[test]
    fn copy_overwrites_existing_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::write(src.path().join("file.txt"), b"new").unwrap();
        std::fs::write(dst.path().join("file.txt"), b"old").unwrap();

        copy_dir_contents(src.path(), dst.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("file.txt")).unwrap(),
            "new"
        );
    }

    #[test]
    fn probe_accepts_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fresh");
        probe_writable(&target).unwrap();
        assert!(target.exists());
        assert!(!target.join(".write_test").exists());
    }

    #[test]
    fn moves_directory_into_place() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("staging");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin/game.exe"), b"x").unwrap();

        let dest = root.path().join("final");
        move_dir(&src, &dest).unwrap();

        assert!(!src.exists());
        assert!(dest.join("bin/game.exe").exists());
    }
}
