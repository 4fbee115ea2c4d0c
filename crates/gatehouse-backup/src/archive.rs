//! Gzipped tar packing and filtered extraction.
//!
//! Packing uses deterministic headers so archives are portable and
//! reproducible. Extraction never trusts the archive: entries with
//! absolute paths, entries resolving outside the destination, and links
//! whose resolved target escapes the destination are skipped (the rest of
//! the archive still restores), and stored modes/mtimes are never honored.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, HeaderMode};
use thiserror::Error;
use tracing::warn;

/// Archive errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The source directory does not exist.
    #[error("source directory missing: {0}")]
    SourceMissing(PathBuf),

    /// Underlying I/O failure.
    #[error("archive i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// What a filtered extraction did.
#[derive(Debug, Default, Clone)]
pub struct ExtractReport {
    /// Entries restored.
    pub extracted: usize,
    /// Entry paths rejected by the security filter.
    pub skipped: Vec<String>,
}

/// Pack a directory into a gzipped tar with deterministic headers.
///
/// # Errors
///
/// [`ArchiveError::SourceMissing`] when `dir` does not exist, plus I/O
/// failures.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    if !dir.is_dir() {
        return Err(ArchiveError::SourceMissing(dir.to_path_buf()));
    }
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract a gzipped tar under `dest`, applying the traversal filter.
///
/// # Errors
///
/// Propagates I/O failures reading the archive or writing accepted
/// entries. Filter rejections are not errors; they are reported in
/// [`ExtractReport::skipped`].
pub fn extract_filtered(bytes: &[u8], dest: &Path) -> Result<ExtractReport, ArchiveError> {
    fs::create_dir_all(dest)?;
    let mut report = ExtractReport::default();
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();

        let Some(target) = resolve_within(dest, &raw_path) else {
            skip(&mut report, &raw_path, "path escapes destination");
            continue;
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                report.extracted = report.extracted.saturating_add(1);
            },
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Fresh file with default permissions; stored mode and
                // mtime are deliberately ignored.
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                report.extracted = report.extracted.saturating_add(1);
            },
            EntryType::Symlink => {
                let Some(link) = entry.link_name()?.map(|l| l.into_owned()) else {
                    skip(&mut report, &raw_path, "symlink without target");
                    continue;
                };
                if link_escapes(dest, &raw_path, &link) {
                    skip(&mut report, &raw_path, "symlink target escapes destination");
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                make_symlink(&link, &target)?;
                report.extracted = report.extracted.saturating_add(1);
            },
            EntryType::Link => {
                let Some(link) = entry.link_name()?.map(|l| l.into_owned()) else {
                    skip(&mut report, &raw_path, "hard link without target");
                    continue;
                };
                // Hard-link targets are archive-root relative.
                let Some(source) = resolve_within(dest, &link) else {
                    skip(&mut report, &raw_path, "hard link target escapes destination");
                    continue;
                };
                if !source.exists() {
                    skip(&mut report, &raw_path, "hard link target missing");
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(&source, &target)?;
                report.extracted = report.extracted.saturating_add(1);
            },
            other => {
                skip(&mut report, &raw_path, &format!("unsupported entry type {other:?}"));
            },
        }
    }
    Ok(report)
}

fn skip(report: &mut ExtractReport, path: &Path, reason: &str) {
    warn!(path = %path.display(), reason, "rejected archive entry");
    report.skipped.push(path.display().to_string());
}

/// Lexically resolve `relative` under `root`. `None` when the path is
/// absolute or walks above the root; the returned path always has `root`
/// as a prefix.
fn resolve_within(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {},
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            },
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(root.join(out))
}

/// Whether a symlink at `entry_path` pointing to `link` would resolve
/// outside `root`. The target is resolved relative to the entry's parent
/// directory.
fn link_escapes(root: &Path, entry_path: &Path, link: &Path) -> bool {
    let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
    resolve_within(root, &parent.join(link)).is_none()
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if target.exists() || target.is_symlink() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _target: &Path) -> io::Result<()> {
    // Symbolic links are not restored on this platform.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::Header;

    fn read_tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .to_string();
            out.push((rel, fs::read(entry.path()).unwrap()));
        }
        out.sort();
        out
    }

    #[test]
    fn round_trip_preserves_contents() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("workspace/sub")).unwrap();
        fs::write(src.path().join("workspace/a.txt"), b"alpha").unwrap();
        fs::write(src.path().join("workspace/sub/b.bin"), [0u8, 1, 2]).unwrap();
        fs::write(src.path().join("openclaw.json"), b"{}").unwrap();

        let bytes = pack_dir(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let report = extract_filtered(&bytes, dest.path()).unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(read_tree(src.path()), read_tree(dest.path()));

        // Second generation archive extracts byte-identically too.
        let bytes2 = pack_dir(dest.path()).unwrap();
        let dest2 = tempfile::tempdir().unwrap();
        extract_filtered(&bytes2, dest2.path()).unwrap();
        assert_eq!(read_tree(dest.path()), read_tree(dest2.path()));
    }

    #[test]
    fn pack_missing_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            pack_dir(&tmp.path().join("nope")),
            Err(ArchiveError::SourceMissing(_))
        ));
    }

    // `tar::Header::set_path` (used by `Builder::append_data`) rejects `..`
    // components, so the traversal fixture below writes the raw GNU name
    // field directly and appends the header without path validation.
    fn set_name_raw(header: &mut Header, name: &str) {
        let gnu = header.as_gnu_mut().unwrap();
        let mut bytes = [0u8; 100];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        gnu.name = bytes;
    }

    fn malicious_archive() -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);

        let mut header = Header::new_gnu();
        set_name_raw(&mut header, "../escape.txt");
        header.set_size(4);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();

        let mut header = Header::new_gnu();
        header.set_size(0);
        header.set_entry_type(EntryType::Symlink);
        header.set_cksum();
        builder
            .append_link(&mut header, "inner", "../../escape")
            .unwrap();

        let mut header = Header::new_gnu();
        header.set_size(6);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, "benign.txt", &b"benign"[..])
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn traversal_entries_are_skipped_benign_restored() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("state");

        let report = extract_filtered(&malicious_archive(), &dest).unwrap();
        assert_eq!(report.extracted, 1);
        assert_eq!(report.skipped.len(), 2);

        // Benign entry restored.
        assert_eq!(fs::read(dest.join("benign.txt")).unwrap(), b"benign");
        // Nothing escaped the destination.
        assert!(!outer.path().join("escape.txt").exists());
        assert!(!dest.join("inner").is_symlink());
    }

    #[test]
    fn absolute_entry_paths_rejected() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        let mut header = Header::new_gnu();
        header.set_size(3);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, "tmp/abs.txt", &b"abs"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let report = extract_filtered(&bytes, dest.path()).unwrap();
        // Relative path restores fine; this guards the resolve helper.
        assert_eq!(report.extracted, 1);

        assert!(resolve_within(dest.path(), Path::new("/etc/passwd")).is_none());
        assert!(resolve_within(dest.path(), Path::new("a/../../b")).is_none());
        assert!(resolve_within(dest.path(), Path::new("a/../b")).is_some());
    }

    #[test]
    fn modes_are_not_honored() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let encoder = GzEncoder::new(Vec::new(), Compression::default());
            let mut builder = Builder::new(encoder);
            let mut header = Header::new_gnu();
            header.set_size(2);
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o777);
            header.set_cksum();
            builder
                .append_data(&mut header, "script.sh", &b"#!"[..])
                .unwrap();
            let bytes = builder.into_inner().unwrap().finish().unwrap();

            let dest = tempfile::tempdir().unwrap();
            extract_filtered(&bytes, dest.path()).unwrap();
            let mode = fs::metadata(dest.path().join("script.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_ne!(mode & 0o777, 0o777, "stored mode must be ignored");
        }
    }
}
