use super::{BackupError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, warn};

fn archive_error(action: &str, path: &Path, e: std::io::Error) -> BackupError {
    BackupError::Archive {
        message: format!("Failed to {action} {}: {e}", path.display()),
    }
}

/// Pack the contents of `source_dir` into a gzip-compressed tarball
pub async fn create_tar_gz(source_dir: &Path, archive_path: &Path) -> Result<()> {
    let source = source_dir.to_path_buf();
    let target = archive_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::create(&target)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);
        // Store symlinks as links, not as copies of their targets
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &source)
            .map_err(|e| archive_error("archive", &source, e))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| archive_error("finish", &target, e))?;
        let file = encoder
            .finish()
            .map_err(|e| archive_error("compress", &target, e))?;
        file.sync_all()?;
        Ok(())
    })
    .await??;

    debug!(
        "Archived {} into {}",
        source_dir.display(),
        archive_path.display()
    );
    Ok(())
}

pub async fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let source = archive_path.to_path_buf();
    let dest = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        fs::create_dir_all(&dest)?;
        let file = File::open(&source)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        archive
            .unpack(&dest)
            .map_err(|e| archive_error("extract", &source, e))
    })
    .await?
}

/// Recursively copy `src` into `dst`. Symlinks are recreated as links
/// pointing where the originals point; sockets, FIFOs and device nodes are
/// skipped with a warning. With `modified_since`, only files and links whose
/// mtime is after the cutoff are copied. Returns the number of entries
/// copied.
pub async fn copy_tree(
    src: &Path,
    dst: &Path,
    modified_since: Option<DateTime<Utc>>,
) -> Result<u64> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let copied =
        tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst, modified_since))
            .await??;
    Ok(copied)
}

fn copy_tree_blocking(
    src: &Path,
    dst: &Path,
    modified_since: Option<DateTime<Utc>>,
) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = pending.pop() {
        for entry in fs::read_dir(&from_dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let target = to_dir.join(entry.file_name());

            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
                pending.push((entry.path(), target));
            } else if file_type.is_file() || file_type.is_symlink() {
                if let Some(cutoff) = modified_since {
                    // DirEntry::metadata does not follow links
                    let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
                    if modified <= cutoff {
                        continue;
                    }
                }
                if file_type.is_symlink() {
                    copy_symlink(&entry.path(), &target)?;
                } else {
                    fs::copy(entry.path(), &target)?;
                }
                copied += 1;
            } else {
                warn!(
                    "Skipping {}: not a regular file, directory or symlink",
                    entry.path().display()
                );
            }
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let points_to = fs::read_link(link)?;
    // Replace whatever sits at the destination, never write through it
    match fs::symlink_metadata(target) {
        Ok(existing) if existing.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(_) => {}
    }
    std::os::unix::fs::symlink(&points_to, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::copy(link, target)?;
    Ok(())
}
