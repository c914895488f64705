//! # Layer Extraction
//!
//! Unpacks layer archives onto the run's [`RootFilesystem`]. Each archive is
//! applied on top of whatever earlier layers left behind:
//!
//! - regular files, links and directories overwrite the same path
//! - `.wh.<name>` removes `<name>` left by a lower layer
//! - `.wh..wh..opq` empties its directory of lower-layer content
//!
//! Applying archives one by one in manifest order yields the layered image
//! without a union filesystem.
//!
//! ## Security
//!
//! - Entries with absolute paths or `..` components fail with
//!   [`Error::PathTraversal`] before anything is written for them.
//! - Whiteouts are resolved against the canonical root. One that reaches
//!   outside it through a lower-layer symlink fails with
//!   [`Error::PathTraversal`] and removes nothing.
//! - Total extracted bytes across all layers of one destination are bounded
//!   by the extractor's rootfs limit (compression bombs).

use crate::error::{Error, Result};
use crate::rootfs::RootFilesystem;
use crate::storage::LayerArchive;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tar::Archive;
use tracing::debug;

/// Prefix marking a whiteout entry.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker that makes its directory opaque.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Gzip member magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks one layer archive into a root filesystem.
pub trait ArchiveExtractor: Send + Sync {
    /// Applies `archive` on top of the current contents of `destination`.
    fn extract(&self, archive: &LayerArchive, destination: &RootFilesystem) -> Result<()>;
}

/// Extractor for gzip-compressed or plain tar layers.
///
/// The byte budget is shared by all layers extracted into the same
/// destination and starts over when the destination changes.
#[derive(Debug)]
pub struct TarExtractor {
    max_rootfs_size: u64,
    usage: Mutex<Usage>,
}

#[derive(Debug, Default)]
struct Usage {
    destination: PathBuf,
    bytes: u64,
}

impl TarExtractor {
    pub fn new(max_rootfs_size: u64) -> Self {
        Self {
            max_rootfs_size,
            usage: Mutex::new(Usage::default()),
        }
    }

    /// Adds `size` to the budget of `rootfs` and returns the new total.
    fn charge(&self, rootfs: &Path, size: u64) -> u64 {
        let mut usage = match self.usage.lock() {
            Ok(usage) => usage,
            Err(poisoned) => poisoned.into_inner(),
        };
        if usage.destination != rootfs {
            usage.destination = rootfs.to_path_buf();
            usage.bytes = 0;
        }
        usage.bytes = usage.bytes.saturating_add(size);
        usage.bytes
    }

    fn unpack<R: Read>(&self, reader: R, archive: &LayerArchive, rootfs: &Path) -> Result<()> {
        let digest = archive.digest.as_str();
        let failed = |e: std::io::Error| Error::Extraction {
            digest: digest.to_string(),
            reason: e.to_string(),
        };

        let mut tar = Archive::new(reader);
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.set_overwrite(true);
        tar.set_unpack_xattrs(false);

        // Paths written by this layer; opaque whiteouts must not remove them.
        let mut written: HashSet<PathBuf> = HashSet::new();

        for entry in tar.entries().map_err(failed)? {
            let mut entry = entry.map_err(failed)?;
            let path = entry.path().map_err(failed)?.into_owned();

            // SECURITY: Check for path traversal
            let relative = sanitize_entry_path(&path).ok_or_else(|| Error::PathTraversal {
                digest: digest.to_string(),
                path: path.to_string_lossy().into_owned(),
            })?;

            let file_name = relative
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if file_name.starts_with(WHITEOUT_PREFIX) {
                let parent = relative.parent().unwrap_or(Path::new(""));
                let Some(dir) = resolve_in_root(rootfs, parent).map_err(failed)? else {
                    continue;
                };
                if !dir.starts_with(rootfs) {
                    return Err(Error::PathTraversal {
                        digest: digest.to_string(),
                        path: path.to_string_lossy().into_owned(),
                    });
                }
                if file_name == OPAQUE_WHITEOUT {
                    clear_directory(&dir, &written).map_err(failed)?;
                } else {
                    let target = dir.join(&file_name[WHITEOUT_PREFIX.len()..]);
                    remove_path(&target).map_err(failed)?;
                    debug!("Whiteout removed {}", target.display());
                }
                continue;
            }

            let size = entry.size();
            let total = self.charge(rootfs, size);
            if total > self.max_rootfs_size {
                return Err(Error::Extraction {
                    digest: digest.to_string(),
                    reason: format!(
                        "root filesystem exceeds size limit: {} > {} bytes",
                        total, self.max_rootfs_size
                    ),
                });
            }

            let unpacked = entry.unpack_in(rootfs).map_err(failed)?;
            if !unpacked {
                return Err(Error::PathTraversal {
                    digest: digest.to_string(),
                    path: path.to_string_lossy().into_owned(),
                });
            }
            written.insert(rootfs.join(&relative));
        }

        Ok(())
    }
}

impl ArchiveExtractor for TarExtractor {
    fn extract(&self, archive: &LayerArchive, destination: &RootFilesystem) -> Result<()> {
        debug!("Extracting layer: {}", archive.digest);

        let file = File::open(&archive.path).map_err(|e| Error::Extraction {
            digest: archive.digest.to_string(),
            reason: format!("cannot open {}: {}", archive.path.display(), e),
        })?;
        let mut reader = BufReader::new(file);

        let root = fs::canonicalize(destination.path()).map_err(|e| Error::Extraction {
            digest: archive.digest.to_string(),
            reason: format!("cannot resolve {}: {}", destination.path().display(), e),
        })?;

        let compressed = reader
            .fill_buf()
            .map_err(|e| Error::Extraction {
                digest: archive.digest.to_string(),
                reason: e.to_string(),
            })?
            .starts_with(&GZIP_MAGIC);

        if compressed {
            self.unpack(GzDecoder::new(reader), archive, &root)
        } else {
            self.unpack(reader, archive, &root)
        }
    }
}

/// Normalizes an entry path to a relative path inside the root.
///
/// Returns `None` for absolute paths and paths with `..` components.
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// Resolves `relative` under `rootfs`, following symlinks.
///
/// Returns `None` when the path does not exist. The result may lie outside
/// `rootfs`; callers check containment.
fn resolve_in_root(rootfs: &Path, relative: &Path) -> std::io::Result<Option<PathBuf>> {
    match fs::canonicalize(rootfs.join(relative)) {
        Ok(resolved) => Ok(Some(resolved)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes a file, symlink or directory tree if it exists.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Empties `dir` of everything not written by the current layer.
///
/// Symlinks are removed or kept, never followed.
fn clear_directory(dir: &Path, keep: &HashSet<PathBuf>) -> std::io::Result<()> {
    if !fs::symlink_metadata(dir)?.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if keep.contains(&path) {
            continue;
        }
        if keep.iter().any(|kept| kept.starts_with(&path)) {
            // Directory holds entries from this layer; clear below it instead.
            if entry.file_type()?.is_dir() {
                clear_directory(&path, keep)?;
            }
            continue;
        }
        remove_path(&path)?;
    }
    debug!("Opaque whiteout cleared {}", dir.display());
    Ok(())
}
