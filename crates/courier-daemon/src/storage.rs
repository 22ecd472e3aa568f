//! Local files on both ends of a transfer
//!
//! Senders read from a [`SourceFile`]. Receivers never write to the final
//! path directly: bytes go into a hidden, session-unique [`StagedFile`] which
//! is published with a rename (or a no-clobber hard link) only after the
//! whole payload is on disk.
//!
//! # File Layout
//! ```text
//! storage_dir/
//! ├── report.pdf                        # published
//! ├── .report.pdf.3f9a1c0d5e6b7a88.part # arriving (session 3f9a...)
//! └── report-1.pdf                      # same name, second upload (keep-both)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use courier_core::path::{conflict_candidate, is_staging_name, resolve, staging_name};
use courier_core::{ConflictPolicy, ProtocolError, SessionId};

/// Upper bound on `name-N.ext` probing under the keep-both policy
pub const MAX_CONFLICT_ATTEMPTS: u32 = 1000;

/// A regular file opened for sending
#[derive(Debug)]
pub struct SourceFile {
    file: File,
    len: u64,
    path: PathBuf,
}

impl SourceFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;

        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", path),
            ));
        }

        Ok(Self {
            file,
            len: meta.len(),
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

/// Where a receiver publishes what it gets
#[derive(Clone, Debug)]
pub enum Destination {
    /// Server storage: the final name comes from the frame header
    Directory {
        dir: PathBuf,
        on_conflict: ConflictPolicy,
    },
    /// Client download: a fixed path, replaced atomically if it exists
    File(PathBuf),
}

/// Resolved target for one incoming file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub staging_dir: PathBuf,
    pub target: PathBuf,
    pub policy: ConflictPolicy,
}

impl Destination {
    /// Decide where a file announced as `header_name` ends up
    ///
    /// Names shaped like staging files are refused for directories, since
    /// publishing under one would replace another session's upload.
    pub fn place(&self, header_name: &str) -> Result<Placement, ProtocolError> {
        match self {
            Destination::Directory { dir, on_conflict } => {
                let target = resolve(dir, header_name)?;
                if is_staging_name(header_name) {
                    return Err(ProtocolError::InvalidName(format!(
                        "{:?} is reserved for uploads in progress",
                        header_name
                    )));
                }
                Ok(Placement {
                    staging_dir: dir.clone(),
                    target,
                    policy: *on_conflict,
                })
            }
            Destination::File(path) => {
                let staging_dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                Ok(Placement {
                    staging_dir,
                    target: path.clone(),
                    policy: ConflictPolicy::Overwrite,
                })
            }
        }
    }
}

/// An in-progress download or upload on disk
///
/// Removed on drop unless committed, so a cancelled or panicking session
/// leaves no staging file behind.
#[derive(Debug)]
pub struct StagedFile {
    file: Option<File>,
    temp_path: PathBuf,
    done: bool,
}

impl StagedFile {
    /// Create a fresh staging file for `placement`
    pub async fn create(placement: &Placement, session: SessionId) -> io::Result<Self> {
        let target_name = placement
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".into());
        let temp_path = placement
            .staging_dir
            .join(staging_name(&target_name, session));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        trace!("Staging {:?}", temp_path);
        Ok(Self {
            file: Some(file),
            temp_path,
            done: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("staging file already closed"))
    }

    /// Sync to disk and publish under the final name
    ///
    /// Returns the path the file is visible at, which differs from the
    /// target when keep-both had to pick another name.
    pub async fn commit(mut self, target: &Path, policy: ConflictPolicy) -> io::Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let published = match policy {
            ConflictPolicy::Overwrite => {
                fs::rename(&self.temp_path, target).await?;
                target.to_path_buf()
            }
            ConflictPolicy::KeepBoth => publish_no_clobber(&self.temp_path, target).await?,
        };

        self.done = true;
        debug!("Published {:?}", published);
        Ok(published)
    }

    /// Drop the partial data
    pub async fn discard(mut self) {
        self.file.take();
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => trace!("Removed {:?}", self.temp_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging file {:?}: {}", self.temp_path, e),
        }
        self.done = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

static LINK_FALLBACK_HINT: Once = Once::new();

/// Link `temp` at the first free `target`, `target-1`, ... then unlink `temp`
///
/// `hard_link` fails with `AlreadyExists` instead of replacing, so two
/// sessions racing for one name each end up with their own file. Where the
/// filesystem has no hard links, names are claimed with placeholders instead.
async fn publish_no_clobber(temp: &Path, target: &Path) -> io::Result<PathBuf> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;

    for attempt in 0..MAX_CONFLICT_ATTEMPTS {
        let candidate = dir.join(conflict_candidate(&name, attempt));
        match fs::hard_link(temp, &candidate).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(temp).await {
                    warn!("Published {:?} but could not remove {:?}: {}", candidate, temp, e);
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                trace!("{:?} taken", candidate);
            }
            Err(e) if links_unsupported(&e) => {
                LINK_FALLBACK_HINT.call_once(|| {
                    warn!(
                        "Hard links unavailable in {:?} ({}); claiming names with placeholders. \
                         Set on_conflict = \"overwrite\" to publish by rename only",
                        dir, e
                    );
                });
                return publish_by_claim(temp, dir, &name, attempt).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(names_exhausted(&name))
}

/// Errors `hard_link` returns on filesystems without link support (FAT, some
/// network mounts)
fn links_unsupported(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
    )
}

/// Claim the first free candidate from `first_attempt` on with an empty
/// `create_new` placeholder, then rename `temp` over it
///
/// The placeholder is visible as an empty file until the rename lands.
async fn publish_by_claim(
    temp: &Path,
    dir: &Path,
    name: &str,
    first_attempt: u32,
) -> io::Result<PathBuf> {
    for attempt in first_attempt..MAX_CONFLICT_ATTEMPTS {
        let candidate = dir.join(conflict_candidate(name, attempt));
        let claimed = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match claimed {
            Ok(placeholder) => {
                drop(placeholder);
                if let Err(e) = fs::rename(temp, &candidate).await {
                    let _ = fs::remove_file(&candidate).await;
                    return Err(e);
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                trace!("{:?} taken", candidate);
            }
            Err(e) => return Err(e),
        }
    }

    Err(names_exhausted(name))
}

fn names_exhausted(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {:?} after {} attempts", name, MAX_CONFLICT_ATTEMPTS),
    )
}
