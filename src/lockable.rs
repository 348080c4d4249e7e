//! # Advisory-Locked File Substrate
//!
//! Every on-disk structure in this crate (record lists, the model hash, the
//! resource hash) is a file shared between processes through `flock(2)` plus
//! a modification-time gate. This module owns that protocol so the
//! structures themselves only deal in two hooks:
//!
//! - `read_metadata`: reload cached in-memory state (header fields, mapping,
//!   derived offsets) from the file
//! - `write_metadata`: write cached state back out so other holders see it
//!
//! ## Protocol
//!
//! Acquiring a lock compares the file's current mtime against the mtime
//! recorded at the last consistent point; if the file changed under us,
//! `read_metadata` runs before the caller proceeds. Releasing an exclusive
//! lock runs `write_metadata`, syncs the descriptor, and records the
//! resulting mtime *before* dropping the flock. That ordering is the
//! linearization point: any process that acquires the lock afterwards
//! observes the flushed state.
//!
//! Lock upgrades and downgrades in place are forbidden (two holders racing
//! an upgrade would deadlock under `flock`), as is re-taking a lock already
//! held. Callers unlock and re-acquire at the new level instead.
//!
//! ## Durability
//!
//! `File::sync_all` is the flush primitive. On macOS the standard library
//! issues `F_FULLFSYNC`, which is required there to actually reach stable
//! storage; plain `fsync(2)` only reaches the drive cache.
//!
//! ## Implementing a Lockable File
//!
//! Types embed a [`FileHandle`] and implement [`Lockable`]. The provided
//! `lock` method has a default body so a composite structure can override it
//! (the resource hash locks its prefix list in the same motion) while still
//! delegating to the stock protocol through [`lock_file`].

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, Result, WrapErr};

/// The lock a handle currently holds. Process-local bookkeeping; the kernel
/// holds the authoritative flock state per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLevel {
    Unlocked,
    Shared,
    Exclusive,
}

/// A lock transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Shared,
    Exclusive,
    Unlock,
}

/// Open disposition, passed through from the caller.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            write: false,
            create: false,
            truncate: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            create: true,
            truncate: false,
        }
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// An open file plus its advisory-lock state and mtime gate.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
    flags: OpenFlags,
    level: LockLevel,
    mtime: SystemTime,
}

impl FileHandle {
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(flags.write)
            .create(flags.write && flags.create)
            .truncate(flags.write && flags.truncate)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            flags,
            level: LockLevel::Unlocked,
            mtime: UNIX_EPOCH,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn modified(&self) -> Result<SystemTime> {
        self.file
            .metadata()
            .and_then(|m| m.modified())
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))
    }

    fn capture_mtime(&mut self) -> Result<()> {
        self.mtime = self.modified()?;
        Ok(())
    }

    fn flock(&self, op: LockOp) -> Result<()> {
        let flag = match op {
            LockOp::Shared => libc::LOCK_SH,
            LockOp::Exclusive => libc::LOCK_EX,
            LockOp::Unlock => libc::LOCK_UN,
        };
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), flag) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .wrap_err_with(|| format!("flock failed on '{}'", self.path.display()));
        }
        Ok(())
    }
}

/// A file-backed structure participating in the lock/metadata protocol.
pub trait Lockable {
    fn handle(&self) -> &FileHandle;
    fn handle_mut(&mut self) -> &mut FileHandle;

    /// Reloads cached in-memory state from the file. Called while holding at
    /// least a shared lock, whenever the mtime gate detects a change.
    fn read_metadata(&mut self) -> Result<()>;

    /// Writes cached state out to the file. Called while holding the
    /// exclusive lock, before it is released.
    fn write_metadata(&mut self) -> Result<()>;

    /// Takes, or releases, the advisory lock. Overridable so composite
    /// structures can piggyback further locks on the same transition.
    fn lock(&mut self, op: LockOp) -> Result<()> {
        lock_file(self, op)
    }

    /// Whether the handle currently holds exactly `level`.
    fn holds(&self, level: LockLevel) -> bool {
        self.handle().level == level
    }

    /// Whether the handle holds any lock (shared or exclusive).
    fn holds_any(&self) -> bool {
        self.handle().level != LockLevel::Unlocked
    }
}

/// The stock lock transition: validity checks, flush-on-exclusive-release,
/// mtime-gated metadata reload on acquisition.
pub fn lock_file<L: Lockable + ?Sized>(l: &mut L, op: LockOp) -> Result<()> {
    let level = l.handle().level;

    match (level, op) {
        (LockLevel::Shared, LockOp::Exclusive) | (LockLevel::Exclusive, LockOp::Shared) => {
            bail!(
                "up/downgrading the lock on '{}' in place is not permitted",
                l.handle().path.display()
            );
        }
        (LockLevel::Shared, LockOp::Shared) | (LockLevel::Exclusive, LockOp::Exclusive) => {
            bail!("double lock on '{}'", l.handle().path.display());
        }
        _ => {}
    }

    // Releasing a write lock publishes our state: metadata out, data synced
    // to the device, mtime recorded, and only then the flock dropped.
    if level == LockLevel::Exclusive && op == LockOp::Unlock {
        l.write_metadata()?;
        l.handle().sync()?;
        l.handle_mut().capture_mtime()?;
    }

    l.handle().flock(op)?;
    l.handle_mut().level = match op {
        LockOp::Shared => LockLevel::Shared,
        LockOp::Exclusive => LockLevel::Exclusive,
        LockOp::Unlock => LockLevel::Unlocked,
    };

    if op != LockOp::Unlock {
        let modified = l.handle().modified()?;
        if modified > l.handle().mtime {
            l.read_metadata()?;
            l.handle_mut().mtime = modified;
        }
    }

    Ok(())
}

/// One-time setup after opening: create or validate the header under the
/// appropriate lock, leaving the handle unlocked with consistent cached
/// state.
pub fn init_lockable<L: Lockable + ?Sized>(l: &mut L) -> Result<()> {
    if l.handle().flags.truncate {
        // We truncated the file, so write a fresh header.
        l.handle().flock(LockOp::Exclusive)?;
        if let Err(e) = l.write_metadata() {
            let _ = l.handle().flock(LockOp::Unlock);
            return Err(e);
        }
        l.handle().sync()?;
        l.handle().flock(LockOp::Shared)?;
    } else {
        // Don't take the exclusive lock until we know the file is empty, so
        // plain opens of an existing file never block behind a writer.
        l.handle().flock(LockOp::Shared)?;
        let len = l
            .handle()
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", l.handle().path.display()))?
            .len();
        if len == 0 {
            // Empty file: check again with an upgraded lock, another process
            // may have written the header while we waited.
            l.handle().flock(LockOp::Exclusive)?;
            let len = l.handle().file.metadata()?.len();
            if len == 0 {
                if let Err(e) = l.write_metadata() {
                    let _ = l.handle().flock(LockOp::Unlock);
                    return Err(e);
                }
            }
            l.handle().sync()?;
            l.handle().flock(LockOp::Shared)?;
        }
    }

    // Holding a read lock now; bring the cached state in line with the file.
    if let Err(e) = l.read_metadata() {
        let _ = l.handle().flock(LockOp::Unlock);
        return Err(e);
    }
    if let Err(e) = l.handle_mut().capture_mtime() {
        let _ = l.handle().flock(LockOp::Unlock);
        return Err(e);
    }

    l.handle().flock(LockOp::Unlock)?;
    l.handle_mut().level = LockLevel::Unlocked;

    Ok(())
}
