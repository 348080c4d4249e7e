//! # Model Hash
//!
//! A persistent open-addressed map from model RIDs to 32-bit index node
//! values, used to find the triple-block chain that stores each graph. The
//! value 0 means "no index node": writing it removes the model from the
//! table's point of view, and lookups of absent keys return it.
//!
//! ## File Format
//!
//! A 512-byte header followed by packed 12-byte entries:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Magic 0x4a584d30
//! 4       4     Table size in slots (power of two)
//! 8       4     Occupied entry count
//! 12      4     Search distance
//! 16      496   Zero padding
//! 512     12×n  Entries {rid: u64 LE, val: u32 LE}
//! ```
//!
//! The entry region is sparse: slots that were never written read back as
//! zeroes, so a fresh table is just a 512-byte file. All table I/O is
//! positional reads and writes; the table is small enough that mapping it
//! buys nothing.
//!
//! ## Probing
//!
//! A key's home slot is `(rid >> 10) & (size - 1)`: the low ten bits are
//! discarded because RIDs are themselves hashes whose low bits correlate
//! with the segment number. Probing walks forward up to `search_dist` slots.
//! An insert that finds neither the key nor a free slot within the window
//! doubles the table in place: entries whose new home falls in the upper
//! half move to `old_size + slot`, everything else stays put.

use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::lockable::{
    init_lockable, FileHandle, LockLevel, LockOp, Lockable, OpenFlags,
};
use crate::rid::Rid;

pub const MHASH_MAGIC: u32 = 0x4a58_4d30;

const HEADER_SIZE: usize = 512;
const ENTRY_SIZE: usize = 12;
const DEFAULT_SIZE: i32 = 4096;
const DEFAULT_SEARCH_DIST: i32 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MhashHeader {
    magic: U32,
    size: I32,
    count: I32,
    search_dist: I32,
    padding: [u8; 496],
}

const _: () = assert!(std::mem::size_of::<MhashHeader>() == HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MhashEntry {
    rid: U64,
    val: U32,
}

const _: () = assert!(std::mem::size_of::<MhashEntry>() == ENTRY_SIZE);

/// Open-addressed disk hash from model RIDs to index node values.
pub struct ModelHash {
    handle: FileHandle,
    size: i32,
    count: i32,
    search_dist: i32,
}

impl ModelHash {
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let mut mh = Self {
            handle: FileHandle::open(path, flags)?,
            size: DEFAULT_SIZE,
            count: 0,
            search_dist: DEFAULT_SEARCH_DIST,
        };
        init_lockable(&mut mh)?;
        Ok(mh)
    }

    /// Number of models with a non-zero index node, per the cached header.
    pub fn count(&self) -> i32 {
        self.count
    }

    fn home(&self, rid: Rid) -> u64 {
        (rid >> 10) & (self.size as u64 - 1)
    }

    /// Reads one slot. Bytes past the end of the file count as zeroes, so
    /// slots that were never written come back free.
    fn read_entry(&self, slot: u64) -> Result<MhashEntry> {
        let mut buf = [0u8; ENTRY_SIZE];
        let off = HEADER_SIZE as u64 + slot * ENTRY_SIZE as u64;
        let mut got = 0;
        while got < ENTRY_SIZE {
            let n = self
                .handle
                .file()
                .read_at(&mut buf[got..], off + got as u64)
                .wrap_err_with(|| {
                    format!("read from '{}' failed", self.handle.path().display())
                })?;
            if n == 0 {
                break;
            }
            got += n;
        }
        MhashEntry::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse hash entry: {:?}", e))
    }

    fn write_entry(&self, slot: u64, e: MhashEntry) -> Result<()> {
        let off = HEADER_SIZE as u64 + slot * ENTRY_SIZE as u64;
        self.handle
            .file()
            .write_all_at(e.as_bytes(), off)
            .wrap_err_with(|| format!("write to '{}' failed", self.handle.path().display()))
    }

    pub fn put(&mut self, rid: Rid, val: u32) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_locked(rid, val);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Inserts or replaces the value for `rid`. Requires the exclusive lock.
    pub fn put_locked(&mut self, rid: Rid, val: u32) -> Result<()> {
        ensure!(
            self.holds(LockLevel::Exclusive),
            "model hash put requires the exclusive lock"
        );

        let mut slot = self.home(rid);
        let mut candidate: Option<u64> = None;
        let mut i = 0;
        let (slot, existing) = loop {
            let e = self.read_entry(slot)?;
            if e.rid.get() == rid {
                break (slot, e);
            }
            if e.rid.get() == 0 && candidate.is_none() {
                // remember the free slot, a matching entry may still follow
                candidate = Some(slot);
            }
            if i == self.search_dist || slot == self.size as u64 - 1 {
                match candidate {
                    Some(c) => break (c, self.read_entry(c)?),
                    None => {
                        // table overfull, grow and retry from scratch
                        self.double_size()?;
                        return self.put_locked(rid, val);
                    }
                }
            }
            i += 1;
            slot += 1;
        };

        if existing.rid.get() == rid && existing.val.get() == val {
            return Ok(());
        }

        let old_val = existing.val.get();
        self.write_entry(
            slot,
            MhashEntry {
                rid: U64::new(rid),
                val: U32::new(val),
            },
        )?;
        if val != 0 {
            if old_val == 0 {
                self.count += 1;
            }
        } else if old_val != 0 {
            self.count -= 1;
        }

        Ok(())
    }

    pub fn get(&mut self, rid: Rid) -> Result<u32> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_locked(rid);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Looks up `rid`, returning 0 for absent keys. Requires a lock.
    pub fn get_locked(&self, rid: Rid) -> Result<u32> {
        ensure!(self.holds_any(), "model hash get requires a lock");

        let mut slot = self.home(rid);
        for _ in 0..self.search_dist {
            let e = self.read_entry(slot)?;
            if e.rid.get() == rid {
                return Ok(e.val.get());
            }
            slot = (slot + 1) & (self.size as u64 - 1);
            if slot == 0 {
                break;
            }
        }
        Ok(0)
    }

    fn double_size(&mut self) -> Result<()> {
        let old_size = self.size;
        self.size *= 2;
        self.search_dist = self.search_dist * 2 + 1;

        let blank = MhashEntry {
            rid: U64::new(0),
            val: U32::new(0),
        };
        for slot in 0..old_size as u64 {
            let e = self.read_entry(slot)?;
            if e.rid.get() == 0 {
                continue;
            }
            if self.home(e.rid.get()) >= old_size as u64 {
                self.write_entry(slot, blank)?;
                self.write_entry(old_size as u64 + slot, e)?;
            }
        }
        Ok(())
    }

    pub fn keys(&mut self) -> Result<Vec<Rid>> {
        self.lock(LockOp::Shared)?;
        let ret = self.keys_locked();
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Every RID with a non-zero value, in table order.
    pub fn keys_locked(&self) -> Result<Vec<Rid>> {
        ensure!(self.holds_any(), "model hash key scan requires a lock");

        let mut keys = Vec::new();
        self.scan(|_, e| {
            if e.val.get() != 0 {
                keys.push(e.rid.get());
            }
            Ok(())
        })?;
        Ok(keys)
    }

    /// Sequential scan over every entry present on disk.
    fn scan(&self, mut f: impl FnMut(u64, MhashEntry) -> Result<()>) -> Result<()> {
        const BATCH: usize = 512;

        let len = self.handle.file().metadata()?.len();
        let total = len.saturating_sub(HEADER_SIZE as u64) / ENTRY_SIZE as u64;
        let mut buf = vec![0u8; BATCH * ENTRY_SIZE];
        let mut slot = 0u64;
        while slot < total {
            let n = ((total - slot) as usize).min(BATCH);
            let bytes = &mut buf[..n * ENTRY_SIZE];
            self.handle
                .file()
                .read_exact_at(bytes, HEADER_SIZE as u64 + slot * ENTRY_SIZE as u64)
                .wrap_err_with(|| {
                    format!("read from '{}' failed", self.handle.path().display())
                })?;
            for (k, chunk) in bytes.chunks_exact(ENTRY_SIZE).enumerate() {
                let e = MhashEntry::read_from_bytes(chunk)
                    .map_err(|e| eyre::eyre!("failed to parse hash entry: {:?}", e))?;
                f(slot + k as u64, e)?;
            }
            slot += n as u64;
        }
        Ok(())
    }

    pub fn print<W: std::io::Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        self.lock(LockOp::Shared)?;
        let ret = self.print_locked(out, verbosity);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Dumps table statistics and verifies the header count and key
    /// uniqueness against a full scan, reporting mismatches as ERROR lines.
    pub fn print_locked<W: std::io::Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        ensure!(self.holds_any(), "model hash print requires a lock");

        writeln!(out, "model hash {}", self.handle.path().display())?;
        writeln!(out, "  count: {}", self.count)?;
        writeln!(out, "  size: {}", self.size)?;
        writeln!(out)?;

        let mut models = Vec::new();
        let mut scanned = 0i32;
        self.scan(|slot, e| {
            if e.val.get() != 0 {
                scanned += 1;
                if verbosity > 0 {
                    writeln!(out, "{:8} {:016x} {:8}", slot, e.rid.get(), e.val.get())?;
                }
                models.push(e.rid.get());
            }
            Ok(())
        })?;

        if self.count != scanned {
            writeln!(
                out,
                "ERROR: {} header count {} != scanned count {}",
                self.handle.path().display(),
                self.count,
                scanned
            )?;
        }

        let before = models.len();
        models.sort_unstable();
        models.dedup();
        if models.len() != before {
            writeln!(
                out,
                "ERROR: {} some models appear more than once",
                self.handle.path().display()
            )?;
        }

        Ok(())
    }
}

impl Lockable for ModelHash {
    fn handle(&self) -> &FileHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut FileHandle {
        &mut self.handle
    }

    fn read_metadata(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        self.handle
            .file()
            .read_exact_at(&mut buf, 0)
            .wrap_err_with(|| {
                format!(
                    "failed to read model hash header from '{}'",
                    self.handle.path().display()
                )
            })?;
        let header = MhashHeader::ref_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse model hash header: {:?}", e))?;
        ensure!(
            header.magic.get() == MHASH_MAGIC,
            "'{}' does not appear to be a model hash file",
            self.handle.path().display()
        );
        self.size = header.size.get();
        self.count = header.count.get();
        self.search_dist = header.search_dist.get();
        Ok(())
    }

    fn write_metadata(&mut self) -> Result<()> {
        let header = MhashHeader {
            magic: U32::new(MHASH_MAGIC),
            size: I32::new(self.size),
            count: I32::new(self.count),
            search_dist: I32::new(self.search_dist),
            padding: [0; 496],
        };
        self.handle
            .file()
            .write_all_at(header.as_bytes(), 0)
            .wrap_err_with(|| {
                format!(
                    "failed to write model hash header on '{}'",
                    self.handle.path().display()
                )
            })
    }
}
