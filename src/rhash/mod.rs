//! # Resource Hash
//!
//! The resource hash maps RIDs to their resource records: the attribute RID
//! and the lexical form. It is the structure a query touches last, turning
//! the 64-bit identifiers the indexes traffic in back into strings, so reads
//! have to be cheap: the primary table is memory-mapped, entries are a fixed
//! 32 bytes, and five storage dispositions keep as many lexical forms inline
//! as possible.
//!
//! ## Files
//!
//! A hash at `res` owns three files:
//!
//! - `res`: the primary table, a 512-byte header followed by 32-byte entries
//!   grouped into buckets of 16
//! - `res.lex`: the auxiliary lexical file, an append-only stream of
//!   self-delimiting payloads for anything that does not fit inline
//! - `res.prefixes`: a record list (width 512) persisting the learned URI
//!   prefix dictionary
//!
//! ## Primary Table Format
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Magic 0x4a585230
//! 4       4     Table size in buckets (power of two)
//! 8       4     Occupied entry count
//! 12      4     Search distance in entries
//! 16      4     Bucket size in entries
//! 20      4     Structure revision (1)
//! 24      488   Zero padding
//! 512     32×n  Entries {rid: u64, aval: 8B, val: 15B, disp: u8}
//! ```
//!
//! A RID's home slot is `((rid >> 10) & (size - 1)) * bucket_size`; probing
//! runs linearly from there for at most `search_dist` entries. When a probe
//! window fills up the table doubles in place: the file is pre-extended (one
//! byte written past the new end), remapped at the new length, and entries
//! whose new home lies in the upper half move to `old_slots + slot`.
//!
//! ## Dispositions
//!
//! | disp | aval              | val                | lexical |
//! |------|-------------------|--------------------|---------|
//! | `i`  | attribute RID     | 15 bytes inline    | short UTF-8 |
//! | `N`  | attribute RID     | BCD nibbles        | numeric, ≤30 symbols |
//! | `D`  | attribute RID     | BCD nibbles        | dateTime, ≤30 symbols |
//! | `p`  | code + 7B suffix  | 15B more suffix    | URI, suffix ≤22 |
//! | `f`  | attribute RID     | lex file offset    | anything |
//! | `P`  | code              | lex file offset    | URI, long suffix |
//! | `Z`  | attribute RID     | lex file offset    | UTF-8 > 100 bytes, deflated |
//!
//! Lex file payloads are self-delimiting: `f` is `{len: i32, bytes, NUL}`,
//! `P` is `{suffix_len: i32, bytes, NUL}`, `Z` is `{comp_len: i32,
//! uncomp_len: i32, zlib stream, NUL}`.
//!
//! ## Prefix Coupling
//!
//! The hash owns its prefix list and keeps the two in lock-step: `lock` on
//! the hash locks the list in the same motion (releasing the hash again if
//! the list cannot be locked), and when the list's metadata generation moves
//! (another process appended prefixes) the in-memory dictionary is rebuilt
//! from the list before the caller proceeds.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{info, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::bcd;
use crate::codec::zlib::{self, ZBuffer};
use crate::list::List;
use crate::lockable::{
    init_lockable, lock_file, FileHandle, LockLevel, LockOp, Lockable, OpenFlags,
};
use crate::rid::{is_bnode, is_uri, Resource, Rid, RID_NULL};

pub mod prefix;

use prefix::{PrefixLine, PrefixTable, PrefixTrie, LEARNER_NODES, PREFIX_LINE_WIDTH};

pub const RHASH_MAGIC: u32 = 0x4a58_5230;
pub const REVISION: u32 = 1;

const HEADER_SIZE: usize = 512;
const ENTRY_SIZE: usize = 32;
const DEFAULT_BUCKETS: u32 = 65536;
const DEFAULT_SEARCH_DIST: u32 = 32;
const DEFAULT_BUCKET_SIZE: u32 = 16;

/// Width of the inline payload.
pub const INLINE_LEN: usize = bcd::INLINE_LEN;

/// Longest URI suffix a `'p'` entry can hold: 7 bytes beside the prefix
/// code plus the inline payload.
const INLINE_SUFFIX_MAX: usize = 7 + INLINE_LEN;

/// Strings longer than this get a deflate attempt before going to the lex
/// file.
const ZLIB_THRESHOLD: usize = 100;

pub const DISP_INLINE_UTF8: u8 = b'i';
pub const DISP_INLINE_NUMBER: u8 = b'N';
pub const DISP_INLINE_DATE: u8 = b'D';
pub const DISP_INLINE_PREFIX: u8 = b'p';
pub const DISP_FILE_UTF8: u8 = b'f';
pub const DISP_FILE_PREFIX: u8 = b'P';
pub const DISP_FILE_ZLIB: u8 = b'Z';

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RhashHeader {
    magic: U32,
    size: U32,
    count: U32,
    search_dist: U32,
    bucket_size: U32,
    revision: U32,
    padding: [u8; 488],
}

const _: () = assert!(std::mem::size_of::<RhashHeader>() == HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RhashEntry {
    rid: U64,
    /// Attribute RID, or for prefix dispositions the code byte followed by
    /// the first seven suffix bytes.
    aval: [u8; 8],
    /// Inline payload, or for file dispositions the lex file offset in the
    /// first eight bytes.
    val: [u8; INLINE_LEN],
    disp: u8,
}

const _: () = assert!(std::mem::size_of::<RhashEntry>() == ENTRY_SIZE);

impl RhashEntry {
    fn attr(&self) -> Rid {
        u64::from_le_bytes(self.aval)
    }

    fn offset(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.val[..8]);
        u64::from_le_bytes(b)
    }

    fn set_offset(&mut self, off: u64) {
        self.val[..8].copy_from_slice(&off.to_le_bytes());
    }
}

/// Bytes of an inline payload up to the first NUL.
fn inline_bytes(val: &[u8]) -> &[u8] {
    let end = val.iter().position(|&b| b == 0).unwrap_or(val.len());
    &val[..end]
}

/// The mapped primary table, writable when the hash is.
enum TableMap {
    Ro(Mmap),
    Rw(MmapMut),
}

impl TableMap {
    fn bytes(&self) -> &[u8] {
        match self {
            TableMap::Ro(m) => m,
            TableMap::Rw(m) => m,
        }
    }
}

/// The auxiliary lexical file: appended at the tail, read positionally.
struct LexFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl LexFile {
    fn open(path: PathBuf, flags: OpenFlags) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(flags.write)
            .create(flags.write && flags.create)
            .truncate(flags.write && flags.truncate)
            .open(&path)
            .wrap_err_with(|| format!("failed to open lexical file '{}'", path.display()))?;
        Ok(Self {
            file,
            path,
            writable: flags.write,
        })
    }

    /// Appends the concatenation of `parts` at the end of the file and
    /// returns the offset it landed at.
    fn append(&mut self, parts: &[&[u8]]) -> Result<u64> {
        let pos = self
            .file
            .seek(SeekFrom::End(0))
            .wrap_err_with(|| format!("failed to seek to end of '{}'", self.path.display()))?;
        for part in parts {
            self.file.write_all(part).wrap_err_with(|| {
                format!("failed writing to lexical file '{}'", self.path.display())
            })?;
        }
        Ok(pos)
    }

    fn read_exact(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, off).wrap_err_with(|| {
            format!(
                "read error from lexical file '{}' at offset {}",
                self.path.display(),
                off
            )
        })
    }

    /// Reads a non-negative little-endian length prefix.
    fn read_len(&self, off: u64) -> Result<usize> {
        let mut b = [0u8; 4];
        self.read_exact(off, &mut b)?;
        let len = i32::from_le_bytes(b);
        ensure!(
            len >= 0,
            "negative payload length {} in lexical file '{}' at offset {}",
            len,
            self.path.display(),
            off
        );
        Ok(len as usize)
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file
                .sync_all()
                .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))?;
        }
        Ok(())
    }
}

/// Appends `suffix` to `path` as a raw string, keeping any extension.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Memory-mapped hash from RIDs to resource records with codec-aware
/// inline/external storage.
pub struct ResourceHash {
    handle: FileHandle,
    map: Option<TableMap>,
    /// Bucket count of the current mapping, to detect growth by another
    /// process through the mapped header.
    size: u32,
    lex: LexFile,
    prefix_list: List,
    prefix_gen: u64,
    prefixes: PrefixTable,
    learner: PrefixTrie,
    z: ZBuffer,
}

impl ResourceHash {
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref();

        let mut rh = Self {
            handle: FileHandle::open(path, flags)?,
            map: None,
            size: 0,
            lex: LexFile::open(sibling(path, ".lex"), flags)?,
            prefix_list: List::open(sibling(path, ".prefixes"), PREFIX_LINE_WIDTH, flags)?,
            prefix_gen: 0,
            prefixes: PrefixTable::new(),
            learner: PrefixTrie::new(LEARNER_NODES),
            z: ZBuffer::new(),
        };
        init_lockable(&mut rh)?;

        // the prefix list was opened just above, so its cached state is
        // current; bring the dictionary in line with it
        rh.prefix_list.lock(LockOp::Shared)?;
        let loaded = rh.reload_prefixes();
        rh.prefix_list.lock(LockOp::Unlock)?;
        loaded?;

        Ok(rh)
    }

    fn table(&self) -> Result<&TableMap> {
        self.map
            .as_ref()
            .ok_or_else(|| eyre::eyre!("resource hash '{}' is not mapped", self.handle.path().display()))
    }

    fn header(&self) -> Result<&RhashHeader> {
        RhashHeader::ref_from_bytes(&self.table()?.bytes()[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse resource hash header: {:?}", e))
    }

    fn header_mut(&mut self) -> Result<&mut RhashHeader> {
        match self.map.as_mut() {
            Some(TableMap::Rw(m)) => RhashHeader::mut_from_bytes(&mut m[..HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse resource hash header: {:?}", e)),
            Some(TableMap::Ro(_)) => bail!(
                "resource hash '{}' is read-only",
                self.handle.path().display()
            ),
            None => bail!(
                "resource hash '{}' is not mapped",
                self.handle.path().display()
            ),
        }
    }

    /// Total entry slots in the table.
    fn slots(&self) -> Result<u64> {
        let h = self.header()?;
        Ok(h.size.get() as u64 * h.bucket_size.get() as u64)
    }

    fn home(&self, rid: Rid) -> Result<u64> {
        let h = self.header()?;
        Ok(((rid >> 10) & (h.size.get() as u64 - 1)) * h.bucket_size.get() as u64)
    }

    fn entry(&self, slot: u64) -> Result<RhashEntry> {
        let off = HEADER_SIZE + slot as usize * ENTRY_SIZE;
        RhashEntry::read_from_bytes(&self.table()?.bytes()[off..off + ENTRY_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse resource hash entry: {:?}", e))
    }

    fn write_entry(&mut self, slot: u64, e: RhashEntry) -> Result<()> {
        let off = HEADER_SIZE + slot as usize * ENTRY_SIZE;
        match self.map.as_mut() {
            Some(TableMap::Rw(m)) => {
                m[off..off + ENTRY_SIZE].copy_from_slice(e.as_bytes());
                Ok(())
            }
            Some(TableMap::Ro(_)) => bail!(
                "resource hash '{}' is read-only",
                self.handle.path().display()
            ),
            None => bail!(
                "resource hash '{}' is not mapped",
                self.handle.path().display()
            ),
        }
    }

    /// Pre-extends the file one byte past the entry region so the mapping of
    /// the last bucket is always backed by allocated blocks.
    fn ensure_size(&self, size: u32, bucket_size: u32) -> Result<()> {
        if !self.handle.flags().write {
            return Ok(());
        }
        let len =
            HEADER_SIZE as u64 + size as u64 * bucket_size as u64 * ENTRY_SIZE as u64;
        self.handle
            .file()
            .write_all_at(&[0], len)
            .wrap_err_with(|| {
                format!(
                    "couldn't pre-allocate {} bytes for '{}'",
                    len,
                    self.handle.path().display()
                )
            })
    }

    /// Establishes or refreshes the mapping. The first call validates the
    /// header through a positional read; afterwards a size change in the
    /// mapped header (our own doubling, or another process having grown the
    /// file) tears the mapping down and rebuilds it at the new length.
    fn remap(&mut self) -> Result<()> {
        let (size, bucket_size) = match self.map.as_ref() {
            None => {
                let mut buf = [0u8; HEADER_SIZE];
                self.handle
                    .file()
                    .read_exact_at(&mut buf, 0)
                    .wrap_err_with(|| {
                        format!(
                            "failed to read resource hash header from '{}'",
                            self.handle.path().display()
                        )
                    })?;
                let h = RhashHeader::ref_from_bytes(&buf)
                    .map_err(|e| eyre::eyre!("failed to parse resource hash header: {:?}", e))?;
                ensure!(
                    h.magic.get() == RHASH_MAGIC,
                    "'{}' does not appear to be a resource hash file",
                    self.handle.path().display()
                );
                ensure!(
                    h.revision.get() == REVISION,
                    "unsupported resource hash revision {} in '{}'",
                    h.revision.get(),
                    self.handle.path().display()
                );
                (h.size.get(), h.bucket_size.get())
            }
            Some(_) => {
                let h = self.header()?;
                (h.size.get(), h.bucket_size.get())
            }
        };
        ensure!(
            size.is_power_of_two() && bucket_size >= 1,
            "corrupt geometry in '{}': size {}, bucket size {}",
            self.handle.path().display(),
            size,
            bucket_size
        );

        if self.map.is_none() || self.size != size {
            // drop the old view before establishing the longer one, so the
            // kernel observes the new file length
            self.map = None;
            let len = HEADER_SIZE + size as usize * bucket_size as usize * ENTRY_SIZE;
            // SAFETY: the mapping length is derived from the validated
            // header and the file is pre-extended past it before any
            // growth; cross-process writers are excluded by the flock
            // protocol for the lifetime of any read.
            let map = if self.handle.flags().write {
                TableMap::Rw(unsafe {
                    MmapOptions::new()
                        .len(len)
                        .map_mut(self.handle.file())
                        .wrap_err_with(|| {
                            format!("failed to map '{}'", self.handle.path().display())
                        })?
                })
            } else {
                TableMap::Ro(unsafe {
                    MmapOptions::new()
                        .len(len)
                        .map(self.handle.file())
                        .wrap_err_with(|| {
                            format!("failed to map '{}'", self.handle.path().display())
                        })?
                })
            };
            self.map = Some(map);
            self.size = size;
        }

        Ok(())
    }

    /// Rebuilds the in-memory prefix dictionary from the prefix list. The
    /// caller holds at least a shared lock on the list.
    fn reload_prefixes(&mut self) -> Result<()> {
        self.prefixes = PrefixTable::new();
        self.prefix_list.rewind_locked()?;
        let mut buf = vec![0u8; PREFIX_LINE_WIDTH];
        while self.prefix_list.next_value_locked(&mut buf)? {
            let line = PrefixLine::ref_from_bytes(&buf[..])
                .map_err(|e| eyre::eyre!("failed to parse prefix list record: {:?}", e))?;
            let code = line.code.get();
            ensure!(
                (1..=255u32).contains(&code),
                "prefix list of '{}' holds invalid code {}",
                self.handle.path().display(),
                code
            );
            self.prefixes.insert(code as u8, line.prefix_str()?)?;
        }
        self.prefix_gen = self.prefix_list.metadata_generation();
        Ok(())
    }

    /// Records a spilled URI in the learner; when the learner fills up, its
    /// best prefixes join the dictionary and the prefix list.
    fn learn(&mut self, lex: &str) -> Result<()> {
        if self.learner.add_string(lex) {
            return Ok(());
        }
        for cand in self.learner.candidates(32) {
            if cand.score == 0 || self.prefixes.is_full() {
                break;
            }
            let code = self.prefixes.register(&cand.prefix)?;
            info!(code, prefix = %cand.prefix, "adding URI prefix");
            let line = PrefixLine::new(code, &cand.prefix);
            self.prefix_list.add_locked(line.as_bytes())?;
        }
        self.learner = PrefixTrie::new(LEARNER_NODES);
        Ok(())
    }

    /// Builds the 32-byte entry for a resource, choosing the first
    /// disposition that fits and writing any overflow payload to the lex
    /// file.
    fn encode(&mut self, res: &Resource) -> Result<RhashEntry> {
        let mut e = RhashEntry {
            rid: U64::new(res.rid),
            aval: res.attr.to_le_bytes(),
            val: [0; INLINE_LEN],
            disp: 0,
        };
        let bytes = res.lex.as_bytes();

        if bytes.len() <= INLINE_LEN {
            e.val[..bytes.len()].copy_from_slice(bytes);
            e.disp = DISP_INLINE_UTF8;
            return Ok(e);
        }
        if let Some(packed) = bcd::pack_number(&res.lex) {
            e.val = packed;
            e.disp = DISP_INLINE_NUMBER;
            return Ok(e);
        }
        if let Some(packed) = bcd::pack_date(&res.lex) {
            e.val = packed;
            e.disp = DISP_INLINE_DATE;
            return Ok(e);
        }

        let matched = if is_uri(res.rid) {
            self.prefixes.longest_match(&res.lex)
        } else {
            None
        };
        if let Some((code, plen)) = matched {
            let suffix = &bytes[plen..];
            e.aval = [0; 8];
            e.aval[0] = code;
            if suffix.len() > INLINE_SUFFIX_MAX {
                // even with the prefix the suffix won't fit inline
                let pos = self.lex.append(&[
                    &(suffix.len() as i32).to_le_bytes(),
                    suffix,
                    &[0],
                ])?;
                e.set_offset(pos);
                e.disp = DISP_FILE_PREFIX;
            } else {
                let head = suffix.len().min(7);
                e.aval[1..1 + head].copy_from_slice(&suffix[..head]);
                if suffix.len() > 7 {
                    e.val[..suffix.len() - 7].copy_from_slice(&suffix[7..]);
                }
                e.disp = DISP_INLINE_PREFIX;
            }
            return Ok(e);
        }

        // spills to the lex file; give the learner a look at URIs first
        if is_uri(res.rid) {
            self.learn(&res.lex)?;
        }

        let comp: Option<&[u8]> = if bytes.len() > ZLIB_THRESHOLD {
            match self.z.compress(bytes) {
                Ok(c) if !c.is_empty() && c.len() < bytes.len() - 4 => Some(c),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "zlib compression failed, storing raw");
                    None
                }
            }
        } else {
            None
        };

        match comp {
            Some(c) => {
                let pos = self.lex.append(&[
                    &(c.len() as i32).to_le_bytes(),
                    &(bytes.len() as i32).to_le_bytes(),
                    c,
                    &[0],
                ])?;
                e.set_offset(pos);
                e.disp = DISP_FILE_ZLIB;
            }
            None => {
                let pos = self
                    .lex
                    .append(&[&(bytes.len() as i32).to_le_bytes(), bytes, &[0]])?;
                e.set_offset(pos);
                e.disp = DISP_FILE_UTF8;
            }
        }
        Ok(e)
    }

    /// Reconstructs the resource behind an entry.
    fn decode(&mut self, e: &RhashEntry) -> Result<Resource> {
        let rid = e.rid.get();
        let lex = match e.disp {
            DISP_INLINE_UTF8 => String::from_utf8(inline_bytes(&e.val).to_vec())
                .map_err(|_| eyre::eyre!("inline lexical of {:016x} is not valid UTF-8", rid))?,
            DISP_INLINE_NUMBER => bcd::unpack_number(&e.val),
            DISP_INLINE_DATE => bcd::unpack_date(&e.val),
            DISP_INLINE_PREFIX => {
                let prefix = self.prefix_str(e.aval[0])?;
                let mut bytes = Vec::with_capacity(prefix.len() + INLINE_SUFFIX_MAX);
                bytes.extend_from_slice(prefix.as_bytes());
                bytes.extend_from_slice(inline_bytes(&e.aval[1..8]));
                bytes.extend_from_slice(inline_bytes(&e.val));
                String::from_utf8(bytes)
                    .map_err(|_| eyre::eyre!("prefixed lexical of {:016x} is not valid UTF-8", rid))?
            }
            DISP_FILE_UTF8 => {
                let off = e.offset();
                let len = self.lex.read_len(off)?;
                let mut buf = vec![0u8; len];
                self.lex.read_exact(off + 4, &mut buf)?;
                String::from_utf8(buf)
                    .map_err(|_| eyre::eyre!("stored lexical of {:016x} is not valid UTF-8", rid))?
            }
            DISP_FILE_PREFIX => {
                let prefix = self.prefix_str(e.aval[0])?;
                let off = e.offset();
                let suffix_len = self.lex.read_len(off)?;
                let mut bytes = Vec::with_capacity(prefix.len() + suffix_len);
                bytes.extend_from_slice(prefix.as_bytes());
                bytes.resize(prefix.len() + suffix_len, 0);
                let plen = prefix.len();
                self.lex.read_exact(off + 4, &mut bytes[plen..])?;
                String::from_utf8(bytes)
                    .map_err(|_| eyre::eyre!("prefixed lexical of {:016x} is not valid UTF-8", rid))?
            }
            DISP_FILE_ZLIB => {
                let off = e.offset();
                let comp_len = self.lex.read_len(off)?;
                let uncomp_len = self.lex.read_len(off + 4)?;
                let staged = self.z.stage(comp_len);
                self.lex.read_exact(off + 8, staged)?;
                let raw = zlib::inflate(staged, uncomp_len)?;
                String::from_utf8(raw)
                    .map_err(|_| eyre::eyre!("deflated lexical of {:016x} is not valid UTF-8", rid))?
            }
            other => bail!(
                "unknown disposition 0x{:02x} for {:016x} in '{}'",
                other,
                rid,
                self.handle.path().display()
            ),
        };

        // prefix dispositions overwrite the attribute field; those entries
        // are URIs, which carry no attribute
        let attr = match e.disp {
            DISP_INLINE_PREFIX | DISP_FILE_PREFIX => 0,
            _ => e.attr(),
        };

        Ok(Resource { rid, attr, lex })
    }

    fn prefix_str(&self, code: u8) -> Result<&str> {
        self.prefixes.get(code).ok_or_else(|| {
            eyre::eyre!(
                "prefix code {} out of range (dictionary holds {})",
                code,
                self.prefixes.len()
            )
        })
    }

    pub fn put(&mut self, res: &Resource) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_locked(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Stores a resource. A RID already in the table is left untouched;
    /// detecting hash collisions is the caller's concern. Requires the
    /// exclusive lock.
    pub fn put_locked(&mut self, res: &Resource) -> Result<()> {
        ensure!(
            self.holds(LockLevel::Exclusive),
            "resource hash put requires the exclusive lock"
        );

        let total = self.slots()?;
        let search_dist = self.header()?.search_dist.get() as u64;
        let home = self.home(res.rid)?;
        ensure!(
            home < total,
            "home slot {} of {:016x} is outside '{}'",
            home,
            res.rid,
            self.handle.path().display()
        );

        let mut free = None;
        for slot in home..(home + search_dist).min(total) {
            let e = self.entry(slot)?;
            if e.rid.get() == res.rid {
                return Ok(());
            }
            if e.rid.get() == 0 && free.is_none() {
                free = Some(slot);
            }
        }

        let Some(slot) = free else {
            // probe window exhausted, grow and retry
            self.double_size()?;
            return self.put_locked(res);
        };

        let e = self.encode(res)?;
        self.write_entry(slot, e)?;
        let h = self.header_mut()?;
        h.count.set(h.count.get() + 1);

        Ok(())
    }

    pub fn get(&mut self, rid: Rid) -> Result<Resource> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_locked(rid);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Looks a RID up and reconstructs its resource. Requires a lock.
    pub fn get_locked(&mut self, rid: Rid) -> Result<Resource> {
        ensure!(self.holds_any(), "resource hash get requires a lock");

        let total = self.slots()?;
        let search_dist = self.header()?.search_dist.get() as u64;
        let home = self.home(rid)?;

        for slot in home..(home + search_dist).min(total) {
            let e = self.entry(slot)?;
            if e.rid.get() == rid {
                return self.decode(&e);
            }
        }

        warn!(
            file = %self.handle.path().display(),
            "resource {:016x} not found in slots {:#x}-{:#x}",
            rid,
            home,
            home + search_dist - 1
        );
        bail!(
            "resource {:016x} not found in slots {:#x}-{:#x} of '{}'",
            rid,
            home,
            home + search_dist - 1,
            self.handle.path().display()
        )
    }

    fn double_size(&mut self) -> Result<()> {
        info!(file = %self.handle.path().display(), "doubling resource hash");

        let h = self.header()?;
        let old_size = h.size.get();
        let bucket_size = h.bucket_size.get();
        self.header_mut()?.size.set(old_size * 2);
        self.ensure_size(old_size * 2, bucket_size)?;
        self.remap()?;

        let old_slots = old_size as u64 * bucket_size as u64;
        let new_mask = (old_size as u64 * 2) - 1;
        for slot in 0..old_slots {
            let e = self.entry(slot)?;
            if e.rid.get() == 0 {
                continue;
            }
            let home = ((e.rid.get() >> 10) & new_mask) * bucket_size as u64;
            if home >= old_slots {
                self.write_entry(old_slots + slot, e)?;
                self.write_entry(slot, RhashEntry::new_zeroed())?;
            }
        }

        Ok(())
    }

    pub fn put_multi(&mut self, res: &mut [Resource]) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_multi_locked(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Stores a batch, sorted by home slot first so the table and lex file
    /// are walked mostly sequentially. Null RIDs and duplicates are skipped.
    pub fn put_multi_locked(&mut self, res: &mut [Resource]) -> Result<()> {
        ensure!(
            self.holds(LockLevel::Exclusive),
            "resource hash put requires the exclusive lock"
        );

        let h = self.header()?;
        let mask = h.size.get() as u64 - 1;
        let bucket_size = h.bucket_size.get() as u64;
        res.sort_by_key(|r| (((r.rid >> 10) & mask) * bucket_size, r.rid));

        let mut last = RID_NULL;
        for r in res.iter() {
            if r.rid == RID_NULL || r.rid == last {
                continue;
            }
            self.put_locked(r)?;
            last = r.rid;
        }
        Ok(())
    }

    pub fn get_multi(&mut self, res: &mut [Resource]) -> Result<usize> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_multi_locked(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Resolves a batch of RIDs in place, sorted by home slot first. Blank
    /// nodes synthesize their `_:b` form without touching the table. A
    /// resource that cannot be resolved gets a diagnostic lexical and a null
    /// attribute; the return value is how many there were.
    pub fn get_multi_locked(&mut self, res: &mut [Resource]) -> Result<usize> {
        ensure!(self.holds_any(), "resource hash get requires a lock");

        let h = self.header()?;
        let mask = h.size.get() as u64 - 1;
        let bucket_size = h.bucket_size.get() as u64;
        res.sort_by_key(|r| (((r.rid >> 10) & mask) * bucket_size, r.rid));

        let mut missing = 0;
        for r in res.iter_mut() {
            if is_bnode(r.rid) {
                r.attr = RID_NULL;
                r.lex = format!("_:b{:x}", r.rid);
                continue;
            }
            match self.get_locked(r.rid) {
                Ok(found) => {
                    r.attr = found.attr;
                    r.lex = found.lex;
                }
                Err(err) => {
                    r.attr = RID_NULL;
                    r.lex = err.to_string();
                    missing += 1;
                }
            }
        }
        Ok(missing)
    }

    /// Number of stored resources, per the mapped header.
    pub fn count(&self) -> Result<u32> {
        Ok(self.header()?.count.get())
    }

    pub fn print<W: Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        self.lock(LockOp::Shared)?;
        let ret = self.print_locked(out, verbosity);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Dumps table statistics; at higher verbosity the prefix dictionary and
    /// every entry, with a disposition frequency table and a header-vs-scan
    /// count check.
    pub fn print_locked<W: Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        ensure!(self.holds_any(), "resource hash print requires a lock");

        let h = self.header()?;
        let (size, bucket_size, count, revision) = (
            h.size.get(),
            h.bucket_size.get(),
            h.count.get(),
            h.revision.get(),
        );
        let total = self.slots()?;

        writeln!(out, "{}", self.handle.path().display())?;
        writeln!(out, "size:     {} (buckets)", size)?;
        writeln!(out, "bucket:   {}", bucket_size)?;
        writeln!(out, "entries:  {}", count)?;
        writeln!(out, "prefixes: {}", self.prefixes.len())?;
        writeln!(out, "revision: {}", revision)?;
        writeln!(
            out,
            "fill:     {:.1}%",
            100.0 * count as f64 / total as f64
        )?;

        if verbosity < 1 {
            return Ok(());
        }

        for code in 1..=self.prefixes.len() as u8 {
            if let Some(p) = self.prefixes.get(code) {
                writeln!(out, "prefix {code}: {p}")?;
            }
        }

        if verbosity < 2 {
            return Ok(());
        }

        let mut disp_freq = [0u64; 256];
        let mut scanned = 0u32;
        for slot in 0..total {
            let e = self.entry(slot)?;
            if e.rid.get() == 0 {
                continue;
            }
            scanned += 1;
            disp_freq[e.disp as usize] += 1;
            let res = match self.decode(&e) {
                Ok(res) => res,
                Err(err) => {
                    writeln!(out, "ERROR: failed to get entry for {:016x}: {}", e.rid.get(), err)?;
                    continue;
                }
            };
            let ent = format!(
                "{:08}.{:02}",
                slot / bucket_size as u64,
                slot % bucket_size as u64
            );
            match e.disp {
                DISP_FILE_UTF8 | DISP_FILE_ZLIB => writeln!(
                    out,
                    "{} {:016x} {:016x} {} {:10} {}",
                    ent,
                    e.rid.get(),
                    e.attr(),
                    e.disp as char,
                    e.offset(),
                    res.lex
                )?,
                DISP_FILE_PREFIX => writeln!(
                    out,
                    "{} {:016x} {:16} {} {:10} {}",
                    ent,
                    e.rid.get(),
                    e.aval[0],
                    e.disp as char,
                    e.offset(),
                    res.lex
                )?,
                _ => writeln!(
                    out,
                    "{} {:016x} {:016x} {} {}",
                    ent,
                    e.rid.get(),
                    e.attr(),
                    e.disp as char,
                    res.lex
                )?,
            }
        }

        writeln!(
            out,
            "STATS: length: {}, bsize: {}, entries: {} ({:+}), {:.1}% full",
            size,
            bucket_size,
            scanned,
            count as i64 - scanned as i64,
            100.0 * scanned as f64 / total as f64
        )?;
        if count != scanned {
            writeln!(
                out,
                "ERROR: entry count in header {} != count from scan {}",
                count, scanned
            )?;
        }
        writeln!(out, "Disposition frequencies:")?;
        for (d, freq) in disp_freq.iter().enumerate() {
            if *freq > 0 {
                writeln!(out, "{}: {:8}", d as u8 as char, freq)?;
            }
        }

        Ok(())
    }
}

impl Lockable for ResourceHash {
    fn handle(&self) -> &FileHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut FileHandle {
        &mut self.handle
    }

    fn read_metadata(&mut self) -> Result<()> {
        self.remap()
    }

    fn write_metadata(&mut self) -> Result<()> {
        if self.map.is_none() {
            // initializing the file: write the header and back the entry
            // region before the first remap
            let header = RhashHeader {
                magic: U32::new(RHASH_MAGIC),
                size: U32::new(DEFAULT_BUCKETS),
                count: U32::new(0),
                search_dist: U32::new(DEFAULT_SEARCH_DIST),
                bucket_size: U32::new(DEFAULT_BUCKET_SIZE),
                revision: U32::new(REVISION),
                padding: [0; 488],
            };
            self.handle
                .file()
                .write_all_at(header.as_bytes(), 0)
                .wrap_err_with(|| {
                    format!(
                        "failed to write resource hash header on '{}'",
                        self.handle.path().display()
                    )
                })?;
            self.ensure_size(DEFAULT_BUCKETS, DEFAULT_BUCKET_SIZE)?;
        }
        if let Some(TableMap::Rw(m)) = self.map.as_ref() {
            m.flush().wrap_err_with(|| {
                format!("failed to flush '{}'", self.handle.path().display())
            })?;
        }
        // the lex file has to be durable before entries pointing into it are
        self.lex.sync()
    }

    /// Locking the hash locks the prefix list in the same motion, so batch
    /// imports don't pay a lock round-trip per learned prefix. If the list
    /// changed under us, the dictionary is rebuilt before the caller runs.
    fn lock(&mut self, op: LockOp) -> Result<()> {
        lock_file(self, op)?;
        if let Err(err) = self.prefix_list.lock(op) {
            if op != LockOp::Unlock {
                let _ = lock_file(self, LockOp::Unlock);
            }
            return Err(err);
        }
        if op != LockOp::Unlock && self.prefix_list.metadata_generation() != self.prefix_gen {
            self.reload_prefixes()?;
        }
        Ok(())
    }
}
