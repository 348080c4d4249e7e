//! # Append-Only Record Lists
//!
//! A [`List`] is a file of fixed-width records with no header: the record
//! width is chosen at open time and the file length is always a whole number
//! of records. Lists back the import pipeline (quad batches waiting to be
//! indexed) and the resource hash's prefix dictionary.
//!
//! ## Buffering
//!
//! Appends go through a 256-record in-memory buffer. The buffer is flushed
//! when full and by the exclusive-unlock path of the lock protocol, so
//! releasing the write lock always leaves the file complete. Random reads
//! are served from the buffer when the index lands past the on-disk tail.
//!
//! ## External Sort
//!
//! Sorting happens in place through a writable mapping, one 512 MiB chunk at
//! a time (the width must divide the chunk size so records never straddle a
//! chunk boundary). A list small enough for one chunk ends up fully sorted;
//! larger lists end up chunk-sorted and are consumed through
//! [`List::next_sort_uniqed_locked`], a streaming multi-way merge that also
//! drops bytewise-duplicate records. Comparators are plain functions over
//! record byte slices, so the sort carries no global state.
//!
//! ## Lock Discipline
//!
//! Operations come in pairs: `add` takes and releases the exclusive lock
//! around one record, while `add_locked` requires the caller to already hold
//! it and is what batch import loops use. Cursor-based reads only exist in
//! `_locked` form since "next" is meaningless outside a lock scope.

use std::cmp::Ordering;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};
use tracing::warn;

use crate::lockable::{
    init_lockable, FileHandle, LockLevel, LockOp, Lockable, OpenFlags,
};

/// Records held in the append buffer before a flush.
const BUFFER_RECORDS: usize = 256;

/// Unit of the external sort: 131072 pages of 4096 bytes. Record widths must
/// divide this so chunks hold whole records.
pub const CHUNK_SIZE: u64 = 131072 * 4096;

/// A record comparator. Both arguments are exactly one record wide.
pub type RecordCmp = fn(&[u8], &[u8]) -> Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortState {
    Unsorted,
    ChunkSorted,
    Sorted,
}

/// Cursors for the streaming merge over a chunk-sorted file.
struct MergeState {
    map: Mmap,
    chunk_pos: Vec<u64>,
    chunk_end: Vec<u64>,
    last: Vec<u8>,
    seen: u64,
}

/// A buffered, lockable, fixed-width record file.
pub struct List {
    handle: FileHandle,
    width: usize,
    /// Records on disk. Buffered records live past this index.
    offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    sort: SortState,
    cmp: Option<RecordCmp>,
    merge: Option<MergeState>,
    meta_gen: u64,
}

impl List {
    pub fn open(path: impl AsRef<Path>, width: usize, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            width > 0 && CHUNK_SIZE % width as u64 == 0,
            "record width {} of '{}' does not divide the sort chunk size {}",
            width,
            path.display(),
            CHUNK_SIZE
        );

        let mut list = Self {
            handle: FileHandle::open(path, flags)?,
            width,
            offset: 0,
            buffer: vec![0; BUFFER_RECORDS * width],
            buffer_pos: 0,
            sort: SortState::Unsorted,
            cmp: None,
            merge: None,
            meta_gen: 0,
        };
        init_lockable(&mut list)?;

        Ok(list)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Bumped every time `read_metadata` runs; lets an owner detect that the
    /// file changed under it and dependent caches need rebuilding.
    pub fn metadata_generation(&self) -> u64 {
        self.meta_gen
    }

    /// Writes buffered records to the tail of the file and re-reads the
    /// on-disk length. Doubles as the `write_metadata` hook.
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer_pos > 0 {
            let bytes = self.buffer_pos * self.width;
            self.handle
                .file()
                .write_all_at(&self.buffer[..bytes], self.offset * self.width as u64)
                .wrap_err_with(|| {
                    format!("failed to write to list '{}'", self.handle.path().display())
                })?;
        }
        self.buffer_pos = 0;
        let len = self.handle.file().metadata()?.len();
        self.offset = len / self.width as u64;
        Ok(())
    }

    pub fn add(&mut self, rec: &[u8]) -> Result<u64> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.add_locked(rec);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Appends one record, returning its index. Requires the exclusive lock.
    pub fn add_locked(&mut self, rec: &[u8]) -> Result<u64> {
        ensure!(self.holds(LockLevel::Exclusive), "list add requires the exclusive lock");
        ensure!(
            rec.len() == self.width,
            "record of {} bytes appended to list of width {}",
            rec.len(),
            self.width
        );

        if self.buffer_pos == BUFFER_RECORDS {
            self.flush_buffer()?;
        }

        self.buffer[self.buffer_pos * self.width..][..self.width].copy_from_slice(rec);
        self.buffer_pos += 1;

        Ok(self.offset + self.buffer_pos as u64 - 1)
    }

    pub fn get(&mut self, pos: u64, out: &mut [u8]) -> Result<()> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_locked(pos, out);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Random read by record index, served from the append buffer when the
    /// index lies past the on-disk tail.
    pub fn get_locked(&mut self, pos: u64, out: &mut [u8]) -> Result<()> {
        ensure!(self.holds_any(), "list get requires a lock");
        ensure!(out.len() == self.width, "output buffer width mismatch");

        if pos >= self.offset {
            let buffered = pos - self.offset;
            if buffered >= self.buffer_pos as u64 {
                bail!(
                    "read past end of list '{}', position {}/{}",
                    self.handle.path().display(),
                    pos,
                    self.offset + self.buffer_pos as u64
                );
            }
            let start = buffered as usize * self.width;
            out.copy_from_slice(&self.buffer[start..start + self.width]);
            return Ok(());
        }

        self.handle
            .file()
            .read_exact_at(out, pos * self.width as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to read record {} from list '{}'",
                    pos,
                    self.handle.path().display()
                )
            })
    }

    /// On-disk records plus buffered records.
    pub fn length_locked(&self) -> u64 {
        debug_assert!(self.holds_any());
        self.offset + self.buffer_pos as u64
    }

    /// Resets the sequential read cursor to the first record.
    pub fn rewind_locked(&mut self) -> Result<()> {
        ensure!(self.holds_any(), "list rewind requires a lock");
        self.handle.file_mut().seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Reads the next record at the sequential cursor. `Ok(false)` means a
    /// clean end of file; a short read mid-record is an error.
    pub fn next_value_locked(&mut self, out: &mut [u8]) -> Result<bool> {
        ensure!(self.holds_any(), "list read requires a lock");
        ensure!(out.len() == self.width, "output buffer width mismatch");

        let mut got = 0;
        while got < self.width {
            let n = self
                .handle
                .file_mut()
                .read(&mut out[got..])
                .wrap_err_with(|| {
                    format!("failed to read from list '{}'", self.handle.path().display())
                })?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            return Ok(false);
        }
        ensure!(
            got == self.width,
            "truncated record in list '{}': got {} of {} bytes",
            self.handle.path().display(),
            got,
            self.width
        );
        Ok(true)
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.truncate_locked();
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Drops every record and resets the sort state.
    pub fn truncate_locked(&mut self) -> Result<()> {
        ensure!(self.holds(LockLevel::Exclusive), "list truncate requires the exclusive lock");
        self.handle
            .file()
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.handle.path().display()))?;
        self.offset = 0;
        self.buffer_pos = 0;
        self.sort = SortState::Unsorted;
        self.merge = None;
        Ok(())
    }

    /// Sorts one run of records in place through a writable mapping. The
    /// byte offset of `start` is always a multiple of the page size because
    /// chunk starts are multiples of `CHUNK_SIZE`.
    fn sort_run(&mut self, start: u64, records: u64, cmp: RecordCmp) -> Result<()> {
        if records == 0 {
            return Ok(());
        }
        // SAFETY: the mapping covers [start, start + records) whole records
        // inside the file, the exclusive lock keeps other processes out, and
        // the mapping is dropped before this function returns.
        let mut map = unsafe {
            MmapOptions::new()
                .offset(start * self.width as u64)
                .len(records as usize * self.width)
                .map_mut(self.handle.file())
                .wrap_err_with(|| {
                    format!(
                        "failed to map '{}' {}+{} records for sorting",
                        self.handle.path().display(),
                        start,
                        records
                    )
                })?
        };
        sort_records(&mut map, self.width, cmp);
        map.flush()
            .wrap_err_with(|| format!("failed to flush sorted '{}'", self.handle.path().display()))
    }

    pub fn sort(&mut self, cmp: RecordCmp) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.sort_locked(cmp);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Sorts the whole file in one mapping.
    pub fn sort_locked(&mut self, cmp: RecordCmp) -> Result<()> {
        ensure!(self.holds(LockLevel::Exclusive), "list sort requires the exclusive lock");
        self.flush_buffer()?;
        self.cmp = Some(cmp);
        self.sort_run(0, self.offset, cmp)?;
        self.sort = SortState::Sorted;
        Ok(())
    }

    pub fn sort_chunked(&mut self, cmp: RecordCmp) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.sort_chunked_locked(cmp);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Sorts each chunk independently; a single-chunk list ends up fully
    /// sorted, anything larger is left for the streaming merge.
    pub fn sort_chunked_locked(&mut self, cmp: RecordCmp) -> Result<()> {
        ensure!(self.holds(LockLevel::Exclusive), "list sort requires the exclusive lock");
        self.flush_buffer()?;
        self.cmp = Some(cmp);

        let chunk_records = CHUNK_SIZE / self.width as u64;
        let mut start = 0;
        while start < self.offset {
            let records = (self.offset - start).min(chunk_records);
            self.sort_run(start, records, cmp).wrap_err_with(|| {
                format!("chunked sort failed at chunk {}", start / chunk_records)
            })?;
            start += chunk_records;
        }

        self.sort = if self.offset <= chunk_records {
            SortState::Sorted
        } else {
            SortState::ChunkSorted
        };
        Ok(())
    }

    /// Streams the sorted file as a set: records come back in comparator
    /// order with bytewise duplicates removed, merged across sort chunks.
    /// Returns `Ok(false)` once exhausted and tears the merge state down so
    /// a later call starts over. Falls back to a plain sequential read, with
    /// a warning, if the list was never sorted.
    pub fn next_sort_uniqed_locked(&mut self, out: &mut [u8]) -> Result<bool> {
        ensure!(self.holds_any(), "list read requires a lock");
        ensure!(out.len() == self.width, "output buffer width mismatch");

        if self.sort == SortState::Unsorted {
            warn!(
                list = %self.handle.path().display(),
                "merged read requested on an unsorted list, falling back to file order"
            );
            return self.next_value_locked(out);
        }

        if self.merge.is_none() {
            if self.offset == 0 {
                return Ok(false);
            }
            let total = self.offset * self.width as u64;
            let chunks = (total / CHUNK_SIZE) as usize + 1;
            let mut chunk_pos = Vec::with_capacity(chunks);
            let mut chunk_end = Vec::with_capacity(chunks);
            for c in 0..chunks {
                chunk_pos.push(c as u64 * CHUNK_SIZE);
                chunk_end.push(((c + 1) as u64 * CHUNK_SIZE).min(total));
            }
            chunk_end[chunks - 1] = total;
            let covered: u64 = chunk_pos
                .iter()
                .zip(&chunk_end)
                .map(|(p, e)| e.saturating_sub(*p))
                .sum();
            ensure!(
                covered == total,
                "chunk bounds cover {} bytes of '{}', file has {}",
                covered,
                self.handle.path().display(),
                total
            );
            // SAFETY: read-only mapping of the record area; the caller holds
            // at least a shared lock for the lifetime of the merge, which
            // keeps writers out.
            let map = unsafe {
                MmapOptions::new()
                    .len(total as usize)
                    .map(self.handle.file())
                    .wrap_err_with(|| {
                        format!("failed to map '{}' for merging", self.handle.path().display())
                    })?
            };
            self.merge = Some(MergeState {
                map,
                chunk_pos,
                chunk_end,
                last: vec![0; self.width],
                seen: 0,
            });
        }

        let Some(cmp) = self.cmp else {
            bail!(
                "list '{}' is marked sorted but has no comparator",
                self.handle.path().display()
            );
        };
        let width = self.width;

        loop {
            let Some(merge) = self.merge.as_mut() else {
                return Ok(false);
            };

            let mut best: Option<usize> = None;
            for c in 0..merge.chunk_pos.len() {
                if merge.chunk_pos[c] >= merge.chunk_end[c] {
                    continue;
                }
                let rec = &merge.map[merge.chunk_pos[c] as usize..][..width];
                best = match best {
                    None => Some(c),
                    Some(b) => {
                        let best_rec = &merge.map[merge.chunk_pos[b] as usize..][..width];
                        if cmp(rec, best_rec) == Ordering::Less {
                            Some(c)
                        } else {
                            Some(b)
                        }
                    }
                };
            }

            let Some(c) = best else {
                let seen = merge.seen;
                self.merge = None;
                if seen != self.offset {
                    warn!(
                        list = %self.handle.path().display(),
                        seen,
                        expected = self.offset,
                        "merge consumed an unexpected number of records"
                    );
                }
                return Ok(false);
            };

            let rec_off = merge.chunk_pos[c] as usize;
            merge.chunk_pos[c] += width as u64;
            merge.seen += 1;

            let rec = &merge.map[rec_off..][..width];
            if rec == &merge.last[..] {
                continue;
            }
            out.copy_from_slice(rec);
            merge.last.copy_from_slice(rec);
            return Ok(true);
        }
    }

    pub fn print<W: Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        self.lock(LockOp::Shared)?;
        let ret = self.print_locked(out, verbosity);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Dumps list statistics, and at `verbosity > 0` the records themselves
    /// (as 64-bit words when the width allows), with sort chunk boundaries
    /// marked.
    pub fn print_locked<W: Write>(&mut self, out: &mut W, verbosity: u32) -> Result<()> {
        ensure!(self.holds_any(), "list print requires a lock");

        writeln!(out, "list of {} entries", self.offset + self.buffer_pos as u64)?;
        if self.buffer_pos > 0 {
            writeln!(out, "   ({} buffered)", self.buffer_pos)?;
        }
        writeln!(out, "  width {} bytes", self.width)?;
        match self.sort {
            SortState::Unsorted => writeln!(out, "  sort state: unsorted")?,
            SortState::ChunkSorted => writeln!(
                out,
                "  sort state: chunk sorted ({} chunks)",
                (self.offset * self.width as u64) / CHUNK_SIZE + 1
            )?,
            SortState::Sorted => writeln!(out, "  sort state: sorted")?,
        }

        if verbosity == 0 {
            return Ok(());
        }

        let chunk_records = CHUNK_SIZE / self.width as u64;
        let mut rec = vec![0u8; self.width];
        self.rewind_locked()?;
        for i in 0..self.offset {
            if self.sort == SortState::ChunkSorted && i > 0 && i % chunk_records == 0 {
                writeln!(out, "--- sort chunk boundary ----")?;
            }
            if !self.next_value_locked(&mut rec)? {
                bail!(
                    "list '{}' ended at record {} of {}",
                    self.handle.path().display(),
                    i,
                    self.offset
                );
            }
            if self.width % 8 == 0 {
                write!(out, "{i:08x}")?;
                for word in rec.chunks_exact(8) {
                    write!(out, " {:016x}", u64::from_le_bytes(word.try_into().unwrap()))?;
                }
                writeln!(out)?;
            }
        }
        Ok(())
    }

    /// Removes the backing file. The handle keeps its descriptor until drop.
    pub fn unlink(&self) -> Result<()> {
        fs::remove_file(self.handle.path()).wrap_err_with(|| {
            format!("failed to unlink list '{}'", self.handle.path().display())
        })
    }
}

impl Lockable for List {
    fn handle(&self) -> &FileHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut FileHandle {
        &mut self.handle
    }

    fn read_metadata(&mut self) -> Result<()> {
        let len = self.handle.file().metadata()?.len();
        ensure!(
            len % self.width as u64 == 0,
            "list '{}' length {} is not a multiple of the record width {}",
            self.handle.path().display(),
            len,
            self.width
        );
        self.offset = len / self.width as u64;
        self.meta_gen += 1;
        Ok(())
    }

    fn write_metadata(&mut self) -> Result<()> {
        self.flush_buffer()
    }
}

/// In-place sort of `buf` as records of `width` bytes: sorts a permutation
/// of record indices, then applies it cycle by cycle with a single spare
/// record of scratch.
fn sort_records(buf: &mut [u8], width: usize, cmp: RecordCmp) {
    let n = buf.len() / width;
    if n <= 1 {
        return;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&a, &b| cmp(&buf[a * width..][..width], &buf[b * width..][..width]));

    let mut tmp = vec![0u8; width];
    for i in 0..n {
        if order[i] == i {
            continue;
        }
        tmp.copy_from_slice(&buf[i * width..][..width]);
        let mut j = i;
        while order[j] != i {
            let k = order[j];
            buf.copy_within(k * width..(k + 1) * width, j * width);
            order[j] = j;
            j = k;
        }
        buf[j * width..][..width].copy_from_slice(&tmp);
        order[j] = j;
    }
}
