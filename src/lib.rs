//! # Tristore Backend Storage
//!
//! This crate implements the on-disk storage primitives of a clustered RDF
//! triple store segment: the file-backed structures that hold resource
//! records, model indexes, and staged quad batches. Everything above them
//! (parsers, the query engine, cluster coordination) talks to these
//! structures through 64-bit resource identifiers and treats this crate as
//! the place where identifiers meet bytes on disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   callers (indexer, query, admin tools)   │
//! ├──────────────┬──────────────┬─────────────┤
//! │ ResourceHash │  ModelHash   │    List     │
//! │ rid → record │ rid → node   │ fixed-width │
//! │ mmap, codecs │ positional   │ append+sort │
//! ├──────────────┴──────────────┴─────────────┤
//! │      Lockable (flock + mtime gate)        │
//! └───────────────────────────────────────────┘
//! ```
//!
//! - [`lockable`]: the shared substrate. Advisory `flock(2)` coordination
//!   between processes, with metadata hooks and a modification-time gate
//!   that reloads cached state when another process changed the file.
//! - [`list`]: append-only files of fixed-width records with buffered
//!   appends, in-place chunked external sort, and a streaming sorted-unique
//!   merge. Stages quad batches during import; also stores the resource
//!   hash's prefix dictionary.
//! - [`mhash`]: an open-addressed hash from model RIDs to 32-bit index node
//!   values, all positional I/O, doubling in place.
//! - [`rhash`]: the resource hash, a memory-mapped bucketed hash from RIDs
//!   to `{attribute, lexical}` records with five storage dispositions, an
//!   auxiliary lexical file, and an online-learned URI prefix dictionary.
//! - [`codec`]: BCD nibble packing for numeric/dateTime lexicals and zlib
//!   framing for long strings.
//!
//! ## Concurrency Model
//!
//! Handles are single-threaded; processes share files only through the
//! filesystem. A writer's exclusive-unlock path flushes metadata and syncs
//! before dropping the flock, and every acquisition re-reads cached state if
//! the file's mtime moved, so whoever locks next sees a consistent
//! structure. Nothing here spawns threads or retries I/O.
//!
//! ## Portability
//!
//! On-disk integers are little-endian via [`zerocopy`] wrapper types, so
//! files move between little-endian hosts; the locking layer is Unix-only
//! (`flock`, `mmap`).

pub mod codec;
pub mod list;
pub mod lockable;
pub mod mhash;
pub mod rhash;
pub mod rid;

pub use list::{List, RecordCmp, CHUNK_SIZE};
pub use lockable::{FileHandle, LockLevel, LockOp, Lockable, OpenFlags};
pub use mhash::ModelHash;
pub use rhash::ResourceHash;
pub use rid::{is_bnode, is_literal, is_uri, Resource, Rid, RID_NULL};
