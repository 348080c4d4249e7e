//! # Lexical Codecs
//!
//! Space-saving encodings for lexical forms stored by the resource hash:
//!
//! - `bcd`: nibble-packed numeric and `xsd:dateTime` lexicals, at most 30
//!   symbols in the 15-byte inline payload
//! - `zlib`: deflate framing for long strings in the auxiliary lexical file
//!
//! Both are fallible by design: a pack failure is not an error, it just
//! means the next storage disposition in line gets a try.

pub mod bcd;
pub mod zlib;

pub use bcd::{pack_date, pack_number, unpack_date, unpack_number, INLINE_LEN, MAX_SYMBOLS};
pub use zlib::{inflate, ZBuffer};
