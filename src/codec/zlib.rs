//! # Zlib Wrapping for Long Lexicals
//!
//! Lexical forms longer than the inline threshold spill to the auxiliary
//! lexical file, and anything over 100 bytes is worth trying to deflate
//! first. The compressed payload is stored in standard zlib framing (2-byte
//! header plus Adler-32 trailer), so a `'Z'` record is
//! `{comp_len: i32, uncomp_len: i32, zlib stream, NUL}` on disk.
//!
//! Compression runs against a per-handle scratch buffer that only ever
//! grows, doubling from 1 KiB up to the deflate bound of the largest input
//! seen. The same buffer is reused to stage compressed payloads read back
//! from the lexical file before inflating them.

use eyre::{ensure, Result, WrapErr};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Reusable compression scratch space. One per resource-hash handle.
#[derive(Debug)]
pub struct ZBuffer {
    buf: Vec<u8>,
}

/// Worst-case deflate output for `len` input bytes.
fn deflate_bound(len: usize) -> usize {
    len + len / 100 + 13
}

impl ZBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; 1024],
        }
    }

    fn grow_to(&mut self, need: usize) {
        let mut len = self.buf.len();
        while len < need {
            len *= 2;
        }
        if len != self.buf.len() {
            self.buf = vec![0; len];
        }
    }

    /// Deflates `input` into the scratch buffer and returns the compressed
    /// bytes. The result is only valid until the next call.
    pub fn compress(&mut self, input: &[u8]) -> Result<&[u8]> {
        self.grow_to(deflate_bound(input.len()));
        let mut c = Compress::new(Compression::default(), true);
        let status = c
            .compress(input, &mut self.buf, FlushCompress::Finish)
            .wrap_err("zlib compression failed")?;
        ensure!(
            status == Status::StreamEnd,
            "zlib compression did not complete in one pass ({} of {} bytes in)",
            c.total_in(),
            input.len()
        );
        Ok(&self.buf[..c.total_out() as usize])
    }

    /// Borrows `len` bytes of scratch space, growing the buffer if needed.
    /// Used to stage compressed payloads read back from the lexical file.
    pub fn stage(&mut self, len: usize) -> &mut [u8] {
        self.grow_to(len.max(1));
        &mut self.buf[..len]
    }
}

impl Default for ZBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Inflates a zlib stream whose uncompressed length is known from the record
/// framing. A length mismatch is treated as corruption.
pub fn inflate(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; expected_len];
    let mut d = Decompress::new(true);
    let status = d
        .decompress(input, &mut out, FlushDecompress::Finish)
        .wrap_err("zlib decompression failed")?;
    ensure!(
        status == Status::StreamEnd,
        "zlib stream did not end where the record framing said it would"
    );
    ensure!(
        d.total_out() as usize == expected_len,
        "zlib stream inflated to {} bytes, framing said {}",
        d.total_out(),
        expected_len
    );
    Ok(out)
}
