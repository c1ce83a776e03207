//! Transparent streaming compression for connections.
//!
//! Wraps a pair of zlib stream contexts (one deflate, one inflate) behind a
//! small two-phase protocol: writes accumulate into the deflater until a
//! flush finalizes the current block and hands the compressed bytes to the
//! transmit queue, while reads pull one raw chunk at a time into the inflater
//! and decompress it incrementally into caller buffers. The inflate side
//! never blocks: callers feed it exactly one chunk whenever it reports that
//! it needs more input.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::CodecError;

/// zlib compression level used for all connections.
const COMPRESSION_LEVEL: u32 = 6;

/// Extra output headroom reserved per compress pass, on top of the input
/// length. A little more than the input is enough to finish in one pass for
/// anything deflate can't shrink.
const COMPRESS_SLACK: usize = 20;

/// Output headroom reserved per flush pass.
const FLUSH_SLACK: usize = 1000;

/// Spare (reserved but unused) capacity of a buffer.
fn spare(buf: &Vec<u8>) -> usize {
    buf.capacity() - buf.len()
}

/// Streaming compressor/decompressor state for a single connection.
pub struct StreamCompressor {
    deflate: Compress,
    inflate: Decompress,
    /// Compressed output accumulated since the last [`take_output`] call.
    ///
    /// [`take_output`]: StreamCompressor::take_output
    out_buf: Vec<u8>,
    /// Raw (still compressed) input chunk currently being inflated.
    in_buf: Vec<u8>,
    /// How much of `in_buf` the inflater has consumed so far.
    in_pos: usize,
    /// True when the current input chunk is fully drained and the next read
    /// must receive a fresh chunk from the transport.
    needs_input: bool,
}

impl std::fmt::Debug for StreamCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCompressor")
            .field("pending_out", &self.out_buf.len())
            .field("buffered_in", &(self.in_buf.len() - self.in_pos))
            .field("needs_input", &self.needs_input)
            .finish()
    }
}

impl StreamCompressor {
    /// Initialize both stream contexts.
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            deflate: Compress::new(Compression::new(COMPRESSION_LEVEL), true),
            inflate: Decompress::new(true),
            out_buf: Vec::new(),
            in_buf: Vec::new(),
            in_pos: 0,
            needs_input: true,
        })
    }

    /// Feed `src` through the deflater, accumulating output.
    ///
    /// The whole input is consumed before returning; output stays buffered
    /// until [`flush_stream`](StreamCompressor::flush_stream) finalizes the
    /// block.
    pub fn compress(&mut self, src: &[u8]) -> Result<(), CodecError> {
        let mut consumed = 0;
        while consumed < src.len() {
            self.out_buf.reserve(src.len() + COMPRESS_SLACK);
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(&src[consumed..], &mut self.out_buf, FlushCompress::None)
                .map_err(|e| CodecError::Compress(e.to_string()))?;
            let step = (self.deflate.total_in() - before) as usize;
            if step == 0 && consumed < src.len() && spare(&self.out_buf) > 0 {
                // The deflater refused input despite having output room.
                return Err(CodecError::Compress("deflate made no progress".into()));
            }
            consumed += step;
        }
        Ok(())
    }

    /// Finalize the current compression block.
    ///
    /// Repeats a sync flush until the deflater reports no more pending
    /// output. After this, the accumulated bytes form a self-contained unit
    /// the peer can fully decompress.
    pub fn flush_stream(&mut self) -> Result<(), CodecError> {
        loop {
            self.out_buf.reserve(FLUSH_SLACK);
            self.deflate
                .compress_vec(&[], &mut self.out_buf, FlushCompress::Sync)
                .map_err(|e| CodecError::Compress(e.to_string()))?;
            if spare(&self.out_buf) > 0 {
                // The deflater had room left over, so everything is out.
                return Ok(());
            }
        }
    }

    /// Move the accumulated compressed output out, leaving the buffer empty.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }

    /// Number of compressed bytes currently buffered on the deflate side.
    pub fn pending_output(&self) -> usize {
        self.out_buf.len()
    }

    /// True when the inflater has drained its current chunk and the next
    /// decompress call needs fresh transport input first.
    pub fn needs_input(&self) -> bool {
        self.needs_input
    }

    /// True when undecompressed input is still buffered in the inflater.
    ///
    /// Readiness checks use this to report a connection readable without
    /// touching the OS: the data is already resident in memory.
    pub fn has_buffered_input(&self) -> bool {
        !self.needs_input
    }

    /// Install a fresh raw chunk for the inflater.
    ///
    /// Only legal while [`needs_input`](StreamCompressor::needs_input) is
    /// true; the previous chunk must be fully consumed first.
    pub fn feed_input(&mut self, chunk: &[u8]) {
        debug_assert!(self.needs_input, "previous input chunk not fully drained");
        self.in_buf.clear();
        self.in_buf.extend_from_slice(chunk);
        self.in_pos = 0;
        if !chunk.is_empty() {
            self.needs_input = false;
        }
    }

    /// Run exactly one decompression step into `dst`.
    ///
    /// Returns the number of bytes produced. When the step leaves free space
    /// in `dst`, the current input chunk has been fully consumed and
    /// [`needs_input`](StreamCompressor::needs_input) becomes true again.
    pub fn decompress(&mut self, dst: &mut [u8]) -> Result<usize, CodecError> {
        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        self.inflate
            .decompress(&self.in_buf[self.in_pos..], dst, FlushDecompress::None)
            .map_err(|e| {
                CodecError::Decompress(
                    e.message().unwrap_or("corrupt or truncated stream").to_string(),
                )
            })?;
        self.in_pos += (self.inflate.total_in() - before_in) as usize;
        let produced = (self.inflate.total_out() - before_out) as usize;

        if produced < dst.len() {
            // Output space left over means the whole chunk was consumed.
            debug_assert_eq!(
                self.in_pos,
                self.in_buf.len(),
                "inflater stalled with input remaining"
            );
            self.needs_input = true;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compress + flush `data` and hand back the wire bytes.
    fn compress_block(c: &mut StreamCompressor, data: &[u8]) -> Vec<u8> {
        c.compress(data).unwrap();
        c.flush_stream().unwrap();
        c.take_output()
    }

    /// Decompress `wire` through `d`, feeding it in `chunk`-sized pieces.
    fn decompress_chunked(d: &mut StreamCompressor, wire: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offered = 0;
        let mut dst = [0u8; 97]; // odd size to exercise partial steps
        loop {
            if d.needs_input() {
                if offered >= wire.len() {
                    break;
                }
                let end = (offered + chunk).min(wire.len());
                d.feed_input(&wire[offered..end]);
                offered = end;
            }
            let n = d.decompress(&mut dst).unwrap();
            out.extend_from_slice(&dst[..n]);
        }
        out
    }

    #[test]
    fn test_roundtrip_reproduces_input_exactly() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut c = StreamCompressor::new().unwrap();
        let mut d = StreamCompressor::new().unwrap();

        let wire = compress_block(&mut c, &data);
        assert!(!wire.is_empty());

        let out = decompress_chunked(&mut d, &wire, 64);
        assert_eq!(out, data, "roundtrip must reproduce the input");
    }

    #[test]
    fn test_roundtrip_across_multiple_flush_cycles() {
        let mut c = StreamCompressor::new().unwrap();
        let mut d = StreamCompressor::new().unwrap();

        let mut expected = Vec::new();
        let mut wire = Vec::new();
        for round in 0..5u8 {
            let block: Vec<u8> = std::iter::repeat_n(round, 300 + round as usize * 41).collect();
            expected.extend_from_slice(&block);
            wire.extend_from_slice(&compress_block(&mut c, &block));
        }

        // Feed the concatenated stream in deliberately awkward chunk sizes.
        let out = decompress_chunked(&mut d, &wire, 13);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_flush_with_no_input_produces_drainable_stream() {
        let mut c = StreamCompressor::new().unwrap();
        c.flush_stream().unwrap();
        // An empty sync flush may still emit a few marker bytes; they must
        // decompress to nothing.
        let wire = c.take_output();
        let mut d = StreamCompressor::new().unwrap();
        let out = decompress_chunked(&mut d, &wire, wire.len().max(1));
        assert!(out.is_empty());
    }

    #[test]
    fn test_needs_input_lifecycle() {
        let mut c = StreamCompressor::new().unwrap();
        let mut d = StreamCompressor::new().unwrap();
        assert!(d.needs_input(), "fresh inflater starts out empty");

        let wire = compress_block(&mut c, b"hello, peer");
        d.feed_input(&wire);
        assert!(d.has_buffered_input());

        let mut dst = [0u8; 64];
        let n = d.decompress(&mut dst).unwrap();
        assert_eq!(&dst[..n], b"hello, peer");
        assert!(
            d.needs_input(),
            "chunk must be fully drained once output space remains"
        );
    }

    #[test]
    fn test_take_output_leaves_buffer_empty() {
        let mut c = StreamCompressor::new().unwrap();
        c.compress(&[1u8; 512]).unwrap();
        c.flush_stream().unwrap();
        assert!(c.pending_output() > 0);
        let first = c.take_output();
        assert!(!first.is_empty());
        assert_eq!(c.pending_output(), 0);
    }

    #[test]
    fn test_corrupt_stream_is_rejected() {
        let mut d = StreamCompressor::new().unwrap();
        d.feed_input(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22]);
        let mut dst = [0u8; 32];
        let err = d.decompress(&mut dst);
        assert!(
            matches!(err, Err(CodecError::Decompress(_))),
            "garbage input must fail with a codec error, got {err:?}"
        );
    }

    #[test]
    fn test_incompressible_data_grows_output_and_survives() {
        // Pseudo-random bytes defeat deflate, forcing the grow-and-retry path.
        let mut state = 0x2545F491_u64;
        let data: Vec<u8> = (0..50_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let mut c = StreamCompressor::new().unwrap();
        let mut d = StreamCompressor::new().unwrap();
        let wire = compress_block(&mut c, &data);
        let out = decompress_chunked(&mut d, &wire, 1021);
        assert_eq!(out, data);
    }
}
