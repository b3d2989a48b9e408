//! Streaming zlib compression for connection traffic.
//!
//! [`CompressionAdapter`] owns one compress and one decompress context. Both
//! directions keep codec state across calls, so a byte stream can be fed in
//! arbitrary chunks on one side and drained in arbitrary chunks on the other.
//!
//! Outbound bytes accumulate in [`CompressionAdapter::compression_out_buffer`]
//! until the caller puts them on the wire; a sync flush makes everything
//! compressed so far decodable by the peer. Inbound on-wire bytes are staged
//! in a fixed input window whose cursor advances as the decoder consumes it.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Output space reserved before each compress step.
const COMPRESS_RESERVE: usize = 16 * 1024;

/// Output space reserved before each flush step.
const FLUSH_RESERVE: usize = 4 * 1024;

/// Tuning for a [`CompressionAdapter`].
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// zlib level, 0 (store) to 9 (best). Default: 6.
    pub level: u32,
    /// Size of the inbound staging window in bytes. Default: 16 KiB.
    pub input_window: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 6,
            input_window: 16 * 1024,
        }
    }
}

/// Errors raised by the streaming codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    /// An operation was attempted before [`CompressionAdapter::initialize`].
    #[error("compression contexts are not initialized")]
    NotInitialized,
    /// The inbound bytes are not a valid zlib stream.
    #[error("corrupt compressed stream: {0}")]
    Corrupt(String),
    /// The compressor failed or stopped making progress.
    #[error("compressor failure: {0}")]
    Codec(String),
    /// The peer terminated its stream but more input followed.
    #[error("data after end of compressed stream")]
    StreamEnded,
}

/// Two independent zlib streams (outbound and inbound) with staging buffers.
pub struct CompressionAdapter {
    config: CompressionConfig,
    compressor: Option<Compress>,
    decompressor: Option<Decompress>,
    /// Compressed bytes waiting to be written to the wire.
    compress_out: Vec<u8>,
    /// Bytes of the current compress input chunk consumed so far.
    compress_cursor: usize,
    /// Staged on-wire bytes awaiting decompression.
    decompress_in: Vec<u8>,
    decompress_in_len: usize,
    decompress_in_pos: usize,
    /// Unused space the last decompress call left in the caller's window.
    decompress_out_space: usize,
    need_input: bool,
    stream_ended: bool,
}

impl CompressionAdapter {
    /// Create an adapter with default tuning. Call [`initialize`](Self::initialize) before use.
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create an adapter with explicit tuning.
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            config,
            compressor: None,
            decompressor: None,
            compress_out: Vec::new(),
            compress_cursor: 0,
            decompress_in: Vec::new(),
            decompress_in_len: 0,
            decompress_in_pos: 0,
            decompress_out_space: 0,
            need_input: false,
            stream_ended: false,
        }
    }

    /// Allocate both codec contexts and the staging buffers.
    ///
    /// Both contexts are created before either is installed, so the adapter is
    /// never left with only one direction usable.
    pub fn initialize(&mut self) -> Result<(), CompressionError> {
        let level = Compression::new(self.config.level.min(9));
        let compressor = Compress::new(level, true);
        let decompressor = Decompress::new(true);

        self.compressor = Some(compressor);
        self.decompressor = Some(decompressor);
        self.compress_out = Vec::with_capacity(COMPRESS_RESERVE);
        self.compress_cursor = 0;
        self.decompress_in = vec![0; self.config.input_window.max(1)];
        self.decompress_in_len = 0;
        self.decompress_in_pos = 0;
        self.decompress_out_space = 0;
        self.need_input = true;
        self.stream_ended = false;
        tracing::trace!(level = self.config.level, "compression contexts initialized");
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.compressor.is_some() && self.decompressor.is_some()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Compress all of `src` into the output accumulator.
    ///
    /// Loops single steps until the input cursor reaches `src.len()`. The
    /// output is not decodable by the peer until
    /// [`flush_compression_stream`](Self::flush_compression_stream).
    pub fn compress(&mut self, src: &[u8]) -> Result<(), CompressionError> {
        let mut consumed = 0;
        while consumed < src.len() {
            let (taken, produced, _) =
                self.compress_step(&src[consumed..], FlushCompress::None, COMPRESS_RESERVE)?;
            if taken == 0 && produced == 0 {
                return Err(CompressionError::Codec(
                    "compressor made no progress".to_string(),
                ));
            }
            consumed += taken;
        }
        self.compress_cursor = consumed;
        Ok(())
    }

    /// Run one compress step over `src`, which becomes the current input chunk.
    ///
    /// May stop before consuming everything; returns the input cursor. Callers
    /// resume with `&src[cursor..]`. Prefer [`compress`](Self::compress).
    pub fn compress_partial(&mut self, src: &[u8]) -> Result<usize, CompressionError> {
        self.compress_cursor = 0;
        let (taken, _, _) = self.compress_step(src, FlushCompress::None, COMPRESS_RESERVE)?;
        self.compress_cursor = taken;
        Ok(taken)
    }

    /// Bytes of the current compress input chunk consumed so far.
    pub fn compression_input_consumed(&self) -> usize {
        self.compress_cursor
    }

    /// Sync-flush the compress stream so every byte given so far becomes decodable.
    ///
    /// Repeats flush steps until the codec leaves unused room in the output
    /// window, i.e. it has nothing left to emit.
    pub fn flush_compression_stream(&mut self) -> Result<(), CompressionError> {
        loop {
            let (_, produced, spare) = self.compress_step(&[], FlushCompress::Sync, FLUSH_RESERVE)?;
            if produced < spare {
                return Ok(());
            }
        }
    }

    /// Compressed bytes waiting to be written.
    pub fn compression_out_buffer(&self) -> &[u8] {
        &self.compress_out
    }

    /// Drop the first `n` bytes of the output accumulator after they were written.
    pub fn consume_compressed(&mut self, n: usize) {
        let n = n.min(self.compress_out.len());
        self.compress_out.drain(..n);
    }

    /// Move the whole output accumulator out.
    pub fn take_compressed(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.compress_out, Vec::with_capacity(COMPRESS_RESERVE))
    }

    /// One deflate call into the accumulator's spare capacity.
    ///
    /// Returns `(input consumed, output produced, output space offered)`.
    fn compress_step(
        &mut self,
        input: &[u8],
        flush: FlushCompress,
        reserve: usize,
    ) -> Result<(usize, usize, usize), CompressionError> {
        let ctx = self
            .compressor
            .as_mut()
            .ok_or(CompressionError::NotInitialized)?;
        self.compress_out.reserve(reserve);
        let spare = self.compress_out.capacity() - self.compress_out.len();

        let in_before = ctx.total_in();
        let out_before = ctx.total_out();
        ctx.compress_vec(input, &mut self.compress_out, flush)
            .map_err(|e| {
                tracing::error!("deflate step failed: {e}");
                CompressionError::Codec(e.to_string())
            })?;

        let taken = (ctx.total_in() - in_before) as usize;
        let produced = (ctx.total_out() - out_before) as usize;
        Ok((taken, produced, spare))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// The staging window to receive on-wire bytes into.
    ///
    /// Only overwrite it once [`decompression_stream_consumed_all_input`]
    /// is true, then report the byte count with
    /// [`reset_decompression_stream_input_size`].
    ///
    /// [`decompression_stream_consumed_all_input`]: Self::decompression_stream_consumed_all_input
    /// [`reset_decompression_stream_input_size`]: Self::reset_decompression_stream_input_size
    pub fn decompression_input_window(&mut self) -> &mut [u8] {
        debug_assert!(self.decompression_stream_consumed_all_input());
        &mut self.decompress_in
    }

    /// Mark the first `size` bytes of the staging window as the new input chunk.
    pub fn reset_decompression_stream_input_size(&mut self, size: usize) {
        self.decompress_in_len = size.min(self.decompress_in.len());
        self.decompress_in_pos = 0;
        self.need_input = self.decompress_in_len == 0;
    }

    /// Copy `data` in as the new input chunk, growing the window if needed.
    pub fn set_decompression_input(&mut self, data: &[u8]) {
        if data.len() > self.decompress_in.len() {
            self.decompress_in.resize(data.len(), 0);
        }
        self.decompress_in[..data.len()].copy_from_slice(data);
        self.reset_decompression_stream_input_size(data.len());
    }

    /// Decode as much of the staged input as fits into `dst`.
    ///
    /// Returns the number of bytes written to `dst`.
    pub fn decompress(&mut self, dst: &mut [u8]) -> Result<usize, CompressionError> {
        let ctx = self
            .decompressor
            .as_mut()
            .ok_or(CompressionError::NotInitialized)?;
        let input = &self.decompress_in[self.decompress_in_pos..self.decompress_in_len];

        if self.stream_ended {
            if input.is_empty() {
                self.decompress_out_space = dst.len();
                self.need_input = true;
                return Ok(0);
            }
            return Err(CompressionError::StreamEnded);
        }

        let in_before = ctx.total_in();
        let out_before = ctx.total_out();
        let status = ctx
            .decompress(input, dst, FlushDecompress::None)
            .map_err(|e| {
                tracing::error!("inflate step failed: {e}");
                CompressionError::Corrupt(e.to_string())
            })?;

        let taken = (ctx.total_in() - in_before) as usize;
        let produced = (ctx.total_out() - out_before) as usize;
        self.decompress_in_pos += taken;
        self.decompress_out_space = dst.len() - produced;
        self.stream_ended = status == Status::StreamEnd;
        self.need_input = self.decompression_stream_consumed_all_input() && produced < dst.len();
        Ok(produced)
    }

    /// True when the decoder has consumed the current chunk and cannot produce
    /// more output without more on-wire bytes.
    ///
    /// False while output is still extractable from already-staged input,
    /// including the case where the last call only stopped because `dst` was full.
    pub fn decompression_need_input(&self) -> bool {
        self.need_input
    }

    /// Override the need-input flag.
    pub fn set_decompression_need_input(&mut self, need_input: bool) {
        self.need_input = need_input;
    }

    /// Unused space the last [`decompress`](Self::decompress) left in its output window.
    pub fn available_space_to_decompress(&self) -> usize {
        self.decompress_out_space
    }

    /// Whether the decoder has consumed every staged input byte.
    pub fn decompression_stream_consumed_all_input(&self) -> bool {
        self.decompress_in_pos >= self.decompress_in_len
    }
}

impl Default for CompressionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompressionAdapter {
    fn drop(&mut self) {
        self.compressor = None;
        self.decompressor = None;
        self.compress_out.clear();
        self.decompress_in.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_adapter() -> CompressionAdapter {
        let mut adapter = CompressionAdapter::new();
        adapter.initialize().unwrap();
        adapter
    }

    /// Feed `wire` to `rx` in `chunk`-sized pieces, draining with a small output window.
    fn decode_all(rx: &mut CompressionAdapter, wire: &[u8], chunk: usize, out_window: usize) -> Vec<u8> {
        let mut decoded = Vec::new();
        let mut out = vec![0u8; out_window];
        for piece in wire.chunks(chunk.max(1)) {
            rx.set_decompression_input(piece);
            loop {
                let n = rx.decompress(&mut out).unwrap();
                decoded.extend_from_slice(&out[..n]);
                if rx.decompression_need_input() {
                    break;
                }
            }
        }
        decoded
    }

    fn sample_stream(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31) ^ (i >> 3)) as u8).collect()
    }

    #[test]
    fn test_uninitialized_adapter_rejects_work() {
        let mut adapter = CompressionAdapter::new();
        assert!(!adapter.is_initialized());
        assert_eq!(adapter.compress(b"data"), Err(CompressionError::NotInitialized));
        let mut out = [0u8; 8];
        assert_eq!(adapter.decompress(&mut out), Err(CompressionError::NotInitialized));
    }

    #[test]
    fn test_roundtrip_with_uneven_chunking() {
        let data = sample_stream(50_000);
        let mut tx = ready_adapter();
        for piece in data.chunks(777) {
            tx.compress(piece).unwrap();
        }
        tx.flush_compression_stream().unwrap();
        let wire = tx.take_compressed();

        for (chunk, window) in [(1, 3), (13, 64), (4096, 100_000), (wire.len(), 1)] {
            let mut rx = ready_adapter();
            let decoded = decode_all(&mut rx, &wire, chunk, window);
            assert_eq!(decoded, data, "chunk={chunk} window={window}");
        }
    }

    #[test]
    fn test_interleaved_flushes_roundtrip() {
        let mut tx = ready_adapter();
        let mut rx = ready_adapter();
        let mut expected = Vec::new();
        let mut decoded = Vec::new();

        for round in 0..5u8 {
            let msg: Vec<u8> = std::iter::repeat_n(round, 300 + round as usize * 50).collect();
            tx.compress(&msg).unwrap();
            tx.flush_compression_stream().unwrap();
            expected.extend_from_slice(&msg);

            let wire = tx.take_compressed();
            decoded.extend(decode_all(&mut rx, &wire, 5, 128));
            assert_eq!(decoded, expected, "all data flushed so far must decode");
        }
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let data = vec![0x42u8; 64 * 1024];
        let mut tx = ready_adapter();
        tx.compress(&data).unwrap();
        tx.flush_compression_stream().unwrap();
        assert!(tx.compression_out_buffer().len() < data.len() / 10);
    }

    #[test]
    fn test_compress_consumes_whole_input() {
        let data = sample_stream(200_000);
        let mut tx = ready_adapter();
        tx.compress(&data).unwrap();
        assert_eq!(tx.compression_input_consumed(), data.len());
    }

    #[test]
    fn test_compress_partial_resumes_from_cursor() {
        let data = sample_stream(100_000);
        let mut tx = ready_adapter();
        let mut offset = 0;
        while offset < data.len() {
            offset += tx.compress_partial(&data[offset..]).unwrap();
        }
        tx.flush_compression_stream().unwrap();

        let mut rx = ready_adapter();
        let wire = tx.take_compressed();
        assert_eq!(decode_all(&mut rx, &wire, 1500, 4096), data);
    }

    #[test]
    fn test_flush_without_data_emits_sync_marker_only() {
        let mut tx = ready_adapter();
        tx.flush_compression_stream().unwrap();
        let wire = tx.take_compressed();
        assert!(!wire.is_empty());

        let mut rx = ready_adapter();
        assert!(decode_all(&mut rx, &wire, 2, 16).is_empty());
    }

    #[test]
    fn test_need_input_false_while_output_remains() {
        let data = vec![7u8; 10_000];
        let mut tx = ready_adapter();
        tx.compress(&data).unwrap();
        tx.flush_compression_stream().unwrap();
        let wire = tx.take_compressed();

        let mut rx = ready_adapter();
        assert!(rx.decompression_need_input(), "fresh decoder needs input");
        rx.set_decompression_input(&wire);
        assert!(!rx.decompression_need_input());

        let mut out = [0u8; 100];
        let n = rx.decompress(&mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(rx.available_space_to_decompress(), 0);
        assert!(
            !rx.decompression_need_input(),
            "a full output window means more output may be pending"
        );

        let mut big = vec![0u8; 20_000];
        let mut total = n;
        loop {
            total += rx.decompress(&mut big).unwrap();
            if rx.decompression_need_input() {
                break;
            }
        }
        assert_eq!(total, data.len());
        assert!(rx.decompression_stream_consumed_all_input());
        assert!(rx.available_space_to_decompress() > 0);
    }

    #[test]
    fn test_partial_frame_needs_input() {
        let mut tx = ready_adapter();
        tx.compress(b"hello, lobby").unwrap();
        tx.flush_compression_stream().unwrap();
        let wire = tx.take_compressed();

        let mut rx = ready_adapter();
        rx.set_decompression_input(&wire[..1]);
        let mut out = [0u8; 64];
        let n = rx.decompress(&mut out).unwrap();
        assert_eq!(n, 0);
        assert!(rx.decompression_stream_consumed_all_input());
        assert!(rx.decompression_need_input());
    }

    #[test]
    fn test_zero_copy_input_window() {
        let mut tx = ready_adapter();
        tx.compress(b"zero copy").unwrap();
        tx.flush_compression_stream().unwrap();
        let wire = tx.take_compressed();

        let mut rx = ready_adapter();
        let window = rx.decompression_input_window();
        window[..wire.len()].copy_from_slice(&wire);
        rx.reset_decompression_stream_input_size(wire.len());

        let mut out = [0u8; 32];
        let n = rx.decompress(&mut out).unwrap();
        assert_eq!(&out[..n], b"zero copy");
    }

    #[test]
    fn test_plain_bytes_surface_corrupt_error() {
        let mut rx = ready_adapter();
        rx.set_decompression_input(b"this is definitely not a zlib stream");
        let mut out = [0u8; 64];
        let result = rx.decompress(&mut out);
        assert!(matches!(result, Err(CompressionError::Corrupt(_))), "{result:?}");
    }

    #[test]
    fn test_consume_compressed_drains_prefix() {
        let mut tx = ready_adapter();
        tx.compress(&sample_stream(1000)).unwrap();
        tx.flush_compression_stream().unwrap();
        let total = tx.compression_out_buffer().len();
        let tail = tx.compression_out_buffer()[3..].to_vec();
        tx.consume_compressed(3);
        assert_eq!(tx.compression_out_buffer().len(), total - 3);
        assert_eq!(tx.compression_out_buffer(), &tail[..]);
        tx.consume_compressed(usize::MAX);
        assert!(tx.compression_out_buffer().is_empty());
    }
}
