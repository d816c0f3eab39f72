use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// One transport-ready slice of a part. `index` counts from zero and
/// `raw_len` is the pre-encoding byte count, used for progress accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChunk {
    pub index: usize,
    pub raw_len: usize,
    pub payload: String,
}

/// Splits a part's bytes into fixed-size slices and base64-encodes each
/// one. The device decodes chunks in arrival order, so chunk `i` always
/// covers the byte range `[i * chunk_size, min((i + 1) * chunk_size, len))`.
#[derive(Clone, Copy, Debug)]
pub struct ChunkEncoder {
    chunk_size: usize,
}

impl ChunkEncoder {
    /// Panics when `chunk_size` is zero; the config layer rejects that
    /// value before an encoder is ever built.
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be greater than zero");
        ChunkEncoder { chunk_size }
    }

    /// Lazy and restartable: calling this again on the same buffer yields
    /// the identical sequence.
    pub fn encode<'a>(&self, buf: &'a [u8]) -> impl Iterator<Item = EncodedChunk> + 'a {
        buf.chunks(self.chunk_size)
            .enumerate()
            .map(|(index, raw)| EncodedChunk {
                index,
                raw_len: raw.len(),
                payload: STANDARD.encode(raw),
            })
    }

    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }
}
