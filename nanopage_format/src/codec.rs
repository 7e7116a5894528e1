use crate::error::CodecError;

/// Compression used for page payloads.
///
/// Decompression runs on worker threads and must not touch shared state.
pub trait PageCodec: Send + Sync + 'static {
    fn compress(&self, src: &[u8]) -> Vec<u8>;

    /// Largest output [`PageCodec::compress`] can produce for `uncompressed_size` input bytes.
    fn max_compressed_size(&self, uncompressed_size: usize) -> usize;

    /// Decompresses `src`, failing unless exactly `uncompressed_size` bytes come out.
    fn decompress(&self, src: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError>;
}

/// Payloads stored as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredCodec;

impl PageCodec for StoredCodec {
    fn compress(&self, src: &[u8]) -> Vec<u8> {
        src.to_vec()
    }

    fn max_compressed_size(&self, uncompressed_size: usize) -> usize {
        uncompressed_size
    }

    fn decompress(&self, src: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError> {
        if src.len() != uncompressed_size {
            return Err(CodecError::SizeMismatch {
                expected: uncompressed_size,
                actual: src.len(),
            });
        }
        Ok(src.to_vec())
    }
}

/// LZ4 block compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl PageCodec for Lz4Codec {
    fn compress(&self, src: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(src)
    }

    fn max_compressed_size(&self, uncompressed_size: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(uncompressed_size)
    }

    fn decompress(&self, src: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError> {
        let out = lz4_flex::block::decompress(src, uncompressed_size)
            .map_err(|e| CodecError::Corrupt(e.to_string()))?;
        if out.len() != uncompressed_size {
            return Err(CodecError::SizeMismatch {
                expected: uncompressed_size,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}
