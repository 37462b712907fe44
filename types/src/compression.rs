use anyhow::{Context, Result};
use std::io::{Read, Write};

/// Compresses a WAL batch payload with LZ4.
pub fn compress_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut compressed = Vec::with_capacity(payload.len() / 2);
    let mut encoder = lz4::EncoderBuilder::new()
        .level(10)
        .build(&mut compressed)
        .with_context(|| "allocating lz4 encoder")?;
    encoder
        .write_all(payload)
        .with_context(|| "writing to lz4 encoder")?;
    let (_writer, res) = encoder.finish();
    res.with_context(|| "closing lz4 encoder")?;
    Ok(compressed)
}

/// Decompresses a WAL batch payload.
pub fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = lz4::Decoder::new(compressed).with_context(|| "allocating lz4 decoder")?;
    let mut payload = Vec::with_capacity(compressed.len() * 2);
    decoder
        .read_to_end(&mut payload)
        .with_context(|| "reading lz4-compressed payload")?;
    let (_reader, res) = decoder.finish();
    res?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress_payload(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress_payload(&compressed).unwrap(), payload);
    }
}
