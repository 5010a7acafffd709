//! Snappy compression of occurrence payloads.
//!
//! Payloads are compressed individually before insertion so the event
//! builder downstream can decompress single occurrences without context.

use snap::raw::{Decoder, Encoder};

use super::error::SinkError;

/// Compress one payload. The record's `compressed` flag tells readers the
/// payload needs [`decompress_payload`] before use.
pub fn compress_payload(bytes: &[u8]) -> Result<Vec<u8>, SinkError> {
    Ok(Encoder::new().compress_vec(bytes)?)
}

/// Inverse of [`compress_payload`].
pub fn decompress_payload(bytes: &[u8]) -> Result<Vec<u8>, SinkError> {
    Ok(Decoder::new().decompress_vec(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_restores_payload() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|w| (w % 97).to_le_bytes()).collect();
        let compressed = compress_payload(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress_payload(&compressed).unwrap(), payload);
    }

    #[test]
    fn garbage_fails_to_decompress() {
        assert!(decompress_payload(&[0xFF, 0x00, 0x12, 0x34]).is_err());
    }
}
