//! Payload pipeline pieces: document encoding, compression framing,
//! chunking and reassembly.
//!
//! Application objects are CBOR documents. The encoded document gets a
//! one-byte compression flag (`0xff` zlib, `0x00` raw), then splits
//! into chunks of at most `max_payload` bytes. A single-chunk message
//! is prefixed with a four-zero-byte sentinel; multi-chunk messages
//! carry `index(2) || count(2) || mid(4)` headers so the receiver can
//! reassemble in any arrival order.

use crate::error::{Error, FrameError};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Compression flag: payload is raw
pub const FLAG_RAW: u8 = 0x00;
/// Compression flag: payload is zlib-compressed
pub const FLAG_ZLIB: u8 = 0xff;

/// Sentinel marking a single-chunk message
pub const SINGLE_CHUNK_SENTINEL: [u8; 4] = [0; 4];

/// Length of the `index || count || mid` chunk header
pub const CHUNK_HEADER_LEN: usize = 8;

/// Self-describing document value delivered to the application
pub type Document = ciborium::value::Value;

/// Encode an application object as a CBOR document.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the value cannot be serialized.
pub fn encode_document<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(out)
}

/// Decode a CBOR document.
///
/// # Errors
///
/// Returns [`Error::Codec`] on malformed input.
pub fn decode_document(bytes: &[u8]) -> Result<Document, Error> {
    ciborium::de::from_reader(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Prefix the encoded document with its compression flag, compressing
/// when it is small enough to be worth the CPU.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the zlib encoder fails.
pub fn compress(encoded: &[u8], max_compression: usize) -> Result<Vec<u8>, Error> {
    if encoded.len() < max_compression {
        let mut out = vec![FLAG_ZLIB];
        let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
        encoder
            .write_all(encoded)
            .and_then(|()| encoder.finish().map(|_| ()))
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(1 + encoded.len());
        out.push(FLAG_RAW);
        out.extend_from_slice(encoded);
        Ok(out)
    }
}

/// Undo [`compress`] given the flag byte and the body after it.
///
/// # Errors
///
/// Returns [`Error::UnknownCompression`] for an unrecognized flag and
/// [`Error::Codec`] on corrupt zlib data.
pub fn decompress(flag: u8, body: &[u8]) -> Result<Vec<u8>, Error> {
    match flag {
        FLAG_RAW => Ok(body.to_vec()),
        FLAG_ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| Error::Codec(e.to_string()))?;
            Ok(out)
        }
        other => Err(Error::UnknownCompression(other)),
    }
}

/// Decode a reassembled flagged payload into a document.
///
/// # Errors
///
/// Propagates [`decompress`] and [`decode_document`] failures; rejects
/// an empty body.
pub fn decode_body(body: &[u8]) -> Result<Document, Error> {
    let (flag, rest) = body
        .split_first()
        .ok_or(Error::Frame(FrameError::ChunkHeader))?;
    let encoded = decompress(*flag, rest)?;
    decode_document(&encoded)
}

/// Split a flagged payload into plaintext chunks ready for encryption.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] when more than `2^16 - 1` chunks
/// would be needed.
pub fn split_chunks(
    payload: &[u8],
    max_payload: usize,
    mid: [u8; 4],
) -> Result<Vec<Vec<u8>>, Error> {
    let count = payload.len().saturating_sub(1) / max_payload + 1;
    if count == 1 {
        let mut chunk = Vec::with_capacity(4 + payload.len());
        chunk.extend_from_slice(&SINGLE_CHUNK_SENTINEL);
        chunk.extend_from_slice(payload);
        return Ok(vec![chunk]);
    }
    if count > u16::MAX as usize {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let mut chunks = Vec::with_capacity(count);
    for (index, piece) in payload.chunks(max_payload).enumerate() {
        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + piece.len());
        chunk.extend_from_slice(&(index as u16).to_be_bytes());
        chunk.extend_from_slice(&(count as u16).to_be_bytes());
        chunk.extend_from_slice(&mid);
        chunk.extend_from_slice(piece);
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Parsed multi-chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk index
    pub index: u16,
    /// Total chunk count for the message
    pub count: u16,
    /// Message id shared by all chunks of one send
    pub mid: [u8; 4],
}

/// Parse a decrypted chunk into its header and body.
///
/// # Errors
///
/// Returns [`FrameError::ChunkHeader`] when the chunk is shorter than
/// its header.
pub fn parse_chunk(plain: &[u8]) -> Result<(ChunkHeader, &[u8]), FrameError> {
    if plain.len() < CHUNK_HEADER_LEN {
        return Err(FrameError::ChunkHeader);
    }
    let header = ChunkHeader {
        index: u16::from_be_bytes([plain[0], plain[1]]),
        count: u16::from_be_bytes([plain[2], plain[3]]),
        mid: [plain[4], plain[5], plain[6], plain[7]],
    };
    Ok((header, &plain[CHUNK_HEADER_LEN..]))
}

/// Fragment buffer keyed by message id
#[derive(Debug, Default)]
pub struct Reassembly {
    pending: HashMap<[u8; 4], HashMap<u16, Vec<u8>>>,
}

impl Reassembly {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one chunk; returns the concatenated flagged payload once
    /// every index of the message has arrived.
    pub fn insert(&mut self, header: ChunkHeader, body: Vec<u8>) -> Option<Vec<u8>> {
        let slots = self.pending.entry(header.mid).or_default();
        slots.insert(header.index, body);

        if slots.len() == header.count as usize
            && (0..header.count).all(|index| slots.contains_key(&index))
        {
            let mut slots = self.pending.remove(&header.mid)?;
            let mut payload = Vec::new();
            for index in 0..header.count {
                payload.extend_from_slice(&slots.remove(&index)?);
            }
            return Some(payload);
        }
        None
    }
}
