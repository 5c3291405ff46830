//! Checkpoint byte format
//!
//! ```text
//! +-------+---------+------------------+-------------------+
//! | STCK  | version | blake3(body) 32B | CBOR(Checkpoint)  |
//! +-------+---------+------------------+-------------------+
//! ```

use strand_core::{Checkpoint, RunId, StoreError};

const MAGIC: &[u8; 4] = b"STCK";
const FORMAT_VERSION: u8 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + DIGEST_LEN;

/// Encode a checkpoint with its integrity header
pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Vec<u8>, StoreError> {
    let body = serde_cbor::to_vec(checkpoint).map_err(|e| StoreError::Io {
        reason: format!("encode checkpoint for {}: {e}", checkpoint.run_id),
    })?;
    let digest = blake3::hash(&body);

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(digest.as_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode and verify the checkpoint stored under `run_id`
pub fn decode_checkpoint(run_id: RunId, bytes: &[u8]) -> Result<Checkpoint, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { run_id, reason };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("truncated header ({} bytes)", bytes.len())));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    let version = header[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {version}")));
    }
    let expected = &header[MAGIC.len() + 1..];
    if blake3::hash(body).as_bytes().as_slice() != expected {
        return Err(corrupt("digest mismatch".to_string()));
    }

    let checkpoint: Checkpoint =
        serde_cbor::from_slice(body).map_err(|e| corrupt(format!("decode: {e}")))?;
    if checkpoint.run_id != run_id {
        return Err(corrupt(format!(
            "stored under {run_id} but belongs to {}",
            checkpoint.run_id
        )));
    }
    Ok(checkpoint)
}
