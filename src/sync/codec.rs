//! Snapshot Codec - Remote catalog wire format
//!
//! The remote catalog is a gzip-compressed JSON envelope:
//! `{format, schema_version, generation, updated_by, updated_at, checksum, records}`
//! where `checksum` is the SHA-256 (hex) of the JSON-encoded `records` array.
//! Records are written sorted by id so the checksum is reproducible.

use super::models::{CatalogRecord, CatalogSnapshot, VersionTriple};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format: u32,
    schema_version: VersionTriple,
    generation: u64,
    updated_by: String,
    updated_at: DateTime<Utc>,
    checksum: String,
    records: Vec<CatalogRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot format: {0}")]
    UnsupportedFormat(u32),

    #[error("Checksum mismatch - snapshot may be corrupted (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Duplicate record id in snapshot: {0}")]
    DuplicateRecord(String),
}

/// Encode a snapshot for upload
pub fn encode_snapshot(snapshot: &CatalogSnapshot) -> Result<Vec<u8>, CodecError> {
    let mut records = snapshot.records.clone();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let envelope = SnapshotEnvelope {
        format: FORMAT_VERSION,
        schema_version: snapshot.schema_version,
        generation: snapshot.generation,
        updated_by: snapshot.updated_by.clone(),
        updated_at: snapshot.updated_at,
        checksum: records_checksum(&records)?,
        records,
    };

    let json = serde_json::to_vec(&envelope)?;
    gzip_compress(&json)
}

/// Decode and verify a downloaded snapshot
pub fn decode_snapshot(data: &[u8]) -> Result<CatalogSnapshot, CodecError> {
    let json = gzip_decompress(data)?;
    let envelope: SnapshotEnvelope = serde_json::from_slice(&json)?;

    if envelope.format != FORMAT_VERSION {
        return Err(CodecError::UnsupportedFormat(envelope.format));
    }

    let actual = records_checksum(&envelope.records)?;
    if actual != envelope.checksum {
        return Err(CodecError::ChecksumMismatch {
            expected: envelope.checksum,
            actual,
        });
    }

    let mut seen = std::collections::HashSet::new();
    for record in &envelope.records {
        if !seen.insert(record.id.as_str()) {
            return Err(CodecError::DuplicateRecord(record.id.clone()));
        }
    }

    Ok(CatalogSnapshot {
        schema_version: envelope.schema_version,
        generation: envelope.generation,
        updated_by: envelope.updated_by,
        updated_at: envelope.updated_at,
        records: envelope.records,
    })
}

fn records_checksum(records: &[CatalogRecord]) -> Result<String, CodecError> {
    let json = serde_json::to_vec(records)?;
    Ok(compute_sha256(&json))
}

/// SHA-256 of data as lowercase hex
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
