//! Image digests declared by init metadata and their local verification.

use crc16::{State, CCITT_FALSE};
use sha2::{Digest, Sha256};

use super::error::{DfuError, DfuResult};
use super::package::InitPacketData;

/// CRC16 used by Nordic bootloaders (CCITT, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    State::<CCITT_FALSE>::calculate(data)
}

/// CRC32 (IEEE) as reported by Secure DFU checksum responses.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Digest of an image as declared by its init metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDigest {
    Crc16(u16),
    Sha256([u8; 32]),
}

impl ImageDigest {
    pub fn algorithm(&self) -> &'static str {
        match self {
            ImageDigest::Crc16(_) => "CRC16",
            ImageDigest::Sha256(_) => "SHA-256",
        }
    }

    /// Digest from the manifest's `init_packet_data`, preferring the hash.
    pub fn from_init_packet_data(data: &InitPacketData) -> DfuResult<Option<Self>> {
        if let Some(hash) = data.firmware_hash.as_deref() {
            let mut out = [0u8; 32];
            hex::decode_to_slice(hash, &mut out).map_err(|e| DfuError::InvalidManifest {
                reason: format!("firmware_hash is not a SHA-256 hex string: {}", e),
            })?;
            return Ok(Some(ImageDigest::Sha256(out)));
        }
        Ok(data.firmware_crc16.map(ImageDigest::Crc16))
    }

    /// CRC16 trailer of a basic Legacy init packet.
    ///
    /// Layout: device type u16, revision u16, application version u32,
    /// SoftDevice count u16, SoftDevice list u16 * count, CRC16 u16.
    pub fn from_legacy_init_packet(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let count = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let expected_len = 12 + count * 2;
        if bytes.len() != expected_len {
            return None;
        }
        let crc = u16::from_le_bytes([bytes[expected_len - 2], bytes[expected_len - 1]]);
        Some(ImageDigest::Crc16(crc))
    }

    /// Does `data` hash to this digest?
    pub fn verify(&self, data: &[u8]) -> DfuResult<()> {
        let matches = match self {
            ImageDigest::Crc16(expected) => crc16(data) == *expected,
            ImageDigest::Sha256(expected) => Sha256::digest(data).as_slice() == expected,
        };
        if matches {
            Ok(())
        } else {
            Err(DfuError::DigestMismatch {
                algorithm: self.algorithm(),
            })
        }
    }
}
