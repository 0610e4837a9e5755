// AES-128-CBC segment decryption primitives.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::hls::HlsDownloaderError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Key material resolved for a session, applied to every admitted segment.
#[derive(Debug, Clone, Copy)]
pub struct DecryptionContext {
    pub key: [u8; 16],
    /// Fixed IV from the manifest or an override. When absent, the IV is
    /// derived per segment from its sequence position.
    pub iv: Option<[u8; 16]>,
}

impl DecryptionContext {
    /// IV to use for the segment at the given sequence position.
    pub fn iv_for(&self, sequence: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| sequence_iv(sequence))
    }
}

/// Big-endian sequence number in the low 8 bytes, the standard HLS IV
/// derivation when the playlist does not carry one.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Parse a hex IV string, with or without a `0x` prefix.
pub fn parse_iv_hex(iv_hex: &str) -> Result<[u8; 16], HlsDownloaderError> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv).map_err(|e| {
        HlsDownloaderError::DecryptionError(format!("Failed to parse IV '{iv_hex}': {e}"))
    })?;
    Ok(iv)
}

/// Parse a hex AES-128 key string.
pub fn parse_key_hex(key_hex: &str) -> Result<[u8; 16], HlsDownloaderError> {
    let trimmed = key_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut key = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut key).map_err(|e| {
        HlsDownloaderError::DecryptionError(format!("Failed to parse key '{key_hex}': {e}"))
    })?;
    Ok(key)
}

/// Decrypt one AES-128-CBC segment body with PKCS7 padding.
pub fn decrypt_aes128(
    data: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Bytes, HlsDownloaderError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        HlsDownloaderError::DecryptionError(format!("Failed to initialize AES decryptor: {e}"))
    })?;

    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| HlsDownloaderError::DecryptionError(format!("Decryption failed: {e}")))?
        .len();

    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}
