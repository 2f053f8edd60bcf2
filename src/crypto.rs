//! C1: crypto primitives. AES-128-CBC encrypt/decrypt, SHA-1, and the
//! per-partition title key derivation, plus an optional real RSA-2048
//! signature check behind the `strict-sig` feature.

use aes::{
    cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    Aes128,
};
use sha1::{Digest, Sha1};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// The common keys indexed by a ticket's `common_key_index` (spec.md 4.1).
/// Real deployments provide these out of band; we only keep the slots.
#[derive(Debug, Clone)]
pub struct CommonKeys {
    pub keys: [[u8; 16]; 2],
}

impl CommonKeys {
    pub fn new(normal: [u8; 16], korean: [u8; 16]) -> Self {
        Self { keys: [normal, korean] }
    }

    pub fn get(&self, index: u8) -> Option<&[u8; 16]> {
        self.keys.get(index as usize)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("buffer has the wrong length for this operation")]
    BadLength,
    #[error("unsupported common key index {0}")]
    BadCommonKeyIndex(u8),
}

/// AES-CBC-decrypt `wrapped_title_key` with `common_key` and IV
/// `title_id ++ 0,0,0,0,0,0,0,0` to recover the per-partition AES key.
pub fn derive_title_key(
    common_key: &[u8; 16],
    title_id: &[u8; 8],
    wrapped_title_key: &[u8; 16],
) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(title_id);
    let mut key = *wrapped_title_key;
    Aes128CbcDec::new(common_key.into(), (&iv).into())
        .decrypt_padded_mut::<NoPadding>(&mut key)
        .expect("fixed 16-byte buffer is always block aligned");
    key
}

/// Encrypts `buf` in place with CBC and the given key/iv. `buf.len()` must be
/// a multiple of 16.
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) -> Result<(), CryptoError> {
    if buf.len() % 16 != 0 {
        return Err(CryptoError::BadLength);
    }
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, buf.len())
        .map_err(|_| CryptoError::BadLength)?;
    Ok(())
}

/// Decrypts `buf` in place with CBC and the given key/iv. `buf.len()` must be
/// a multiple of 16.
pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) -> Result<(), CryptoError> {
    if buf.len() % 16 != 0 {
        return Err(CryptoError::BadLength);
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| CryptoError::BadLength)?;
    Ok(())
}

/// One-shot SHA-1.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental SHA-1, used by the hash tree engine so the same `Sha1` state
/// can be reused across the 31+8+8+1 digests of a group without
/// reallocating (matches hash_encrypt_block's `finalize_reset` usage).
pub struct IncrementalSha1 {
    hasher: Sha1,
}

impl Default for IncrementalSha1 {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalSha1 {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self
    }

    pub fn finalize_reset(&mut self) -> [u8; 20] {
        self.hasher.finalize_reset().into()
    }
}

#[cfg(feature = "strict-sig")]
pub mod sig {
    use rsa::{pkcs1v15::Pkcs1v15Sign, traits::PublicKeyParts, BigUint, RsaPublicKey};
    use sha1::{Digest, Sha1};

    #[derive(thiserror::Error, Debug)]
    pub enum SigError {
        #[error("signature verification failed")]
        Invalid,
        #[error("malformed public key")]
        BadKey,
    }

    /// Verifies an RSA-2048 PKCS#1 v1.5 signature over `signed_region` using
    /// the modulus/exponent pulled from a certificate body (spec.md 4.1,
    /// "optional"). Strict mode is opt-in; fake-signed disc images are the
    /// common case and never reach this path.
    pub fn rsa2048_sha1_verify(
        modulus: &[u8],
        exponent: u32,
        signature: &[u8; 256],
        signed_region: &[u8],
    ) -> Result<(), SigError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from(exponent);
        let key = RsaPublicKey::new(n, e).map_err(|_| SigError::BadKey)?;
        debug_assert_eq!(key.size(), 256);
        let digest = Sha1::digest(signed_region);
        key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|_| SigError::Invalid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            sha1(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn cbc_round_trip() {
        let key = [0u8; 16];
        let iv = [1u8; 16];
        let mut buf = [0x42u8; 32];
        let plain = buf;
        aes_cbc_encrypt(&key, &iv, &mut buf).unwrap();
        assert_ne!(buf, plain);
        aes_cbc_decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn bad_length_rejected() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        let mut buf = [0u8; 15];
        assert!(matches!(aes_cbc_encrypt(&key, &iv, &mut buf), Err(CryptoError::BadLength)));
    }
}
