//! Block-cipher codec for archive chunks.
//!
//! The archive format encrypts chunk payloads with AES in CBC mode. The
//! codec operates on whole cipher blocks only and never pads its own
//! stream; the chunk layer is responsible for zero-filling the tail so
//! that a whole number of blocks is emitted.
//!
//! The master key is derived once per archive from the deployed password
//! and the archive salt; each entry header and each data part gets a
//! fresh random IV so CBC chains never repeat across chunks.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::password::Password;

pub const SALT_LENGTH: usize = 16;
pub const IV_LENGTH: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Supported symmetric ciphers. The small integer ids are part of the
/// on-disk format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptAlgorithm {
    None,
    Aes128,
    Aes192,
    Aes256,
}

impl CryptAlgorithm {
    pub fn id(self) -> u16 {
        match self {
            CryptAlgorithm::None => 0,
            CryptAlgorithm::Aes128 => 1,
            CryptAlgorithm::Aes192 => 2,
            CryptAlgorithm::Aes256 => 3,
        }
    }

    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(CryptAlgorithm::None),
            1 => Ok(CryptAlgorithm::Aes128),
            2 => Ok(CryptAlgorithm::Aes192),
            3 => Ok(CryptAlgorithm::Aes256),
            other => Err(Error::UnsupportedCipher(other)),
        }
    }

    /// Cipher block length; chunk headers are aligned to this.
    pub fn block_length(self) -> usize {
        match self {
            CryptAlgorithm::None => 1,
            _ => 16,
        }
    }

    pub fn key_length(self) -> usize {
        match self {
            CryptAlgorithm::None => 0,
            CryptAlgorithm::Aes128 => 16,
            CryptAlgorithm::Aes192 => 24,
            CryptAlgorithm::Aes256 => 32,
        }
    }
}

/// Derived key material, wiped on drop.
pub struct CryptKey {
    bytes: Vec<u8>,
}

impl CryptKey {
    /// Derive key material for `algorithm` from a deployed password and
    /// the per-archive salt (PBKDF2-HMAC-SHA256).
    pub fn derive(algorithm: CryptAlgorithm, password: &Password, salt: &[u8]) -> Self {
        let mut bytes = vec![0u8; algorithm.key_length()];
        if !bytes.is_empty() {
            password.with_plain(|plain| {
                pbkdf2_hmac::<Sha256>(plain, salt, PBKDF2_ROUNDS, &mut bytes);
            });
        }
        CryptKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for CryptKey {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            // SAFETY: valid pointer into the owned buffer.
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Streaming encryptor over whole blocks. CBC chaining state persists
/// across calls, so a chunk payload may be fed in several slices.
pub enum Encryptor {
    Plain,
    Aes128(Box<Aes128CbcEnc>),
    Aes192(Box<Aes192CbcEnc>),
    Aes256(Box<Aes256CbcEnc>),
}

impl Encryptor {
    pub fn new(algorithm: CryptAlgorithm, key: &CryptKey, iv: &[u8]) -> Result<Self> {
        match algorithm {
            CryptAlgorithm::None => Ok(Encryptor::Plain),
            CryptAlgorithm::Aes128 => Aes128CbcEnc::new_from_slices(key.as_bytes(), iv)
                .map(|c| Encryptor::Aes128(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
            CryptAlgorithm::Aes192 => Aes192CbcEnc::new_from_slices(key.as_bytes(), iv)
                .map(|c| Encryptor::Aes192(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
            CryptAlgorithm::Aes256 => Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
                .map(|c| Encryptor::Aes256(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
        }
    }

    /// Encrypt `buffer` in place. The length must be a whole number of
    /// cipher blocks.
    pub fn process(&mut self, buffer: &mut [u8]) {
        match self {
            Encryptor::Plain => {}
            Encryptor::Aes128(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Encryptor::Aes192(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Encryptor::Aes256(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}

/// Streaming decryptor; the mirror of [`Encryptor`].
pub enum Decryptor {
    Plain,
    Aes128(Box<Aes128CbcDec>),
    Aes192(Box<Aes192CbcDec>),
    Aes256(Box<Aes256CbcDec>),
}

impl Decryptor {
    pub fn new(algorithm: CryptAlgorithm, key: &CryptKey, iv: &[u8]) -> Result<Self> {
        match algorithm {
            CryptAlgorithm::None => Ok(Decryptor::Plain),
            CryptAlgorithm::Aes128 => Aes128CbcDec::new_from_slices(key.as_bytes(), iv)
                .map(|c| Decryptor::Aes128(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
            CryptAlgorithm::Aes192 => Aes192CbcDec::new_from_slices(key.as_bytes(), iv)
                .map(|c| Decryptor::Aes192(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
            CryptAlgorithm::Aes256 => Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
                .map(|c| Decryptor::Aes256(Box::new(c)))
                .map_err(|_| Error::UnsupportedCipher(algorithm.id())),
        }
    }

    /// Decrypt `buffer` in place. The length must be a whole number of
    /// cipher blocks.
    pub fn process(&mut self, buffer: &mut [u8]) {
        match self {
            Decryptor::Plain => {}
            Decryptor::Aes128(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Decryptor::Aes192(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Decryptor::Aes256(cipher) => {
                debug_assert_eq!(buffer.len() % 16, 0);
                for block in buffer.chunks_exact_mut(16) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: CryptAlgorithm) {
        let password = Password::from_bytes(b"correct horse");
        let salt = generate_salt();
        let iv = generate_iv();
        let key = CryptKey::derive(algorithm, &password, &salt);

        let plain = b"0123456789abcdef0123456789abcdef".to_vec();
        let mut buffer = plain.clone();

        let mut enc = Encryptor::new(algorithm, &key, &iv).unwrap();
        enc.process(&mut buffer);
        if algorithm != CryptAlgorithm::None {
            assert_ne!(buffer, plain);
        }

        let mut dec = Decryptor::new(algorithm, &key, &iv).unwrap();
        dec.process(&mut buffer);
        assert_eq!(buffer, plain);
    }

    #[test]
    fn roundtrip_all_algorithms() {
        roundtrip(CryptAlgorithm::None);
        roundtrip(CryptAlgorithm::Aes128);
        roundtrip(CryptAlgorithm::Aes192);
        roundtrip(CryptAlgorithm::Aes256);
    }

    #[test]
    fn chaining_is_stream_equivalent() {
        // Feeding one 32-byte slice must equal feeding two 16-byte slices.
        let password = Password::from_bytes(b"pw");
        let salt = [7u8; SALT_LENGTH];
        let iv = [9u8; IV_LENGTH];
        let key = CryptKey::derive(CryptAlgorithm::Aes256, &password, &salt);

        let plain = [0x5au8; 32];

        let mut whole = plain;
        let mut enc = Encryptor::new(CryptAlgorithm::Aes256, &key, &iv).unwrap();
        enc.process(&mut whole);

        let mut split = plain;
        let mut enc = Encryptor::new(CryptAlgorithm::Aes256, &key, &iv).unwrap();
        let (a, b) = split.split_at_mut(16);
        enc.process(a);
        enc.process(b);

        assert_eq!(whole, split);
    }

    #[test]
    fn wrong_iv_garbles() {
        let password = Password::from_bytes(b"pw");
        let salt = [1u8; SALT_LENGTH];
        let key = CryptKey::derive(CryptAlgorithm::Aes128, &password, &salt);

        let mut buffer = [0x11u8; 16];
        let mut enc = Encryptor::new(CryptAlgorithm::Aes128, &key, &[2u8; 16]).unwrap();
        enc.process(&mut buffer);
        let mut dec = Decryptor::new(CryptAlgorithm::Aes128, &key, &[3u8; 16]).unwrap();
        dec.process(&mut buffer);
        assert_ne!(buffer, [0x11u8; 16]);
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(matches!(CryptAlgorithm::from_id(99), Err(Error::UnsupportedCipher(99))));
    }
}
