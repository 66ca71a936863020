//! Credential vault for datastore passwords stored at rest.
//!
//! Passwords are encrypted with AES-256-CBC (PKCS#7 padding). The key is the
//! SHA-256 digest of a shared secret and every encryption uses a fresh random IV.
//!
//! # Stored Format
//!
//! `hex(ciphertext):hex(iv)`, for example
//! `9f2c...e1:00112233445566778899aabbccddeeff`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("encrypted value is missing the ':' delimiter")]
    MissingDelimiter,

    #[error("encrypted value is not valid hex")]
    InvalidHex,

    #[error("initialization vector must be {IV_LEN} bytes")]
    InvalidIv,

    #[error("padding validation failed")]
    BadPadding,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Symmetric encryption of stored datastore passwords.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Derive the vault key by hashing the shared secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt `plaintext` into `hex(ciphertext):hex(iv)`.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let iv: [u8; IV_LEN] = rand::random();
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}:{}", hex::encode(ciphertext), hex::encode(iv))
    }

    /// Decrypt a value produced by [`CredentialVault::encrypt`].
    ///
    /// # Errors
    ///
    /// Fails when the delimiter is missing, either half is not hex, the IV has the
    /// wrong length, the padding does not validate, or the plaintext is not UTF-8.
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let (ciphertext_hex, iv_hex) = encoded
            .split_once(':')
            .ok_or(VaultError::MissingDelimiter)?;

        let ciphertext = hex::decode(ciphertext_hex).map_err(|_| VaultError::InvalidHex)?;
        let iv = hex::decode(iv_hex).map_err(|_| VaultError::InvalidHex)?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| VaultError::InvalidIv)?;

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| VaultError::BadPadding)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::InvalidUtf8)
    }

    /// Encrypt `value` unless it already decrypts cleanly.
    ///
    /// Used before persisting a password field so that re-saving a record does not
    /// encrypt ciphertext a second time. A plaintext that happens to look like
    /// `hex:hex` with a 16-byte IV and valid padding under this key is kept as-is;
    /// that misclassification is possible, if unlikely.
    pub fn seal_if_plain(&self, value: &str) -> String {
        match self.decrypt(value) {
            Ok(_) => value.to_string(),
            Err(_) => self.encrypt(value),
        }
    }
}
