//! Password sealing of the wallet seed.
//!
//! The seed words are encrypted with ChaCha20-Poly1305 under a key derived from
//! the password with Argon2id. A blake3 hash of the derived key (the verifier)
//! is stored next to the ciphertext so a wrong password is told apart from a
//! damaged blob before the AEAD is even tried.
//!
//! ```text
//! password ──Argon2id(salt, kdf)──▶ key ──blake3──▶ verifier
//!                                    │
//! seed words ──ChaCha20-Poly1305(key, nonce, AAD)──▶ ciphertext
//! ```
//!
//! The sealed document is JSON with base64 fields and carries its own KDF
//! parameters, so blobs stay readable after the defaults change.

use crate::error::SealError;
use crate::secret::SeedPhrase;
use crate::session::config::KdfParams;
use argon2::{Algorithm, Argon2, Params, Version};
use bip39::{Language, Mnemonic};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const AAD_SEED: &[u8] = b"beezap-seed";
const SEAL_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedSeed {
    version: u8,
    kdf: KdfParams,
    salt: String,
    verifier: String,
    nonce: String,
    ciphertext: String,
}

type DerivedKey = Zeroizing<[u8; 32]>;

/// Generate a fresh 12-word English mnemonic from OS randomness.
pub fn generate_mnemonic() -> Result<SeedPhrase, SealError> {
    let mut entropy = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(entropy.as_mut());
    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
        .map_err(|e| SealError::Seal(format!("mnemonic generation failed: {e}")))?;
    Ok(SeedPhrase::new(mnemonic.to_string()))
}

/// Validate a BIP39 mnemonic (English wordlist).
pub fn validate_mnemonic(words: &str) -> bool {
    Mnemonic::parse_in(Language::English, words).is_ok()
}

/// Encrypt the seed under `password`. Returns the sealed document bytes.
pub fn seal_seed(seed: &SeedPhrase, password: &str, kdf: &KdfParams) -> Result<Vec<u8>, SealError> {
    if password.is_empty() {
        return Err(SealError::Seal("password must not be empty".into()));
    }
    if !kdf.within_limits() {
        return Err(SealError::Seal(format!("kdf parameters out of range: {kdf:?}")));
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, kdf).map_err(SealError::Seal)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: seed.expose().as_bytes(), aad: AAD_SEED })
        .map_err(|_| SealError::Seal("encryption failed".into()))?;

    let sealed = SealedSeed {
        version: SEAL_VERSION,
        kdf: *kdf,
        salt: encode_base64(&salt),
        verifier: verifier(&key),
        nonce: encode_base64(&nonce),
        ciphertext: encode_base64(&ciphertext),
    };
    serde_json::to_vec(&sealed).map_err(|e| SealError::Seal(format!("sealed json: {e}")))
}

/// Decrypt a sealed document. Distinguishes `WrongPassword` from `CorruptBackup`.
pub fn unseal_seed(blob: &[u8], password: &str) -> Result<SeedPhrase, SealError> {
    let sealed: SealedSeed = serde_json::from_slice(blob)
        .map_err(|e| SealError::CorruptBackup(format!("sealed json: {e}")))?;
    if sealed.version != SEAL_VERSION {
        return Err(SealError::CorruptBackup(format!("unsupported seal version {}", sealed.version)));
    }
    if !sealed.kdf.within_limits() {
        return Err(SealError::CorruptBackup(format!("kdf parameters out of range: {:?}", sealed.kdf)));
    }
    let salt = decode_base64(&sealed.salt)?;
    let nonce: [u8; NONCE_LEN] = decode_base64(&sealed.nonce)?
        .try_into()
        .map_err(|_| SealError::CorruptBackup("nonce length".into()))?;
    let ciphertext = decode_base64(&sealed.ciphertext)?;

    let key = derive_key(password, &salt, &sealed.kdf).map_err(SealError::CorruptBackup)?;
    if verifier(&key) != sealed.verifier {
        return Err(SealError::WrongPassword);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: AAD_SEED })
            .map_err(|_| SealError::CorruptBackup("authentication failed".into()))?,
    );
    let words = std::str::from_utf8(&plaintext)
        .map_err(|_| SealError::CorruptBackup("seed is not utf-8".into()))?;
    if !validate_mnemonic(words) {
        return Err(SealError::CorruptBackup("seed is not a valid mnemonic".into()));
    }
    Ok(SeedPhrase::new(words.to_string()))
}

fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> Result<DerivedKey, String> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| format!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|e| format!("argon2 hash: {e}"))?;
    Ok(key)
}

fn verifier(key: &DerivedKey) -> String {
    blake3::hash(key.as_ref()).to_hex().to_string()
}

fn encode_base64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_base64(value: &str) -> Result<Vec<u8>, SealError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| SealError::CorruptBackup(format!("base64: {e}")))
}
