//! Password-sealed certificate bundles
//!
//! Issued certificates are written as a single file holding the PEM chain
//! followed by the PEM private key, sealed with AES-256-GCM. The key is
//! PBKDF2-HMAC-SHA256 over the password with a random salt; the round count
//! is stored in the file. The file itself is JSON:
//!
//! ```json
//! {"version":2,"salt":"...","iterations":100000,"nonce":"...","ciphertext":"..."}
//! ```
//!
//! Version 1 files, keyed by a single SHA-256 of salt and password, can still
//! be opened. New bundles are always version 2.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::Engine;
use rand::RngCore;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::path::Path;
use tracing::info;

const BUNDLE_VERSION: u32 = 2;
const LEGACY_VERSION: u32 = 1;
const PBKDF2_ROUNDS: u32 = 100_000;
/// Upper bound on rounds accepted from a file
const MAX_PBKDF2_ROUNDS: u32 = 10_000_000;
/// Length of nonce in bytes (96 bits)
const NONCE_LENGTH: usize = 12;
const SALT_LENGTH: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct SealedBundle {
    version: u32,
    salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    nonce: String,
    ciphertext: String,
}

fn derive_key(salt: &[u8], password: &str, rounds: NonZeroU32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        salt,
        password.as_bytes(),
        &mut key,
    );
    key
}

fn derive_legacy_key(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn default_rounds() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ROUNDS).unwrap_or(NonZeroU32::MIN)
}

fn b64() -> &'static base64::engine::GeneralPurpose {
    &base64::engine::general_purpose::STANDARD
}

/// Seal PEM material with `password`
pub fn seal(pem: &str, password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(&salt, password, default_rounds());
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    let bundle = SealedBundle {
        version: BUNDLE_VERSION,
        salt: b64().encode(salt),
        iterations: Some(PBKDF2_ROUNDS),
        nonce: b64().encode(nonce_bytes),
        ciphertext: b64().encode(ciphertext),
    };
    Ok(serde_json::to_string(&bundle)?)
}

/// Open a sealed bundle, returning the PEM material
pub fn open(sealed: &str, password: &str) -> Result<String> {
    let bundle: SealedBundle =
        serde_json::from_str(sealed).context("Certificate bundle is not valid JSON")?;

    let salt = b64().decode(&bundle.salt).context("Invalid bundle salt")?;
    let nonce_bytes = b64().decode(&bundle.nonce).context("Invalid bundle nonce")?;
    if nonce_bytes.len() != NONCE_LENGTH {
        anyhow::bail!("Invalid bundle nonce length");
    }
    let ciphertext = b64()
        .decode(&bundle.ciphertext)
        .context("Invalid bundle ciphertext")?;

    let key = match bundle.version {
        BUNDLE_VERSION => {
            let rounds = bundle
                .iterations
                .filter(|r| *r <= MAX_PBKDF2_ROUNDS)
                .and_then(NonZeroU32::new)
                .context("Invalid bundle iteration count")?;
            derive_key(&salt, password, rounds)
        }
        LEGACY_VERSION => derive_legacy_key(&salt, password),
        other => anyhow::bail!("Unsupported certificate bundle version {}", other),
    };
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| anyhow::anyhow!("Wrong password or corrupted certificate bundle"))?;

    String::from_utf8(plaintext).context("Certificate bundle is not UTF-8")
}

/// Seal `pem` and write it to `path` with owner-only permissions
pub fn write_bundle(path: &Path, pem: &str, password: &str) -> Result<()> {
    let sealed = seal(pem, password)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write atomically
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &sealed)?;
    std::fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    info!(path = %path.display(), "Wrote sealed certificate bundle");
    Ok(())
}

pub fn read_bundle(path: &Path, password: &str) -> Result<String> {
    let sealed = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read certificate bundle {}", path.display()))?;
    open(&sealed, password)
}

/// Random password for a newly issued bundle
pub fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
