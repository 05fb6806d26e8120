//! Plugin signing and verification.
//!
//! Manifests and package archives are signed with Ed25519. Signatures travel
//! as base64 text; public keys live as `<name>.pub` files in the trusted keys
//! directory, either as 32 raw bytes or as base64 text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use super::manifest::PluginManifest;

/// Signing errors.
#[derive(Debug, Error)]
pub enum SigningError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid key format.
    #[error("invalid key format: {0}")]
    InvalidKey(String),

    /// Signature is not valid base64 or has the wrong length.
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    /// No trusted key accepted the signature.
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    /// The manifest could not be serialized for signing.
    #[error("manifest error: {0}")]
    Manifest(String),
}

/// Result type for signing operations.
pub type Result<T> = std::result::Result<T, SigningError>;

/// Produces base64 Ed25519 signatures.
pub struct PackageSigner {
    signing_key: SigningKey,
}

impl PackageSigner {
    /// Creates a signer from the 32 secret key bytes.
    pub fn from_private_key(private_key_bytes: &[u8]) -> Result<Self> {
        let key_array: [u8; 32] = private_key_bytes.try_into().map_err(|_| {
            SigningError::InvalidKey(format!(
                "invalid key length (expected 32 bytes, got {})",
                private_key_bytes.len()
            ))
        })?;
        Ok(Self { signing_key: SigningKey::from_bytes(&key_array) })
    }

    /// Creates a signer from a key file holding raw or base64 key bytes.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_private_key(&decode_key_material(&bytes)?)
    }

    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self { signing_key: SigningKey::generate(&mut csprng) }
    }

    /// Loads the key stored at `path`, generating and storing one when absent.
    ///
    /// Used for the host's own install key, which signs install receipts.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_key_file(path);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let signer = Self::generate();
        fs::write(path, STANDARD.encode(signer.private_key()))?;
        restrict_permissions(path)?;
        debug!(path = %path.display(), "Generated host install key");
        Ok(signer)
    }

    /// A trusted key set holding only this signer's public key.
    pub fn trusted_keys(&self, name: &str) -> TrustedKeys {
        TrustedKeys { keys: vec![(name.to_string(), self.signing_key.verifying_key())] }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    pub fn private_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Signs arbitrary bytes, returning the base64 signature.
    pub fn sign_bytes(&self, data: &[u8]) -> String {
        STANDARD.encode(self.signing_key.sign(data).to_bytes())
    }

    /// Signs a manifest in place.
    pub fn sign_manifest(&self, manifest: &mut PluginManifest) -> Result<()> {
        let payload =
            manifest.signing_payload().map_err(|e| SigningError::Manifest(e.to_string()))?;
        manifest.signature = Some(self.sign_bytes(&payload));
        Ok(())
    }
}

/// The set of public keys whose signatures the host accepts.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<(String, VerifyingKey)>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.pub` file in `dir`.
    ///
    /// A missing directory yields an empty set. Unreadable or malformed key
    /// files are skipped with a warning so one bad file cannot disable
    /// verification for the rest.
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let mut trusted = Self::new();
        if !dir.exists() {
            return Ok(trusted);
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("pub"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            match fs::read(&path).map_err(SigningError::from).and_then(|b| trusted.insert(&name, &b)) {
                Ok(()) => debug!(key = %name, "Loaded trusted key"),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping trusted key"),
            }
        }

        Ok(trusted)
    }

    /// Adds a key from raw or base64-encoded bytes.
    pub fn insert(&mut self, name: &str, key_material: &[u8]) -> Result<()> {
        let bytes = decode_key_material(key_material)?;
        let key_array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SigningError::InvalidKey(format!("expected 32 key bytes, got {}", bytes.len()))
        })?;
        let key = VerifyingKey::from_bytes(&key_array)
            .map_err(|e| SigningError::InvalidKey(format!("invalid public key: {}", e)))?;

        self.keys.retain(|(existing, _)| existing != name);
        self.keys.push((name.to_string(), key));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.keys.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Verifies a base64 signature and returns the name of the key that accepted it.
    pub fn verify(&self, data: &[u8], signature_b64: &str) -> Result<&str> {
        let signature = decode_signature(signature_b64)?;
        self.keys
            .iter()
            .find(|(_, key)| key.verify(data, &signature).is_ok())
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| {
                SigningError::VerificationFailed("no trusted key accepts this signature".to_string())
            })
    }

    /// Checks a manifest's embedded signature.
    ///
    /// Returns `Ok(false)` for unsigned manifests and `Err` for a signature
    /// that is present but does not verify.
    pub fn verify_manifest(&self, manifest: &PluginManifest) -> Result<bool> {
        let Some(signature) = manifest.signature.as_deref() else {
            return Ok(false);
        };
        let payload =
            manifest.signing_payload().map_err(|e| SigningError::Manifest(e.to_string()))?;
        self.verify(&payload, signature)?;
        Ok(true)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn decode_signature(signature_b64: &str) -> Result<Signature> {
    let bytes = STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    let array: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        SigningError::InvalidSignature(format!("expected 64 bytes, got {}", bytes.len()))
    })?;
    Ok(Signature::from_bytes(&array))
}

/// Key files hold either the 32 raw bytes or their base64 text.
fn decode_key_material(material: &[u8]) -> Result<Vec<u8>> {
    if material.len() == 32 {
        return Ok(material.to_vec());
    }
    let text = std::str::from_utf8(material)
        .map_err(|_| SigningError::InvalidKey("key is neither raw bytes nor base64".to_string()))?;
    STANDARD.decode(text.trim()).map_err(|e| SigningError::InvalidKey(e.to_string()))
}
