//! Plugin package archives and install receipts.
//!
//! Packages are gzip-compressed tarballs carrying a manifest either at the
//! archive root or inside a single top-level directory.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use thiserror::Error;

use super::capability::ManifestOrigin;
use super::manifest::MANIFEST_FILE;
use super::signing::{PackageSigner, TrustedKeys};

/// Receipt written next to the manifest of every catalog install.
pub const INSTALL_RECEIPT_FILE: &str = ".tibok-install.json";

/// Package handling errors.
#[derive(Debug, Error)]
pub enum PackageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive entry that is not a plain file or directory, or escapes the root.
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),

    /// No manifest at the archive root or in a single top-level directory.
    #[error("package does not contain {MANIFEST_FILE}")]
    MissingManifest,

    /// SHA-256 digest differs from the expected value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The install receipt could not be encoded.
    #[error("install receipt: {0}")]
    Receipt(#[from] serde_json::Error),
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Compares a digest case-insensitively against `expected`.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), PackageError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(PackageError::ChecksumMismatch { expected: expected.trim().to_string(), actual })
    }
}

/// Unpacks a `.tar.gz` into `dest`.
///
/// Only regular files and directories are accepted. Any other entry type,
/// or an entry whose path would land outside `dest`, aborts extraction.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), PackageError> {
    fs::create_dir_all(dest)?;
    let file = fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.display().to_string();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            other => {
                return Err(PackageError::UnsafeEntry(format!("{} ({:?})", entry_path, other)));
            }
        }

        if !entry.unpack_in(dest)? {
            return Err(PackageError::UnsafeEntry(entry_path));
        }
    }

    Ok(())
}

/// Finds the directory holding the manifest inside an extracted package.
pub fn locate_package_root(extracted: &Path) -> Result<PathBuf, PackageError> {
    if extracted.join(MANIFEST_FILE).is_file() {
        return Ok(extracted.to_path_buf());
    }

    let dirs: Vec<PathBuf> = fs::read_dir(extracted)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    match dirs.as_slice() {
        [single] if single.join(MANIFEST_FILE).is_file() => Ok(single.clone()),
        _ => Err(PackageError::MissingManifest),
    }
}

/// Provenance of an installed plugin directory.
///
/// Receipts are signed with the host's install key and bound to the manifest
/// they were written next to, so a hand-written or copied receipt cannot
/// promote a sideloaded plugin to registry origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReceipt {
    /// Always `Registry` for receipts the downloader writes.
    pub origin: ManifestOrigin,
    /// Installed version.
    pub version: String,
    pub installed_at: DateTime<Utc>,
    /// Hex SHA-256 of the downloaded package.
    pub sha256: String,
    /// Where the package was downloaded from.
    pub download_url: String,
    /// Hex SHA-256 of the manifest file as installed.
    #[serde(default)]
    pub manifest_sha256: String,
    /// Base64 signature by the host install key over every other field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl InstallReceipt {
    /// An unsigned registry receipt for a package whose manifest file holds `manifest_bytes`.
    pub fn registry(version: &str, sha256: String, download_url: &str, manifest_bytes: &[u8]) -> Self {
        Self {
            origin: ManifestOrigin::Registry,
            version: version.to_string(),
            installed_at: Utc::now(),
            sha256,
            download_url: download_url.to_string(),
            manifest_sha256: sha256_hex(manifest_bytes),
            signature: None,
        }
    }

    fn signing_payload(&self) -> Result<Vec<u8>, PackageError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Signs the receipt with the host install key, replacing any previous signature.
    pub fn sign(&mut self, signer: &PackageSigner) -> Result<(), PackageError> {
        self.signature = Some(signer.sign_bytes(&self.signing_payload()?));
        Ok(())
    }

    /// Whether the receipt was signed by one of `keys` and still matches the
    /// manifest in `plugin_dir`.
    pub fn is_authentic(&self, plugin_dir: &Path, keys: &TrustedKeys) -> bool {
        let Some(signature) = self.signature.as_deref() else {
            return false;
        };
        let signed = self
            .signing_payload()
            .is_ok_and(|payload| keys.verify(&payload, signature).is_ok());
        signed
            && fs::read(plugin_dir.join(MANIFEST_FILE))
                .is_ok_and(|manifest| sha256_hex(&manifest) == self.manifest_sha256)
    }

    /// Reads the receipt of a plugin directory; `None` if absent or unreadable.
    pub fn load(plugin_dir: &Path) -> Option<Self> {
        let content = fs::read_to_string(plugin_dir.join(INSTALL_RECEIPT_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Writes the receipt into `plugin_dir`.
    pub fn write(&self, plugin_dir: &Path) -> Result<(), PackageError> {
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(plugin_dir.join(INSTALL_RECEIPT_FILE), content)?;
        Ok(())
    }
}
