//! `keygen` and `sign` commands for package publishers.

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use colored::Colorize;
use std::fs;
use std::path::Path;
use tibok_core::plugins::PackageSigner;
use tibok_core::plugins::package::sha256_hex;

/// Write a new keypair as `<name>.key` (private) and `<name>.pub` (public), base64 encoded.
///
/// Refuses to overwrite existing key files.
pub fn keygen(out: &Path, name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(anyhow!("Invalid key name '{}'", name));
    }

    let private_path = out.join(format!("{name}.key"));
    let public_path = out.join(format!("{name}.pub"));
    for path in [&private_path, &public_path] {
        if path.exists() {
            return Err(anyhow!("{} already exists", path.display()));
        }
    }

    fs::create_dir_all(out).with_context(|| format!("Creating {}", out.display()))?;
    let signer = PackageSigner::generate();
    fs::write(&private_path, STANDARD.encode(signer.private_key()))?;
    fs::write(&public_path, STANDARD.encode(signer.public_key()))?;
    restrict_permissions(&private_path)?;

    println!("{}", "✓ Keypair generated".green());
    println!("  Private key: {}", private_path.display());
    println!("  Public key:  {}", public_path.display());
    println!();
    println!("{}", "⚠ Keep your private key secure!".yellow());
    println!(
        "{}",
        "Hosts trust packages signed with this key once the .pub file is placed in their trusted-keys directory."
            .dimmed()
    );
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Print the SHA-256 and base64 signature of a package for its catalog entry.
pub fn sign(file: &Path, key: &Path) -> anyhow::Result<()> {
    let signer = PackageSigner::from_key_file(key)
        .map_err(|e| anyhow!("Failed to load private key {}: {}", key.display(), e))?;
    let bytes = fs::read(file).with_context(|| format!("Reading {}", file.display()))?;

    println!("sha256:    {}", sha256_hex(&bytes));
    println!("signature: {}", signer.sign_bytes(&bytes));
    Ok(())
}
