//! Detached signatures of finished images.
//!
//! The image is hashed with SHA-256 and the 32-byte digest is signed with Ed25519. The signature
//! file holds the raw 64 signature bytes. Keys are read as PKCS#8 / SPKI PEM or as raw 32 bytes.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use ed25519_dalek::{
    pkcs8::{
        spki::der::pem::LineEnding, DecodePrivateKey as _, DecodePublicKey as _,
        EncodePrivateKey as _, EncodePublicKey as _,
    },
    Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey, SECRET_KEY_LENGTH,
};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt as _;

use crate::error::BuildError;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// `<image>.sig`, next to the image.
pub fn default_signature_path(image: &Path) -> PathBuf {
    let mut path = image.to_owned().into_os_string();
    path.push(".sig");
    path.into()
}

pub async fn image_digest(image: &Path) -> Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(image)
        .await
        .with_context(|| format!("Failed to open {image:?}"))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

fn ensure_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(BuildError::NotFound(path.to_owned()).into());
    }
    Ok(())
}

fn signing_error(message: impl Into<String>) -> anyhow::Error {
    BuildError::SigningError(message.into()).into()
}

fn parse_signing_key(raw: &[u8]) -> Result<SigningKey> {
    if let Ok(text) = std::str::from_utf8(raw) {
        if text.contains("-----BEGIN") {
            return SigningKey::from_pkcs8_pem(text.trim())
                .map_err(|e| signing_error(format!("invalid PKCS#8 private key: {e}")));
        }
    }

    let seed: [u8; SECRET_KEY_LENGTH] = raw.try_into().map_err(|_| {
        signing_error(format!(
            "private key must be PKCS#8 PEM or {SECRET_KEY_LENGTH} raw bytes, got {} bytes",
            raw.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

fn parse_verifying_key(raw: &[u8]) -> Result<VerifyingKey> {
    if let Ok(text) = std::str::from_utf8(raw) {
        if text.contains("-----BEGIN") {
            return VerifyingKey::from_public_key_pem(text.trim())
                .map_err(|e| signing_error(format!("invalid public key: {e}")));
        }
    }

    let bytes: [u8; 32] = raw.try_into().map_err(|_| {
        signing_error(format!(
            "public key must be SPKI PEM or 32 raw bytes, got {} bytes",
            raw.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| signing_error(format!("invalid public key: {e}")))
}

/// Sign `image` with the private key at `key`, writing the signature to `output` or
/// [`default_signature_path`]. Returns where the signature went.
pub async fn sign_image(image: &Path, key: &Path, output: Option<&Path>) -> Result<PathBuf> {
    ensure_exists(image)?;
    ensure_exists(key)?;

    let raw_key = tokio::fs::read(key)
        .await
        .with_context(|| format!("Failed to read private key {key:?}"))?;
    let signing_key = parse_signing_key(&raw_key)?;

    let digest = image_digest(image).await?;
    let signature = signing_key
        .try_sign(&digest)
        .map_err(|e| signing_error(format!("failed to sign {image:?}: {e}")))?;

    let output = output
        .map(Path::to_owned)
        .unwrap_or_else(|| default_signature_path(image));
    tokio::fs::write(&output, signature.to_bytes())
        .await
        .with_context(|| format!("Failed to write signature to {output:?}"))?;

    tracing::info!(?image, signature = ?output, digest = %hex::encode(digest), "Image signed");
    Ok(output)
}

/// Check a detached signature; a mismatch is a [`BuildError::SigningError`].
pub async fn verify_image(image: &Path, signature: &Path, public_key: &Path) -> Result<()> {
    ensure_exists(image)?;
    ensure_exists(signature)?;
    ensure_exists(public_key)?;

    let raw_key = tokio::fs::read(public_key)
        .await
        .with_context(|| format!("Failed to read public key {public_key:?}"))?;
    let verifying_key = parse_verifying_key(&raw_key)?;

    let raw_signature = tokio::fs::read(signature)
        .await
        .with_context(|| format!("Failed to read signature {signature:?}"))?;
    let signature = Signature::from_slice(&raw_signature)
        .map_err(|e| signing_error(format!("malformed signature: {e}")))?;

    let digest = image_digest(image).await?;
    verifying_key
        .verify(&digest, &signature)
        .map_err(|_| signing_error(format!("signature does not match {image:?}")))?;

    tracing::info!(?image, "Signature is valid");
    Ok(())
}

/// Write a new PKCS#8 private key (mode 0600) and its SPKI public key, both PEM encoded.
/// Existing files are never overwritten.
pub async fn generate_keypair(private_key: &Path, public_key: &Path) -> Result<()> {
    for path in [private_key, public_key] {
        if path.exists() {
            return Err(BuildError::TargetExists(path.to_owned()).into());
        }
    }

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| signing_error(format!("failed to encode private key: {e}")))?;
    let public_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| signing_error(format!("failed to encode public key: {e}")))?;

    tokio::fs::write(private_key, private_pem.as_bytes())
        .await
        .with_context(|| format!("Failed to write {private_key:?}"))?;
    tokio::fs::set_permissions(private_key, std::fs::Permissions::from_mode(0o600)).await?;
    tokio::fs::write(public_key, public_pem)
        .await
        .with_context(|| format!("Failed to write {public_key:?}"))?;

    tracing::info!(?private_key, ?public_key, "Key pair generated");
    Ok(())
}
