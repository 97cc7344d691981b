//! Detached-signature verification for plugin artifacts.
//!
//! Keyring files hold one base64-encoded key per line (blank lines and
//! `#` comments ignored). A signature is the base64 HMAC-SHA256 of the
//! artifact bytes under one of the keyring keys, optionally wrapped in an
//! armor envelope:
//!
//! ```text
//! -----BEGIN OXTEL SIGNATURE-----
//! <base64>
//! -----END OXTEL SIGNATURE-----
//! ```

use crate::error::{PluginError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use oxtel_common::types::TrustLevel;
use sha2::Sha256;
use std::path::{Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

const ARMOR_BEGIN: &str = "-----BEGIN OXTEL SIGNATURE-----";
const ARMOR_END: &str = "-----END OXTEL SIGNATURE-----";

pub struct SignatureVerifier {
    trust: TrustLevel,
    keys: Vec<Vec<u8>>,
    keyring_paths: Vec<PathBuf>,
}

impl SignatureVerifier {
    pub fn new(trust: TrustLevel) -> Self {
        Self {
            trust,
            keys: Vec::new(),
            keyring_paths: Vec::new(),
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.trust
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keyring_paths(&self) -> &[PathBuf] {
        &self.keyring_paths
    }

    /// Load every key from a keyring file.
    pub fn add_keyring_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PluginError::Keyring(format!("unable to open keyring file {path:?}: {e}"))
        })?;
        let mut added = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = BASE64
                .decode(line)
                .map_err(|e| PluginError::Keyring(format!("bad key in {path:?}: {e}")))?;
            self.keys.push(key);
            added += 1;
        }
        if added == 0 {
            return Err(PluginError::Keyring(format!(
                "keyring file {path:?} holds no keys"
            )));
        }
        self.keyring_paths.push(path.to_path_buf());
        Ok(added)
    }

    /// Verify a detached signature against every keyring key.
    pub fn verify(&self, artifact: &[u8], signature: &[u8]) -> Result<()> {
        let digest = decode_armor(signature)?;
        for key in &self.keys {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| PluginError::Signature(e.to_string()))?;
            mac.update(artifact);
            if mac.verify_slice(&digest).is_ok() {
                return Ok(());
            }
        }
        Err(PluginError::Signature(
            "signature matches no keyring key".to_string(),
        ))
    }

    /// Apply the trust policy to an upload. Returns whether the plugin is
    /// recorded as signed.
    ///
    /// - `disabled`: verification skipped entirely.
    /// - `enabled`: unsigned or badly-signed uploads are fatal to the load.
    /// - `warning`: failures are logged and the plugin admitted unsigned.
    pub fn check(&self, artifact: &[u8], signature: Option<&[u8]>) -> Result<bool> {
        match self.trust {
            TrustLevel::Disabled => Ok(false),
            TrustLevel::Enabled => match signature {
                Some(sig) => {
                    self.verify(artifact, sig)?;
                    Ok(true)
                }
                None => Err(PluginError::Signature(
                    "unsigned plugin rejected (trust level: enabled)".to_string(),
                )),
            },
            TrustLevel::Warning => match signature {
                Some(sig) => match self.verify(artifact, sig) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        tracing::warn!(error = %e, "admitting plugin with bad signature");
                        Ok(false)
                    }
                },
                None => {
                    tracing::warn!("admitting unsigned plugin");
                    Ok(false)
                }
            },
        }
    }
}

/// Produce an armored detached signature. Lives here so tests and
/// deployment tooling agree on the format byte for byte.
pub fn sign(artifact: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| PluginError::Signature(e.to_string()))?;
    mac.update(artifact);
    let digest = mac.finalize().into_bytes();
    let armored = format!("{ARMOR_BEGIN}\n{}\n{ARMOR_END}\n", BASE64.encode(digest));
    Ok(armored.into_bytes())
}

fn decode_armor(signature: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(signature)
        .map_err(|_| PluginError::Signature("signature is not text".to_string()))?;
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != ARMOR_BEGIN && *l != ARMOR_END)
        .collect();
    BASE64
        .decode(body.as_bytes())
        .map_err(|e| PluginError::Signature(format!("bad signature encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn keyring_with(key: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# test keyring").unwrap();
        writeln!(file, "{}", BASE64.encode(key)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn verify_accepts_signature_from_keyring_key() {
        let key = b"super-secret-keyring-key";
        let keyring = keyring_with(key);
        let mut verifier = SignatureVerifier::new(TrustLevel::Enabled);
        assert_eq!(verifier.add_keyring_file(keyring.path()).unwrap(), 1);

        let artifact = b"plugin binary bytes";
        let sig = sign(artifact, key).unwrap();
        assert!(verifier.verify(artifact, &sig).is_ok());
        assert_eq!(verifier.check(artifact, Some(&sig)).unwrap(), true);
    }

    #[test]
    fn verify_rejects_wrong_key_and_tampered_artifact() {
        let keyring = keyring_with(b"key-one");
        let mut verifier = SignatureVerifier::new(TrustLevel::Enabled);
        verifier.add_keyring_file(keyring.path()).unwrap();

        let sig = sign(b"artifact", b"another-key").unwrap();
        assert!(verifier.verify(b"artifact", &sig).is_err());

        let sig = sign(b"artifact", b"key-one").unwrap();
        assert!(verifier.verify(b"artifact!", &sig).is_err());
    }

    #[test]
    fn trust_enabled_rejects_unsigned() {
        let keyring = keyring_with(b"key");
        let mut verifier = SignatureVerifier::new(TrustLevel::Enabled);
        verifier.add_keyring_file(keyring.path()).unwrap();
        assert!(verifier.check(b"artifact", None).is_err());
    }

    #[test]
    fn trust_warning_admits_unsigned_as_unsigned() {
        let verifier = SignatureVerifier::new(TrustLevel::Warning);
        assert_eq!(verifier.check(b"artifact", None).unwrap(), false);
    }

    #[test]
    fn trust_disabled_skips_verification() {
        let verifier = SignatureVerifier::new(TrustLevel::Disabled);
        let garbage = b"not a signature";
        assert_eq!(verifier.check(b"artifact", Some(garbage)).unwrap(), false);
    }

    #[test]
    fn bare_base64_signature_accepted() {
        let key = b"key";
        let keyring = keyring_with(key);
        let mut verifier = SignatureVerifier::new(TrustLevel::Enabled);
        verifier.add_keyring_file(keyring.path()).unwrap();

        let armored = sign(b"data", key).unwrap();
        let bare: String = String::from_utf8(armored)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        assert!(verifier.verify(b"data", bare.as_bytes()).is_ok());
    }
}
