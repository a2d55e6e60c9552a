//! CV-050: Trusted-key store and detached signature verification.
//!
//! Keys live in three layered directories, loaded in order system, user,
//! local. Each key file is named after the lowercase hex fingerprint of
//! the key it holds. A zero-byte file masks the identically named key
//! loaded from an earlier layer, which lets a user disable a system key
//! without root.

use crate::core::config::KeystoreConfig;
use crate::core::error::{Error, Result};
use pgp::types::KeyTrait;
use pgp::{Deserializable, SignedPublicKey, StandaloneSignature};
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Trusted keys keyed by fingerprint.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: BTreeMap<String, SignedPublicKey>,
}

impl Keyring {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.keys.contains_key(fingerprint)
    }
}

/// Layered on-disk key store. Reads may run concurrently; writes are exclusive.
#[derive(Debug)]
pub struct Keystore {
    system: PathBuf,
    user: PathBuf,
    local: PathBuf,
    lock: RwLock<()>,
}

impl Keystore {
    pub fn new(system: impl Into<PathBuf>, user: impl Into<PathBuf>, local: impl Into<PathBuf>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            local: local.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn from_config(config: &KeystoreConfig) -> Self {
        Self::new(&config.system, &config.user, &config.local)
    }

    pub fn user_dir(&self) -> &Path {
        &self.user
    }

    /// Parse an armored public-key block and store it under the user
    /// directory, named after the first key's fingerprint.
    pub fn store_trusted_key(&self, armored: &[u8]) -> Result<PathBuf> {
        let key = first_key(armored)?;
        let fingerprint = fingerprint_of(&key);
        let _guard = self
            .lock
            .write()
            .map_err(|_| Error::Keystore("lock poisoned".to_string()))?;
        fs::create_dir_all(&self.user).map_err(|e| Error::io(&self.user, e))?;
        let path = self.user.join(&fingerprint);
        fs::write(&path, armored).map_err(|e| Error::io(&path, e))?;
        debug!(%fingerprint, path = %path.display(), "stored trusted key");
        Ok(path)
    }

    /// Remove a key from the user directory.
    pub fn delete_trusted_key(&self, fingerprint: &str) -> Result<()> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        let _guard = self
            .lock
            .write()
            .map_err(|_| Error::Keystore("lock poisoned".to_string()))?;
        let path = self.user.join(&fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Keystore(format!(
                "no user key {} in {}",
                fingerprint,
                self.user.display()
            ))),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Disable a key from a lower layer by writing a zero-byte file in the user directory.
    pub fn mask_trusted_system_key(&self, fingerprint: &str) -> Result<PathBuf> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        let _guard = self
            .lock
            .write()
            .map_err(|_| Error::Keystore("lock poisoned".to_string()))?;
        fs::create_dir_all(&self.user).map_err(|e| Error::io(&self.user, e))?;
        let path = self.user.join(&fingerprint);
        fs::write(&path, b"").map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }

    /// Load every layer; later layers override earlier ones and zero-byte files mask.
    pub fn load_keyring(&self) -> Result<Keyring> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| Error::Keystore("lock poisoned".to_string()))?;
        let mut keyring = Keyring::default();
        for dir in [&self.system, &self.user, &self.local] {
            load_layer(dir, &mut keyring)?;
        }
        Ok(keyring)
    }

    /// Verify an armored detached signature over `signed`; returns the signer's fingerprint.
    pub fn check_signature(&self, signed: &[u8], signature: &[u8]) -> Result<String> {
        let keyring = self.load_keyring()?;
        check_signature_with(&keyring, signed, signature)
    }
}

pub fn check_signature_with(keyring: &Keyring, signed: &[u8], signature: &[u8]) -> Result<String> {
    let no_signatures = || Error::Signature("no valid signatures found".to_string());
    if signature.iter().all(u8::is_ascii_whitespace) {
        return Err(no_signatures());
    }
    let (signatures, _headers) = StandaloneSignature::from_armor_many(Cursor::new(signature))
        .map_err(|e| Error::Signature(format!("unreadable signature: {}", e)))?;

    let mut seen_any = false;
    for sig in signatures {
        let sig = sig.map_err(|e| Error::Signature(format!("unreadable signature: {}", e)))?;
        seen_any = true;
        let Some(issuer) = sig.signature.issuer() else {
            return Err(Error::Signature("invalid signer".to_string()));
        };
        for (fingerprint, key) in &keyring.keys {
            if key.key_id() == *issuer {
                sig.verify(key, signed)
                    .map_err(|e| Error::Signature(format!("key {}: {}", fingerprint, e)))?;
                return Ok(fingerprint.clone());
            }
            for sub in &key.public_subkeys {
                if sub.key_id() == *issuer {
                    sig.verify(sub, signed)
                        .map_err(|e| Error::Signature(format!("key {}: {}", fingerprint, e)))?;
                    return Ok(fingerprint.clone());
                }
            }
        }
    }
    if !seen_any {
        debug!("signature stream was empty");
    }
    Err(no_signatures())
}

fn first_key(armored: &[u8]) -> Result<SignedPublicKey> {
    if armored.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::Keystore("empty key block".to_string()));
    }
    let (mut keys, _headers) = SignedPublicKey::from_armor_many(Cursor::new(armored))
        .map_err(|e| Error::Keystore(format!("unreadable key block: {}", e)))?;
    match keys.next() {
        Some(key) => key.map_err(|e| Error::Keystore(format!("unreadable key: {}", e))),
        None => Err(Error::Keystore("empty key block".to_string())),
    }
}

fn fingerprint_of(key: &SignedPublicKey) -> String {
    hex::encode(key.fingerprint())
}

fn normalize_fingerprint(fingerprint: &str) -> Result<String> {
    let fp = fingerprint.trim().to_ascii_lowercase();
    if fp.is_empty() || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Keystore(format!("invalid fingerprint {:?}", fingerprint)));
    }
    Ok(fp)
}

fn load_layer(dir: &Path, keyring: &mut Keyring) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(dir, e)),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        if bytes.is_empty() {
            if keyring.keys.remove(name).is_some() {
                warn!(fingerprint = name, layer = %dir.display(), "trusted key masked");
            }
            continue;
        }
        let key = first_key(&bytes)
            .map_err(|e| Error::Keystore(format!("{}: {}", path.display(), e)))?;
        let fingerprint = fingerprint_of(&key);
        if fingerprint != name {
            return Err(Error::Keystore(format!(
                "{}: file name does not match key fingerprint {}",
                path.display(),
                fingerprint
            )));
        }
        keyring.keys.insert(fingerprint, key);
    }
    Ok(())
}
