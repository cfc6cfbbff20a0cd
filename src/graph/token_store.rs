//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! Encrypted at-rest persistence for the OAuth2 token bundle.
//!
//! The bundle is CBOR-encoded and sealed with AES-128-GCM. The key is
//! derived as `KMAC128(host_secret, upstream_user, "tokens")`, where the
//! host secret is `/etc/machine-id` when readable and otherwise a random
//! seed persisted beside the token file. The token file is therefore not
//! usable when copied to another host: the derived key changes and the GCM
//! tag check fails.
//!
//! File layout: 1-byte format version, 12-byte IV, 16-byte authentication
//! tag, ciphertext.
//!
//! A corrupt, truncated, or undecryptable file is indistinguishable from an
//! absent one; callers respond by requiring a fresh device-code login.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::warn;
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Kmac};

use crate::support::{error::Error, file_ops};

const VERSION: u8 = 1;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 16;

/// The persisted OAuth2 state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of `access_token`.
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    /// The user principal the tokens were issued for.
    pub account: String,
}

impl TokenBundle {
    /// Whether the access token expires within `seconds` from now.
    pub fn expires_within(&self, seconds: i64) -> bool {
        self.expires_at - Utc::now() <= chrono::Duration::seconds(seconds)
    }
}

pub struct TokenStore {
    path: PathBuf,
    key: [u8; KEY_LEN],
}

impl TokenStore {
    /// Open the store at `path` for tokens belonging to `user`.
    ///
    /// This derives the encryption key, creating the host seed if this
    /// host has no machine id.
    pub fn new(path: PathBuf, user: &str) -> Result<Self, Error> {
        let dir = path
            .parent()
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;
        let secret = host_secret(&dir)?;
        Ok(Self {
            key: derive_key(&secret, user),
            path,
        })
    }

    #[cfg(test)]
    pub fn with_secret(path: PathBuf, secret: &[u8], user: &str) -> Self {
        Self {
            key: derive_key(secret, user),
            path,
        }
    }

    /// Load the stored bundle.
    ///
    /// Corrupt or undecryptable files read as absent.
    pub fn load(&self) -> Option<TokenBundle> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return None
            },
            Err(e) => {
                warn!("Unable to read {}: {e}", self.path.display());
                return None;
            },
        };

        if raw.len() < 1 + IV_LEN + TAG_LEN || VERSION != raw[0] {
            warn!("{} is corrupt; ignoring it", self.path.display());
            return None;
        }

        let iv = &raw[1..1 + IV_LEN];
        let tag = &raw[1 + IV_LEN..1 + IV_LEN + TAG_LEN];
        let ciphertext = &raw[1 + IV_LEN + TAG_LEN..];

        let cleartext = match openssl::symm::decrypt_aead(
            openssl::symm::Cipher::aes_128_gcm(),
            &self.key,
            Some(iv),
            &[],
            ciphertext,
            tag,
        ) {
            Ok(c) => c,
            Err(_) => {
                warn!(
                    "{} cannot be decrypted (wrong host?); ignoring it",
                    self.path.display(),
                );
                return None;
            },
        };

        match serde_cbor::from_slice(&cleartext) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("{} has a bad payload: {e}", self.path.display());
                None
            },
        }
    }

    /// Atomically persist `bundle`.
    pub fn save(&self, bundle: &TokenBundle) -> Result<(), Error> {
        let cleartext = serde_cbor::to_vec(bundle)?;
        let iv: [u8; IV_LEN] = OsRng.gen();
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = openssl::symm::encrypt_aead(
            openssl::symm::Cipher::aes_128_gcm(),
            &self.key,
            Some(&iv),
            &[],
            &cleartext,
            &mut tag,
        )?;

        let mut raw = Vec::with_capacity(1 + IV_LEN + TAG_LEN + ciphertext.len());
        raw.push(VERSION);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&tag);
        raw.extend_from_slice(&ciphertext);

        let tmp = self
            .path
            .parent()
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."));
        file_ops::spit(tmp, &self.path, true, 0o600, &raw)?;
        Ok(())
    }

    /// Remove the stored bundle, if any.
    pub fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn derive_key(secret: &[u8], user: &str) -> [u8; KEY_LEN] {
    let mut k = Kmac::v128(secret, b"tokens");
    k.update(user.as_bytes());
    let mut key = [0u8; KEY_LEN];
    k.finalize(&mut key);
    key
}

/// The stable host-local secret the token key is derived from.
fn host_secret(dir: &Path) -> Result<Vec<u8>, Error> {
    if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
        let machine_id = machine_id.trim();
        if !machine_id.is_empty() {
            return Ok(machine_id.as_bytes().to_vec());
        }
    }

    let seed_path = dir.join("host.seed");
    match fs::read(&seed_path) {
        Ok(seed) if !seed.is_empty() => Ok(seed),
        _ => {
            let seed: [u8; 32] = OsRng.gen();
            file_ops::spit(dir, &seed_path, false, 0o600, &seed)?;
            Ok(seed.to_vec())
        },
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn bundle() -> TokenBundle {
        TokenBundle {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            scopes: vec!["offline_access".to_owned()],
            account: "admin@t.onmicrosoft.com".to_owned(),
        }
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::with_secret(
            dir.path().join("tokens.enc"),
            b"secret",
            "admin@t.onmicrosoft.com",
        );
        assert_eq!(None, store.load());
        store.save(&bundle()).unwrap();
        assert_eq!(Some(bundle()), store.load());
        store.clear().unwrap();
        assert_eq!(None, store.load());
        store.clear().unwrap();
    }

    #[test]
    fn other_host_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::with_secret(
            dir.path().join("tokens.enc"),
            b"host-a",
            "admin@t.onmicrosoft.com",
        );
        store.save(&bundle()).unwrap();

        let other = TokenStore::with_secret(
            dir.path().join("tokens.enc"),
            b"host-b",
            "admin@t.onmicrosoft.com",
        );
        assert_eq!(None, other.load());
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.enc");
        let store =
            TokenStore::with_secret(path.clone(), b"secret", "a@b.com");
        store.save(&bundle()).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();
        assert_eq!(None, store.load());

        fs::write(&path, b"x").unwrap();
        assert_eq!(None, store.load());
    }

    #[test]
    fn expiry_window() {
        let mut b = bundle();
        b.expires_at = Utc::now() + chrono::Duration::seconds(60);
        assert!(b.expires_within(300));
        assert!(!b.expires_within(10));
    }
}
