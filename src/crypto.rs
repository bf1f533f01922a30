//! Key store surface and software implementation.
//!
//! All frame authentication runs through the [`KeyStore`] trait, which mirrors
//! the narrow slice of a PSA-style crypto service the protocol needs:
//! persistent HMAC-SHA-256 keys addressed by integer id, MAC computation and
//! a random source. Hardware-backed stores implement the trait outside this
//! crate; [`SoftKeyStore`] is the in-process implementation used by tests and
//! host-side tools.

use std::{collections::HashMap, sync::Mutex};

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::{DeviceId, Error, ErrorKind, Result};

/// Persistent key identifier.
pub type KeyId = u32;

/// Length of HMAC key material in bytes (256-bit keys).
pub const KEY_LEN: usize = 32;

/// Length of an HMAC-SHA-256 tag in bytes.
pub const MAC_LEN: usize = 32;

/// Key id of the advertiser's signing key.
///
/// Scanner keys follow at [`scanner_key_id`] offsets; the provisioning tool
/// writes all of them once, out-of-band.
pub const ADVERTISER_KEY_ID: KeyId = 0x0000_0101;

/// Key id holding the signing key of the given scanner device.
pub const fn scanner_key_id(device: DeviceId) -> KeyId {
    ADVERTISER_KEY_ID + device.0 as KeyId
}

type HmacSha256 = Hmac<Sha256>;

/// Persistent HMAC key store.
///
/// Implementations must be callable from driver context: no method may block
/// beyond a short mutex and none may panic on missing keys.
pub trait KeyStore: Send + Sync {
    /// Imports persistent HMAC-SHA-256 key material under the given id,
    /// replacing any previous key with that id.
    fn import_key(&self, id: KeyId, material: &[u8]) -> Result<()>;

    /// Destroys the key with the given id. Unknown ids are not an error.
    fn destroy_key(&self, id: KeyId) -> Result<()>;

    /// Computes the HMAC-SHA-256 tag of `message` under the key `id`.
    fn compute_mac(&self, id: KeyId, message: &[u8]) -> Result<[u8; MAC_LEN]>;

    /// Copies the key material of `id` into `out` and returns its length.
    fn export_key(&self, id: KeyId, out: &mut [u8]) -> Result<usize>;

    /// Fills `out` with cryptographically secure random bytes.
    fn random_bytes(&self, out: &mut [u8]) -> Result<()>;
}

/// Software key store backed by process memory.
///
/// Keys live in a mutexed table and vanish with the process; pair it with a
/// persistent [`crate::counter::CounterStore`] that matches the deployment.
#[derive(Default)]
pub struct SoftKeyStore {
    keys: Mutex<HashMap<KeyId, Vec<u8>>>,
}

impl SoftKeyStore {
    /// Creates an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh random 256-bit key under the given id.
    pub fn generate_key(&self, id: KeyId) -> Result<()> {
        let mut material = vec![0u8; KEY_LEN];
        self.random_bytes(&mut material)?;
        self.import_key(id, &material)
    }
}

impl KeyStore for SoftKeyStore {
    fn import_key(&self, id: KeyId, material: &[u8]) -> Result<()> {
        if material.is_empty() {
            return Err(Error::with_message(ErrorKind::Crypto, "empty key material"));
        }
        log::debug!("importing key {:#010x} ({} bytes)", id, material.len());
        self.keys.lock().unwrap().insert(id, material.to_vec());
        Ok(())
    }

    fn destroy_key(&self, id: KeyId) -> Result<()> {
        self.keys.lock().unwrap().remove(&id);
        Ok(())
    }

    fn compute_mac(&self, id: KeyId, message: &[u8]) -> Result<[u8; MAC_LEN]> {
        let keys = self.keys.lock().unwrap();
        let material = keys
            .get(&id)
            .ok_or_else(|| Error::with_message(ErrorKind::Crypto, format!("no key {id:#010x}")))?;
        let mut mac = HmacSha256::new_from_slice(material)
            .map_err(|_| Error::with_message(ErrorKind::Crypto, "unusable key material"))?;
        mac.update(message);
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    fn export_key(&self, id: KeyId, out: &mut [u8]) -> Result<usize> {
        let keys = self.keys.lock().unwrap();
        let material = keys
            .get(&id)
            .ok_or_else(|| Error::with_message(ErrorKind::Crypto, format!("no key {id:#010x}")))?;
        if out.len() < material.len() {
            return Err(Error::with_message(ErrorKind::Crypto, "export buffer too small"));
        }
        out[..material.len()].copy_from_slice(material);
        Ok(material.len())
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(out)
            .map_err(|err| Error::with_message(ErrorKind::Crypto, err.to_string()))
    }
}
