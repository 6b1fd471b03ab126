use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::network::address::PeerId;
use crate::network::error::{P2PError, Result};

/// File name of the node key under the data directory.
pub const PRIV_KEY_FILE: &str = "priv.key";

/// The node's long-lived ed25519 identity.
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let peer_id = PeerId::from_public_key(signing_key.verifying_key().as_bytes());
        Self { signing_key, peer_id }
    }

    /// Loads the key at `path`, or generates and persists a new one.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim())
                .map_err(|e| P2PError::Identity(format!("{}: {}", path.display(), e)))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| P2PError::Identity(format!("{}: expected 32 bytes", path.display())))?;
            return Ok(Self::from_secret(secret));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(identity.signing_key.to_bytes()))?;
        info!("Generated new node identity. id={} path={}", identity.peer_id, path.display());
        Ok(identity)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verifies `signature` over `message` by `public_key`.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
