//! Type definitions shared by the membership sync components.

use crate::utils::hex_bytes32;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

pub const HASH_SIZE: usize = 32;

/// Fixed slot of a member in the membership tree.
///
/// Slots are assigned by the registry contract and never move: deleting a
/// member clears its slot without shifting the ones after it.
pub type MembershipIndex = u64;

/// Public commitment of a member's identity secret (a 256-bit value).
pub type IdCommitment = [u8; HASH_SIZE];

/// A node (or root) of the membership tree.
pub type MerkleNode = [u8; HASH_SIZE];

/// One `MemberRegistered` log entry as read from the chain.
///
/// `removed` is set when the chain reorganized the registration away. It is
/// not a "member left" action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipEvent {
    pub index: MembershipIndex,
    pub id_commitment: IdCommitment,
    pub block_number: u64,
    pub removed: bool,
}

impl MembershipEvent {
    /// A confirmed registration.
    pub fn registered(index: MembershipIndex, id_commitment: IdCommitment, block_number: u64) -> Self {
        Self {
            index,
            id_commitment,
            block_number,
            removed: false,
        }
    }

    /// The same registration reported again as reorged away.
    #[must_use]
    pub fn into_removed(self) -> Self {
        Self {
            removed: true,
            ..self
        }
    }
}

/// The node's own identity key material and its public commitment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityCredential {
    #[serde(with = "hex_bytes32")]
    pub id_trapdoor: [u8; HASH_SIZE],
    #[serde(with = "hex_bytes32")]
    pub id_nullifier: [u8; HASH_SIZE],
    #[serde(with = "hex_bytes32")]
    pub id_secret_hash: [u8; HASH_SIZE],
    #[serde(with = "hex_bytes32")]
    pub id_commitment: IdCommitment,
}

impl IdentityCredential {
    /// Generates a fresh credential from random trapdoor and nullifier.
    ///
    /// The secret hash and commitment are derived with SHA3-256. This is
    /// meant for ephemeral and test nodes; credentials registered against a
    /// production contract come from the zero-knowledge toolkit instead.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut id_trapdoor = [0u8; HASH_SIZE];
        let mut id_nullifier = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut id_trapdoor);
        rng.fill_bytes(&mut id_nullifier);

        let mut hasher = Sha3_256::new();
        hasher.update(id_trapdoor);
        hasher.update(id_nullifier);
        let id_secret_hash: [u8; HASH_SIZE] = hasher.finalize().into();
        let id_commitment: IdCommitment = Sha3_256::digest(id_secret_hash).into();

        Self {
            id_trapdoor,
            id_nullifier,
            id_secret_hash,
            id_commitment,
        }
    }
}

impl fmt::Debug for IdentityCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCredential")
            .field("id_commitment", &hex::encode(self.id_commitment))
            .finish_non_exhaustive()
    }
}

/// Identifies the application a keystore belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub application: String,
    pub app_identifier: String,
    pub version: String,
}

impl AppInfo {
    /// Descriptor used by the relay's rate-limiting layer.
    pub fn rln_relay() -> Self {
        Self {
            application: "waku-rln-relay".to_string(),
            app_identifier: "01234567890abcdef".to_string(),
            version: "0.1".to_string(),
        }
    }
}
