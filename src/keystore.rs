//! Membership credential keystore.
//!
//! A keystore file holds one or more identity credentials, each listing the
//! registry contracts (and tree positions) it is registered in. Every
//! credential is sealed with ChaCha20-Poly1305 under a key derived from the
//! keystore password with Argon2id. The salt and cost parameters live in the
//! file's `kdf` header, so a keystore can be opened without outside state.
//!
//! The group manager only needs [`CredentialKeystore`]; [`FileKeystore`] is
//! the file-backed implementation used by the binaries.

use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{GroupManagerError, KeystoreError};
use crate::ethereum::{format_address, format_chain_id};
use crate::types::{AppInfo, IdentityCredential, MembershipIndex};

/// Keystore used when none is configured.
pub const DEFAULT_KEYSTORE_PATH: &str = "./rlnKeystore.json";

/// Password used when none is configured. Only suitable for throwaway nodes.
pub const DEFAULT_KEYSTORE_PASSWORD: &str = "password";

const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const KDF_ALGORITHM: &str = "argon2id";

/// Argon2id memory cost for new keystores.
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 64 * 1024;
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;
pub const DEFAULT_KDF_PARALLELISM: u32 = 1;

/// A registry deployment: chain id (`0x` + uppercase hex) and contract address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipContract {
    pub chain_id: String,
    pub address: String,
}

impl MembershipContract {
    pub fn new(chain_id: u64, address: &ethers::types::Address) -> Self {
        Self {
            chain_id: format_chain_id(chain_id),
            address: format_address(address),
        }
    }

    /// Hex spellings differ between tools, so compare case-insensitively.
    pub fn matches(&self, other: &MembershipContract) -> bool {
        self.chain_id.eq_ignore_ascii_case(&other.chain_id)
            && self.address.eq_ignore_ascii_case(&other.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipGroup {
    pub membership_contract: MembershipContract,
    pub tree_index: MembershipIndex,
}

/// One credential and the groups it is registered in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipCredentials {
    pub identity_credential: IdentityCredential,
    pub membership_groups: Vec<MembershipGroup>,
}

pub trait CredentialKeystore: Send + Sync {
    /// Returns the credentials registered in any of `filter`, with their
    /// groups narrowed to the matching ones. An empty filter returns all.
    fn get_membership_credentials(
        &self,
        path: &Path,
        password: &str,
        app_info: &AppInfo,
        filter: &[MembershipContract],
    ) -> Result<Vec<MembershipCredentials>, KeystoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredential {
    pub nonce: String,
    pub ciphertext: String,
}

/// Password hashing parameters, stored in the keystore header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: String,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    /// Hex-encoded, `SALT_SIZE` bytes.
    pub salt: String,
}

impl KdfParams {
    /// Argon2id with the given cost and a fresh random salt.
    pub fn argon2id(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: KDF_ALGORITHM.to_string(),
            memory_kib,
            iterations,
            parallelism,
            salt: hex::encode(salt),
        }
    }

    fn derive_key(&self, password: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>, KeystoreError> {
        if self.algorithm != KDF_ALGORITHM {
            return Err(KeystoreError::Kdf(format!(
                "unsupported kdf {}",
                self.algorithm
            )));
        }

        let salt = hex::decode(&self.salt)
            .map_err(|e| KeystoreError::Malformed(format!("invalid salt encoding: {}", e)))?;
        if salt.len() != SALT_SIZE {
            return Err(KeystoreError::Malformed(format!(
                "invalid salt length: expected {}, found {}",
                SALT_SIZE,
                salt.len()
            )));
        }

        let params = ParamsBuilder::new()
            .m_cost(self.memory_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .output_len(KEY_SIZE)
            .build()
            .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(password.as_bytes(), &salt, &mut key[..])
            .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
        Ok(key)
    }

    fn cipher(&self, password: &str) -> Result<ChaCha20Poly1305, KeystoreError> {
        let key = self.derive_key(password)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(
            DEFAULT_KDF_MEMORY_KIB,
            DEFAULT_KDF_ITERATIONS,
            DEFAULT_KDF_PARALLELISM,
        )
    }
}

/// On-disk keystore layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreFile {
    #[serde(flatten)]
    pub app_info: AppInfo,
    pub kdf: KdfParams,
    #[serde(default)]
    pub credentials: Vec<SealedCredential>,
}

impl KeystoreFile {
    /// Empty keystore using the default Argon2id cost.
    pub fn new(app_info: AppInfo) -> Self {
        Self::with_kdf(app_info, KdfParams::default())
    }

    pub fn with_kdf(app_info: AppInfo, kdf: KdfParams) -> Self {
        Self {
            app_info,
            kdf,
            credentials: Vec::new(),
        }
    }

    /// Loads a keystore, or returns an empty one if `path` does not exist.
    pub fn load_or_new(path: &Path, app_info: &AppInfo) -> Result<Self, KeystoreError> {
        if !path.exists() {
            return Ok(Self::new(app_info.clone()));
        }
        let keystore = Self::load(path)?;
        keystore.check_app(app_info)?;
        Ok(keystore)
    }

    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), KeystoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn check_app(&self, app_info: &AppInfo) -> Result<(), KeystoreError> {
        if self.app_info.application != app_info.application
            || self.app_info.app_identifier != app_info.app_identifier
        {
            return Err(KeystoreError::AppMismatch {
                expected: app_info.application.clone(),
                found: self.app_info.application.clone(),
            });
        }
        Ok(())
    }

    /// Seals `credential` under `password` and appends it.
    pub fn add_credential(
        &mut self,
        credential: &MembershipCredentials,
        password: &str,
    ) -> Result<(), KeystoreError> {
        let cipher = self.kdf.cipher(password)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let plaintext = serde_json::to_vec(credential)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: self.app_info.app_identifier.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::Encryption)?;

        self.credentials.push(SealedCredential {
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        });
        Ok(())
    }

    /// Decrypts every credential with `password`.
    pub fn unseal(&self, password: &str) -> Result<Vec<MembershipCredentials>, KeystoreError> {
        if self.credentials.is_empty() {
            return Ok(Vec::new());
        }
        let cipher = self.kdf.cipher(password)?;

        self.credentials
            .iter()
            .map(|sealed| {
                let nonce = hex::decode(&sealed.nonce)
                    .map_err(|e| KeystoreError::Malformed(e.to_string()))?;
                if nonce.len() != NONCE_SIZE {
                    return Err(KeystoreError::Malformed(format!(
                        "nonce must be {} bytes, got {}",
                        NONCE_SIZE,
                        nonce.len()
                    )));
                }
                let ciphertext = hex::decode(&sealed.ciphertext)
                    .map_err(|e| KeystoreError::Malformed(e.to_string()))?;

                let plaintext = cipher
                    .decrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: &ciphertext,
                            aad: self.app_info.app_identifier.as_bytes(),
                        },
                    )
                    .map_err(|_| KeystoreError::Decryption)?;
                Ok(serde_json::from_slice(&plaintext)?)
            })
            .collect()
    }
}

/// Reads credentials from a [`KeystoreFile`] on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileKeystore;

impl CredentialKeystore for FileKeystore {
    fn get_membership_credentials(
        &self,
        path: &Path,
        password: &str,
        app_info: &AppInfo,
        filter: &[MembershipContract],
    ) -> Result<Vec<MembershipCredentials>, KeystoreError> {
        let keystore = KeystoreFile::load_or_new(path, app_info)?;
        let credentials = keystore.unseal(password)?;
        let total = credentials.len();
        let matching = filter_credentials(credentials, filter);

        debug!(
            "keystore {}: {} of {} credentials match",
            path.display(),
            matching.len(),
            total
        );
        Ok(matching)
    }
}

fn filter_credentials(
    credentials: Vec<MembershipCredentials>,
    filter: &[MembershipContract],
) -> Vec<MembershipCredentials> {
    if filter.is_empty() {
        return credentials;
    }

    credentials
        .into_iter()
        .filter_map(|mut credential| {
            credential.membership_groups.retain(|group| {
                filter
                    .iter()
                    .any(|contract| contract.matches(&group.membership_contract))
            });
            (!credential.membership_groups.is_empty()).then_some(credential)
        })
        .collect()
}

/// Picks the credential at `keystore_index` and its group at `group_index`.
pub fn select_credential(
    credentials: &[MembershipCredentials],
    keystore_index: usize,
    group_index: usize,
) -> Result<(IdentityCredential, MembershipIndex), GroupManagerError> {
    if credentials.is_empty() {
        return Err(GroupManagerError::Config(
            "no credentials available for the membership contract".to_string(),
        ));
    }

    let credential = credentials.get(keystore_index).ok_or_else(|| {
        GroupManagerError::Config(format!(
            "invalid keystore index {} ({} credentials available)",
            keystore_index,
            credentials.len()
        ))
    })?;

    let group = credential
        .membership_groups
        .get(group_index)
        .ok_or_else(|| {
            GroupManagerError::Config(format!(
                "invalid membership group index {} ({} groups available)",
                group_index,
                credential.membership_groups.len()
            ))
        })?;

    Ok((credential.identity_credential.clone(), group.tree_index))
}
