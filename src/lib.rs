//! RLN Membership Sync
//!
//! Keeps a node's local copy of the RLN membership tree consistent with an
//! on-chain membership registry, so that proofs can be checked against any
//! recently valid tree root.
//!
//! # Components
//!
//! - [`GroupManager`]: lifecycle facade; starts and stops the chain sync worker
//! - [`EventReconciler`]: applies batches of registry events to the tree
//! - [`PersistentMerkleTree`]: sparse, index-addressed membership tree
//! - [`MerkleRootTracker`]: window of acceptable roots plus eviction history
//! - [`FileKeystore`]: encrypted credential store
//! - [`FileMetadataStore`]: last processed block, bound to chain and contract
//!
//! # Example
//!
//! ```no_run
//! use rln_membership_sync::{
//!     merkle::PersistentMerkleTree, root_tracker::MerkleRootTracker, EthersConnector,
//!     FileKeystore, FileMetadataStore, GroupManager, GroupManagerSettings,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let contract = rln_membership_sync::ethereum::parse_contract_address(
//!     "0x742d35Cc6634C0532925a3b844Bc454e4438f44e",
//! )?;
//! let settings = GroupManagerSettings::new("http://localhost:8545", contract);
//! let mut manager = GroupManager::new(
//!     settings,
//!     Arc::new(EthersConnector),
//!     Arc::new(FileKeystore),
//!     Arc::new(FileMetadataStore::new("rln_metadata.bin")),
//! );
//!
//! let tree = PersistentMerkleTree::open("rln_tree.json", 20)?;
//! manager
//!     .start(Box::new(tree), Box::new(MerkleRootTracker::default()))
//!     .await?;
//! // ...
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ethereum;
pub mod group_manager;
pub mod keystore;
pub mod merkle;
pub mod metadata;
pub mod reconciler;
pub mod root_tracker;
pub mod types;
pub mod utils;


pub use error::{ChainError, GroupManagerError, KeystoreError, MetadataError, TreeError};
pub use ethereum::{ChainClient, ChainConnector, EthersConnector, FilterId};
pub use group_manager::{GroupManager, GroupManagerSettings, ManagerState, SyncState};
pub use keystore::{CredentialKeystore, FileKeystore, KeystoreFile};
pub use merkle::{MembershipTree, MerkleProof, PersistentMerkleTree};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore, RlnMetadata};
pub use reconciler::EventReconciler;
pub use root_tracker::{MerkleRootTracker, RootTracker};
pub use types::{AppInfo, IdentityCredential, MembershipEvent};
