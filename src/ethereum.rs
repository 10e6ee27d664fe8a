//! Chain access for the membership registry.
//!
//! The group manager only talks to the chain through [`ChainConnector`] and
//! [`ChainClient`]. [`EthersConnector`] implements them over HTTP JSON-RPC:
//! `eth_getLogs` over bounded block ranges for catch-up, plus an
//! `eth_newFilter` log filter whose changes carry the `removed` logs of
//! reorged blocks.

use async_trait::async_trait;
use ethers::providers::{FilterKind, Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionRequest, U256};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ChainError;
use crate::types::{IdCommitment, MembershipEvent, HASH_SIZE};
use crate::utils::validate_and_strip_hex;

/// Expected length of an Ethereum address in hex characters (excluding 0x prefix)
/// Ethereum addresses are 20 bytes = 40 hex characters
pub const ADDRESS_HEX_LENGTH: usize = 40;

/// Registry event carrying a new member: both fields are non-indexed, so the
/// log data is `idCommitment (32 bytes) | index (32 bytes)`.
pub const MEMBER_REGISTERED_EVENT: &str = "MemberRegistered(uint256,uint256)";

/// Read-only registry accessor used as a liveness probe.
pub const MEMBERSHIP_DEPOSIT_SIGNATURE: &str = "MEMBERSHIP_DEPOSIT()";

/// Node-side id of an installed log filter.
pub type FilterId = U256;

/// Validates and normalizes a single Ethereum address.
///
/// Returns a lowercase hex string without the 0x prefix.
///
/// # Examples
///
/// ```
/// use rln_membership_sync::ethereum::normalize_address;
///
/// let normalized = normalize_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e").unwrap();
/// assert_eq!(normalized, "742d35cc6634c0532925a3b844bc454e4438f44e");
/// ```
pub fn normalize_address(address: &str) -> anyhow::Result<String> {
    validate_and_strip_hex(address, ADDRESS_HEX_LENGTH).map(|s| s.to_lowercase())
}

/// Parses a registry contract address, rejecting the zero address.
pub fn parse_contract_address(address: &str) -> anyhow::Result<Address> {
    let normalized = normalize_address(address)?;
    let parsed: Address = normalized
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid contract address '{}': {}", address, e))?;

    if parsed.is_zero() {
        return Err(anyhow::anyhow!(
            "Contract address cannot be the zero address"
        ));
    }
    Ok(parsed)
}

/// Chain id in the form keystores record it (`0x` + uppercase hex).
pub fn format_chain_id(chain_id: u64) -> String {
    format!("0x{:X}", chain_id)
}

/// Full `0x`-prefixed lowercase form of an address.
pub fn format_address(address: &Address) -> String {
    format!("{:?}", address)
}

/// Opens connections to a chain node.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ChainClient>, ChainError>;
}

/// One open connection to a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    /// Height of the latest block.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Reads the registry's membership deposit; used to check the contract exists.
    async fn membership_fee(&self, contract: Address) -> Result<U256, ChainError>;

    /// Canonical membership events of `contract` in `[from_block, to_block]`.
    ///
    /// Never reports `removed` events.
    async fn membership_events(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MembershipEvent>, ChainError>;

    /// Installs a log filter for membership events of `contract` from the
    /// current head on.
    async fn watch_membership_events(&self, contract: Address) -> Result<FilterId, ChainError>;

    /// Events the filter matched since the previous call. Logs of blocks
    /// dropped by a reorg come back with `removed` set and their original
    /// block number.
    async fn membership_event_changes(
        &self,
        filter: FilterId,
    ) -> Result<Vec<MembershipEvent>, ChainError>;

    async fn unwatch_membership_events(&self, filter: FilterId) -> Result<(), ChainError>;

    /// Closes the connection; later calls fail with [`ChainError::Closed`].
    fn close(&self);
}

/// Dials HTTP JSON-RPC endpoints with ethers.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthersConnector;

#[async_trait]
impl ChainConnector for EthersConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ChainClient>, ChainError> {
        let provider = Provider::<Http>::try_from(address).map_err(|e| ChainError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let client = EthersChainClient {
            provider,
            closed: AtomicBool::new(false),
        };

        // A URL can parse without a node behind it; ask for the head once.
        client.block_number().await.map_err(|e| ChainError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Arc::new(client))
    }
}

#[derive(Debug)]
pub struct EthersChainClient {
    provider: Provider<Http>,
    closed: AtomicBool,
}

impl EthersChainClient {
    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChainError::Closed);
        }
        Ok(())
    }
}

fn u256_to_u64(value: U256) -> Option<u64> {
    (value <= U256::from(u64::MAX)).then(|| value.low_u64())
}

/// Decodes one `MemberRegistered` log.
pub fn decode_member_registered(log: &Log) -> Result<MembershipEvent, ChainError> {
    let data = log.data.as_ref();
    if data.len() < 2 * HASH_SIZE {
        return Err(ChainError::MalformedLog(format!(
            "expected at least {} data bytes, got {}",
            2 * HASH_SIZE,
            data.len()
        )));
    }

    let mut id_commitment: IdCommitment = [0u8; HASH_SIZE];
    id_commitment.copy_from_slice(&data[..HASH_SIZE]);
    let index = U256::from_big_endian(&data[HASH_SIZE..2 * HASH_SIZE]);
    let index = u256_to_u64(index).ok_or_else(|| {
        ChainError::MalformedLog(format!("member index {} does not fit in 64 bits", index))
    })?;

    let block_number = log
        .block_number
        .ok_or_else(|| ChainError::MalformedLog("log has no block number".to_string()))?
        .as_u64();

    Ok(MembershipEvent {
        index,
        id_commitment,
        block_number,
        removed: log.removed.unwrap_or(false),
    })
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.ensure_open()?;
        let chain_id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        u256_to_u64(chain_id)
            .ok_or_else(|| ChainError::Rpc(format!("chain id {} does not fit in 64 bits", chain_id)))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.ensure_open()?;
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(head.as_u64())
    }

    async fn membership_fee(&self, contract: Address) -> Result<U256, ChainError> {
        self.ensure_open()?;
        let selector = ethers::utils::id(MEMBERSHIP_DEPOSIT_SIGNATURE);
        let tx: TypedTransaction = TransactionRequest::new()
            .to(contract)
            .data(Bytes::from(selector.to_vec()))
            .into();

        let raw = self
            .provider
            .call(&tx, None)
            .await
            .map_err(|e| ChainError::ContractCall(e.to_string()))?;

        if raw.len() < HASH_SIZE {
            return Err(ChainError::ContractCall(format!(
                "{} returned {} bytes",
                MEMBERSHIP_DEPOSIT_SIGNATURE,
                raw.len()
            )));
        }
        Ok(U256::from_big_endian(&raw[..HASH_SIZE]))
    }

    async fn membership_events(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MembershipEvent>, ChainError> {
        self.ensure_open()?;
        let filter = Filter::new()
            .address(contract)
            .event(MEMBER_REGISTERED_EVENT)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        debug!(
            "fetched {} membership logs for blocks {}..={}",
            logs.len(),
            from_block,
            to_block
        );
        logs.iter().map(decode_member_registered).collect()
    }

    async fn watch_membership_events(&self, contract: Address) -> Result<FilterId, ChainError> {
        self.ensure_open()?;
        let filter = Filter::new()
            .address(contract)
            .event(MEMBER_REGISTERED_EVENT);

        let id = self
            .provider
            .new_filter(FilterKind::Logs(&filter))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        debug!("installed membership log filter {}", id);
        Ok(id)
    }

    async fn membership_event_changes(
        &self,
        filter: FilterId,
    ) -> Result<Vec<MembershipEvent>, ChainError> {
        self.ensure_open()?;
        let logs: Vec<Log> = self
            .provider
            .get_filter_changes(filter)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let events = logs
            .iter()
            .map(decode_member_registered)
            .collect::<Result<Vec<_>, _>>()?;
        if !events.is_empty() {
            debug!(
                "membership log filter {} reported {} logs ({} removed)",
                filter,
                events.len(),
                events.iter().filter(|e| e.removed).count()
            );
        }
        Ok(events)
    }

    async fn unwatch_membership_events(&self, filter: FilterId) -> Result<(), ChainError> {
        self.ensure_open()?;
        self.provider
            .uninstall_filter(filter)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
