//! Dynamic group manager: keeps the local membership tree in step with the
//! on-chain registry.
//!
//! [`GroupManager::start`] dials the chain, probes the registry contract,
//! resolves the node's own credential and spawns a single sync worker. The
//! worker owns the tree and root tracker for as long as it runs, so no lock
//! guards them; [`GroupManager::stop`] signals it, joins it and takes both
//! back before flushing the tree.
//!
//! Registrations arrive through bounded `eth_getLogs` range polls. A log
//! filter installed before the first poll reports reorgs: logs of dropped
//! blocks come back flagged `removed`, and logs re-included below the poll
//! cursor are applied from the filter as well.

use anyhow::Context;
use ethers::types::Address;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::Config;
use crate::error::{ChainError, GroupManagerError};
use crate::ethereum::{
    format_address, parse_contract_address, ChainClient, ChainConnector, FilterId,
};
use crate::keystore::{
    select_credential, CredentialKeystore, MembershipContract, DEFAULT_KEYSTORE_PASSWORD,
    DEFAULT_KEYSTORE_PATH,
};
use crate::merkle::MembershipTree;
use crate::metadata::MetadataStore;
use crate::reconciler::EventReconciler;
use crate::root_tracker::RootTracker;
use crate::types::{
    AppInfo, IdCommitment, IdentityCredential, MembershipEvent, MembershipIndex, MerkleNode,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BLOCK_RANGE: u64 = 5_000;

/// Blocks below the poll cursor for which range-polled logs are remembered.
const RECENT_LOG_HORIZON: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Settings the manager is built from.
#[derive(Clone)]
pub struct GroupManagerSettings {
    pub eth_client_address: String,
    pub membership_contract: Address,
    pub keystore_path: Option<PathBuf>,
    pub keystore_password: Option<String>,
    pub keystore_index: usize,
    pub membership_group_index: usize,
    /// First block to scan when no progress was persisted.
    pub start_block: u64,
    pub poll_interval: Duration,
    /// Widest block range requested in one poll.
    pub max_block_range: u64,
}

impl GroupManagerSettings {
    pub fn new(eth_client_address: impl Into<String>, membership_contract: Address) -> Self {
        Self {
            eth_client_address: eth_client_address.into(),
            membership_contract,
            keystore_path: None,
            keystore_password: None,
            keystore_index: 0,
            membership_group_index: 0,
            start_block: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let contract = config
            .chain
            .membership_contract_address
            .as_deref()
            .context("membership contract address is not configured")?;
        let membership_contract = parse_contract_address(contract)?;

        Ok(Self {
            eth_client_address: config.chain.eth_client_address.clone(),
            membership_contract,
            keystore_path: config.keystore.path.clone(),
            keystore_password: config.keystore.password.clone(),
            keystore_index: config.keystore.keystore_index,
            membership_group_index: config.keystore.membership_group_index,
            start_block: config.chain.start_block,
            poll_interval: Duration::from_millis(config.chain.poll_interval_ms.max(1)),
            max_block_range: config.chain.max_block_range,
        })
    }
}

/// Tree and root history, owned by whoever currently drives them.
pub struct SyncState {
    pub tree: Box<dyn MembershipTree>,
    pub tracker: Box<dyn RootTracker>,
}

struct RunningSync {
    client: Arc<dyn ChainClient>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<SyncState>,
}

pub struct GroupManager {
    settings: GroupManagerSettings,
    keystore_path: PathBuf,
    keystore_password: String,
    connector: Arc<dyn ChainConnector>,
    keystore: Arc<dyn CredentialKeystore>,
    metadata: Arc<dyn MetadataStore>,

    state: ManagerState,
    identity_credential: Option<IdentityCredential>,
    membership_index: Option<MembershipIndex>,
    chain_id: Option<u64>,
    last_processed_block: Arc<AtomicU64>,
    roots: Arc<watch::Sender<Vec<MerkleNode>>>,

    running: Option<RunningSync>,
    stopped_state: Option<SyncState>,
}

impl GroupManager {
    pub fn new(
        settings: GroupManagerSettings,
        connector: Arc<dyn ChainConnector>,
        keystore: Arc<dyn CredentialKeystore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let keystore_path = match settings
            .keystore_path
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
        {
            Some(path) => path,
            None => {
                warn!(
                    "keystore: no credentials path set, using default path {}",
                    DEFAULT_KEYSTORE_PATH
                );
                PathBuf::from(DEFAULT_KEYSTORE_PATH)
            }
        };

        let keystore_password = match settings
            .keystore_password
            .clone()
            .filter(|password| !password.is_empty())
        {
            Some(password) => password,
            None => {
                warn!("keystore: no credentials password set, using default password");
                DEFAULT_KEYSTORE_PASSWORD.to_string()
            }
        };

        let (roots, _) = watch::channel(Vec::new());

        Self {
            settings,
            keystore_path,
            keystore_password,
            connector,
            keystore,
            metadata,
            state: ManagerState::Idle,
            identity_credential: None,
            membership_index: None,
            chain_id: None,
            last_processed_block: Arc::new(AtomicU64::new(0)),
            roots: Arc::new(roots),
            running: None,
            stopped_state: None,
        }
    }

    /// Uses an already known credential instead of reading the keystore.
    #[must_use]
    pub fn with_identity(mut self, credential: IdentityCredential, index: MembershipIndex) -> Self {
        self.identity_credential = Some(credential);
        self.membership_index = Some(index);
        self
    }

    /// Connects to the chain and starts syncing into `tree` and `tracker`.
    ///
    /// On error nothing keeps running and `start` may be retried with fresh
    /// handles.
    pub async fn start(
        &mut self,
        tree: Box<dyn MembershipTree>,
        tracker: Box<dyn RootTracker>,
    ) -> Result<(), GroupManagerError> {
        if matches!(
            self.state,
            ManagerState::Starting | ManagerState::Running | ManagerState::Stopping
        ) {
            return Err(GroupManagerError::AlreadyStarted);
        }

        self.state = ManagerState::Starting;
        info!("mounting rln-relay in on-chain/dynamic mode");

        match self.launch(SyncState { tree, tracker }).await {
            Ok(running) => {
                self.running = Some(running);
                self.state = ManagerState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = ManagerState::Idle;
                Err(e)
            }
        }
    }

    async fn launch(&mut self, state: SyncState) -> Result<RunningSync, GroupManagerError> {
        let client = self
            .connector
            .connect(&self.settings.eth_client_address)
            .await?;

        match self.prepare(client.as_ref()).await {
            Ok((chain_id, filter)) => Ok(self.spawn_worker(client, chain_id, filter, state)),
            Err(e) => {
                client.close();
                Err(e)
            }
        }
    }

    async fn prepare(
        &mut self,
        client: &dyn ChainClient,
    ) -> Result<(u64, FilterId), GroupManagerError> {
        let chain_id = client.chain_id().await?;
        let contract = self.settings.membership_contract;

        // the registry must answer a static call before we trust its logs
        let fee = client.membership_fee(contract).await?;
        debug!(
            "registry {} reachable on chain {} (membership deposit {})",
            format_address(&contract),
            chain_id,
            fee
        );

        self.resolve_credentials(chain_id)?;

        // installed before the first range poll so no reorg slips between them
        let filter = client.watch_membership_events(contract).await?;
        Ok((chain_id, filter))
    }

    fn resolve_credentials(&mut self, chain_id: u64) -> Result<(), GroupManagerError> {
        if self.identity_credential.is_none() {
            let filter = [MembershipContract::new(
                chain_id,
                &self.settings.membership_contract,
            )];
            let credentials = self.keystore.get_membership_credentials(
                &self.keystore_path,
                &self.keystore_password,
                &AppInfo::rln_relay(),
                &filter,
            )?;
            let (credential, index) = select_credential(
                &credentials,
                self.settings.keystore_index,
                self.settings.membership_group_index,
            )?;
            self.identity_credential = Some(credential);
            self.membership_index = Some(index);
        }

        if self.identity_credential.is_none() || self.membership_index.is_none() {
            return Err(GroupManagerError::Config(
                "no credentials available".to_string(),
            ));
        }
        Ok(())
    }

    fn resume_block(&self, chain_id: u64) -> Option<u64> {
        match self.metadata.get_metadata() {
            Ok(Some(metadata))
                if metadata.chain_id == chain_id
                    && metadata.contract_address == self.settings.membership_contract =>
            {
                info!(
                    "resuming rln sync after block {}",
                    metadata.last_processed_block
                );
                Some(metadata.last_processed_block)
            }
            Ok(Some(metadata)) => {
                warn!(
                    "ignoring rln metadata recorded for chain {} contract {}",
                    metadata.chain_id,
                    format_address(&metadata.contract_address)
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read rln metadata, syncing from scratch: {}", e);
                None
            }
        }
    }

    fn spawn_worker(
        &mut self,
        client: Arc<dyn ChainClient>,
        chain_id: u64,
        filter: FilterId,
        state: SyncState,
    ) -> RunningSync {
        let contract = self.settings.membership_contract;
        let resumed = self.resume_block(chain_id);
        let last_processed_block = resumed.unwrap_or(0);
        let cursor = resumed.map_or(self.settings.start_block, |block| {
            block.saturating_add(1).max(self.settings.start_block)
        });

        self.chain_id = Some(chain_id);
        self.last_processed_block
            .store(last_processed_block, Ordering::Release);
        self.roots.send_replace(state.tracker.roots());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync = ChainSync {
            client: Arc::clone(&client),
            contract,
            reconciler: EventReconciler::new(chain_id, contract, last_processed_block),
            metadata: Arc::clone(&self.metadata),
            roots: Arc::clone(&self.roots),
            watermark: Arc::clone(&self.last_processed_block),
            cursor,
            filter: Some(filter),
            recent: RecentLogs::default(),
            pending_changes: Vec::new(),
            poll_interval: self.settings.poll_interval,
            max_block_range: self.settings.max_block_range.max(1),
        };
        let worker = tokio::spawn(sync.run(state, shutdown_rx));

        RunningSync {
            client,
            shutdown: shutdown_tx,
            worker,
        }
    }

    /// Stops the sync worker, flushes the tree and closes the chain connection.
    ///
    /// A no-op when the manager is not running. The flush error, if any, is
    /// returned after the connection has been closed.
    pub async fn stop(&mut self) -> Result<(), GroupManagerError> {
        let Some(RunningSync {
            client,
            shutdown,
            worker,
        }) = self.running.take()
        else {
            return Ok(());
        };

        self.state = ManagerState::Stopping;
        let _ = shutdown.send(true);

        let mut result = Ok(());
        match worker.await {
            Ok(mut state) => {
                if let Err(e) = state.tree.flush() {
                    error!("failed to flush membership tree: {}", e);
                    result = Err(GroupManagerError::Flush(e));
                }
                self.stopped_state = Some(state);
            }
            Err(e) => {
                error!("rln sync worker did not exit cleanly: {}", e);
                result = Err(GroupManagerError::Worker(e.to_string()));
            }
        }

        client.close();
        self.state = ManagerState::Stopped;
        info!("rln group manager stopped");
        result
    }

    pub fn identity_credentials(&self) -> Result<IdentityCredential, GroupManagerError> {
        self.identity_credential
            .clone()
            .ok_or(GroupManagerError::NotInitialized("identity credential"))
    }

    pub fn membership_index(&self) -> Result<MembershipIndex, GroupManagerError> {
        self.membership_index
            .ok_or(GroupManagerError::NotInitialized("membership index"))
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Highest block whose registrations have been applied.
    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block.load(Ordering::Acquire)
    }

    /// Chain id of the connected chain, once started.
    pub fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    pub fn membership_contract(&self) -> Address {
        self.settings.membership_contract
    }

    /// Receives the acceptable root window after every applied batch.
    pub fn subscribe_roots(&self) -> watch::Receiver<Vec<MerkleNode>> {
        self.roots.subscribe()
    }

    /// Hands back the tree and tracker after [`GroupManager::stop`].
    pub fn take_sync_state(&mut self) -> Option<SyncState> {
        self.stopped_state.take()
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.client.close();
        }
    }
}

/// The sync worker: polls the registry and feeds the reconciler.
struct ChainSync {
    client: Arc<dyn ChainClient>,
    contract: Address,
    reconciler: EventReconciler,
    metadata: Arc<dyn MetadataStore>,
    roots: Arc<watch::Sender<Vec<MerkleNode>>>,
    watermark: Arc<AtomicU64>,
    /// Next block to request.
    cursor: u64,
    /// Reorg log filter; reinstalled on the next tick after it fails.
    filter: Option<FilterId>,
    recent: RecentLogs,
    /// Filter changes that failed to apply and will be retried.
    pending_changes: Vec<MembershipEvent>,
    poll_interval: Duration,
    max_block_range: u64,
}

impl ChainSync {
    async fn run(mut self, mut state: SyncState, mut shutdown: watch::Receiver<bool>) -> SyncState {
        info!("rln sync worker started at block {}", self.cursor);

        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    // Only fetches are cancellable; whatever arrived is applied in full.
                    let changes = tokio::select! {
                        changes = self.fetch_filter_changes() => changes,
                        _ = shutdown.changed() => break,
                    };
                    match changes {
                        Ok(events) => self.apply_filter_changes(&mut state, events),
                        Err(e) => warn!("membership log filter failed, reinstalling: {}", e),
                    }

                    let fetched = tokio::select! {
                        fetched = self.fetch_batch() => fetched,
                        _ = shutdown.changed() => break,
                    };

                    match fetched {
                        Ok(Some((to_block, events))) => self.apply_batch(&mut state, to_block, &events),
                        Ok(None) => {}
                        Err(e) => warn!("polling membership events failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(filter) = self.filter.take() {
            if let Err(e) = self.client.unwatch_membership_events(filter).await {
                debug!("failed to uninstall membership log filter: {}", e);
            }
        }

        info!(
            "rln sync worker stopped (lastProcessedBlock={})",
            self.reconciler.last_processed_block()
        );
        state
    }

    async fn fetch_batch(&self) -> Result<Option<(u64, Vec<MembershipEvent>)>, ChainError> {
        let head = self.client.block_number().await?;
        if head < self.cursor {
            return Ok(None);
        }

        let to_block = head.min(self.cursor.saturating_add(self.max_block_range - 1));
        let events = self
            .client
            .membership_events(self.contract, self.cursor, to_block)
            .await?;
        Ok(Some((to_block, events)))
    }

    async fn fetch_filter_changes(&mut self) -> Result<Vec<MembershipEvent>, ChainError> {
        let filter = match self.filter {
            Some(filter) => filter,
            None => {
                let filter = self.client.watch_membership_events(self.contract).await?;
                self.filter = Some(filter);
                filter
            }
        };

        match self.client.membership_event_changes(filter).await {
            Ok(events) => Ok(events),
            Err(e) => {
                self.filter = None;
                Err(e)
            }
        }
    }

    fn apply_filter_changes(&mut self, state: &mut SyncState, events: Vec<MembershipEvent>) {
        let changes = self.recent.reorg_changes(events, self.cursor);
        self.pending_changes.extend(changes);
        if self.pending_changes.is_empty() {
            return;
        }

        let outcome = self.reconciler.apply_events(
            state.tree.as_mut(),
            state.tracker.as_mut(),
            self.metadata.as_ref(),
            &self.pending_changes,
        );

        match outcome {
            Ok(outcome) => {
                info!(
                    "applied chain reorg: {} inserted, {} removed",
                    outcome.inserted, outcome.removed
                );
                self.pending_changes.clear();
                self.roots.send_replace(state.tracker.roots());
                self.watermark
                    .store(outcome.last_processed_block, Ordering::Release);
            }
            Err(e) => {
                error!(
                    "failed to apply {} reorged membership logs, will retry: {}",
                    self.pending_changes.len(),
                    e
                );
            }
        }
    }

    fn apply_batch(&mut self, state: &mut SyncState, to_block: u64, events: &[MembershipEvent]) {
        let outcome = self.reconciler.apply_events(
            state.tree.as_mut(),
            state.tracker.as_mut(),
            self.metadata.as_ref(),
            events,
        );

        match outcome {
            Ok(outcome) => {
                debug!(
                    "reconciled blocks {}..={}: {} inserted, {} removed",
                    self.cursor, to_block, outcome.inserted, outcome.removed
                );
                self.cursor = to_block.saturating_add(1);
                self.recent.record(events);
                self.recent
                    .forget_before(self.cursor.saturating_sub(RECENT_LOG_HORIZON));
                // roots go out before the watermark moves past them
                if outcome.inserted + outcome.removed > 0 {
                    self.roots.send_replace(state.tracker.roots());
                }
                self.watermark
                    .store(outcome.last_processed_block, Ordering::Release);
            }
            Err(e) => {
                error!(
                    "failed to reconcile blocks {}..={}, will retry: {}",
                    self.cursor, to_block, e
                );
            }
        }
    }
}

/// Registrations recently applied from range polls, keyed by block.
///
/// The log filter reports every new log too; copies of logs the range poll
/// already applied are recognised here and skipped.
#[derive(Debug, Default)]
struct RecentLogs {
    by_block: BTreeMap<u64, Vec<(MembershipIndex, IdCommitment)>>,
}

impl RecentLogs {
    fn record(&mut self, events: &[MembershipEvent]) {
        for event in events.iter().filter(|event| !event.removed) {
            self.by_block
                .entry(event.block_number)
                .or_default()
                .push((event.index, event.id_commitment));
        }
    }

    fn forget_before(&mut self, block_number: u64) {
        self.by_block = self.by_block.split_off(&block_number);
    }

    /// Drops one remembered copy of `event`; false if none was remembered.
    fn forget(&mut self, event: &MembershipEvent) -> bool {
        let Some(entries) = self.by_block.get_mut(&event.block_number) else {
            return false;
        };
        let Some(position) = entries
            .iter()
            .position(|entry| *entry == (event.index, event.id_commitment))
        else {
            return false;
        };

        entries.remove(position);
        if entries.is_empty() {
            self.by_block.remove(&event.block_number);
        }
        true
    }

    /// Filter output the range poll will not deliver.
    ///
    /// Removals always apply. Logs at or past `cursor` are left to the range
    /// poll, and logs below it apply unless the range poll already did.
    fn reorg_changes(
        &mut self,
        events: Vec<MembershipEvent>,
        cursor: u64,
    ) -> Vec<MembershipEvent> {
        events
            .into_iter()
            .filter(|event| {
                if event.removed {
                    self.forget(event);
                    true
                } else if event.block_number >= cursor {
                    false
                } else {
                    !self.forget(event)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config_requires_contract() {
        let config = Config::default();
        let result = GroupManagerSettings::from_config(&config);
        assert!(result.is_err());
        assert!(result
            .err()
            .map(|e| e.to_string().contains("membership contract"))
            .unwrap_or(false));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.chain.membership_contract_address =
            Some("0x742d35Cc6634C0532925a3b844Bc454e4438f44e".to_string());
        config.chain.poll_interval_ms = 250;
        config.keystore.keystore_index = 2;

        let settings = GroupManagerSettings::from_config(&config).unwrap();
        assert_eq!(
            format_address(&settings.membership_contract),
            "0x742d35cc6634c0532925a3b844bc454e4438f44e"
        );
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.keystore_index, 2);
        assert!(settings.keystore_path.is_none());
    }

    #[test]
    fn test_filter_copies_of_polled_logs_are_skipped() {
        let polled = MembershipEvent::registered(0, [1u8; 32], 50);
        let mut recent = RecentLogs::default();
        recent.record(&[polled]);

        let changes = recent.reorg_changes(vec![polled], 51);

        assert!(changes.is_empty());
        assert!(recent.by_block.is_empty());
    }

    #[test]
    fn test_logs_ahead_of_cursor_are_left_to_range_poll() {
        let mut recent = RecentLogs::default();
        let ahead = MembershipEvent::registered(3, [3u8; 32], 60);

        assert!(recent.reorg_changes(vec![ahead], 60).is_empty());
    }

    #[test]
    fn test_removals_and_reincluded_logs_are_applied() {
        let original = MembershipEvent::registered(0, [1u8; 32], 50);
        let replacement = MembershipEvent::registered(0, [2u8; 32], 50);
        let mut recent = RecentLogs::default();
        recent.record(&[original]);

        let changes = recent.reorg_changes(vec![original.into_removed(), replacement], 51);

        assert_eq!(changes, vec![original.into_removed(), replacement]);
        assert!(recent.by_block.is_empty());
    }

    #[test]
    fn test_forget_before_prunes_old_blocks() {
        let mut recent = RecentLogs::default();
        recent.record(&[
            MembershipEvent::registered(0, [1u8; 32], 10),
            MembershipEvent::registered(1, [2u8; 32], 20),
        ]);

        recent.forget_before(15);

        assert_eq!(recent.by_block.keys().copied().collect::<Vec<_>>(), vec![20]);
    }
}
