//! Simulated host network for tests: in-memory hosts speaking the frame
//! protocol, plus stub contract and payment layers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::account::{AccountManager, SignedWithdrawal};
use crate::config::EnvProfile;
use crate::crypto::Hash;
use crate::error::HostError;
use crate::host::{ContractSource, HostStream, PaymentProvider, StreamOpener};
use crate::pricetable::PriceTable;
use crate::registry::SignedRegistryValue;
use crate::types::{
    Allowance, Contract, ContractUtility, Currency, HostKey, PublicKey, Specifier,
    RPC_ACCOUNT_BALANCE, RPC_FUND_ACCOUNT, RPC_HAS_SECTOR, RPC_READ_REGISTRY, RPC_READ_SECTOR,
    RPC_UPDATE_PRICE_TABLE, RPC_UPDATE_REGISTRY,
};
use crate::worker::jobs::{
    encode_update_proof, HasSectorRequest, ReadRegistryRequest, ReadSectorRequest,
    UpdateRegistryRequest, UPDATE_STATUS_LOWER_REV, UPDATE_STATUS_OK, UPDATE_STATUS_SAME_REV,
};
use crate::worker::{AccountBalanceResponse, WorkerDeps};

/// Price table a simulated host publishes. Valid for an hour so tests never
/// race the expiry.
pub(crate) fn sim_price_table() -> PriceTable {
    PriceTable {
        validity: Duration::from_secs(3600).as_nanos() as u64,
        ..PriceTable::default()
    }
}

// ============================================================================
// Simulated host
// ============================================================================

#[derive(Default)]
pub(crate) struct SimHostState {
    pub registry: HashMap<(PublicKey, Hash), SignedRegistryValue>,
    pub sectors: HashMap<Hash, Vec<u8>>,
    pub account_balances: HashMap<PublicKey, Currency>,
}

pub(crate) struct SimHost {
    pub key: HostKey,
    pub state: Mutex<SimHostState>,
    pub price_table: Mutex<PriceTable>,
    pub offline: AtomicBool,
}

impl SimHost {
    pub(crate) fn new(key: HostKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(SimHostState::default()),
            price_table: Mutex::new(sim_price_table()),
            offline: AtomicBool::new(false),
        })
    }

    pub(crate) fn store_sector(&self, data: Vec<u8>) -> Hash {
        let root = crate::crypto::sector_root(&data);
        self.state.lock().sectors.insert(root, data);
        root
    }

    pub(crate) fn store_registry_entry(&self, pubkey: PublicKey, entry: SignedRegistryValue) {
        self.state
            .lock()
            .registry
            .insert((pubkey, entry.value.tweak), entry);
    }

    /// Number of frames each RPC expects before the host answers.
    fn frames_expected(specifier: &Specifier) -> usize {
        if *specifier == RPC_UPDATE_PRICE_TABLE {
            1
        } else if *specifier == RPC_FUND_ACCOUNT || *specifier == RPC_ACCOUNT_BALANCE {
            2
        } else {
            3
        }
    }

    /// Handle one complete request, producing the response frames in order.
    fn handle(&self, frames: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, HostError> {
        let specifier = Specifier(
            frames[0]
                .as_slice()
                .try_into()
                .map_err(|_| HostError::Protocol("bad specifier frame".into()))?,
        );
        if specifier == RPC_UPDATE_PRICE_TABLE {
            let table = self.price_table.lock().clone();
            let json = serde_json::to_vec(&table).expect("price table encodes");
            // Table, then the payment acknowledgement.
            return Ok(vec![json, Vec::new()]);
        }
        if specifier == RPC_FUND_ACCOUNT {
            let request: crate::worker::FundAccountRequest = decode(&frames[1])?;
            let mut state = self.state.lock();
            let balance = state.account_balances.entry(request.account).or_default();
            *balance = balance.saturating_add(request.amount);
            return Ok(vec![Vec::new()]);
        }
        if specifier == RPC_ACCOUNT_BALANCE {
            let request: crate::worker::AccountBalanceRequest = decode(&frames[1])?;
            let balance = self
                .state
                .lock()
                .account_balances
                .get(&request.account)
                .copied()
                .unwrap_or(0);
            let json = serde_json::to_vec(&AccountBalanceResponse { balance })
                .expect("balance encodes");
            return Ok(vec![json]);
        }

        // Paid RPCs: frame 1 carries the withdrawal, frame 2 the request.
        let withdrawal: SignedWithdrawal = decode(&frames[1])?;
        if !withdrawal.verify() {
            return Err(HostError::PaymentRejected("bad withdrawal".into()));
        }
        if specifier == RPC_READ_REGISTRY {
            let request: ReadRegistryRequest = decode(&frames[2])?;
            let entry = self
                .state
                .lock()
                .registry
                .get(&(request.pubkey, request.tweak))
                .cloned();
            return Ok(vec![match entry {
                Some(entry) => serde_json::to_vec(&entry).expect("entry encodes"),
                None => Vec::new(),
            }]);
        }
        if specifier == RPC_UPDATE_REGISTRY {
            let request: UpdateRegistryRequest = decode(&frames[2])?;
            let mut state = self.state.lock();
            let key = (request.pubkey, request.entry.value.tweak);
            let response = match state.registry.get(&key) {
                Some(existing) if request.entry.value.revision < existing.value.revision => {
                    let mut out = vec![UPDATE_STATUS_LOWER_REV];
                    out.extend_from_slice(&encode_update_proof(
                        &existing.signature,
                        existing.value.revision,
                        &existing.value.data,
                    ));
                    out
                }
                Some(existing) if request.entry.value.revision == existing.value.revision => {
                    let mut out = vec![UPDATE_STATUS_SAME_REV];
                    out.extend_from_slice(&encode_update_proof(
                        &existing.signature,
                        existing.value.revision,
                        &existing.value.data,
                    ));
                    out
                }
                _ => {
                    if request.entry.verify(&request.pubkey).is_err() {
                        return Err(HostError::Protocol("bad entry signature".into()));
                    }
                    state.registry.insert(key, request.entry);
                    vec![UPDATE_STATUS_OK]
                }
            };
            return Ok(vec![response]);
        }
        if specifier == RPC_HAS_SECTOR {
            let request: HasSectorRequest = decode(&frames[2])?;
            let has = self.state.lock().sectors.contains_key(&request.root);
            return Ok(vec![vec![u8::from(has)]]);
        }
        if specifier == RPC_READ_SECTOR {
            let request: ReadSectorRequest = decode(&frames[2])?;
            let state = self.state.lock();
            let Some(sector) = state.sectors.get(&request.root) else {
                return Err(HostError::Protocol("unknown sector".into()));
            };
            let start = request.offset as usize;
            let end = start + request.length as usize;
            if end > sector.len() {
                // Short sectors are padded; hosts serve zeroes past the data.
                let mut out = vec![0u8; request.length as usize];
                if start < sector.len() {
                    let avail = &sector[start..];
                    out[..avail.len()].copy_from_slice(avail);
                }
                return Ok(vec![out]);
            }
            return Ok(vec![sector[start..end].to_vec()]);
        }
        Err(HostError::Protocol("unknown specifier".into()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T, HostError> {
    serde_json::from_slice(frame).map_err(|e| HostError::Protocol(e.to_string()))
}

// ============================================================================
// Streams and openers
// ============================================================================

pub(crate) struct SimStream {
    host: Arc<SimHost>,
    written: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    pending_err: Option<HostError>,
}

#[async_trait]
impl HostStream for SimStream {
    async fn read_frame(&mut self) -> Result<Vec<u8>, HostError> {
        if let Some(err) = self.pending_err.take() {
            return Err(err);
        }
        self.responses
            .pop_front()
            .ok_or(HostError::StreamClosed)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), HostError> {
        self.written.push(frame.to_vec());
        if let Some(specifier_frame) = self.written.first() {
            if specifier_frame.len() == 16 {
                let specifier = Specifier(specifier_frame.as_slice().try_into().unwrap());
                if self.written.len() == SimHost::frames_expected(&specifier) {
                    match self.host.handle(&self.written) {
                        Ok(frames) => self.responses.extend(frames),
                        Err(err) => self.pending_err = Some(err),
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HostError> {
        Ok(())
    }
}

/// Opener routing streams to the simulated hosts.
pub(crate) struct SimNetwork {
    pub hosts: Mutex<HashMap<HostKey, Arc<SimHost>>>,
}

impl SimNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn add_host(&self, host: Arc<SimHost>) {
        self.hosts.lock().insert(host.key, host);
    }

    pub(crate) fn host(&self, key: &HostKey) -> Option<Arc<SimHost>> {
        self.hosts.lock().get(key).cloned()
    }
}

#[async_trait]
impl StreamOpener for SimNetwork {
    async fn open_stream(&self, host: &HostKey) -> Result<Box<dyn HostStream>, HostError> {
        let host = self.host(host).ok_or(HostError::Offline)?;
        if host.offline.load(Ordering::SeqCst) {
            return Err(HostError::Offline);
        }
        Ok(Box::new(SimStream {
            host,
            written: Vec::new(),
            responses: VecDeque::new(),
            pending_err: None,
        }))
    }
}

// ============================================================================
// Payment and contracts
// ============================================================================

/// Records payments instead of moving money.
pub(crate) struct SimPayment {
    pub paid: Mutex<HashMap<HostKey, Currency>>,
    pub fail: AtomicBool,
}

impl SimPayment {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            paid: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PaymentProvider for SimPayment {
    async fn pay(
        &self,
        _stream: &mut dyn HostStream,
        host: &HostKey,
        amount: Currency,
    ) -> Result<(), HostError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::PaymentRejected("payment disabled".into()));
        }
        let mut paid = self.paid.lock();
        let total = paid.entry(*host).or_default();
        *total = total.saturating_add(amount);
        Ok(())
    }
}

pub(crate) struct SimContracts {
    pub contracts: Mutex<Vec<Contract>>,
    pub allowance: Mutex<Allowance>,
}

impl SimContracts {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            contracts: Mutex::new(Vec::new()),
            allowance: Mutex::new(Allowance::default()),
        })
    }

    pub(crate) fn add_contract(&self, host: HostKey) {
        let mut contracts = self.contracts.lock();
        let id_byte = contracts.len() as u8;
        contracts.push(Contract {
            id: [id_byte; 32],
            host_key: host,
            end_height: 1_000,
            utility: ContractUtility {
                good_for_upload: true,
                good_for_renew: true,
            },
            host_version: "1.5.0".into(),
        });
    }

    pub(crate) fn remove_contract(&self, host: &HostKey) {
        self.contracts.lock().retain(|c| c.host_key != *host);
    }
}

/// Host database stub: every host resolves to a plain record.
pub(crate) struct SimHostDb;

impl crate::host::HostDb for SimHostDb {
    fn host(&self, host: &HostKey) -> Option<crate::host::HostInfo> {
        Some(crate::host::HostInfo {
            host_key: *host,
            net_address: "sim.host:9982".into(),
            version: "1.5.0".into(),
        })
    }
}

impl ContractSource for SimContracts {
    fn contracts(&self) -> Vec<Contract> {
        self.contracts.lock().clone()
    }

    fn contract_utility(&self, host: &HostKey) -> Option<ContractUtility> {
        self.contracts
            .lock()
            .iter()
            .find(|c| c.host_key == *host)
            .map(|c| c.utility)
    }

    fn is_offline(&self, _host: &HostKey) -> bool {
        false
    }

    fn allowance(&self) -> Allowance {
        self.allowance.lock().clone()
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Poll until `condition` holds, panicking after a few seconds.
pub(crate) async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Everything a worker/pool test needs, with `count` simulated hosts that
/// already have contracts.
pub(crate) struct SimHarness {
    pub network: Arc<SimNetwork>,
    pub contracts: Arc<SimContracts>,
    pub payment: Arc<SimPayment>,
    pub deps: WorkerDeps,
    pub hosts: Vec<Arc<SimHost>>,
    _dir: tempfile::TempDir,
}

impl SimHarness {
    pub(crate) fn new(count: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let network = SimNetwork::new();
        let contracts = SimContracts::new();
        let payment = SimPayment::new();
        let accounts = Arc::new(
            AccountManager::open(&dir.path().join("accounts.dat")).expect("accounts file"),
        );
        let mut hosts = Vec::new();
        for i in 0..count {
            let key = HostKey::ed25519([i as u8 + 1; 32]);
            let host = SimHost::new(key);
            network.add_host(host.clone());
            contracts.add_contract(key);
            hosts.push(host);
        }
        let deps = WorkerDeps {
            stream_opener: network.clone(),
            payment: payment.clone(),
            accounts,
            env: EnvProfile::Testing,
            allowance: Arc::new(Mutex::new(Allowance::default())),
            block_height: Arc::new(AtomicU64::new(10)),
            balance_target: 1_000_000,
        };
        Self {
            network,
            contracts,
            payment,
            deps,
            hosts,
            _dir: dir,
        }
    }
}
