//! The per-host worker: owns all RPCs and state addressed to one host.
//!
//! A worker runs a single long-lived task. Within a worker, jobs execute
//! sequentially; distinct workers run fully in parallel. The loop priority is
//! shutdown, then price-table maintenance, then account maintenance, then the
//! job queues in decreasing priority.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountManager, SignedWithdrawal};
use crate::config::EnvProfile;
use crate::error::{AccountError, GougingError, HostError, JobError};
use crate::host::{HostStream, PaymentProvider, StreamOpener};
use crate::pricetable::{fetch_price_table, PriceTable, PriceTableCell};
use crate::registry::RegistryCache;
use crate::types::{
    currency_serde, Allowance, ContractId, Currency, HostKey, PublicKey, RPC_ACCOUNT_BALANCE,
    RPC_FUND_ACCOUNT,
};

pub mod jobs;
pub mod pool;
pub mod queue;

use jobs::{HasSectorJob, ReadRegistryJob, ReadSectorJob, UpdateRegistryJob};
use queue::{cooldown_duration, JobQueue, QueueStatus};

/// Heartbeat for the main loop so expired cooldowns are re-checked even
/// without a wake signal.
const WORKER_LOOP_HEARTBEAT: Duration = Duration::from_millis(500);

/// Minimum seed for the job time estimates.
const MIN_JOB_TIME_SEED: Duration = Duration::from_secs(1);

// ============================================================================
// Account RPC wire shapes
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FundAccountRequest {
    pub account: PublicKey,
    #[serde(with = "currency_serde")]
    pub amount: Currency,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountBalanceRequest {
    pub account: PublicKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountBalanceResponse {
    #[serde(with = "currency_serde")]
    pub balance: Currency,
}

// ============================================================================
// Dependencies
// ============================================================================

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub stream_opener: Arc<dyn StreamOpener>,
    pub payment: Arc<dyn PaymentProvider>,
    pub accounts: Arc<AccountManager>,
    pub env: EnvProfile,
    pub allowance: Arc<Mutex<Allowance>>,
    pub block_height: Arc<AtomicU64>,
    pub balance_target: Currency,
}

/// Diagnostic snapshot of a worker.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub host_key: HostKey,
    pub contract_id: ContractId,
    pub price_table_fetched: bool,
    pub account_balance: Currency,
    pub queues: Vec<QueueStatus>,
}

struct MaintenanceCooldown {
    consecutive_failures: u32,
    until: Option<Instant>,
}

// ============================================================================
// The worker
// ============================================================================

pub struct Worker {
    host_key: HostKey,
    contract_id: ContractId,
    deps: WorkerDeps,
    price_table: PriceTableCell,
    account: Arc<Account>,
    registry_cache: RegistryCache,
    wake: Arc<Notify>,
    kill: CancellationToken,
    estimates_seeded: AtomicBool,
    account_cooldown: Mutex<MaintenanceCooldown>,

    update_registry: JobQueue<UpdateRegistryJob>,
    read_registry: JobQueue<ReadRegistryJob>,
    has_sector: JobQueue<HasSectorJob>,
    read_sector: JobQueue<ReadSectorJob>,
}

impl Worker {
    /// Construct a worker for a contract, opening (or creating) its account
    /// slot. The caller starts the main loop via [`Worker::run`].
    pub fn new(
        host_key: HostKey,
        contract_id: ContractId,
        deps: WorkerDeps,
    ) -> Result<Arc<Self>, AccountError> {
        let account = deps.accounts.open_account(host_key)?;
        let wake = Arc::new(Notify::new());
        Ok(Arc::new(Self {
            host_key,
            contract_id,
            deps,
            price_table: PriceTableCell::new(),
            account,
            registry_cache: RegistryCache::new(),
            wake: wake.clone(),
            kill: CancellationToken::new(),
            estimates_seeded: AtomicBool::new(false),
            account_cooldown: Mutex::new(MaintenanceCooldown {
                consecutive_failures: 0,
                until: None,
            }),
            update_registry: JobQueue::new("update-registry", wake.clone()),
            read_registry: JobQueue::new("read-registry", wake.clone()),
            has_sector: JobQueue::new("has-sector", wake.clone()),
            read_sector: JobQueue::new("read-sector", wake),
        }))
    }

    // --- accessors used by jobs ---

    #[must_use]
    pub fn host_key(&self) -> HostKey {
        self.host_key
    }

    #[must_use]
    pub fn contract_id(&self) -> ContractId {
        self.contract_id
    }

    #[must_use]
    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    #[must_use]
    pub fn registry_cache(&self) -> &RegistryCache {
        &self.registry_cache
    }

    #[must_use]
    pub fn allowance(&self) -> Allowance {
        self.deps.allowance.lock().clone()
    }

    #[must_use]
    pub fn block_height(&self) -> u64 {
        self.deps.block_height.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn price_table(&self) -> &PriceTableCell {
        &self.price_table
    }

    pub(crate) fn update_registry_queue(&self) -> &JobQueue<UpdateRegistryJob> {
        &self.update_registry
    }

    pub(crate) fn read_registry_queue(&self) -> &JobQueue<ReadRegistryJob> {
        &self.read_registry
    }

    pub(crate) fn has_sector_queue(&self) -> &JobQueue<HasSectorJob> {
        &self.has_sector
    }

    pub(crate) fn read_sector_queue(&self) -> &JobQueue<ReadSectorJob> {
        &self.read_sector
    }

    /// The current price table if it is fetched and unexpired.
    pub(crate) fn usable_price_table(&self) -> Result<PriceTable, JobError> {
        let current = self.price_table.current();
        match current.times {
            None => Err(JobError::Gouging(GougingError::PriceTableNotFetched)),
            Some(t) if Instant::now() >= t.expiry => {
                Err(JobError::Gouging(GougingError::PriceTableExpired))
            }
            Some(_) => Ok(current.table.clone()),
        }
    }

    pub(crate) async fn open_stream(&self) -> Result<Box<dyn HostStream>, HostError> {
        self.deps.stream_opener.open_stream(&self.host_key).await
    }

    pub(crate) fn new_withdrawal(&self, amount: Currency) -> SignedWithdrawal {
        self.account
            .new_withdrawal_message(amount, self.block_height())
    }

    // --- queue entry points ---

    pub fn add_update_registry_job(&self, job: UpdateRegistryJob) -> bool {
        self.update_registry.add(job)
    }

    pub fn add_read_registry_job(&self, job: ReadRegistryJob) -> bool {
        self.read_registry.add(job)
    }

    pub fn add_has_sector_job(&self, job: HasSectorJob) -> bool {
        self.has_sector.add(job)
    }

    pub fn add_read_sector_job(&self, job: ReadSectorJob) -> bool {
        self.read_sector.add(job)
    }

    /// Whether this worker can serve registry requests right now.
    #[must_use]
    pub fn supports_registry(&self) -> bool {
        self.usable_price_table().is_ok()
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            host_key: self.host_key,
            contract_id: self.contract_id,
            price_table_fetched: self.price_table.current().times.is_some(),
            account_balance: self.account.balance().balance,
            queues: vec![
                self.update_registry.status(),
                self.read_registry.status(),
                self.has_sector.status(),
                self.read_sector.status(),
            ],
        }
    }

    /// Signal shutdown. The main loop drains the queues and returns.
    pub fn shutdown(&self) {
        self.kill.cancel();
        self.wake.notify_one();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.kill.is_cancelled()
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    pub async fn run(self: Arc<Self>) {
        debug!("worker {:?}: starting", self.host_key);
        loop {
            if self.kill.is_cancelled() {
                self.drain();
                debug!("worker {:?}: stopped", self.host_key);
                return;
            }
            let now = Instant::now();

            // Maintenance: price table first, everything needs it.
            if self.price_table.should_update(now) {
                self.managed_update_price_table().await;
                continue;
            }
            if self.usable_price_table().is_err() {
                // Not usable and not updatable: on maintenance cooldown.
                self.idle().await;
                continue;
            }

            // A suspected revision mismatch invalidates the local view of
            // the account balance.
            if self.price_table.take_suspect_revision_mismatch() {
                self.account.mark_needs_sync();
            }

            if !self.account_on_cooldown(now) {
                let balance = self.account.balance();
                let pending =
                    balance.pending_deposits != 0 || balance.pending_withdrawals != 0;
                if self.account.needs_sync() && !pending {
                    self.managed_sync_account().await;
                    continue;
                }
                if !self.account.needs_sync()
                    && self.account.available_balance() < self.deps.balance_target / 2
                {
                    self.managed_refill_account().await;
                    continue;
                }
            }

            // Job queues in priority order.
            if let Some(job) = self.update_registry.pop() {
                job.execute(&self).await;
                continue;
            }
            if let Some(job) = self.read_registry.pop() {
                job.execute(&self).await;
                continue;
            }
            if let Some(job) = self.has_sector.pop() {
                job.execute(&self).await;
                continue;
            }
            if let Some(job) = self.read_sector.pop() {
                job.execute(&self).await;
                continue;
            }

            self.idle().await;
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.kill.cancelled() => {}
            _ = tokio::time::sleep(WORKER_LOOP_HEARTBEAT) => {}
        }
    }

    fn drain(&self) {
        self.update_registry.kill();
        self.read_registry.kill();
        self.has_sector.kill();
        self.read_sector.kill();
        if let Err(e) = self.deps.accounts.persist_account(&self.account) {
            warn!("worker {:?}: persisting account: {e}", self.host_key);
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn managed_update_price_table(&self) {
        self.price_table.begin_update();
        let allowance = self.allowance();
        let result = match self.open_stream().await {
            Ok(mut stream) => {
                let res = fetch_price_table(
                    stream.as_mut(),
                    self.deps.payment.as_ref(),
                    &self.host_key,
                    self.deps.env,
                    &allowance,
                )
                .await;
                let _ = stream.close().await;
                res
            }
            Err(e) => Err(e.into()),
        };
        match result {
            Ok((table, elapsed)) => {
                self.price_table.complete_update(table, Instant::now());
                if !self.estimates_seeded.swap(true, Ordering::SeqCst) {
                    let seed = elapsed.max(MIN_JOB_TIME_SEED);
                    self.has_sector.seed_estimate(seed);
                    self.read_sector.seed_estimate(seed);
                    self.read_registry.seed_estimate(seed);
                    self.update_registry.seed_estimate(seed);
                }
            }
            Err(e) => {
                warn!("worker {:?}: price table update: {e}", self.host_key);
                let mismatch = e.is_revision_mismatch();
                self.price_table
                    .fail_update(e.to_string(), mismatch, Instant::now());
                if mismatch {
                    self.wake.notify_one();
                }
            }
        }
    }

    fn account_on_cooldown(&self, now: Instant) -> bool {
        let cooldown = self.account_cooldown.lock();
        cooldown.until.is_some_and(|until| now < until)
    }

    fn account_maintenance_succeeded(&self) {
        let mut cooldown = self.account_cooldown.lock();
        cooldown.consecutive_failures = 0;
        cooldown.until = None;
    }

    fn account_maintenance_failed(&self) {
        let mut cooldown = self.account_cooldown.lock();
        cooldown.consecutive_failures += 1;
        cooldown.until = Some(Instant::now() + cooldown_duration(cooldown.consecutive_failures));
    }

    /// Ask the host for its view of the balance and adopt it wholesale.
    /// Preconditions (no pending deltas, no job in flight) hold because the
    /// loop is single-threaded and checked pending counters before calling.
    async fn managed_sync_account(&self) {
        let _local_balance = self.account.begin_sync();
        match self.account_balance_rpc().await {
            Ok(balance) => {
                self.account.reset_balance(balance);
                if let Err(e) = self.deps.accounts.persist_account(&self.account) {
                    warn!("worker {:?}: persisting account: {e}", self.host_key);
                }
                self.account_maintenance_succeeded();
            }
            Err(e) => {
                warn!("worker {:?}: account sync: {e}", self.host_key);
                self.account.mark_needs_sync();
                self.account_maintenance_failed();
            }
        }
    }

    async fn account_balance_rpc(&self) -> Result<Currency, JobError> {
        let table = self.usable_price_table()?;
        let mut stream = self.open_stream().await?;
        stream.write_frame(RPC_ACCOUNT_BALANCE.as_bytes()).await?;
        let request = AccountBalanceRequest {
            account: self.account.id(),
        };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        self.deps
            .payment
            .pay(stream.as_mut(), &self.host_key, table.account_balance_cost)
            .await?;
        let frame = stream.read_frame().await?;
        let _ = stream.close().await;
        let response: AccountBalanceResponse =
            serde_json::from_slice(&frame).map_err(protocol_err)?;
        Ok(response.balance)
    }

    /// Top the account back up to the balance target.
    async fn managed_refill_account(&self) {
        let available = self.account.available_balance();
        let amount = self.deps.balance_target.saturating_sub(available);
        if amount == 0 {
            return;
        }
        self.account.track_deposit(amount);
        let result = self.fund_account_rpc(amount).await;
        let ok = result.is_ok();
        self.account.commit_deposit(amount, ok);
        match result {
            Ok(()) => {
                if let Err(e) = self.deps.accounts.persist_account(&self.account) {
                    warn!("worker {:?}: persisting account: {e}", self.host_key);
                }
                self.account_maintenance_succeeded();
            }
            Err(e) => {
                warn!("worker {:?}: account refill: {e}", self.host_key);
                self.account_maintenance_failed();
            }
        }
    }

    async fn fund_account_rpc(&self, amount: Currency) -> Result<(), JobError> {
        let table = self.usable_price_table()?;
        let mut stream = self.open_stream().await?;
        stream.write_frame(RPC_FUND_ACCOUNT.as_bytes()).await?;
        let request = FundAccountRequest {
            account: self.account.id(),
            amount,
        };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        self.deps
            .payment
            .pay(
                stream.as_mut(),
                &self.host_key,
                amount.saturating_add(table.fund_account_cost),
            )
            .await?;
        // Host acknowledges once the deposit is credited.
        stream.read_frame().await?;
        let _ = stream.close().await;
        Ok(())
    }
}

fn protocol_err(e: serde_json::Error) -> JobError {
    JobError::Host(HostError::Protocol(e.to_string()))
}
