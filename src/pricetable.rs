//! Host price tables: caching, the update protocol, and the gouging guard.
//!
//! Each worker holds the current table in an atomically swappable cell.
//! Readers never block; updates are single-flight and a concurrent second
//! update attempt is a programmer error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{
    EnvProfile, PRICE_TABLE_FUND_DIVISOR, SECONDS_PER_BLOCK, SECTOR_SIZE,
};
use crate::error::{GougingError, HostError};
use crate::host::{HostStream, PaymentProvider};
use crate::types::{currency_serde, Allowance, Currency, HostKey, RPC_UPDATE_PRICE_TABLE};
use crate::worker::queue::cooldown_duration;

// ============================================================================
// The table
// ============================================================================

/// A host's published, time-bound price list. Field names follow the host
/// wire format.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    pub uid: [u8; 16],
    /// Validity in nanoseconds.
    pub validity: u64,
    #[serde(rename = "hostblockheight")]
    pub host_block_height: u64,
    #[serde(rename = "updatepricetablecost", with = "currency_serde")]
    pub update_price_table_cost: Currency,
    #[serde(rename = "fundaccountcost", with = "currency_serde")]
    pub fund_account_cost: Currency,
    #[serde(rename = "accountbalancecost", with = "currency_serde")]
    pub account_balance_cost: Currency,
    #[serde(rename = "initbasecost", with = "currency_serde")]
    pub init_base_cost: Currency,
    #[serde(rename = "memorytimecost", with = "currency_serde")]
    pub memory_time_cost: Currency,
    #[serde(rename = "readbasecost", with = "currency_serde")]
    pub read_base_cost: Currency,
    #[serde(rename = "readlengthcost", with = "currency_serde")]
    pub read_length_cost: Currency,
    #[serde(rename = "hassectorbasecost", with = "currency_serde")]
    pub has_sector_base_cost: Currency,
    #[serde(rename = "downloadbandwidthcost", with = "currency_serde")]
    pub download_bandwidth_cost: Currency,
    #[serde(rename = "uploadbandwidthcost", with = "currency_serde")]
    pub upload_bandwidth_cost: Currency,
}

impl PriceTable {
    #[must_use]
    pub fn validity_duration(&self) -> Duration {
        Duration::from_nanos(self.validity)
    }
}

/// Fetch timestamps attached to a table once it has been fetched.
#[derive(Clone, Copy, Debug)]
pub struct PriceTableTimes {
    pub fetch_time: Instant,
    pub expiry: Instant,
    pub update_time: Instant,
}

/// A worker's view of its host's prices. `times == None` means the table was
/// never fetched, which blocks all work requiring it.
#[derive(Clone, Debug)]
pub struct WorkerPriceTable {
    pub table: PriceTable,
    pub times: Option<PriceTableTimes>,
}

impl WorkerPriceTable {
    #[must_use]
    pub fn never_fetched() -> Self {
        Self {
            table: PriceTable::default(),
            times: None,
        }
    }

    /// True once the fetched table has passed its half-life.
    #[must_use]
    pub fn needs_update(&self, now: Instant) -> bool {
        match self.times {
            None => true,
            Some(t) => now >= t.update_time,
        }
    }

    /// True while the table may be used to price RPCs.
    #[must_use]
    pub fn usable(&self, now: Instant) -> bool {
        match self.times {
            None => false,
            Some(t) => now < t.expiry,
        }
    }
}

// ============================================================================
// The per-worker cell
// ============================================================================

#[derive(Debug, Default)]
struct MaintenanceState {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    recent_err: Option<String>,
    suspect_revision_mismatch: bool,
}

/// Per-worker price table cell with single-flight update tracking and a
/// maintenance cooldown separate from the job queues.
pub struct PriceTableCell {
    current: ArcSwap<WorkerPriceTable>,
    update_in_flight: AtomicBool,
    maintenance: Mutex<MaintenanceState>,
}

impl PriceTableCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(WorkerPriceTable::never_fetched()),
            update_in_flight: AtomicBool::new(false),
            maintenance: Mutex::new(MaintenanceState::default()),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<WorkerPriceTable> {
        self.current.load_full()
    }

    /// Whether the worker should run a price table update now.
    #[must_use]
    pub fn should_update(&self, now: Instant) -> bool {
        if self.update_in_flight.load(Ordering::SeqCst) {
            return false;
        }
        {
            let m = self.maintenance.lock();
            if let Some(until) = m.cooldown_until {
                if now < until {
                    return false;
                }
            }
        }
        self.current.load().needs_update(now)
    }

    /// Claim the single-flight slot. A second claim while one update is in
    /// flight is a programmer error.
    pub fn begin_update(&self) {
        let was = self.update_in_flight.swap(true, Ordering::SeqCst);
        assert!(!was, "concurrent price table update");
    }

    /// Store a freshly fetched table.
    pub fn complete_update(&self, table: PriceTable, now: Instant) {
        let validity = table.validity_duration();
        let times = PriceTableTimes {
            fetch_time: now,
            expiry: now + validity,
            update_time: now + validity / 2,
        };
        self.current.store(Arc::new(WorkerPriceTable {
            table,
            times: Some(times),
        }));
        let mut m = self.maintenance.lock();
        m.cooldown_until = None;
        m.consecutive_failures = 0;
        m.recent_err = None;
        self.update_in_flight.store(false, Ordering::SeqCst);
    }

    /// Record a failed update. The previous table's contents survive; only
    /// the maintenance cooldown moves.
    pub fn fail_update(&self, err: String, revision_mismatch: bool, now: Instant) {
        let mut m = self.maintenance.lock();
        m.consecutive_failures += 1;
        m.cooldown_until = Some(now + cooldown_duration(m.consecutive_failures));
        m.recent_err = Some(err);
        if revision_mismatch {
            m.suspect_revision_mismatch = true;
        }
        drop(m);
        self.update_in_flight.store(false, Ordering::SeqCst);
    }

    /// Read and clear the revision-mismatch suspicion flag.
    pub fn take_suspect_revision_mismatch(&self) -> bool {
        let mut m = self.maintenance.lock();
        std::mem::take(&mut m.suspect_revision_mismatch)
    }

    #[must_use]
    pub fn recent_err(&self) -> Option<String> {
        self.maintenance.lock().recent_err.clone()
    }
}

impl Default for PriceTableCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Gouging guard
// ============================================================================

/// Reject a candidate price table before any payment happens.
pub fn check_price_table_gouging(
    env: EnvProfile,
    allowance: &Allowance,
    table: &PriceTable,
) -> Result<(), GougingError> {
    let validity = table.validity_duration();
    let min = env.min_accepted_price_table_validity();
    if validity < min {
        return Err(GougingError::ValidityTooShort {
            got_secs: validity.as_secs(),
            min_secs: min.as_secs(),
        });
    }
    // Paying for an update every validity/2 for a whole period must not eat
    // more than 1% of the allowance.
    let validity_secs = validity.as_secs().max(1);
    let updates_per_period =
        (allowance.period * SECONDS_PER_BLOCK).div_ceil(validity_secs) as Currency;
    let period_cost = table
        .update_price_table_cost
        .saturating_mul(updates_per_period);
    if period_cost > allowance.funds / PRICE_TABLE_FUND_DIVISOR {
        return Err(GougingError::UpdateCostTooHigh);
    }
    Ok(())
}

fn max_bandwidth_price(funds: Currency, expected_bytes: u64) -> Currency {
    if expected_bytes == 0 {
        return Currency::MAX;
    }
    // A quarter of the allowance may go to bandwidth in either direction.
    (funds / 4) / expected_bytes as Currency
}

/// Gouging check shared by the read path (registry reads, sector reads).
pub fn check_pdbr_gouging(allowance: &Allowance, table: &PriceTable) -> Result<(), GougingError> {
    if allowance.is_zero() {
        return Ok(());
    }
    if table.download_bandwidth_cost
        > max_bandwidth_price(allowance.funds, allowance.expected_download)
    {
        return Err(GougingError::DownloadBandwidthTooExpensive);
    }
    if table.upload_bandwidth_cost > max_bandwidth_price(allowance.funds, allowance.expected_upload)
    {
        return Err(GougingError::UploadBandwidthTooExpensive);
    }
    // Lower bound on the cost of serving the user's expected download.
    let sectors = (allowance.expected_download as usize).div_ceil(SECTOR_SIZE) as Currency;
    let per_sector = table
        .init_base_cost
        .saturating_add(table.read_base_cost)
        .saturating_add(table.read_length_cost.saturating_mul(SECTOR_SIZE as Currency));
    let total = per_sector.saturating_mul(sectors).saturating_add(
        table
            .download_bandwidth_cost
            .saturating_mul(allowance.expected_download as Currency),
    );
    if total > allowance.funds {
        return Err(GougingError::ExpectedDownloadTooExpensive);
    }
    Ok(())
}

/// Gouging check for the upload path (registry updates).
pub fn check_upload_gouging(allowance: &Allowance, table: &PriceTable) -> Result<(), GougingError> {
    if allowance.is_zero() {
        return Ok(());
    }
    if table.upload_bandwidth_cost > max_bandwidth_price(allowance.funds, allowance.expected_upload)
    {
        return Err(GougingError::UploadBandwidthTooExpensive);
    }
    Ok(())
}

// ============================================================================
// Update protocol
// ============================================================================

/// Run the price table update protocol on an open host stream. Returns the
/// accepted table plus the observed round-trip time. The gouging check runs
/// before any payment.
pub async fn fetch_price_table(
    stream: &mut dyn HostStream,
    payment: &dyn PaymentProvider,
    host: &HostKey,
    env: EnvProfile,
    allowance: &Allowance,
) -> Result<(PriceTable, Duration), PriceTableFetchError> {
    let start = Instant::now();
    stream
        .write_frame(RPC_UPDATE_PRICE_TABLE.as_bytes())
        .await?;
    let frame = stream.read_frame().await?;
    let elapsed = start.elapsed();
    let table: PriceTable = serde_json::from_slice(&frame)
        .map_err(|e| PriceTableFetchError::Host(HostError::Protocol(e.to_string())))?;

    check_price_table_gouging(env, allowance, &table)?;

    payment
        .pay(stream, host, table.update_price_table_cost)
        .await?;
    // The host acknowledges once the payment is credited.
    stream.read_frame().await?;
    Ok((table, elapsed))
}

/// Failures of the update protocol.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum PriceTableFetchError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Gouging(#[from] GougingError),
}

impl PriceTableFetchError {
    /// Revision-mismatch failures mark the worker as suspect so it re-syncs.
    #[must_use]
    pub fn is_revision_mismatch(&self) -> bool {
        match self {
            PriceTableFetchError::Host(HostError::PaymentRejected(msg)) => {
                msg.contains("revision")
            }
            _ => false,
        }
    }
}
