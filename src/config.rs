//! Renter configuration constants and environment profiles.
//! Standard/Dev/Testing select different protocol timings; everything else is shared.

use std::time::Duration;

use crate::types::Currency;

// ============================================================================
// Sector geometry
// ============================================================================
/// Size of a single host sector in bytes.
pub const SECTOR_SIZE: usize = 1 << 22; // 4 MiB
/// Size of a Merkle tree segment. Sector roots are computed over segments.
pub const SEGMENT_SIZE: usize = 64;
/// Hash output size used throughout (BLAKE2b-256).
pub const HASH_SIZE: usize = 32;

// ============================================================================
// Registry
// ============================================================================
/// Maximum registry entry data accepted from a host.
pub const MAX_REGISTRY_DATA_SIZE: usize = 256;
/// Number of hosts that must accept an update before it is considered durable.
pub const MIN_UPDATE_REGISTRY_SUCCESSES: usize = 3;
/// Window after the first read response during which a higher revision may
/// still replace the best entry seen.
pub const READ_REGISTRY_BEST_TIMEOUT: Duration = Duration::from_millis(100);
/// Background deadline for update-registry jobs once the caller has gone away.
pub const UPDATE_REGISTRY_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-worker revision cache capacity (entries).
pub const REGISTRY_CACHE_SIZE: usize = 1 << 12;

// ============================================================================
// Ephemeral accounts
// ============================================================================
/// On-disk size of one account slot. Must divide the 4096-byte page size.
pub const ACCOUNT_SIZE: usize = 1 << 10;
/// Size of the accounts file header.
pub const ACCOUNTS_FILE_HEADER_SIZE: usize = 256;
/// Magic bytes opening the accounts file.
pub const ACCOUNTS_FILE_MAGIC: &[u8; 16] = b"renter-accounts\n";
/// Accounts file format version.
pub const ACCOUNTS_FILE_VERSION: u8 = 1;
/// How long a signed withdrawal message stays valid at the host.
pub const WITHDRAWAL_VALIDITY_PERIOD: u64 = 6; // blocks

// ============================================================================
// Worker cooldowns
// ============================================================================
/// Base cooldown after the first consecutive job failure.
pub const COOLDOWN_BASE: Duration = Duration::from_secs(10);
/// Exponent cap for the geometric cooldown growth.
pub const COOLDOWN_MAX_EXPONENT: u32 = 6;
/// Ceiling on any single cooldown period.
pub const COOLDOWN_MAX: Duration = Duration::from_secs(600);
/// Decay factor for per-queue job time estimates.
pub const JOB_TIME_EWMA_DECAY: f64 = 0.9;

// ============================================================================
// Price tables
// ============================================================================
/// Fraction of the allowance funds that may go to price-table updates,
/// expressed as a divisor (1%).
pub const PRICE_TABLE_FUND_DIVISOR: u128 = 100;
/// Blocks per period used when extrapolating per-period update costs.
pub const BLOCKS_PER_PERIOD: u64 = 4032;
/// Seconds per block used for the same extrapolation.
pub const SECONDS_PER_BLOCK: u64 = 600;

// ============================================================================
// Memory manager budgets
// ============================================================================
/// Unit size for registry memory requests.
pub const REGISTRY_MEMORY_UNIT: u64 = 20 << 10;
/// Budget of the registry memory pool.
pub const REGISTRY_MEMORY_BUDGET: u64 = 4 << 20;
/// Budget of the user upload pool.
pub const USER_UPLOAD_MEMORY_BUDGET: u64 = 192 << 20;
/// Budget of the user download pool.
pub const USER_DOWNLOAD_MEMORY_BUDGET: u64 = 192 << 20;
/// Budget of the repair pool.
pub const REPAIR_MEMORY_BUDGET: u64 = 96 << 20;

// ============================================================================
// Bubble / health
// ============================================================================
/// Files whose recomputed health reaches this value are considered to need
/// user attention and get an alert registered.
pub const ALERT_LOW_REDUNDANCY_THRESHOLD: f64 = 0.75;
/// Health at or above this value means a file is missing enough pieces that
/// the repair loop must act.
pub const REPAIR_THRESHOLD: f64 = 0.25;
/// Cap on the stack of files with recently repaired stuck chunks.
pub const MAX_SUCCESSFUL_STUCK_REPAIR_FILES: usize = 20;
/// Chunks added from the stuck stack per stuck-loop iteration.
pub const STUCK_LOOP_CHUNKS_PER_ITERATION: usize = 3;
/// Capacity of the repair chunk heap.
pub const REPAIR_HEAP_CAPACITY: usize = 512;
/// Subtree descent keeps going while a directory rolls up more subdirs than this.
pub const HEALTH_BATCH_MAX_SUBDIRS: u64 = 4;
/// Subtree descent keeps going while a directory rolls up more files than this.
pub const HEALTH_BATCH_MAX_FILES: u64 = 25;

// ============================================================================
// Default allowance
// ============================================================================
/// Default funds granted to a fresh allowance, in hastings.
pub const DEFAULT_ALLOWANCE_FUNDS: Currency = 500_000_000_000_000_000_000_000_000;
/// Default allowance period in blocks.
pub const DEFAULT_ALLOWANCE_PERIOD: u64 = 2 * BLOCKS_PER_PERIOD;

// ============================================================================
// Environment profiles
// ============================================================================

/// Deployment environment. Selects protocol timings; see the accessors below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvProfile {
    Standard,
    Dev,
    Testing,
}

impl EnvProfile {
    /// Price tables promising less validity than this are rejected as gouging.
    #[must_use]
    pub const fn min_accepted_price_table_validity(self) -> Duration {
        match self {
            EnvProfile::Standard => Duration::from_secs(5 * 60),
            EnvProfile::Dev => Duration::from_secs(60),
            EnvProfile::Testing => Duration::from_secs(3),
        }
    }

    /// Ceiling on the caller-provided registry read timeout.
    #[must_use]
    pub const fn max_registry_read_timeout(self) -> Duration {
        match self {
            EnvProfile::Standard => Duration::from_secs(5 * 60),
            EnvProfile::Dev => Duration::from_secs(60),
            EnvProfile::Testing => Duration::from_secs(30),
        }
    }

    /// Timeout applied to registry updates when the caller does not pass one.
    #[must_use]
    pub const fn default_registry_update_timeout(self) -> Duration {
        match self {
            EnvProfile::Standard => Duration::from_secs(5 * 60),
            EnvProfile::Dev => Duration::from_secs(60),
            EnvProfile::Testing => Duration::from_secs(3),
        }
    }

    /// How often every file's health must be recomputed.
    #[must_use]
    pub const fn health_check_interval(self) -> Duration {
        match self {
            EnvProfile::Standard => Duration::from_secs(24 * 60 * 60),
            EnvProfile::Dev => Duration::from_secs(60 * 60),
            EnvProfile::Testing => Duration::from_secs(5),
        }
    }
}
