//! Renter lifecycle: settings and migrations, startup, background loops,
//! and the user-facing entry points that tie the subsystems together.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::AccountManager;
use crate::bubble::health::{oldest_health_check_time, prepare_for_bubble};
use crate::bubble::stuck::{add_stuck_chunks_to_heap, RepairHeap, StuckStack};
use crate::bubble::BubbleEngine;
use crate::config::{EnvProfile, REGISTRY_MEMORY_UNIT};
use crate::crypto::Hash;
use crate::error::{RegistryError, RenterError, SkyfileError};
use crate::fs::{FileNode, FileStore};
use crate::host::{ConsensusChange, ContractSource, HostDb, HostInfo, PaymentProvider, StreamOpener};
use crate::memory::{MemoryClass, MemoryManager, MemoryPriority};
use crate::registry::{self, SignedRegistryValue, UpdateRegistryOutcome};
use crate::skyfile::encryption::Skykey;
use crate::skyfile::{
    self, Blocklist, PreparedSkyfile, SectorFetcher, SkyfileMetadata, SkyfileStreamer,
    SkyfileUploadRequest, Skylink,
};
use crate::stream::{BandwidthLimiter, RateLimitedStreamOpener};
use crate::types::{Allowance, Currency, HostKey, PublicKey, RenterPath};
use crate::worker::pool::WorkerPool;
use crate::worker::WorkerDeps;

const SETTINGS_FILE: &str = "renter.json";
const SETTINGS_VERSION: &str = "1.4.2";
/// Idle pause between background loop passes.
const LOOP_PAUSE: Duration = Duration::from_millis(250);

// ============================================================================
// Settings
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenterSettings {
    pub version: String,
    pub allowance: Allowance,
    pub max_download_speed: u64,
    pub max_upload_speed: u64,
    pub stream_packet_size: u64,
    pub ip_violation_check: bool,
}

impl Default for RenterSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION.to_string(),
            allowance: Allowance::default(),
            max_download_speed: 0,
            max_upload_speed: 0,
            stream_packet_size: 1 << 14,
            ip_violation_check: true,
        }
    }
}

/// Load the settings file, walking it through the sequential format
/// migrations. A missing file yields defaults.
fn load_settings(path: &Path) -> Result<RenterSettings, RenterError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RenterSettings::default())
        }
        Err(e) => return Err(e.into()),
    };
    let mut value: Value =
        serde_json::from_slice(&raw).map_err(|e| RenterError::BadSettings(e.to_string()))?;
    loop {
        let version = value
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("0.4")
            .to_string();
        match version.as_str() {
            "0.4" => migrate_v04_to_v133(&mut value)?,
            "1.3.3" => migrate_v133_to_v140(&mut value),
            "1.4.0" => migrate_v140_to_v142(&mut value),
            SETTINGS_VERSION => {
                return serde_json::from_value(value)
                    .map_err(|e| RenterError::BadSettings(e.to_string()));
            }
            other => return Err(RenterError::UnknownSettingsVersion(other.to_string())),
        }
    }
}

/// v0.4 kept the allowance fields flat at the top level.
fn migrate_v04_to_v133(value: &mut Value) -> Result<(), RenterError> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| RenterError::BadSettings("settings not an object".into()))?;
    let defaults = Allowance::default();
    let funds = obj
        .remove("allowancefunds")
        .and_then(|v| v.as_str().and_then(|s| s.parse::<Currency>().ok()))
        .unwrap_or(defaults.funds);
    let period = obj
        .remove("allowanceperiod")
        .and_then(|v| v.as_u64())
        .unwrap_or(defaults.period);
    let hosts = obj
        .remove("allowancehosts")
        .and_then(|v| v.as_u64())
        .unwrap_or(defaults.hosts);
    let allowance = Allowance {
        funds,
        period,
        hosts,
        ..defaults
    };
    obj.insert(
        "allowance".into(),
        serde_json::to_value(&allowance).map_err(|e| RenterError::BadSettings(e.to_string()))?,
    );
    obj.insert("version".into(), Value::from("1.3.3"));
    Ok(())
}

/// v1.4.0 introduced bandwidth limits.
fn migrate_v133_to_v140(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("max_download_speed").or_insert(Value::from(0u64));
        obj.entry("max_upload_speed").or_insert(Value::from(0u64));
        obj.insert("version".into(), Value::from("1.4.0"));
    }
}

/// v1.4.2 introduced the packet size and the IP violation check.
fn migrate_v140_to_v142(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("stream_packet_size")
            .or_insert(Value::from(1u64 << 14));
        obj.entry("ip_violation_check").or_insert(Value::from(true));
        obj.insert("version".into(), Value::from(SETTINGS_VERSION));
    }
}

fn save_settings(path: &Path, settings: &RenterSettings) -> Result<(), RenterError> {
    let json = serde_json::to_vec_pretty(settings)
        .map_err(|e| RenterError::BadSettings(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

// ============================================================================
// Construction
// ============================================================================

/// Static configuration for a renter instance.
#[derive(Clone, Debug)]
pub struct RenterConfig {
    pub persist_dir: PathBuf,
    pub env: EnvProfile,
    pub balance_target: Currency,
    /// Test hook: skip spawning the background loops on start.
    pub disable_background_loops: bool,
}

/// External collaborators a renter is built from.
#[derive(Clone)]
pub struct RenterDeps {
    pub fs: Arc<dyn FileStore>,
    pub contracts: Arc<dyn ContractSource>,
    pub hostdb: Arc<dyn HostDb>,
    pub stream_opener: Arc<dyn StreamOpener>,
    pub payment: Arc<dyn PaymentProvider>,
}

/// The renter's core coordination layer.
pub struct Renter {
    config: RenterConfig,
    deps: RenterDeps,
    settings: Mutex<RenterSettings>,
    allowance: Arc<Mutex<Allowance>>,
    limiter: Arc<BandwidthLimiter>,
    memory: MemoryManager,
    accounts: Arc<AccountManager>,
    pool: Arc<WorkerPool>,
    bubble: Arc<BubbleEngine>,
    stuck_stack: StuckStack,
    repair_heap: RepairHeap,
    blocklist: Blocklist,
    skykeys: Mutex<Vec<Skykey>>,
    block_height: Arc<AtomicU64>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Renter {
    /// Blocking startup: open persistent state, run settings migrations,
    /// create the essential directories, and build the worker pool. The
    /// async side (`start`) spawns the background loops.
    pub fn new(config: RenterConfig, deps: RenterDeps) -> Result<Arc<Self>, RenterError> {
        std::fs::create_dir_all(&config.persist_dir)
            .map_err(|e| RenterError::Persist(e.to_string()))?;
        let settings = load_settings(&config.persist_dir.join(SETTINGS_FILE))?;
        save_settings(&config.persist_dir.join(SETTINGS_FILE), &settings)?;

        for dir in [
            RenterPath::home_dir(),
            RenterPath::user_dir(),
            RenterPath::snapshots_dir(),
            RenterPath::skynet_dir(),
        ] {
            deps.fs.new_dir(&dir)?;
        }

        let accounts = Arc::new(AccountManager::open(
            &config.persist_dir.join("accounts.dat"),
        )?);
        if !accounts.was_clean() {
            info!("accounts file was not cleanly shut down; balances reset");
        }

        let limiter = BandwidthLimiter::new();
        limiter.set_limits(
            settings.max_download_speed,
            settings.max_upload_speed,
            settings.stream_packet_size,
        );
        let rate_limited_opener: Arc<dyn StreamOpener> = Arc::new(RateLimitedStreamOpener::new(
            deps.stream_opener.clone(),
            limiter.clone(),
        ));

        let allowance = Arc::new(Mutex::new(settings.allowance.clone()));
        let block_height = Arc::new(AtomicU64::new(0));
        let worker_deps = WorkerDeps {
            stream_opener: rate_limited_opener,
            payment: deps.payment.clone(),
            accounts: accounts.clone(),
            env: config.env,
            allowance: allowance.clone(),
            block_height: block_height.clone(),
            balance_target: config.balance_target,
        };
        let pool = WorkerPool::new(deps.contracts.clone(), worker_deps);
        let bubble = BubbleEngine::new(deps.fs.clone());

        Ok(Arc::new(Self {
            config,
            deps,
            settings: Mutex::new(settings),
            allowance,
            limiter,
            memory: MemoryManager::new(),
            accounts,
            pool,
            bubble,
            stuck_stack: StuckStack::new(),
            repair_heap: RepairHeap::new(),
            blocklist: Blocklist::new(),
            skykeys: Mutex::new(Vec::new()),
            block_height,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Async startup: seed the pool from the contract set and spawn the
    /// background loops unless the test hook disabled them.
    pub async fn start(self: &Arc<Self>) {
        self.pool.update().await;
        if self.config.disable_background_loops {
            return;
        }
        let mut background = self.background.lock();
        background.push(tokio::spawn(self.clone().health_check_loop()));
        background.push(tokio::spawn(self.clone().stuck_loop()));
    }

    /// Shutdown: stop the loops, drain the pool, and only then close the
    /// accounts file so the clean flag lands last.
    pub async fn close(self: &Arc<Self>) -> Result<(), RenterError> {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.shutdown().await;
        save_settings(
            &self.config.persist_dir.join(SETTINGS_FILE),
            &self.settings.lock().clone(),
        )?;
        self.accounts.close()?;
        Ok(())
    }

    // --- accessors ---

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn bubble(&self) -> &Arc<BubbleEngine> {
        &self.bubble
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<dyn FileStore> {
        &self.deps.fs
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    #[must_use]
    pub fn stuck_stack(&self) -> &StuckStack {
        &self.stuck_stack
    }

    #[must_use]
    pub fn repair_heap(&self) -> &RepairHeap {
        &self.repair_heap
    }

    #[must_use]
    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    #[must_use]
    pub fn settings(&self) -> RenterSettings {
        self.settings.lock().clone()
    }

    #[must_use]
    pub fn allowance(&self) -> Allowance {
        self.allowance.lock().clone()
    }

    #[must_use]
    pub fn block_height(&self) -> u64 {
        self.block_height.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn host_info(&self, host: &HostKey) -> Option<HostInfo> {
        self.deps.hostdb.host(host)
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<(RenterPath, String)> {
        self.bubble.alerts.active()
    }

    pub fn add_skykey(&self, key: Skykey) {
        self.skykeys.lock().push(key);
    }

    // --- settings updates ---

    pub fn set_allowance(&self, allowance: Allowance) -> Result<(), RenterError> {
        *self.allowance.lock() = allowance.clone();
        let mut settings = self.settings.lock();
        settings.allowance = allowance;
        save_settings(&self.config.persist_dir.join(SETTINGS_FILE), &settings)
    }

    pub fn set_bandwidth_limits(
        &self,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RenterError> {
        let mut settings = self.settings.lock();
        settings.max_download_speed = download_bps;
        settings.max_upload_speed = upload_bps;
        self.limiter
            .set_limits(download_bps, upload_bps, settings.stream_packet_size);
        save_settings(&self.config.persist_dir.join(SETTINGS_FILE), &settings)
    }

    // --- consensus subscription ---

    /// Consensus update hook: track the height and re-sync the pool with the
    /// possibly-changed contract set.
    pub async fn process_consensus_change(self: &Arc<Self>, change: ConsensusChange) {
        self.block_height.store(change.block_height, Ordering::SeqCst);
        if change.synced {
            self.pool.update().await;
        }
    }

    // --- registry ---

    pub async fn read_registry(
        &self,
        pubkey: &PublicKey,
        tweak: &Hash,
        timeout: Duration,
    ) -> Result<SignedRegistryValue, RegistryError> {
        let _memory = self
            .memory
            .pool(MemoryClass::Registry)
            .request(REGISTRY_MEMORY_UNIT, MemoryPriority::High, &self.shutdown)
            .await
            .ok_or(RegistryError::ShuttingDown)?;
        registry::read_registry(&self.pool, self.config.env, pubkey, tweak, timeout).await
    }

    pub async fn update_registry(
        &self,
        pubkey: &PublicKey,
        entry: SignedRegistryValue,
        timeout: Option<Duration>,
    ) -> Result<UpdateRegistryOutcome, RegistryError> {
        let _memory = self
            .memory
            .pool(MemoryClass::Registry)
            .request(REGISTRY_MEMORY_UNIT, MemoryPriority::High, &self.shutdown)
            .await
            .ok_or(RegistryError::ShuttingDown)?;
        registry::update_registry(&self.pool, self.config.env, pubkey, entry, timeout).await
    }

    // --- blobs ---

    /// Assemble and stage a blob, then bubble the upload directory so the
    /// new file shows up in the aggregates.
    pub fn upload_skyfile(
        &self,
        data: &[u8],
        request: &SkyfileUploadRequest,
    ) -> Result<PreparedSkyfile, SkyfileError> {
        let prepared = skyfile::upload_skyfile(&self.deps.fs, &self.blocklist, data, request)?;
        if let Some(parent) = request.upload_path.parent() {
            self.bubble.queue_bubble(&parent);
        }
        Ok(prepared)
    }

    pub async fn download_skyfile(
        &self,
        link: &Skylink,
    ) -> Result<(SkyfileMetadata, SkyfileStreamer), SkyfileError> {
        if self.blocklist.is_blocked(link) {
            return Err(SkyfileError::SkylinkBlocked);
        }
        let _memory = self
            .memory
            .pool(MemoryClass::UserDownload)
            .request(
                crate::config::SECTOR_SIZE as u64,
                MemoryPriority::High,
                &self.shutdown,
            )
            .await
            .ok_or_else(|| SkyfileError::Download("shutting down".into()))?;
        let fetcher: Arc<dyn SectorFetcher> = self.pool.clone();
        let skykeys = self.skykeys.lock().clone();
        skyfile::download_skyfile(&fetcher, link, &skykeys).await
    }

    pub fn block_skylink(&self, link: &Skylink) {
        self.blocklist.block(link);
    }

    // --- backups ---

    pub fn create_backup(&self, dest: &Path, secret: Option<&[u8; 32]>) -> Result<(), crate::error::BackupError> {
        crate::backup::create_backup(&self.deps.fs, dest, &self.allowance(), secret)
    }

    pub fn load_backup(
        &self,
        src: &Path,
        secret: Option<&[u8; 32]>,
    ) -> Result<Option<Allowance>, crate::error::BackupError> {
        crate::backup::load_backup(&self.deps.fs, src, secret)
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Keep the cached file health fresh: find the subtree that is most
    /// overdue, refresh it, and bubble the results.
    async fn health_check_loop(self: Arc<Self>) {
        let interval = self.config.env.health_check_interval();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let batch = oldest_health_check_time(&self.deps.fs);
            match batch {
                Ok((root, checked_at)) => {
                    let age = SystemTime::now()
                        .duration_since(checked_at)
                        .unwrap_or(interval);
                    if age < interval {
                        let wait = interval - age;
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.shutdown.cancelled() => return,
                        }
                        continue;
                    }
                    let refresh = prepare_for_bubble(
                        &self.deps.fs,
                        &root,
                        interval,
                        SystemTime::now(),
                        &keep_cached_health,
                    );
                    match refresh {
                        Ok(paths) => paths.refresh_all_blocking(&self.bubble).await,
                        Err(e) => warn!("health loop: preparing {root}: {e}"),
                    }
                }
                Err(e) => warn!("health loop: finding batch: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(LOOP_PAUSE) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Feed the repair heap with stuck chunks whenever the tree signals any.
    async fn stuck_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.bubble.stuck_found.notified() => {}
                _ = tokio::time::sleep(self.config.env.health_check_interval()) => {}
                _ = self.shutdown.cancelled() => return,
            }
            if self.shutdown.is_cancelled() {
                return;
            }
            match add_stuck_chunks_to_heap(&self.deps.fs, &self.stuck_stack, &self.repair_heap) {
                Ok(added) if added > 0 => {
                    info!("stuck loop: queued {added} chunks for repair");
                    self.bubble.repair_needed.notify_one();
                }
                Ok(_) => {}
                Err(e) => warn!("stuck loop: {e}"),
            }
        }
    }
}

/// Health refresh used by the health loop. Re-deriving health from host
/// availability belongs to the repair subsystem; the loop's job here is the
/// walk itself and the check timestamps.
fn keep_cached_health(file: &dyn FileNode) -> (f64, f64, f64) {
    let info = file.info();
    (info.health, info.stuck_health, info.redundancy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_until, SimHarness, SimHostDb};

    fn test_config(dir: &Path) -> RenterConfig {
        RenterConfig {
            persist_dir: dir.to_path_buf(),
            env: EnvProfile::Testing,
            balance_target: 1_000_000,
            disable_background_loops: true,
        }
    }

    fn renter_deps(harness: &SimHarness) -> RenterDeps {
        RenterDeps {
            fs: Arc::new(crate::fs::mem::MemFileStore::new()),
            contracts: harness.contracts.clone(),
            hostdb: Arc::new(SimHostDb),
            stream_opener: harness.network.clone(),
            payment: harness.payment.clone(),
        }
    }

    #[test]
    fn settings_migrate_from_v04() {
        let raw = serde_json::json!({
            "allowancefunds": "123456",
            "allowanceperiod": 1000,
            "allowancehosts": 30,
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.allowance.funds, 123456);
        assert_eq!(settings.allowance.period, 1000);
        assert_eq!(settings.allowance.hosts, 30);
        assert_eq!(settings.max_download_speed, 0);
        assert!(settings.ip_violation_check);
    }

    #[test]
    fn settings_migrate_from_v133() {
        let raw = serde_json::json!({
            "version": "1.3.3",
            "allowance": serde_json::to_value(Allowance::default()).unwrap(),
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.stream_packet_size, 1 << 14);
    }

    #[test]
    fn settings_unknown_version_rejected() {
        let raw = serde_json::json!({ "version": "9.9" });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(matches!(
            load_settings(&path),
            Err(RenterError::UnknownSettingsVersion(v)) if v == "9.9"
        ));
    }

    #[test]
    fn settings_roundtrip_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        let mut settings = RenterSettings::default();
        settings.max_download_speed = 42;
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[tokio::test]
    async fn lifecycle_creates_dirs_and_workers() {
        let harness = SimHarness::new(2);
        let dir = tempfile::tempdir().unwrap();
        let renter = Renter::new(test_config(dir.path()), renter_deps(&harness)).unwrap();
        renter.start().await;

        for p in [
            RenterPath::home_dir(),
            RenterPath::user_dir(),
            RenterPath::snapshots_dir(),
            RenterPath::skynet_dir(),
        ] {
            assert!(renter.fs().dir_exists(&p), "{p} missing");
        }
        assert_eq!(renter.pool().num_workers(), 2);

        renter.close().await.unwrap();
        // The accounts file closed clean.
        let reopened =
            AccountManager::open(&dir.path().join("accounts.dat")).unwrap();
        assert!(reopened.was_clean());
    }

    #[tokio::test]
    async fn consensus_change_updates_height_and_pool() {
        let harness = SimHarness::new(1);
        let dir = tempfile::tempdir().unwrap();
        let renter = Renter::new(test_config(dir.path()), renter_deps(&harness)).unwrap();
        renter.start().await;
        assert_eq!(renter.pool().num_workers(), 1);

        harness.contracts.remove_contract(&harness.hosts[0].key);
        renter
            .process_consensus_change(ConsensusChange {
                block_height: 77,
                synced: true,
            })
            .await;
        assert_eq!(renter.block_height(), 77);
        assert_eq!(renter.pool().num_workers(), 0);
        renter.close().await.unwrap();
    }

    #[tokio::test]
    async fn registry_roundtrip_through_renter() {
        let harness = SimHarness::new(3);
        let dir = tempfile::tempdir().unwrap();
        let renter = Renter::new(test_config(dir.path()), renter_deps(&harness)).unwrap();
        renter.start().await;

        let probe = renter.pool().clone();
        wait_until("workers ready", move || {
            probe.workers().iter().all(|w| w.supports_registry())
        })
        .await;

        let (sk, vk) = crate::crypto::generate_keypair();
        let pk = PublicKey::ed25519(vk.to_bytes());
        let entry = crate::registry::RegistryValue {
            tweak: [1u8; 32],
            data: b"hello".to_vec(),
            revision: 1,
        }
        .sign(&sk);
        renter
            .update_registry(&pk, entry.clone(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let got = renter
            .read_registry(&pk, &[1u8; 32], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got, entry);
        renter.close().await.unwrap();
    }

    #[tokio::test]
    async fn blocked_skylink_refuses_upload_and_download() {
        let harness = SimHarness::new(1);
        let dir = tempfile::tempdir().unwrap();
        let renter = Renter::new(test_config(dir.path()), renter_deps(&harness)).unwrap();
        renter.start().await;

        let request = SkyfileUploadRequest {
            upload_path: RenterPath::new("var/skynet/blocked").unwrap(),
            filename: "blocked".into(),
            skykey: None,
        };
        let prepared = renter.upload_skyfile(b"payload", &request).unwrap();
        renter.block_skylink(&prepared.skylink);

        assert!(matches!(
            renter.download_skyfile(&prepared.skylink).await,
            Err(SkyfileError::SkylinkBlocked)
        ));
        renter.close().await.unwrap();
    }
}
