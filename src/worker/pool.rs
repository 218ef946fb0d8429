//! The worker pool: one worker per host with a usable contract.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::crypto::Hash;
use crate::error::{JobError, RegistryError};
use crate::host::ContractSource;
use crate::types::{Contract, HostKey};
use crate::worker::jobs::ReadSectorJob;
use crate::worker::{Worker, WorkerDeps, WorkerStatus};

struct PoolEntry {
    worker: Arc<Worker>,
    handle: JoinHandle<()>,
}

/// Creates and retires workers in lockstep with the active contract set.
pub struct WorkerPool {
    contracts: Arc<dyn ContractSource>,
    deps: WorkerDeps,
    state: Mutex<HashMap<HostKey, PoolEntry>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(contracts: Arc<dyn ContractSource>, deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self {
            contracts,
            deps,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Diff the desired host set against the live workers: spawn one worker
    /// per new usable contract, retire workers whose contract disappeared.
    pub async fn update(&self) {
        let desired: HashMap<HostKey, Contract> = self
            .contracts
            .contracts()
            .into_iter()
            .filter(|c| c.utility.good_for_upload || c.utility.good_for_renew)
            .map(|c| (c.host_key, c))
            .collect();

        let mut retired = Vec::new();
        {
            let mut state = self.state.lock();
            let stale: Vec<HostKey> = state
                .keys()
                .filter(|host| !desired.contains_key(host))
                .copied()
                .collect();
            for host in stale {
                if let Some(entry) = state.remove(&host) {
                    entry.worker.shutdown();
                    retired.push(entry.handle);
                }
            }
            for (host, contract) in &desired {
                if state.contains_key(host) {
                    continue;
                }
                match Worker::new(*host, contract.id, self.deps.clone()) {
                    Ok(worker) => {
                        let handle = tokio::spawn(worker.clone().run());
                        state.insert(*host, PoolEntry { worker, handle });
                    }
                    Err(e) => warn!("pool: worker for {host:?}: {e}"),
                }
            }
        }
        // Wait for retired workers to drain their queues.
        for handle in retired {
            let _ = handle.await;
        }
    }

    /// Snapshot of the live workers. Ordering is not guaranteed.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.state
            .lock()
            .values()
            .map(|entry| entry.worker.clone())
            .collect()
    }

    #[must_use]
    pub fn worker(&self, host: &HostKey) -> Option<Arc<Worker>> {
        self.state.lock().get(host).map(|entry| entry.worker.clone())
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.state.lock().len()
    }

    /// Current utility flags for a host's contract.
    #[must_use]
    pub fn contract_utility(&self, host: &HostKey) -> Option<crate::types::ContractUtility> {
        self.contracts.contract_utility(host)
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.state
            .lock()
            .values()
            .map(|entry| entry.worker.status())
            .collect()
    }

    /// Retire every worker and wait for the drains.
    pub async fn shutdown(&self) {
        let entries: Vec<PoolEntry> = {
            let mut state = self.state.lock();
            state.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.worker.shutdown();
        }
        for entry in entries {
            let _ = entry.handle.await;
        }
    }

    /// Fetch a byte range of a sector by Merkle root from any worker that
    /// can serve it. First success wins; remaining responses are dropped.
    pub async fn download_by_root(
        &self,
        root: Hash,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, JobError> {
        let mut set = JoinSet::new();
        for worker in self.workers() {
            let (tx, rx) = oneshot::channel();
            let job = ReadSectorJob {
                root,
                offset,
                length,
                response: tx,
            };
            if worker.add_read_sector_job(job) {
                set.spawn(async move { rx.await.unwrap_or(Err(JobError::Discarded)) });
            }
        }
        if set.is_empty() {
            return Err(JobError::Registry(RegistryError::NotEnoughWorkers));
        }
        let mut last_err = JobError::Discarded;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(e)) => last_err = e,
                Err(_) => {}
            }
        }
        Err(last_err)
    }
}
