//! Multi-host registry update with revision-conflict reconciliation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{
    EnvProfile, MIN_UPDATE_REGISTRY_SUCCESSES, UPDATE_REGISTRY_BACKGROUND_TIMEOUT,
};
use crate::error::{JobError, RegistryError};
use crate::pricetable::check_upload_gouging;
use crate::registry::SignedRegistryValue;
use crate::types::PublicKey;
use crate::worker::jobs::UpdateRegistryJob;
use crate::worker::pool::WorkerPool;

/// Outcome of a successful update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateRegistryOutcome {
    /// Hosts that accepted the entry before the call returned. More may
    /// accept afterwards; jobs keep running on their background deadline.
    pub successes: usize,
}

/// Store `entry` on at least [`MIN_UPDATE_REGISTRY_SUCCESSES`] hosts.
///
/// Jobs run with a background deadline longer than the caller's timeout so
/// hosts that answer late still converge on the new revision.
pub async fn update_registry(
    pool: &WorkerPool,
    env: EnvProfile,
    pubkey: &PublicKey,
    entry: SignedRegistryValue,
    timeout: Option<Duration>,
) -> Result<UpdateRegistryOutcome, RegistryError> {
    entry.verify(pubkey)?;
    let timeout = timeout.unwrap_or_else(|| env.default_registry_update_timeout());

    let qualified: Vec<_> = pool
        .workers()
        .into_iter()
        .filter(|w| {
            w.supports_registry()
                && w.usable_price_table()
                    .is_ok_and(|t| check_upload_gouging(&w.allowance(), &t).is_ok())
                && pool
                    .contract_utility(&w.host_key())
                    .is_some_and(|u| u.good_for_upload)
        })
        .collect();
    if qualified.len() < MIN_UPDATE_REGISTRY_SUCCESSES {
        return Err(RegistryError::NotEnoughWorkers);
    }

    let deadline = Instant::now() + UPDATE_REGISTRY_BACKGROUND_TIMEOUT;
    let (tx, mut rx) = mpsc::channel(qualified.len());
    let mut submitted = 0usize;
    for worker in &qualified {
        worker.add_update_registry_job(UpdateRegistryJob {
            pubkey: *pubkey,
            entry: entry.clone(),
            response: tx.clone(),
            deadline,
        });
        submitted += 1;
    }
    drop(tx);

    let overall_deadline = Instant::now() + timeout;
    let mut successes = 0usize;
    let mut responses = 0usize;
    let mut highest_invalid_rev: Option<u64> = None;
    let mut cheat_err: Option<RegistryError> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(overall_deadline) => break,
            received = rx.recv() => match received {
                Some(response) => {
                    responses += 1;
                    match response.result {
                        Ok(()) => {
                            successes += 1;
                            if successes >= MIN_UPDATE_REGISTRY_SUCCESSES {
                                return Ok(UpdateRegistryOutcome { successes });
                            }
                        }
                        Err(JobError::Registry(err)) if err.is_revision_mismatch() => {
                            if let Some(proof) = response.proof {
                                let rev = proof.value.revision;
                                if highest_invalid_rev.is_none_or(|h| rev > h) {
                                    highest_invalid_rev = Some(rev);
                                }
                            }
                        }
                        Err(JobError::Registry(
                            err @ (RegistryError::HostLowerRevisionThanCache
                            | RegistryError::HostOutdatedProof),
                        )) => {
                            cheat_err = Some(err);
                        }
                        Err(_) => {}
                    }
                    if responses == submitted {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    // Host misbehavior always surfaces, ahead of the softer failure modes.
    if let Some(err) = cheat_err {
        return Err(err);
    }
    match highest_invalid_rev {
        Some(rev) if rev == entry.value.revision => Err(RegistryError::SameRevNum),
        Some(_) => Err(RegistryError::LowerRevNum),
        None if responses >= submitted => Err(RegistryError::InsufficientRedundancy),
        None => Err(RegistryError::Timeout),
    }
}
