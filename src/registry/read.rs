//! Quorum-style registry read across the worker pool.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{EnvProfile, READ_REGISTRY_BEST_TIMEOUT};
use crate::crypto::Hash;
use crate::error::RegistryError;
use crate::pricetable::check_pdbr_gouging;
use crate::registry::SignedRegistryValue;
use crate::types::PublicKey;
use crate::worker::jobs::ReadRegistryJob;
use crate::worker::pool::WorkerPool;

/// Read the registry entry for `(pubkey, tweak)` from every capable worker
/// and return the highest valid revision seen.
///
/// The first successful response opens a short use-highest window; the call
/// returns once all workers answered, the window closes, or `timeout` fires.
pub async fn read_registry(
    pool: &WorkerPool,
    env: EnvProfile,
    pubkey: &PublicKey,
    tweak: &Hash,
    timeout: Duration,
) -> Result<SignedRegistryValue, RegistryError> {
    let timeout = timeout.min(env.max_registry_read_timeout());

    let qualified: Vec<_> = pool
        .workers()
        .into_iter()
        .filter(|w| {
            w.supports_registry()
                && w.usable_price_table()
                    .is_ok_and(|t| check_pdbr_gouging(&w.allowance(), &t).is_ok())
        })
        .collect();
    if qualified.is_empty() {
        return Err(RegistryError::NotEnoughWorkers);
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(qualified.len());
    let mut submitted = 0usize;
    for worker in &qualified {
        // Every offered job produces exactly one response, discarded jobs
        // included, so each attempt counts toward the response total.
        worker.add_read_registry_job(ReadRegistryJob {
            pubkey: *pubkey,
            tweak: *tweak,
            response: tx.clone(),
            cancel: cancel.child_token(),
        });
        submitted += 1;
    }
    drop(tx);

    let overall_deadline = Instant::now() + timeout;
    let mut best: Option<SignedRegistryValue> = None;
    let mut best_deadline: Option<Instant> = None;
    let mut responses = 0usize;

    loop {
        let use_highest = async {
            match best_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::time::sleep_until(overall_deadline) => break,
            _ = use_highest => break,
            received = rx.recv() => match received {
                Some(response) => {
                    responses += 1;
                    if let Ok(Some(entry)) = response.result {
                        let better = best
                            .as_ref()
                            .is_none_or(|b| entry.value.revision > b.value.revision);
                        if better {
                            best = Some(entry);
                        }
                        if best_deadline.is_none() {
                            best_deadline = Some(Instant::now() + READ_REGISTRY_BEST_TIMEOUT);
                        }
                    }
                    if responses == submitted {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    cancel.cancel();

    match best {
        Some(entry) => Ok(entry),
        None if responses >= submitted => Err(RegistryError::NotFound),
        None => Err(RegistryError::Timeout),
    }
}
