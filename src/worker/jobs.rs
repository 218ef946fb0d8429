//! Job types executed by workers: registry reads and updates, sector
//! probes, and sector reads. Each job owns its response channel and reports
//! its own success or failure to the queue it ran on.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::crypto::Hash;
use crate::error::{HostError, JobError, RegistryError};
use crate::pricetable::{check_pdbr_gouging, check_upload_gouging, PriceTable};
use crate::registry::{RegistryValue, SignedRegistryValue};
use crate::types::{
    Currency, HostKey, PublicKey, RPC_HAS_SECTOR, RPC_READ_REGISTRY, RPC_READ_SECTOR,
    RPC_UPDATE_REGISTRY,
};
use crate::worker::queue::QueueJob;
use crate::worker::Worker;

// Expected bandwidth per job kind, reserved before execution.
const READ_REGISTRY_BANDWIDTH: (u64, u64) = (640, 1024);
const UPDATE_REGISTRY_BANDWIDTH: (u64, u64) = (1024, 640);
const HAS_SECTOR_BANDWIDTH: (u64, u64) = (512, 512);
const READ_SECTOR_BASE_BANDWIDTH: (u64, u64) = (512, 4096);

/// Program cost lower bound for a pay-by-account RPC.
fn rpc_cost(table: &PriceTable, upload: u64, download: u64) -> Currency {
    table
        .init_base_cost
        .saturating_add(table.read_base_cost)
        .saturating_add(table.upload_bandwidth_cost.saturating_mul(upload as Currency))
        .saturating_add(
            table
                .download_bandwidth_cost
                .saturating_mul(download as Currency),
        )
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRegistryRequest {
    pub pubkey: PublicKey,
    pub tweak: Hash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRegistryRequest {
    pub pubkey: PublicKey,
    pub entry: SignedRegistryValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HasSectorRequest {
    pub root: Hash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadSectorRequest {
    pub root: Hash,
    pub offset: u32,
    pub length: u32,
}

/// Update-registry response status byte.
pub(crate) const UPDATE_STATUS_OK: u8 = 0;
pub(crate) const UPDATE_STATUS_LOWER_REV: u8 = 1;
pub(crate) const UPDATE_STATUS_SAME_REV: u8 = 2;

/// Encode a revision proof: `signature(64) || revision(8, LE) || data`.
#[must_use]
pub(crate) fn encode_update_proof(signature: &[u8; 64], revision: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(72 + data.len());
    out.extend_from_slice(signature);
    out.extend_from_slice(&revision.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Decode a revision proof. Anything shorter than 72 bytes is malformed.
#[must_use]
pub(crate) fn decode_update_proof(frame: &[u8]) -> Option<([u8; 64], u64, Vec<u8>)> {
    if frame.len() < 72 {
        return None;
    }
    let signature: [u8; 64] = frame[..64].try_into().ok()?;
    let revision = u64::from_le_bytes(frame[64..72].try_into().ok()?);
    Some((signature, revision, frame[72..].to_vec()))
}

// ============================================================================
// Read registry
// ============================================================================

#[derive(Debug)]
pub struct ReadRegistryResponse {
    pub host: HostKey,
    pub result: Result<Option<SignedRegistryValue>, JobError>,
}

pub struct ReadRegistryJob {
    pub pubkey: PublicKey,
    pub tweak: Hash,
    pub response: mpsc::Sender<ReadRegistryResponse>,
    pub cancel: CancellationToken,
}

impl QueueJob for ReadRegistryJob {
    fn discard(self, err: JobError) {
        let _ = self.response.try_send(ReadRegistryResponse {
            host: HostKey::ed25519([0u8; 32]),
            result: Err(err),
        });
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        READ_REGISTRY_BANDWIDTH
    }
}

impl ReadRegistryJob {
    pub(crate) async fn execute(self, worker: &Worker) {
        let host = worker.host_key();
        let start = Instant::now();
        let result = self.run(worker).await;
        match &result {
            Ok(_) => worker.read_registry_queue().report_success(start.elapsed()),
            Err(err) => {
                if !matches!(err, JobError::Cancelled) {
                    worker.read_registry_queue().report_failure(err);
                }
            }
        }
        let _ = self.response.try_send(ReadRegistryResponse { host, result });
    }

    async fn run(&self, worker: &Worker) -> Result<Option<SignedRegistryValue>, JobError> {
        let table = worker.usable_price_table()?;
        check_pdbr_gouging(&worker.allowance(), &table)?;
        let (ul, dl) = self.expected_bandwidth();
        let cost = rpc_cost(&table, ul, dl);

        worker.account().track_withdrawal(cost);
        let outcome = tokio::select! {
            res = self.rpc(worker, cost) => res,
            _ = self.cancel.cancelled() => Err(JobError::Cancelled),
        };
        worker.account().commit_withdrawal(cost, outcome.is_ok());

        let entry = match outcome? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry
            .verify(&self.pubkey)
            .map_err(|_| JobError::Registry(RegistryError::InvalidSignature))?;
        if entry.value.tweak != self.tweak {
            return Err(JobError::Host(HostError::Protocol(
                "entry tweak mismatch".into(),
            )));
        }
        worker
            .registry_cache()
            .set_if_higher(&self.pubkey, &self.tweak, entry.value.revision);
        Ok(Some(entry))
    }

    async fn rpc(
        &self,
        worker: &Worker,
        cost: Currency,
    ) -> Result<Option<SignedRegistryValue>, JobError> {
        let mut stream = worker.open_stream().await?;
        stream.write_frame(RPC_READ_REGISTRY.as_bytes()).await?;
        let withdrawal = worker.new_withdrawal(cost);
        stream
            .write_frame(&serde_json::to_vec(&withdrawal).map_err(protocol_err)?)
            .await?;
        let request = ReadRegistryRequest {
            pubkey: self.pubkey,
            tweak: self.tweak,
        };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        let frame = stream.read_frame().await?;
        let _ = stream.close().await;
        if frame.is_empty() {
            // Not found; the host refunds the payment.
            return Ok(None);
        }
        let entry: SignedRegistryValue = serde_json::from_slice(&frame).map_err(protocol_err)?;
        Ok(Some(entry))
    }
}

// ============================================================================
// Update registry
// ============================================================================

#[derive(Debug)]
pub struct UpdateRegistryResponse {
    pub host: HostKey,
    pub result: Result<(), JobError>,
    /// The host's claimed latest entry when the result is a revision error.
    pub proof: Option<SignedRegistryValue>,
}

pub struct UpdateRegistryJob {
    pub pubkey: PublicKey,
    pub entry: SignedRegistryValue,
    pub response: mpsc::Sender<UpdateRegistryResponse>,
    /// Jobs keep running past the caller's timeout until this deadline, so
    /// slow hosts still converge.
    pub deadline: Instant,
}

impl QueueJob for UpdateRegistryJob {
    fn discard(self, err: JobError) {
        let _ = self.response.try_send(UpdateRegistryResponse {
            host: HostKey::ed25519([0u8; 32]),
            result: Err(err),
            proof: None,
        });
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        UPDATE_REGISTRY_BANDWIDTH
    }
}

impl UpdateRegistryJob {
    pub(crate) async fn execute(self, worker: &Worker) {
        let host = worker.host_key();
        let start = Instant::now();
        let (result, proof) = match tokio::time::timeout_at(self.deadline, self.run(worker)).await
        {
            Ok(outcome) => outcome,
            Err(_) => (Err(JobError::Cancelled), None),
        };
        // Revision mismatches carry a valid proof and are the caller's
        // concern, not the worker's; they never bump the cooldown.
        match &result {
            Ok(()) => worker.update_registry_queue().report_success(start.elapsed()),
            Err(JobError::Registry(e)) if e.is_revision_mismatch() => {
                worker.update_registry_queue().report_success(start.elapsed());
            }
            Err(JobError::Cancelled) => {}
            Err(err) => worker.update_registry_queue().report_failure(err),
        }
        let _ = self.response.try_send(UpdateRegistryResponse {
            host,
            result,
            proof,
        });
    }

    async fn run(&self, worker: &Worker) -> (Result<(), JobError>, Option<SignedRegistryValue>) {
        let table = match worker.usable_price_table() {
            Ok(t) => t,
            Err(e) => return (Err(e), None),
        };
        if let Err(e) = check_upload_gouging(&worker.allowance(), &table) {
            return (Err(JobError::Gouging(e)), None);
        }
        let (ul, dl) = self.expected_bandwidth();
        let cost = rpc_cost(&table, ul, dl);

        worker.account().track_withdrawal(cost);
        let outcome = self.rpc(worker, cost).await;
        worker.account().commit_withdrawal(cost, outcome.is_ok());

        let frame = match outcome {
            Ok(frame) => frame,
            Err(e) => return (Err(e), None),
        };
        self.interpret(worker, &frame)
    }

    async fn rpc(&self, worker: &Worker, cost: Currency) -> Result<Vec<u8>, JobError> {
        let mut stream = worker.open_stream().await?;
        stream.write_frame(RPC_UPDATE_REGISTRY.as_bytes()).await?;
        let withdrawal = worker.new_withdrawal(cost);
        stream
            .write_frame(&serde_json::to_vec(&withdrawal).map_err(protocol_err)?)
            .await?;
        let request = UpdateRegistryRequest {
            pubkey: self.pubkey,
            entry: self.entry.clone(),
        };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        let frame = stream.read_frame().await?;
        let _ = stream.close().await;
        Ok(frame)
    }

    /// Map the status frame to a result, running the cheating checks on any
    /// attached proof.
    fn interpret(
        &self,
        worker: &Worker,
        frame: &[u8],
    ) -> (Result<(), JobError>, Option<SignedRegistryValue>) {
        let Some((&status, proof_bytes)) = frame.split_first() else {
            return (
                Err(JobError::Host(HostError::Protocol("empty response".into()))),
                None,
            );
        };
        let tweak = self.entry.value.tweak;
        match status {
            UPDATE_STATUS_OK => {
                worker
                    .registry_cache()
                    .set_if_higher(&self.pubkey, &tweak, self.entry.value.revision);
                (Ok(()), None)
            }
            UPDATE_STATUS_LOWER_REV | UPDATE_STATUS_SAME_REV => {
                let Some((signature, revision, data)) = decode_update_proof(proof_bytes) else {
                    return (
                        Err(JobError::Host(HostError::Protocol("short proof".into()))),
                        None,
                    );
                };
                let proof = SignedRegistryValue {
                    value: RegistryValue {
                        tweak,
                        data,
                        revision,
                    },
                    signature,
                };
                if proof.verify(&self.pubkey).is_err() {
                    return (Err(JobError::Registry(RegistryError::InvalidSignature)), None);
                }
                let cached = worker.registry_cache().get(&self.pubkey, &tweak);
                // The host once proved a higher revision than it claims now:
                // it lost data, and that is a penalty. The cache still only
                // moves forward.
                if let Some(cached) = cached {
                    if proof.value.revision < cached {
                        worker.registry_cache().set_if_higher(
                            &self.pubkey,
                            &tweak,
                            proof.value.revision,
                        );
                        return (
                            Err(JobError::Registry(RegistryError::HostLowerRevisionThanCache)),
                            Some(proof),
                        );
                    }
                }
                if proof.value.revision < self.entry.value.revision {
                    return (
                        Err(JobError::Registry(RegistryError::HostOutdatedProof)),
                        Some(proof),
                    );
                }
                worker
                    .registry_cache()
                    .set_if_higher(&self.pubkey, &tweak, proof.value.revision);
                let err = if status == UPDATE_STATUS_SAME_REV {
                    RegistryError::SameRevNum
                } else {
                    RegistryError::LowerRevNum
                };
                (Err(JobError::Registry(err)), Some(proof))
            }
            other => (
                Err(JobError::Host(HostError::Protocol(format!(
                    "unknown update status {other}"
                )))),
                None,
            ),
        }
    }
}

// ============================================================================
// Has sector
// ============================================================================

pub struct HasSectorJob {
    pub root: Hash,
    pub response: oneshot::Sender<Result<bool, JobError>>,
}

impl QueueJob for HasSectorJob {
    fn discard(self, err: JobError) {
        let _ = self.response.send(Err(err));
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        HAS_SECTOR_BANDWIDTH
    }
}

impl HasSectorJob {
    pub(crate) async fn execute(self, worker: &Worker) {
        let start = Instant::now();
        let result = self.run(worker).await;
        match &result {
            Ok(_) => worker.has_sector_queue().report_success(start.elapsed()),
            Err(err) => worker.has_sector_queue().report_failure(err),
        }
        let _ = self.response.send(result);
    }

    async fn run(&self, worker: &Worker) -> Result<bool, JobError> {
        let table = worker.usable_price_table()?;
        check_pdbr_gouging(&worker.allowance(), &table)?;
        let (ul, dl) = self.expected_bandwidth();
        let cost = table
            .has_sector_base_cost
            .saturating_add(rpc_cost(&table, ul, dl));

        worker.account().track_withdrawal(cost);
        let outcome = self.rpc(worker, cost).await;
        worker.account().commit_withdrawal(cost, outcome.is_ok());
        outcome
    }

    async fn rpc(&self, worker: &Worker, cost: Currency) -> Result<bool, JobError> {
        let mut stream = worker.open_stream().await?;
        stream.write_frame(RPC_HAS_SECTOR.as_bytes()).await?;
        let withdrawal = worker.new_withdrawal(cost);
        stream
            .write_frame(&serde_json::to_vec(&withdrawal).map_err(protocol_err)?)
            .await?;
        let request = HasSectorRequest { root: self.root };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        let frame = stream.read_frame().await?;
        let _ = stream.close().await;
        match frame.as_slice() {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(JobError::Host(HostError::Protocol(
                "bad has-sector response".into(),
            ))),
        }
    }
}

// ============================================================================
// Read sector
// ============================================================================

pub struct ReadSectorJob {
    pub root: Hash,
    pub offset: u32,
    pub length: u32,
    pub response: oneshot::Sender<Result<Vec<u8>, JobError>>,
}

impl QueueJob for ReadSectorJob {
    fn discard(self, err: JobError) {
        let _ = self.response.send(Err(err));
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        let (ul, dl) = READ_SECTOR_BASE_BANDWIDTH;
        (ul, dl + u64::from(self.length))
    }
}

impl ReadSectorJob {
    pub(crate) async fn execute(self, worker: &Worker) {
        let start = Instant::now();
        let result = self.run(worker).await;
        match &result {
            Ok(_) => worker.read_sector_queue().report_success(start.elapsed()),
            Err(err) => worker.read_sector_queue().report_failure(err),
        }
        let _ = self.response.send(result);
    }

    async fn run(&self, worker: &Worker) -> Result<Vec<u8>, JobError> {
        let table = worker.usable_price_table()?;
        check_pdbr_gouging(&worker.allowance(), &table)?;
        let (ul, dl) = self.expected_bandwidth();
        let cost = rpc_cost(&table, ul, dl).saturating_add(
            table
                .read_length_cost
                .saturating_mul(Currency::from(self.length)),
        );

        worker.account().track_withdrawal(cost);
        let outcome = self.rpc(worker, cost).await;
        worker.account().commit_withdrawal(cost, outcome.is_ok());
        outcome
    }

    async fn rpc(&self, worker: &Worker, cost: Currency) -> Result<Vec<u8>, JobError> {
        let mut stream = worker.open_stream().await?;
        stream.write_frame(RPC_READ_SECTOR.as_bytes()).await?;
        let withdrawal = worker.new_withdrawal(cost);
        stream
            .write_frame(&serde_json::to_vec(&withdrawal).map_err(protocol_err)?)
            .await?;
        let request = ReadSectorRequest {
            root: self.root,
            offset: self.offset,
            length: self.length,
        };
        stream
            .write_frame(&serde_json::to_vec(&request).map_err(protocol_err)?)
            .await?;
        let frame = stream.read_frame().await?;
        let _ = stream.close().await;
        if frame.len() != self.length as usize {
            return Err(JobError::Host(HostError::Protocol(format!(
                "expected {} bytes, host sent {}",
                self.length,
                frame.len()
            ))));
        }
        Ok(frame)
    }
}

fn protocol_err(e: serde_json::Error) -> JobError {
    JobError::Host(HostError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_codec_roundtrip() {
        let sig = [9u8; 64];
        let encoded = encode_update_proof(&sig, 77, b"abc");
        assert!(encoded.len() >= 72);
        let (s, rev, data) = decode_update_proof(&encoded).unwrap();
        assert_eq!(s, sig);
        assert_eq!(rev, 77);
        assert_eq!(data, b"abc");
    }

    #[test]
    fn short_proof_rejected() {
        assert!(decode_update_proof(&[0u8; 71]).is_none());
        assert!(decode_update_proof(&[0u8; 72]).is_some());
    }

    #[test]
    fn read_sector_bandwidth_scales_with_length() {
        let (tx, _rx) = oneshot::channel();
        let job = ReadSectorJob {
            root: [0u8; 32],
            offset: 0,
            length: 1 << 20,
            response: tx,
        };
        let (_, dl) = job.expected_bandwidth();
        assert!(dl >= 1 << 20);
    }
}
