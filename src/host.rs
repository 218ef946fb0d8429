//! External collaborator interfaces: contracts, host database, payment,
//! and the stream layer the RPC mux exposes to the core.

use async_trait::async_trait;

use crate::error::HostError;
use crate::types::{Allowance, Contract, ContractUtility, Currency, HostKey};

/// A bi-directional framed stream to a host, opened through the RPC mux.
/// Closing is idempotent.
#[async_trait]
pub trait HostStream: Send {
    async fn read_frame(&mut self) -> Result<Vec<u8>, HostError>;
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), HostError>;
    async fn close(&mut self) -> Result<(), HostError>;
}

/// Opens streams to hosts.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self, host: &HostKey) -> Result<Box<dyn HostStream>, HostError>;
}

/// Provides payment for an RPC on an open stream. The payment mechanism
/// (contract revision or ephemeral account) is the provider's concern.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn pay(
        &self,
        stream: &mut dyn HostStream,
        host: &HostKey,
        amount: Currency,
    ) -> Result<(), HostError>;
}

/// The contract layer as seen by the core.
pub trait ContractSource: Send + Sync {
    fn contracts(&self) -> Vec<Contract>;
    fn contract_utility(&self, host: &HostKey) -> Option<ContractUtility>;
    fn is_offline(&self, host: &HostKey) -> bool;
    fn allowance(&self) -> Allowance;
}

/// Host database record visible to the core.
#[derive(Clone, Debug)]
pub struct HostInfo {
    pub host_key: HostKey,
    pub net_address: String,
    pub version: String,
}

/// Host database lookup.
pub trait HostDb: Send + Sync {
    fn host(&self, host: &HostKey) -> Option<HostInfo>;
}

/// A consensus update delivered by the subscription hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsensusChange {
    pub block_height: u64,
    pub synced: bool,
}
