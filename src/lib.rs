//! Renter coordination layer for a decentralized storage network.
//!
//! The crate wires per-host workers with typed job queues, ephemeral
//! account funding, quorum registry access, recursive directory metadata
//! propagation, content-addressed blob assembly and streaming, encrypted
//! backups, and the lifecycle gluing them together. Contract formation,
//! the on-disk file format, and the wire mux live behind the interfaces in
//! [`host`] and [`fs`].

pub mod account;
pub mod backup;
pub mod bubble;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod host;
pub mod memory;
pub mod pricetable;
pub mod registry;
pub mod renter;
pub mod skyfile;
pub mod stream;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use account::{Account, AccountManager};
pub use config::EnvProfile;
pub use error::RenterError;
pub use memory::{MemoryClass, MemoryManager, MemoryPriority};
pub use renter::{Renter, RenterConfig};
pub use types::{Allowance, Contract, ContractUtility, Currency, HostKey, PublicKey, RenterPath};
pub use worker::pool::WorkerPool;
