//! Error types shared across the renter subsystems.

use thiserror::Error;

/// Malformed logical paths.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed renter path: {0:?}")]
    Malformed(String),
}

/// Errors from the file-store interface.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("path already exists: {0}")]
    Exists(String),
    #[error("expected a directory: {0}")]
    NotADirectory(String),
    #[error("expected a file: {0}")]
    NotAFile(String),
    #[error("file store i/o: {0}")]
    Io(String),
}

/// Errors talking to a host.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host is offline")]
    Offline,
    #[error("stream closed")]
    StreamClosed,
    #[error("host rejected payment: {0}")]
    PaymentRejected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("host i/o: {0}")]
    Io(String),
}

/// Host pricing out of policy. Fatal for the RPC, checked before payment.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GougingError {
    #[error("price table validity {got_secs}s below accepted minimum {min_secs}s")]
    ValidityTooShort { got_secs: u64, min_secs: u64 },
    #[error("price table update cost over the allowance budget")]
    UpdateCostTooHigh,
    #[error("download bandwidth price over the allowance budget")]
    DownloadBandwidthTooExpensive,
    #[error("upload bandwidth price over the allowance budget")]
    UploadBandwidthTooExpensive,
    #[error("expected download too expensive under the current prices")]
    ExpectedDownloadTooExpensive,
    #[error("price table was never fetched")]
    PriceTableNotFetched,
    #[error("price table expired")]
    PriceTableExpired,
}

/// Ephemeral account failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("accounts file corrupt: {0}")]
    Corrupt(String),
    #[error("accounts file closed")]
    Closed,
    #[error("account i/o: {0}")]
    Io(String),
    #[error("withdrawal message expired")]
    WithdrawalExpired,
    #[error("insufficient account balance")]
    InsufficientBalance,
}

/// Job lifecycle errors surfaced on response channels.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job discarded before execution")]
    Discarded,
    #[error("worker queue on cooldown")]
    OnCooldown,
    #[error("worker shutting down")]
    ShuttingDown,
    #[error("job cancelled by caller")]
    Cancelled,
    #[error(transparent)]
    Gouging(#[from] GougingError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registry subsystem errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("renter is shutting down")]
    ShuttingDown,
    #[error("entry not found")]
    NotFound,
    #[error("registry lookup timed out")]
    Timeout,
    #[error("not enough workers to service the registry request")]
    NotEnoughWorkers,
    #[error("invalid signature on registry entry")]
    InvalidSignature,
    #[error("host reported a higher revision (lower rev submitted)")]
    LowerRevNum,
    #[error("host already stores this revision")]
    SameRevNum,
    #[error("update reached fewer hosts than required")]
    InsufficientRedundancy,
    #[error("host proof carries a lower revision than requested")]
    HostOutdatedProof,
    #[error("host returned a revision below its own recorded history")]
    HostLowerRevisionThanCache,
    #[error("registry entry data exceeds the size cap")]
    DataTooLarge,
}

impl RegistryError {
    /// Revision conflicts on update jobs carry a proof and are not the
    /// worker's fault; they must not bump cooldown counters.
    #[must_use]
    pub fn is_revision_mismatch(&self) -> bool {
        matches!(self, RegistryError::LowerRevNum | RegistryError::SameRevNum)
    }
}

/// Content-addressed blob errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SkyfileError {
    #[error("metadata and fanout do not fit in the base sector")]
    MetadataTooBig,
    #[error("source erasure coding is not supported for conversion")]
    RedundancyNotSupported,
    #[error("no known key decrypts this file")]
    EncryptionNotSupported,
    #[error("skylink is blocked")]
    SkylinkBlocked,
    #[error("malformed skylink: {0}")]
    MalformedSkylink(String),
    #[error("malformed base sector: {0}")]
    MalformedBaseSector(String),
    #[error("chunk irrecoverable: {completed} of {needed} pieces fetched")]
    ChunkIrrecoverable { completed: usize, needed: usize },
    #[error("read past the end of the file")]
    OutOfBounds,
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("download failed: {0}")]
    Download(String),
}

/// Backup archive errors.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup checksum mismatch")]
    ChecksumMismatch,
    #[error("unsupported backup header: {0}")]
    BadHeader(String),
    #[error("wrong or missing backup secret")]
    WrongSecret,
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("backup i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Top-level lifecycle errors.
#[derive(Debug, Error)]
pub enum RenterError {
    #[error("renter is shutting down")]
    ShuttingDown,
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    #[error("persist dir: {0}")]
    Persist(String),
    #[error("settings file corrupt: {0}")]
    BadSettings(String),
    #[error("unknown settings version {0:?}")]
    UnknownSettingsVersion(String),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
