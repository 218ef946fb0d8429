//! Crash-safe persistence for ephemeral accounts.
//!
//! One fixed-size slot per account at a stable file offset. Every slot is
//! checksummed; a clean-shutdown byte in the header decides whether loaded
//! balances can be trusted.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;

use crate::account::{Account, AccountBalance};
use crate::config::{
    ACCOUNTS_FILE_HEADER_SIZE, ACCOUNTS_FILE_MAGIC, ACCOUNTS_FILE_VERSION, ACCOUNT_SIZE,
};
use crate::crypto::{blake2b256, generate_keypair};
use crate::error::AccountError;
use crate::types::{HostKey, PublicKey, Specifier};

const CHECKSUM_SIZE: usize = 32;
const SLOT_PAYLOAD_SIZE: usize = 16 + 32 + 16 + 32 + 16 + 16 + 32;
const CLEAN_SHUTDOWN_OFFSET: u64 = (ACCOUNTS_FILE_MAGIC.len() + 1) as u64;

fn io_err(e: std::io::Error) -> AccountError {
    AccountError::Io(e.to_string())
}

// ============================================================================
// Slot codec
// ============================================================================

fn encode_slot(account: &Account) -> [u8; ACCOUNT_SIZE] {
    let balance = account.balance();
    let mut payload = [0u8; SLOT_PAYLOAD_SIZE];
    let mut at = 0usize;
    let mut put = |bytes: &[u8]| {
        payload[at..at + bytes.len()].copy_from_slice(bytes);
        at += bytes.len();
    };
    put(account.id().algorithm.as_bytes());
    put(&account.id().key);
    put(account.host_key().algorithm.as_bytes());
    put(&account.host_key().key);
    put(&balance.balance.to_le_bytes());
    put(&balance.host_acked_balance.to_le_bytes());
    put(&account.secret_key().to_bytes());

    let checksum = blake2b256(&payload);
    let mut slot = [0u8; ACCOUNT_SIZE];
    slot[..CHECKSUM_SIZE].copy_from_slice(&checksum);
    slot[CHECKSUM_SIZE..CHECKSUM_SIZE + SLOT_PAYLOAD_SIZE].copy_from_slice(&payload);
    slot
}

struct DecodedSlot {
    id: PublicKey,
    host_key: HostKey,
    balance: u128,
    host_acked_balance: u128,
    secret_key: SigningKey,
}

/// Decode one slot. `None` means the checksum does not cover the payload,
/// which marks the slot as dead; the account is not revived.
fn decode_slot(slot: &[u8]) -> Option<DecodedSlot> {
    if slot.len() < CHECKSUM_SIZE + SLOT_PAYLOAD_SIZE {
        return None;
    }
    let stored: [u8; CHECKSUM_SIZE] = slot[..CHECKSUM_SIZE].try_into().ok()?;
    let payload = &slot[CHECKSUM_SIZE..];
    if blake2b256(&payload[..SLOT_PAYLOAD_SIZE]) != stored {
        return None;
    }
    fn take<'a>(payload: &'a [u8], at: &mut usize, n: usize) -> &'a [u8] {
        let out = &payload[*at..*at + n];
        *at += n;
        out
    }
    let mut at = 0usize;
    let id_alg = Specifier(take(payload, &mut at, 16).try_into().ok()?);
    let id_key: [u8; 32] = take(payload, &mut at, 32).try_into().ok()?;
    let host_alg = Specifier(take(payload, &mut at, 16).try_into().ok()?);
    let host_key: [u8; 32] = take(payload, &mut at, 32).try_into().ok()?;
    let balance = u128::from_le_bytes(take(payload, &mut at, 16).try_into().ok()?);
    let host_acked = u128::from_le_bytes(take(payload, &mut at, 16).try_into().ok()?);
    let secret: [u8; 32] = take(payload, &mut at, 32).try_into().ok()?;
    Some(DecodedSlot {
        id: PublicKey {
            algorithm: id_alg,
            key: id_key,
        },
        host_key: PublicKey {
            algorithm: host_alg,
            key: host_key,
        },
        balance,
        host_acked_balance: host_acked,
        secret_key: SigningKey::from_bytes(&secret),
    })
}

// ============================================================================
// The manager
// ============================================================================

struct ManagerState {
    file: File,
    accounts: HashMap<HostKey, Arc<Account>>,
    next_offset: u64,
    closed: bool,
}

/// Owns the accounts file and every account loaded from it.
pub struct AccountManager {
    state: Mutex<ManagerState>,
    clean_on_open: bool,
}

impl AccountManager {
    /// Open or create the accounts file. If the previous shutdown was not
    /// clean, every loaded account keeps its keys but loses its balances.
    pub fn open(path: &Path) -> Result<Self, AccountError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();

        let clean = if len == 0 {
            // Fresh file: write a header with the clean byte unset; a fresh
            // file has nothing to distrust.
            let mut header = [0u8; ACCOUNTS_FILE_HEADER_SIZE];
            header[..ACCOUNTS_FILE_MAGIC.len()].copy_from_slice(ACCOUNTS_FILE_MAGIC);
            header[ACCOUNTS_FILE_MAGIC.len()] = ACCOUNTS_FILE_VERSION;
            file.write_all_at(&header, 0).map_err(io_err)?;
            true
        } else {
            let mut header = [0u8; ACCOUNTS_FILE_HEADER_SIZE];
            file.read_exact_at(&mut header, 0).map_err(io_err)?;
            if &header[..ACCOUNTS_FILE_MAGIC.len()] != ACCOUNTS_FILE_MAGIC {
                return Err(AccountError::Corrupt("bad magic".into()));
            }
            if header[ACCOUNTS_FILE_MAGIC.len()] != ACCOUNTS_FILE_VERSION {
                return Err(AccountError::Corrupt("unknown version".into()));
            }
            header[CLEAN_SHUTDOWN_OFFSET as usize] == 1
        };

        // Clear the clean byte first; it is only set again on graceful close.
        file.write_all_at(&[0u8], CLEAN_SHUTDOWN_OFFSET)
            .map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        let mut accounts = HashMap::new();
        let mut offset = ACCOUNTS_FILE_HEADER_SIZE as u64;
        while offset + ACCOUNT_SIZE as u64 <= len {
            let mut slot = vec![0u8; ACCOUNT_SIZE];
            file.read_exact_at(&mut slot, offset).map_err(io_err)?;
            if let Some(decoded) = decode_slot(&slot) {
                let balance = if clean {
                    AccountBalance {
                        balance: decoded.balance,
                        host_acked_balance: decoded.host_acked_balance,
                        ..AccountBalance::default()
                    }
                } else {
                    AccountBalance::default()
                };
                let account = Arc::new(Account::new(
                    decoded.id,
                    decoded.secret_key,
                    decoded.host_key,
                    offset,
                    balance,
                ));
                if !clean {
                    account.mark_needs_sync();
                }
                accounts.insert(decoded.host_key, account);
            }
            offset += ACCOUNT_SIZE as u64;
        }

        let next_offset = (ACCOUNTS_FILE_HEADER_SIZE as u64).max(len);
        Ok(Self {
            state: Mutex::new(ManagerState {
                file,
                accounts,
                next_offset,
                closed: false,
            }),
            clean_on_open: clean,
        })
    }

    /// Whether the previous shutdown marked the file clean.
    #[must_use]
    pub fn was_clean(&self) -> bool {
        self.clean_on_open
    }

    /// Fetch the account for a host, creating and persisting a fresh one on
    /// first use. Fails once the manager has been closed.
    pub fn open_account(&self, host: HostKey) -> Result<Arc<Account>, AccountError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AccountError::Closed);
        }
        if let Some(existing) = state.accounts.get(&host) {
            return Ok(existing.clone());
        }
        let (sk, vk) = generate_keypair();
        let offset = state.next_offset;
        state.next_offset += ACCOUNT_SIZE as u64;
        let account = Arc::new(Account::new(
            PublicKey::ed25519(vk.to_bytes()),
            sk,
            host,
            offset,
            AccountBalance::default(),
        ));
        let slot = encode_slot(&account);
        state.file.write_all_at(&slot, offset).map_err(io_err)?;
        state.accounts.insert(host, account.clone());
        Ok(account)
    }

    /// Existing account for a host, if any.
    #[must_use]
    pub fn account(&self, host: &HostKey) -> Option<Arc<Account>> {
        self.state.lock().accounts.get(host).cloned()
    }

    /// All loaded accounts.
    #[must_use]
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.state.lock().accounts.values().cloned().collect()
    }

    /// Write one account's slot back to disk.
    pub fn persist_account(&self, account: &Account) -> Result<(), AccountError> {
        let state = self.state.lock();
        if state.closed {
            return Err(AccountError::Closed);
        }
        let slot = encode_slot(account);
        state
            .file
            .write_all_at(&slot, account.offset())
            .map_err(io_err)?;
        Ok(())
    }

    /// Persist every account, then set the clean byte. The clean byte goes
    /// last so a crash mid-close still reads as unclean.
    pub fn close(&self) -> Result<(), AccountError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        for account in state.accounts.values() {
            let slot = encode_slot(account);
            state
                .file
                .write_all_at(&slot, account.offset())
                .map_err(io_err)?;
        }
        state.file.sync_data().map_err(io_err)?;
        state
            .file
            .write_all_at(&[1u8], CLEAN_SHUTDOWN_OFFSET)
            .map_err(io_err)?;
        state.file.sync_data().map_err(io_err)?;
        Ok(())
    }
}
