//! Ephemeral accounts: per-host prepaid balances with pending-delta
//! accounting and signed withdrawal messages.

use std::sync::atomic::{AtomicBool, Ordering};

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::WITHDRAWAL_VALIDITY_PERIOD;
use crate::crypto::{blake2b256_all, sign_hash, verify_hash, Hash};
use crate::types::{currency_serde, Currency, HostKey, PublicKey};

pub mod persist;

pub use persist::AccountManager;

/// The mutable balance state of one account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountBalance {
    pub balance: Currency,
    pub negative_balance: Currency,
    pub pending_deposits: Currency,
    pub pending_withdrawals: Currency,
    /// Last balance the host confirmed during a sync.
    pub host_acked_balance: Currency,
}

impl AccountBalance {
    /// Lower bound on what the host will honor right now.
    #[must_use]
    pub fn min_expected_balance(&self) -> Currency {
        self.balance
            .saturating_sub(self.negative_balance)
            .saturating_sub(self.pending_withdrawals)
    }

    /// Upper bound once every pending operation lands.
    #[must_use]
    pub fn max_expected_balance(&self) -> Currency {
        self.balance
            .saturating_sub(self.negative_balance)
            .saturating_add(self.pending_deposits)
            .saturating_sub(self.pending_withdrawals)
    }
}

/// A per-host prepaid account. Balance mutations go through the tracking and
/// commit pairs so pending deltas stay consistent across in-flight RPCs.
pub struct Account {
    id: PublicKey,
    secret_key: SigningKey,
    host_key: HostKey,
    offset: u64,
    balance: Mutex<AccountBalance>,
    needs_sync: AtomicBool,
}

impl Account {
    pub(crate) fn new(
        id: PublicKey,
        secret_key: SigningKey,
        host_key: HostKey,
        offset: u64,
        balance: AccountBalance,
    ) -> Self {
        Self {
            id,
            secret_key,
            host_key,
            offset,
            balance: Mutex::new(balance),
            needs_sync: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> PublicKey {
        self.id
    }

    #[must_use]
    pub fn host_key(&self) -> HostKey {
        self.host_key
    }

    #[must_use]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn secret_key(&self) -> &SigningKey {
        &self.secret_key
    }

    #[must_use]
    pub fn balance(&self) -> AccountBalance {
        *self.balance.lock()
    }

    /// Spendable balance assuming every pending operation fails against us.
    #[must_use]
    pub fn available_balance(&self) -> Currency {
        self.balance.lock().min_expected_balance()
    }

    pub fn track_deposit(&self, amount: Currency) {
        let mut b = self.balance.lock();
        b.pending_deposits = b.pending_deposits.saturating_add(amount);
    }

    pub fn commit_deposit(&self, amount: Currency, success: bool) {
        let mut b = self.balance.lock();
        b.pending_deposits = b.pending_deposits.saturating_sub(amount);
        if success {
            // Deposits first pay down any negative balance.
            if b.negative_balance >= amount {
                b.negative_balance -= amount;
            } else {
                let remainder = amount - b.negative_balance;
                b.negative_balance = 0;
                b.balance = b.balance.saturating_add(remainder);
            }
        }
    }

    pub fn track_withdrawal(&self, amount: Currency) {
        let mut b = self.balance.lock();
        b.pending_withdrawals = b.pending_withdrawals.saturating_add(amount);
    }

    pub fn commit_withdrawal(&self, amount: Currency, success: bool) {
        let mut b = self.balance.lock();
        b.pending_withdrawals = b.pending_withdrawals.saturating_sub(amount);
        if success {
            if b.balance >= amount {
                b.balance -= amount;
            } else {
                let overdraft = amount - b.balance;
                b.balance = 0;
                b.negative_balance = b.negative_balance.saturating_add(overdraft);
            }
        }
    }

    /// Replace the whole balance with the host's view. Clears all deltas.
    pub fn reset_balance(&self, balance: Currency) {
        let mut b = self.balance.lock();
        b.balance = balance;
        b.negative_balance = 0;
        b.pending_deposits = 0;
        b.pending_withdrawals = 0;
        b.host_acked_balance = balance;
    }

    /// Whether the account must re-sync with the host before further work.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.needs_sync.load(Ordering::SeqCst)
    }

    pub fn mark_needs_sync(&self) {
        self.needs_sync.store(true, Ordering::SeqCst);
    }

    /// Assert the sync precondition and clear the flag. Calling this with
    /// pending operations in flight is a programmer error.
    pub fn begin_sync(&self) -> Currency {
        let b = self.balance.lock();
        assert!(
            b.pending_deposits == 0 && b.pending_withdrawals == 0,
            "account sync with pending operations"
        );
        self.needs_sync.store(false, Ordering::SeqCst);
        b.balance
    }

    /// Build and sign a withdrawal message for the given amount.
    #[must_use]
    pub fn new_withdrawal_message(
        &self,
        amount: Currency,
        block_height: u64,
    ) -> SignedWithdrawal {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let message = WithdrawalMessage {
            account_id: self.id,
            amount,
            expiry: block_height + WITHDRAWAL_VALIDITY_PERIOD,
            nonce,
        };
        let signature = sign_hash(&self.secret_key, &message.hash());
        SignedWithdrawal { message, signature }
    }
}

// ============================================================================
// Withdrawal messages
// ============================================================================

/// Authorizes the host to debit the account once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalMessage {
    pub account_id: PublicKey,
    #[serde(with = "currency_serde")]
    pub amount: Currency,
    /// Block height after which the host refuses the withdrawal.
    pub expiry: u64,
    pub nonce: [u8; 8],
}

impl WithdrawalMessage {
    #[must_use]
    pub fn hash(&self) -> Hash {
        blake2b256_all(&[
            self.account_id.algorithm.as_bytes(),
            &self.account_id.key,
            &self.amount.to_le_bytes(),
            &self.expiry.to_le_bytes(),
            &self.nonce,
        ])
    }

    /// True when the message is still spendable at `block_height`.
    #[must_use]
    pub fn valid_at(&self, block_height: u64) -> bool {
        self.expiry >= block_height
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWithdrawal {
    pub message: WithdrawalMessage,
    #[serde(with = "crate::crypto::sig_serde")]
    pub signature: [u8; 64],
}

impl SignedWithdrawal {
    #[must_use]
    pub fn verify(&self) -> bool {
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&self.message.account_id.key) else {
            return false;
        };
        verify_hash(&vk, &self.message.hash(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn test_account() -> Account {
        let (sk, vk) = generate_keypair();
        let (_, host_vk) = generate_keypair();
        Account::new(
            PublicKey::ed25519(vk.to_bytes()),
            sk,
            PublicKey::ed25519(host_vk.to_bytes()),
            0,
            AccountBalance::default(),
        )
    }

    #[test]
    fn deposit_lifecycle() {
        let a = test_account();
        a.track_deposit(100);
        assert_eq!(a.balance().pending_deposits, 100);
        assert_eq!(a.balance().max_expected_balance(), 100);
        assert_eq!(a.balance().min_expected_balance(), 0);
        a.commit_deposit(100, true);
        let b = a.balance();
        assert_eq!(b.balance, 100);
        assert_eq!(b.pending_deposits, 0);
    }

    #[test]
    fn failed_deposit_leaves_balance() {
        let a = test_account();
        a.track_deposit(100);
        a.commit_deposit(100, false);
        assert_eq!(a.balance(), AccountBalance::default());
    }

    #[test]
    fn withdrawal_can_go_negative() {
        let a = test_account();
        a.reset_balance(50);
        a.track_withdrawal(80);
        assert_eq!(a.available_balance(), 0);
        a.commit_withdrawal(80, true);
        let b = a.balance();
        assert_eq!(b.balance, 0);
        assert_eq!(b.negative_balance, 30);
        // A deposit pays the negative balance down first.
        a.track_deposit(100);
        a.commit_deposit(100, true);
        let b = a.balance();
        assert_eq!(b.balance, 70);
        assert_eq!(b.negative_balance, 0);
    }

    #[test]
    fn balance_bounds_hold_across_interleavings() {
        let a = test_account();
        a.reset_balance(1_000);
        let ops: [(Currency, bool); 4] = [(100, true), (250, false), (75, true), (40, false)];
        for (amount, is_deposit) in ops {
            if is_deposit {
                a.track_deposit(amount);
            } else {
                a.track_withdrawal(amount);
            }
            let b = a.balance();
            let mid = b.balance.saturating_sub(b.negative_balance);
            assert!(b.min_expected_balance() <= mid);
            assert!(mid <= b.max_expected_balance() + b.pending_withdrawals);
        }
        for (amount, is_deposit) in ops {
            if is_deposit {
                a.commit_deposit(amount, true);
            } else {
                a.commit_withdrawal(amount, true);
            }
        }
        let b = a.balance();
        assert_eq!(b.pending_deposits, 0);
        assert_eq!(b.pending_withdrawals, 0);
        assert_eq!(b.balance, 1_000 + 100 + 75 - 250 - 40);
    }

    #[test]
    fn reset_clears_everything() {
        let a = test_account();
        a.track_deposit(10);
        a.track_withdrawal(20);
        a.reset_balance(500);
        let b = a.balance();
        assert_eq!(b.balance, 500);
        assert_eq!(b.pending_deposits, 0);
        assert_eq!(b.pending_withdrawals, 0);
        assert_eq!(b.host_acked_balance, 500);
    }

    #[test]
    #[should_panic(expected = "account sync with pending operations")]
    fn sync_with_pending_panics() {
        let a = test_account();
        a.track_deposit(10);
        a.begin_sync();
    }

    #[test]
    fn withdrawal_message_signs_and_expires() {
        let a = test_account();
        let w = a.new_withdrawal_message(42, 100);
        assert!(w.verify());
        assert_eq!(w.message.expiry, 100 + WITHDRAWAL_VALIDITY_PERIOD);
        assert!(w.message.valid_at(w.message.expiry));
        assert!(!w.message.valid_at(w.message.expiry + 1));
        let mut forged = w;
        forged.message.amount += 1;
        assert!(!forged.verify());
    }

    #[test]
    fn withdrawal_nonces_differ() {
        let a = test_account();
        let w1 = a.new_withdrawal_message(1, 1);
        let w2 = a.new_withdrawal_message(1, 1);
        assert_ne!(w1.message.nonce, w2.message.nonce);
    }
}
