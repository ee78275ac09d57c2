// In-memory account bank
// Balances, spending power, transfers with burned fees, write-off

use pledger_consensus::Stakeholder;
use pledger_core::{Wallet, ID_FIRST_USER, ID_GENESIS, ID_RECYCLE};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BankError {
    #[error("account not found: {0}")]
    AccountNotFound(u64),
    #[error("account already exists: {0}")]
    AccountExists(u64),
    #[error("amount must be non-negative")]
    NegativeAmount,
    #[error("fee must be non-negative")]
    NegativeFee,
    #[error("insufficient balance for account {account} in token {token}")]
    InsufficientBalance { account: u64, token: u64 },
    #[error("balance overflow for account {account} in token {token}")]
    BalanceOverflow { account: u64, token: u64 },
    #[error("balance mismatch for account {account} in token {token}: expected {expected}, got {actual}")]
    BalanceMismatch {
        account: u64,
        token: u64,
        expected: i64,
        actual: i64,
    },
}

/// A bank account: wallet plus the block that last refreshed it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub id: u64,
    /// Block id of the transaction that created or last renewed this
    /// account; drives the renewal deadline.
    pub block_id: u64,
    pub wallet: Wallet,
}

/// In-memory account state, authoritative between ledger appends.
///
/// Mutated only by the block-application path; readers take a snapshot
/// or route through the owner (single-writer discipline). Cloning
/// snapshots the full account map, which is how block application stays
/// atomic: mutate a clone, commit on success.
#[derive(Clone, Default)]
pub struct Bank {
    accounts: BTreeMap<u64, Account>,
}

impl Bank {
    pub fn new() -> Self {
        Bank::default()
    }

    pub fn has_account(&self, id: u64) -> bool {
        self.accounts.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn get_account(&self, id: u64) -> Result<&Account, BankError> {
        self.accounts.get(&id).ok_or(BankError::AccountNotFound(id))
    }

    pub fn add(&mut self, account: Account) -> Result<(), BankError> {
        if self.has_account(account.id) {
            return Err(BankError::AccountExists(account.id));
        }
        self.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) {
        self.accounts.remove(&id);
    }

    pub fn reset(&mut self) {
        self.accounts.clear();
    }

    /// Zero for a missing account or token.
    pub fn get_balance(&self, account_id: u64, token_id: u64) -> i64 {
        self.accounts
            .get(&account_id)
            .and_then(|a| a.wallet.balances.get(&token_id))
            .copied()
            .unwrap_or(0)
    }

    /// Negative balances are the token-genesis privilege: only a system
    /// account whose id equals the token id may go below zero.
    fn is_negative_balance_allowed(account_id: u64, token_id: u64) -> bool {
        account_id < ID_FIRST_USER && account_id == token_id
    }

    /// Accounts whose last refresh predates `block_id`; these are due for
    /// renewal.
    pub fn account_ids_before_block_id(&self, block_id: u64) -> Vec<u64> {
        self.accounts
            .values()
            .filter(|a| a.block_id < block_id)
            .map(|a| a.id)
            .collect()
    }

    /// All accounts with positive genesis-token balance, in id order.
    pub fn stakeholders(&self) -> Vec<Stakeholder> {
        self.accounts
            .values()
            .filter_map(|account| {
                let balance = account.wallet.balances.get(&ID_GENESIS).copied().unwrap_or(0);
                (balance > 0).then_some(Stakeholder {
                    id: account.id,
                    stake: balance as u64,
                })
            })
            .collect()
    }

    /// Check that `account_id` can cover a transfer of `amount` in
    /// `token_id` plus `fee` in the genesis token.
    pub fn verify_spending_power(
        &self,
        account_id: u64,
        token_id: u64,
        amount: i64,
        fee: i64,
    ) -> Result<(), BankError> {
        if amount < 0 {
            return Err(BankError::NegativeAmount);
        }
        if fee < 0 {
            return Err(BankError::NegativeFee);
        }
        if !self.has_account(account_id) {
            return Err(BankError::AccountNotFound(account_id));
        }

        let token_balance = self.get_balance(account_id, token_id);
        let allow_negative = Self::is_negative_balance_allowed(account_id, token_id);

        if token_id == ID_GENESIS {
            // Amount and fee come from the same bucket.
            let needed = amount
                .checked_add(fee)
                .ok_or(BankError::BalanceOverflow {
                    account: account_id,
                    token: token_id,
                })?;
            if allow_negative {
                // Underflow is the only limit for the genesis account.
                token_balance
                    .checked_sub(needed)
                    .ok_or(BankError::InsufficientBalance {
                        account: account_id,
                        token: token_id,
                    })?;
            } else if token_balance < needed {
                return Err(BankError::InsufficientBalance {
                    account: account_id,
                    token: token_id,
                });
            }
        } else {
            if allow_negative {
                token_balance
                    .checked_sub(amount)
                    .ok_or(BankError::InsufficientBalance {
                        account: account_id,
                        token: token_id,
                    })?;
            } else if token_balance < amount {
                return Err(BankError::InsufficientBalance {
                    account: account_id,
                    token: token_id,
                });
            }
            // The fee bucket is checked independently.
            if self.get_balance(account_id, ID_GENESIS) < fee {
                return Err(BankError::InsufficientBalance {
                    account: account_id,
                    token: ID_GENESIS,
                });
            }
        }
        Ok(())
    }

    /// Check that the bank's balances equal `expected`, modulo the
    /// genesis-token delta `amount + fee` that a pending transaction will
    /// deduct. All other token balances must match exactly.
    pub fn verify_balance(
        &self,
        account_id: u64,
        amount: i64,
        fee: i64,
        expected: &BTreeMap<u64, i64>,
    ) -> Result<(), BankError> {
        if amount < 0 {
            return Err(BankError::NegativeAmount);
        }
        if fee < 0 {
            return Err(BankError::NegativeFee);
        }
        let account = self.get_account(account_id)?;
        let actual = &account.wallet.balances;

        let balance_of = |map: &BTreeMap<u64, i64>, token: u64| -> i64 {
            map.get(&token).copied().unwrap_or(0)
        };

        // Non-genesis tokens must match exactly in both directions.
        for &token in actual.keys().chain(expected.keys()) {
            if token == ID_GENESIS {
                continue;
            }
            let actual_balance = balance_of(actual, token);
            let expected_balance = balance_of(expected, token);
            if actual_balance != expected_balance {
                return Err(BankError::BalanceMismatch {
                    account: account_id,
                    token,
                    expected: expected_balance,
                    actual: actual_balance,
                });
            }
        }

        let delta = amount.checked_add(fee).ok_or(BankError::BalanceOverflow {
            account: account_id,
            token: ID_GENESIS,
        })?;
        let expected_genesis = balance_of(expected, ID_GENESIS)
            .checked_add(delta)
            .ok_or(BankError::BalanceOverflow {
                account: account_id,
                token: ID_GENESIS,
            })?;
        let actual_genesis = balance_of(actual, ID_GENESIS);
        if actual_genesis != expected_genesis {
            return Err(BankError::BalanceMismatch {
                account: account_id,
                token: ID_GENESIS,
                expected: expected_genesis,
                actual: actual_genesis,
            });
        }
        Ok(())
    }

    pub fn deposit(&mut self, account_id: u64, token_id: u64, amount: i64) -> Result<(), BankError> {
        if amount < 0 {
            return Err(BankError::NegativeAmount);
        }
        let current = self.get_balance(account_id, token_id);
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(BankError::AccountNotFound(account_id))?;
        let updated = current.checked_add(amount).ok_or(BankError::BalanceOverflow {
            account: account_id,
            token: token_id,
        })?;
        account.wallet.balances.insert(token_id, updated);
        Ok(())
    }

    pub fn withdraw(
        &mut self,
        account_id: u64,
        token_id: u64,
        amount: i64,
    ) -> Result<(), BankError> {
        if amount < 0 {
            return Err(BankError::NegativeAmount);
        }
        let current = self.get_balance(account_id, token_id);
        if !Self::is_negative_balance_allowed(account_id, token_id) && current < amount {
            return Err(BankError::InsufficientBalance {
                account: account_id,
                token: token_id,
            });
        }
        let updated = current.checked_sub(amount).ok_or(BankError::BalanceOverflow {
            account: account_id,
            token: token_id,
        })?;
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(BankError::AccountNotFound(account_id))?;
        account.wallet.balances.insert(token_id, updated);
        Ok(())
    }

    /// Move `amount` of `token_id` from `from_id` to `to_id`, burning
    /// `fee` from the source's genesis-token bucket. Either everything
    /// applies or nothing does.
    pub fn transfer_balance(
        &mut self,
        from_id: u64,
        to_id: u64,
        token_id: u64,
        amount: i64,
        fee: i64,
    ) -> Result<(), BankError> {
        self.verify_spending_power(from_id, token_id, amount, fee)?;
        if !self.has_account(to_id) {
            return Err(BankError::AccountNotFound(to_id));
        }

        let to_balance = self.get_balance(to_id, token_id);
        to_balance.checked_add(amount).ok_or(BankError::BalanceOverflow {
            account: to_id,
            token: token_id,
        })?;

        // All checks passed; apply debit, fee burn, and credit.
        let from_balance = self.get_balance(from_id, token_id);
        if token_id == ID_GENESIS {
            let from = self.accounts.get_mut(&from_id).expect("checked above");
            from.wallet
                .balances
                .insert(ID_GENESIS, from_balance - amount - fee);
        } else {
            let genesis_balance = self.get_balance(from_id, ID_GENESIS);
            let from = self.accounts.get_mut(&from_id).expect("checked above");
            from.wallet.balances.insert(token_id, from_balance - amount);
            if fee > 0 {
                from.wallet.balances.insert(ID_GENESIS, genesis_balance - fee);
            }
        }
        let to = self.accounts.get_mut(&to_id).expect("checked above");
        to.wallet.balances.insert(token_id, to_balance + amount);
        Ok(())
    }

    /// Move all positive balances of `account_id` to the recycle account
    /// and erase it. Negative balances are history: a custom-token
    /// genesis account keeps no minting power after write-off.
    pub fn write_off(&mut self, account_id: u64) -> Result<(), BankError> {
        if !self.has_account(ID_RECYCLE) {
            return Err(BankError::AccountNotFound(ID_RECYCLE));
        }
        let account = self
            .accounts
            .remove(&account_id)
            .ok_or(BankError::AccountNotFound(account_id))?;

        for (&token_id, &balance) in &account.wallet.balances {
            if balance > 0 {
                if let Err(error) = self.deposit(ID_RECYCLE, token_id, balance) {
                    // Restore the account so the failed write-off has no
                    // partial effect.
                    self.accounts.insert(account_id, account);
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}
