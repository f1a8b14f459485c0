//! The pooled-entry lottery state machine.
//!
//! A [`LotteryLedger`] is deployed once by its administrator and then only
//! changes through [`LotteryLedger::enter`] and [`LotteryLedger::pick_winner`].
//! Caller identity, attached value and block entropy are passed in
//! explicitly, and all value movement goes through a [`Custody`]
//! implementation so a failed transfer aborts the call.

pub mod entropy;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ledger::{AccountId, Amount, Custody, LedgerError, WEI_PER_ETHER};

pub use entropy::DrawEntropy;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryConfig {
    /// Deposits must be strictly greater than this.
    pub minimum_entry: Amount,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            minimum_entry: WEI_PER_ETHER / 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LotteryError {
    #[error("{caller} is not allowed to {action}")]
    Unauthorized {
        caller: AccountId,
        action: &'static str,
    },
    #[error("deposit of {value} must exceed the minimum entry of {minimum}")]
    InsufficientDeposit { value: Amount, minimum: Amount },
    #[error("no entrants to draw from")]
    EmptyPool,
    #[error("pooled balance of {pooled} cannot take a further {value}")]
    PoolOverflow { pooled: Amount, value: Amount },
    #[error("custody transfer failed: {0}")]
    Custody(#[from] LedgerError),
}

/// Outcome of a successful draw.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Draw {
    pub winner: AccountId,
    pub index: usize,
    pub prize: Amount,
    pub entries: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryLedger {
    administrator: AccountId,
    program_account: AccountId,
    config: LotteryConfig,
    entrants: Vec<AccountId>,
    pooled_balance: Amount,
}

impl LotteryLedger {
    /// Creates the ledger. `administrator` is fixed for its whole lifetime and
    /// `program_account` is the identity that holds the pooled deposits.
    pub fn deploy(administrator: AccountId, program_account: AccountId, config: LotteryConfig) -> Self {
        info!(
            administrator = %administrator,
            program = %program_account,
            minimum_entry = config.minimum_entry,
            "lottery deployed"
        );
        Self {
            administrator,
            program_account,
            config,
            entrants: Vec::new(),
            pooled_balance: 0,
        }
    }

    pub fn enter<C: Custody + ?Sized>(
        &mut self,
        caller: &AccountId,
        value: Amount,
        custody: &mut C,
    ) -> Result<(), LotteryError> {
        if value <= self.config.minimum_entry {
            return Err(LotteryError::InsufficientDeposit {
                value,
                minimum: self.config.minimum_entry,
            });
        }
        if caller == &self.administrator || caller == &self.program_account {
            return Err(LotteryError::Unauthorized {
                caller: caller.clone(),
                action: "enter the lottery",
            });
        }
        let pooled = self
            .pooled_balance
            .checked_add(value)
            .ok_or(LotteryError::PoolOverflow {
                pooled: self.pooled_balance,
                value,
            })?;

        custody.transfer(caller, &self.program_account, value, "lottery entry")?;
        self.entrants.push(caller.clone());
        self.pooled_balance = pooled;

        debug!(
            caller = %caller,
            value,
            entries = self.entrants.len(),
            pooled = self.pooled_balance,
            "entry accepted"
        );
        Ok(())
    }

    /// Pays the whole pool to one pseudo-randomly chosen entry and resets.
    ///
    /// Entrants and balance are cleared before the payout leaves custody, so
    /// anything observing the ledger during the transfer sees an empty pool.
    /// If the transfer fails the cleared state is put back untouched.
    pub fn pick_winner<C: Custody + ?Sized>(
        &mut self,
        caller: &AccountId,
        entropy: &DrawEntropy,
        custody: &mut C,
    ) -> Result<Draw, LotteryError> {
        if caller != &self.administrator {
            return Err(LotteryError::Unauthorized {
                caller: caller.clone(),
                action: "pick a winner",
            });
        }
        let index = entropy
            .draw_index(caller, &self.entrants)
            .ok_or(LotteryError::EmptyPool)?;
        let winner = self.entrants[index].clone();

        let entrants = std::mem::take(&mut self.entrants);
        let prize = std::mem::take(&mut self.pooled_balance);

        if let Err(err) = custody.transfer(&self.program_account, &winner, prize, "lottery prize") {
            warn!(winner = %winner, prize, error = %err, "payout failed, draw reverted");
            self.entrants = entrants;
            self.pooled_balance = prize;
            return Err(err.into());
        }

        info!(winner = %winner, index, prize, entries = entrants.len(), "winner paid");
        Ok(Draw {
            winner,
            index,
            prize,
            entries: entrants.len(),
        })
    }

    pub fn players(&self) -> &[AccountId] {
        &self.entrants
    }

    pub fn balance(&self) -> Amount {
        self.pooled_balance
    }

    pub fn administrator(&self) -> &AccountId {
        &self.administrator
    }

    pub fn program_account(&self) -> &AccountId {
        &self.program_account
    }

    pub fn config(&self) -> &LotteryConfig {
        &self.config
    }
}
