//! A single-pot lottery run as a deterministic, auditable ledger program.
//!
//! * [`ledger`]: custodied balances, transfers and snapshot roots.
//! * [`lottery`]: the entry / draw / payout state machine.
//! * [`host`]: an in-process execution environment that feeds caller,
//!   attached value and block entropy into the lottery and keeps receipts.

pub mod host;
pub mod ledger;
pub mod lottery;

pub use host::{Call, CallOutput, Host, HostError};
pub use ledger::{AccountId, Amount, Custody, LedgerError, LedgerState};
pub use lottery::{Draw, DrawEntropy, LotteryConfig, LotteryError, LotteryLedger};
