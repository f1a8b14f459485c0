use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type AccountId = String;
pub type Amount = u128;

pub const WEI_PER_GWEI: Amount = 1_000_000_000;
pub const WEI_PER_ETHER: Amount = 1_000_000_000_000_000_000; // 1 ether = 1e18 value units

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}: needed {needed}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        needed: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("balance overflow in account {account}")]
    Overflow { account: AccountId },
}

/// Moves custodied value between identities.
///
/// The lottery never touches balances directly; every deposit and payout
/// goes through this seam so a failed movement can abort the whole call.
pub trait Custody {
    fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        memo: &str,
    ) -> Result<(), LedgerError>;

    fn balance_of(&self, account: &AccountId) -> Amount;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub sequence: u64,
    pub timestamp: u64,
    pub previous_receipt: Option<[u8; 32]>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub balances: BTreeMap<AccountId, Amount>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_digest")]
    pub merkle_root: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Provision {
        to: AccountId,
        amount: Amount,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    pub balances: BTreeMap<AccountId, Amount>,
    pub events: Vec<LedgerEvent>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions new value into an account. Only genesis allocation uses this.
    pub fn credit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let credited = self
            .balance_of(account)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow {
                account: account.clone(),
            })?;
        self.balances.insert(account.clone(), credited);
        self.events.push(LedgerEvent::Provision {
            to: account.clone(),
            amount,
        });
        Ok(())
    }

    pub fn debit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self
            .balances
            .get_mut(account)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: account.clone(),
            })?;
        if *balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.clone(),
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    /// Registers the account with a zero balance if it is not known yet.
    pub fn open_account(&mut self, account: &AccountId) {
        self.balances.entry(account.clone()).or_insert(0);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            balances: self.balances.clone(),
            events: self.events.clone(),
            merkle_root: compute_merkle_root(&self.balances),
        }
    }

    pub fn record_receipt(&mut self, receipt_id: [u8; 32], timestamp: u64) {
        self.meta.sequence += 1;
        self.meta.timestamp = timestamp;
        self.meta.previous_receipt = Some(receipt_id);
    }

    pub fn total_supply(&self) -> Amount {
        self.balances.values().copied().sum()
    }
}

impl Custody for LedgerState {
    fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        memo: &str,
    ) -> Result<(), LedgerError> {
        let available = *self
            .balances
            .get(from)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: from.clone(),
            })?;
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: from.clone(),
                needed: amount,
                available,
            });
        }
        if from != to {
            // Both sides are checked before either is written.
            let credited = self
                .balance_of(to)
                .checked_add(amount)
                .ok_or_else(|| LedgerError::Overflow { account: to.clone() })?;
            self.debit_account(from, amount)?;
            self.balances.insert(to.clone(), credited);
        }
        self.events.push(LedgerEvent::Transfer {
            from: from.clone(),
            to: to.clone(),
            amount,
            memo: (!memo.is_empty()).then(|| memo.to_string()),
        });
        Ok(())
    }

    fn balance_of(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,
    #[error("malformed amount {0:?}")]
    Malformed(String),
    #[error("unknown unit {0:?} (expected wei, gwei or ether)")]
    UnknownUnit(String),
    #[error("{unit} amounts allow at most {max} fractional digits")]
    TooPrecise { unit: &'static str, max: usize },
    #[error("amount does not fit in 128 bits")]
    Overflow,
}

/// Parses `250`, `5gwei`, `0.02ether` or `3 ether` into value units.
pub fn parse_amount(input: &str) -> Result<Amount, AmountParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AmountParseError::Empty);
    }
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number = number.trim();
    let (unit, decimals) = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "wei" => ("wei", 0usize),
        "gwei" => ("gwei", 9),
        "eth" | "ether" => ("ether", 18),
        other => return Err(AmountParseError::UnknownUnit(other.to_string())),
    };

    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
        return Err(AmountParseError::Malformed(input.to_string()));
    }
    if frac.len() > decimals {
        return Err(AmountParseError::TooPrecise { unit, max: decimals });
    }

    let scale = 10u128.pow(decimals as u32);
    let whole_value: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| AmountParseError::Overflow)?
    };
    let frac_value: u128 = if frac.is_empty() {
        0
    } else {
        let digits: u128 = frac.parse().map_err(|_| AmountParseError::Overflow)?;
        digits * 10u128.pow((decimals - frac.len()) as u32)
    };
    whole_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or(AmountParseError::Overflow)
}

/// Renders value units as a decimal ether string, e.g. `0.06 ether`.
pub fn format_ether(amount: Amount) -> String {
    let whole = amount / WEI_PER_ETHER;
    let frac = amount % WEI_PER_ETHER;
    if frac == 0 {
        return format!("{whole} ether");
    }
    let digits = format!("{frac:018}");
    format!("{whole}.{} ether", digits.trim_end_matches('0'))
}

fn compute_merkle_root(balances: &BTreeMap<AccountId, Amount>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = balances
        .iter()
        .map(|(account, balance)| {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"pot-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

pub(crate) mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }
}
