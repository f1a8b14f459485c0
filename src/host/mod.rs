use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ledger::{hex_digest, AccountId, Amount, LedgerError, LedgerState};
use crate::lottery::{
    entropy::update_prefixed, Draw, DrawEntropy, LotteryConfig, LotteryError, LotteryLedger,
};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Lottery(#[from] LotteryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{call} does not accept value (got {value})")]
    NonPayable { call: &'static str, value: Amount },
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: u64,
    pub difficulty: u64,
}

impl BlockContext {
    pub fn genesis(timestamp: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"genesis");
        hasher.update(timestamp.to_be_bytes());
        Self {
            height: 0,
            timestamp,
            difficulty: leading_u64(&hasher.finalize().into()),
        }
    }

    pub fn entropy(&self) -> DrawEntropy {
        DrawEntropy::new(self.timestamp, self.difficulty)
    }

    fn next(&self, timestamp: u64, parent: Option<&[u8; 32]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"block");
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(parent.unwrap_or(&[0u8; 32]));
        Self {
            height: self.height + 1,
            timestamp: timestamp.max(self.timestamp),
            difficulty: leading_u64(&hasher.finalize().into()),
        }
    }
}

fn leading_u64(digest: &[u8; 32]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Enter,
    PickWinner,
    GetPlayers,
    GetBalance,
    Manager,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Enter => "enter",
            Call::PickWinner => "pickWinner",
            Call::GetPlayers => "getPlayers",
            Call::GetBalance => "getBalance",
            Call::Manager => "manager",
        }
    }

    pub fn is_payable(&self) -> bool {
        matches!(self, Call::Enter)
    }

    /// Transactions mutate state and leave a receipt; the rest are reads.
    pub fn is_transaction(&self) -> bool {
        matches!(self, Call::Enter | Call::PickWinner)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutput {
    Unit,
    Players { players: Vec<AccountId> },
    Balance { balance: Amount },
    Manager { manager: AccountId },
    Winner { draw: Draw },
}

impl CallOutput {
    fn commitment(&self, buf: &mut Vec<u8>) {
        match self {
            CallOutput::Unit => buf.extend_from_slice(b"unit"),
            CallOutput::Players { players } => {
                buf.extend_from_slice(b"players");
                buf.extend_from_slice(&(players.len() as u64).to_le_bytes());
                for player in players {
                    push_prefixed(buf, player.as_bytes());
                }
            }
            CallOutput::Balance { balance } => {
                buf.extend_from_slice(b"balance");
                buf.extend_from_slice(&balance.to_le_bytes());
            }
            CallOutput::Manager { manager } => {
                buf.extend_from_slice(b"manager");
                push_prefixed(buf, manager.as_bytes());
            }
            CallOutput::Winner { draw } => {
                buf.extend_from_slice(b"winner");
                push_prefixed(buf, draw.winner.as_bytes());
                buf.extend_from_slice(&(draw.index as u64).to_le_bytes());
                buf.extend_from_slice(&draw.prize.to_le_bytes());
            }
        }
    }
}

/// Appends `bytes` behind a length so adjacent fields cannot run together.
fn push_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Accepted { output: CallOutput },
    Rejected { reason: String },
}

impl ReceiptOutcome {
    pub fn commitment(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ReceiptOutcome::Accepted { output } => {
                buf.extend_from_slice(b"accepted");
                output.commitment(&mut buf);
            }
            ReceiptOutcome::Rejected { reason } => {
                buf.extend_from_slice(b"rejected");
                push_prefixed(&mut buf, reason.as_bytes());
            }
        }
        buf
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiptOutcome::Accepted { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub block_height: u64,
    pub timestamp: u64,
    pub caller: AccountId,
    pub value: Amount,
    pub call: Call,
    pub outcome: ReceiptOutcome,
    #[serde(with = "hex_digest")]
    pub digest: [u8; 32],
}

impl Receipt {
    fn seal(
        block: &BlockContext,
        caller: &AccountId,
        value: Amount,
        call: Call,
        outcome: ReceiptOutcome,
        previous: Option<&[u8; 32]>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(previous.unwrap_or(&[0u8; 32]));
        hasher.update(block.height.to_le_bytes());
        hasher.update(block.timestamp.to_le_bytes());
        update_prefixed(&mut hasher, caller.as_bytes());
        hasher.update(value.to_le_bytes());
        update_prefixed(&mut hasher, call.name().as_bytes());
        update_prefixed(&mut hasher, &outcome.commitment());
        Self {
            block_height: block.height,
            timestamp: block.timestamp,
            caller: caller.clone(),
            value,
            call,
            outcome,
            digest: hasher.finalize().into(),
        }
    }
}

/// Address that holds the pot for a lottery deployed by `deployer`.
pub fn program_address(deployer: &AccountId) -> AccountId {
    let mut hasher = Sha256::new();
    hasher.update(b"pot-lottery-program");
    hasher.update(deployer.as_bytes());
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[..20]))
}

/// In-process execution environment: one lottery, its custody ledger and a
/// block context. Calls run one at a time to completion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    block: BlockContext,
    ledger: LedgerState,
    lottery: LotteryLedger,
    receipts: Vec<Receipt>,
}

impl Host {
    pub fn genesis(
        administrator: AccountId,
        allocations: &[(AccountId, Amount)],
        config: LotteryConfig,
        timestamp: u64,
    ) -> Result<Self, HostError> {
        let mut ledger = LedgerState::new();
        for (account, amount) in allocations {
            ledger.credit_account(account, *amount)?;
        }
        ledger.open_account(&administrator);
        let program = program_address(&administrator);
        ledger.open_account(&program);
        let lottery = LotteryLedger::deploy(administrator, program, config);
        info!(accounts = ledger.balances.len(), "genesis complete");
        Ok(Self {
            block: BlockContext::genesis(timestamp),
            ledger,
            lottery,
            receipts: Vec::new(),
        })
    }

    /// Moves the clock forward; earlier timestamps are ignored.
    pub fn advance_to(&mut self, timestamp: u64) {
        self.block.timestamp = self.block.timestamp.max(timestamp);
    }

    pub fn execute(
        &mut self,
        caller: &AccountId,
        value: Amount,
        call: Call,
    ) -> Result<CallOutput, HostError> {
        debug!(caller = %caller, value, call = call.name(), "executing call");
        let result = self.dispatch(caller, value, &call);
        if call.is_transaction() {
            let outcome = match &result {
                Ok(output) => ReceiptOutcome::Accepted {
                    output: output.clone(),
                },
                Err(err) => ReceiptOutcome::Rejected {
                    reason: err.to_string(),
                },
            };
            self.commit(caller, value, call, outcome);
        }
        if let Err(err) = &result {
            warn!(caller = %caller, error = %err, "call rejected");
        }
        result
    }

    fn dispatch(&mut self, caller: &AccountId, value: Amount, call: &Call) -> Result<CallOutput, HostError> {
        if value > 0 && !call.is_payable() {
            return Err(HostError::NonPayable {
                call: call.name(),
                value,
            });
        }
        let output = match call {
            Call::Enter => {
                self.lottery.enter(caller, value, &mut self.ledger)?;
                CallOutput::Unit
            }
            Call::PickWinner => {
                let entropy = self.block.entropy();
                let draw = self.lottery.pick_winner(caller, &entropy, &mut self.ledger)?;
                CallOutput::Winner { draw }
            }
            Call::GetPlayers => CallOutput::Players {
                players: self.lottery.players().to_vec(),
            },
            Call::GetBalance => CallOutput::Balance {
                balance: self.lottery.balance(),
            },
            Call::Manager => CallOutput::Manager {
                manager: self.lottery.administrator().clone(),
            },
        };
        Ok(output)
    }

    /// Appends the receipt and mines the next block on top of it.
    fn commit(&mut self, caller: &AccountId, value: Amount, call: Call, outcome: ReceiptOutcome) {
        let previous = self.receipts.last().map(|r| r.digest);
        let accepted = outcome.is_accepted();
        let receipt = Receipt::seal(&self.block, caller, value, call, outcome, previous.as_ref());
        if accepted {
            self.ledger.record_receipt(receipt.digest, receipt.timestamp);
        }
        self.block = self.block.next(self.block.timestamp, Some(&receipt.digest));
        self.receipts.push(receipt);
    }

    pub fn block(&self) -> &BlockContext {
        &self.block
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn lottery(&self) -> &LotteryLedger {
        &self.lottery
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let bytes = fs::read(path).map_err(|source| HostError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| HostError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), HostError> {
        let io_err = |source| HostError::Io {
            path: path.display().to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| HostError::Json {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Written aside and renamed so a crash never leaves half a state file.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, bytes).map_err(io_err)?;
        fs::rename(&staging, path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ledger::{Custody, WEI_PER_ETHER};

    const ADMIN: &str = "0xmanager";

    fn host() -> Host {
        let allocations: Vec<(AccountId, Amount)> = ["0xa1", "0xa2", "0xa3", ADMIN]
            .iter()
            .map(|a| (a.to_string(), 100 * WEI_PER_ETHER))
            .collect();
        Host::genesis(ADMIN.into(), &allocations, LotteryConfig::default(), 1_700_000_000).unwrap()
    }

    fn players(host: &mut Host) -> Vec<AccountId> {
        match host.execute(&"0xa1".into(), 0, Call::GetPlayers).unwrap() {
            CallOutput::Players { players } => players,
            other => panic!("unexpected output {other:?}"),
        }
    }

    fn pot(host: &mut Host) -> Amount {
        match host.execute(&ADMIN.into(), 0, Call::GetBalance).unwrap() {
            CallOutput::Balance { balance } => balance,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn deploys_with_manager() {
        let mut host = host();
        let output = host.execute(&"0xa2".into(), 0, Call::Manager).unwrap();
        assert_eq!(output, CallOutput::Manager { manager: ADMIN.into() });
        assert_eq!(host.lottery().program_account(), &program_address(&ADMIN.into()));
        assert!(players(&mut host).is_empty());
    }

    #[test]
    fn three_entries_then_reads() {
        let mut host = host();
        let stake = 2 * WEI_PER_ETHER / 100;
        for caller in ["0xa1", "0xa2", "0xa3"] {
            host.execute(&caller.into(), stake, Call::Enter).unwrap();
        }
        assert_eq!(players(&mut host), ["0xa1", "0xa2", "0xa3"].map(String::from));
        assert_eq!(pot(&mut host), 6 * WEI_PER_ETHER / 100);
        assert_eq!(host.receipts().len(), 3);
    }

    #[test]
    fn value_on_non_payable_call_is_rejected() {
        let mut host = host();
        host.execute(&"0xa1".into(), WEI_PER_ETHER, Call::Enter).unwrap();
        let ledger_before = host.ledger().clone();
        let lottery_before = host.lottery().clone();

        let err = host
            .execute(&ADMIN.into(), 1, Call::PickWinner)
            .unwrap_err();

        assert!(matches!(err, HostError::NonPayable { call: "pickWinner", value: 1 }));
        assert_eq!(host.ledger(), &ledger_before);
        assert_eq!(host.lottery(), &lottery_before);
        let last = host.receipts().last().unwrap();
        assert!(!last.outcome.is_accepted());
    }

    #[test]
    fn rejected_transactions_leave_receipts_but_no_state() {
        let mut host = host();
        let err = host.execute(&"0xa1".into(), 0, Call::PickWinner).unwrap_err();
        assert!(matches!(err, HostError::Lottery(LotteryError::Unauthorized { .. })));
        let err = host.execute(&ADMIN.into(), 0, Call::PickWinner).unwrap_err();
        assert!(matches!(err, HostError::Lottery(LotteryError::EmptyPool)));
        assert_eq!(host.receipts().len(), 2);
        assert!(host.receipts().iter().all(|r| !r.outcome.is_accepted()));
        assert_eq!(host.ledger().meta.sequence, 0);
    }

    #[test]
    fn draw_pays_the_winner_through_custody() {
        let mut host = host();
        host.execute(&"0xa1".into(), 3 * WEI_PER_ETHER, Call::Enter).unwrap();
        let initial = host.ledger().balance_of(&"0xa1".into());
        let supply = host.ledger().total_supply();

        let output = host.execute(&ADMIN.into(), 0, Call::PickWinner).unwrap();

        let CallOutput::Winner { draw } = output else {
            panic!("expected a draw");
        };
        assert_eq!(draw.winner, "0xa1");
        let gained = host.ledger().balance_of(&"0xa1".into()) - initial;
        assert!(gained > 18 * WEI_PER_ETHER / 10);
        assert_eq!(pot(&mut host), 0);
        assert!(players(&mut host).is_empty());
        assert_eq!(host.ledger().balance_of(host.lottery().program_account()), 0);
        assert_eq!(host.ledger().total_supply(), supply);
    }

    #[test]
    fn receipts_are_chained_and_blocks_advance() {
        let mut host = host();
        let genesis = *host.block();
        host.execute(&"0xa1".into(), WEI_PER_ETHER, Call::Enter).unwrap();
        host.advance_to(1_700_000_100);
        host.execute(&"0xa2".into(), WEI_PER_ETHER, Call::Enter).unwrap();

        let receipts = host.receipts();
        assert_ne!(receipts[0].digest, receipts[1].digest);
        assert_eq!(receipts[1].timestamp, 1_700_000_100);
        assert_eq!(host.block().height, genesis.height + 2);
        assert_ne!(host.block().difficulty, genesis.difficulty);
        assert_eq!(host.ledger().meta.previous_receipt, Some(receipts[1].digest));
        assert_eq!(host.ledger().meta.sequence, 2);

        host.advance_to(5);
        assert_eq!(host.block().timestamp, 1_700_000_100);
    }

    #[test]
    fn reads_do_not_mine_blocks() {
        let mut host = host();
        let before = *host.block();
        players(&mut host);
        pot(&mut host);
        assert_eq!(*host.block(), before);
        assert!(host.receipts().is_empty());
    }

    #[test]
    fn reads_are_idempotent() {
        let mut host = host();
        for caller in ["0xa1", "0xa2"] {
            host.execute(&caller.into(), WEI_PER_ETHER, Call::Enter).unwrap();
        }
        let block = *host.block();
        let receipts = host.receipts().to_vec();
        let ledger = host.ledger().clone();

        let first = host.execute(&"0xa3".into(), 0, Call::GetBalance).unwrap();
        let second = host.execute(&"0xa3".into(), 0, Call::GetBalance).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, CallOutput::Balance { balance: 2 * WEI_PER_ETHER });
        let first = host.execute(&ADMIN.into(), 0, Call::GetPlayers).unwrap();
        let second = host.execute(&ADMIN.into(), 0, Call::GetPlayers).unwrap();
        assert_eq!(first, second);

        assert_eq!(*host.block(), block);
        assert_eq!(host.receipts(), receipts.as_slice());
        assert_eq!(host.ledger(), &ledger);
    }

    #[test]
    fn player_commitments_do_not_run_together() {
        let split = |ids: [&str; 2]| {
            let output = CallOutput::Players {
                players: ids.map(String::from).to_vec(),
            };
            ReceiptOutcome::Accepted { output }.commitment()
        };
        assert_ne!(split(["ab", "c"]), split(["a", "bc"]));

        let rejected = |reason: &str| ReceiptOutcome::Rejected { reason: reason.into() }.commitment();
        assert_ne!(rejected("ab"), rejected("a"));
    }

    #[test]
    fn receipt_digest_separates_caller_from_call() {
        let block = BlockContext::genesis(1);
        let outcome = ReceiptOutcome::Accepted { output: CallOutput::Unit };
        let a = Receipt::seal(&block, &"0xa".into(), 0, Call::Enter, outcome.clone(), None);
        let b = Receipt::seal(&block, &"0xa1".into(), 0, Call::Enter, outcome, None);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn amounts_beyond_u64_survive_json() {
        let whale = 20 * WEI_PER_ETHER;
        assert!(whale > u64::MAX as Amount);
        let mut host = Host::genesis(
            ADMIN.into(),
            &[("0xwhale".into(), whale)],
            LotteryConfig::default(),
            1_700_000_000,
        )
        .unwrap();
        host.execute(&"0xwhale".into(), 19 * WEI_PER_ETHER, Call::Enter).unwrap();
        assert!(pot(&mut host) > u64::MAX as Amount);
        host.execute(&ADMIN.into(), 0, Call::PickWinner).unwrap();

        let encoded = serde_json::to_string(&host).unwrap();
        let decoded: Host = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, host);
        assert_eq!(decoded.ledger().balance_of(&"0xwhale".into()), whale);
        let ReceiptOutcome::Accepted {
            output: CallOutput::Winner { draw },
        } = &decoded.receipts()[1].outcome
        else {
            panic!("expected a draw receipt");
        };
        assert_eq!(draw.prize, 19 * WEI_PER_ETHER);
    }

    #[test]
    fn state_survives_save_and_load() {
        let mut host = host();
        host.execute(&"0xa1".into(), WEI_PER_ETHER, Call::Enter).unwrap();
        let dir = std::env::temp_dir().join(format!("pot-lottery-{}", std::process::id()));
        let path = dir.join("state.json");

        host.save(&path).unwrap();
        let mut restored = Host::load(&path).unwrap();
        fs::remove_dir_all(&dir).ok();

        assert_eq!(restored, host);
        restored.execute(&"0xa2".into(), WEI_PER_ETHER, Call::Enter).unwrap();
        assert_eq!(players(&mut restored), ["0xa1", "0xa2"].map(String::from));
    }

    #[test]
    fn loading_missing_state_reports_path() {
        let err = Host::load(Path::new("/nonexistent/pot-lottery/state.json")).unwrap_err();
        assert!(matches!(err, HostError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/pot-lottery/state.json"));
    }
}
