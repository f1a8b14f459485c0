use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pot_lottery::{
    ledger::{format_ether, parse_amount},
    AccountId, Amount, Call, CallOutput, Host, HostError, LotteryConfig,
};

#[derive(Parser)]
#[command(name = "pot-lottery", version, about = "Pooled-entry lottery ledger")]
struct Cli {
    /// State file holding balances, the lottery and its receipts.
    #[arg(long, global = true, default_value = "lottery-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a state file with funded accounts and a freshly deployed lottery.
    Genesis {
        /// Deploying account; becomes the lottery manager.
        #[arg(long)]
        admin: AccountId,
        /// Initial balance as ACCOUNT=AMOUNT, e.g. 0xab..=100ether (repeatable).
        #[arg(long = "fund", value_parser = allocation_arg)]
        fund: Vec<(AccountId, Amount)>,
        /// Entries must send strictly more than this.
        #[arg(long, value_parser = amount_arg, default_value = "0.01ether")]
        min_entry: Amount,
        /// Overwrite an existing state file.
        #[arg(long)]
        force: bool,
    },
    /// Generate an ed25519 key pair and print the derived account id.
    Keygen {
        /// Also write sk.hex and pk.hex into this directory.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Enter the lottery with an attached deposit.
    Enter {
        #[arg(long)]
        from: AccountId,
        /// Amount with optional unit: 250, 5gwei, 0.02ether.
        #[arg(long, value_parser = amount_arg)]
        value: Amount,
    },
    /// Draw a winner and pay out the whole pot (manager only).
    PickWinner {
        #[arg(long)]
        from: AccountId,
    },
    /// List entrants in entry order.
    Players {
        #[arg(long)]
        from: Option<AccountId>,
    },
    /// Show the pooled balance.
    Balance {
        #[arg(long)]
        from: Option<AccountId>,
    },
    /// Show the lottery manager.
    Manager,
    /// Dump the custody ledger snapshot as JSON.
    Accounts,
    /// Dump the receipt log as JSON.
    Receipts,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("state file {0} already exists (use --force to overwrite)")]
    StateExists(PathBuf),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json encoding: {0}")]
    Json(#[from] serde_json::Error),
}

fn amount_arg(s: &str) -> Result<Amount, String> {
    parse_amount(s).map_err(|e| e.to_string())
}

fn allocation_arg(s: &str) -> Result<(AccountId, Amount), String> {
    let (account, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ACCOUNT=AMOUNT, got {s:?}"))?;
    let account = account.trim();
    if account.is_empty() {
        return Err("account must not be empty".to_string());
    }
    Ok((account.to_string(), amount_arg(amount)?))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `0x` + first 20 bytes of SHA-256 over the public key.
fn account_id(key: &SigningKey) -> AccountId {
    let digest = Sha256::digest(key.verifying_key().as_bytes());
    format!("0x{}", hex::encode(&digest[..20]))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    fs::write(path, bytes).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

//==================== commands ====================//

fn genesis_cmd(
    state: &Path,
    admin: AccountId,
    fund: Vec<(AccountId, Amount)>,
    min_entry: Amount,
    force: bool,
) -> Result<(), CliError> {
    if state.exists() && !force {
        return Err(CliError::StateExists(state.to_path_buf()));
    }
    let config = LotteryConfig {
        minimum_entry: min_entry,
    };
    let host = Host::genesis(admin, &fund, config, now_secs())?;
    host.save(state)?;
    println!("manager  {}", host.lottery().administrator());
    println!("program  {}", host.lottery().program_account());
    println!("accounts {}", host.ledger().balances.len());
    println!("state    {}", state.display());
    Ok(())
}

fn keygen_cmd(out_dir: Option<PathBuf>) -> Result<(), CliError> {
    let sk = SigningKey::generate(&mut OsRng);
    let account = account_id(&sk);
    if let Some(dir) = out_dir {
        fs::create_dir_all(&dir).map_err(|source| CliError::Io {
            path: dir.clone(),
            source,
        })?;
        write_file(&dir.join("sk.hex"), hex::encode(sk.to_bytes()).as_bytes())?;
        write_file(
            &dir.join("pk.hex"),
            hex::encode(sk.verifying_key().as_bytes()).as_bytes(),
        )?;
        info!(dir = %dir.display(), "keypair written");
    }
    println!("{account}");
    Ok(())
}

/// Runs a state-changing call and persists the result, rejected or not.
fn transact(state: &Path, caller: &AccountId, value: Amount, call: Call) -> Result<CallOutput, CliError> {
    let mut host = Host::load(state)?;
    host.advance_to(now_secs());
    let result = host.execute(caller, value, call);
    host.save(state)?;
    Ok(result?)
}

fn query(state: &Path, caller: Option<AccountId>, call: Call) -> Result<CallOutput, CliError> {
    let mut host = Host::load(state)?;
    let caller = caller.unwrap_or_else(|| host.lottery().administrator().clone());
    Ok(host.execute(&caller, 0, call)?)
}

fn print_output(output: &CallOutput) -> Result<(), CliError> {
    match output {
        CallOutput::Unit => println!("ok"),
        CallOutput::Players { players } => {
            for player in players {
                println!("{player}");
            }
        }
        CallOutput::Balance { balance } => println!("{balance} ({})", format_ether(*balance)),
        CallOutput::Manager { manager } => println!("{manager}"),
        CallOutput::Winner { draw } => println!("{}", serde_json::to_string_pretty(draw)?),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let state = cli.state.as_path();
    match cli.command {
        Command::Genesis {
            admin,
            fund,
            min_entry,
            force,
        } => genesis_cmd(state, admin, fund, min_entry, force),
        Command::Keygen { out_dir } => keygen_cmd(out_dir),
        Command::Enter { from, value } => print_output(&transact(state, &from, value, Call::Enter)?),
        Command::PickWinner { from } => print_output(&transact(state, &from, 0, Call::PickWinner)?),
        Command::Players { from } => print_output(&query(state, from, Call::GetPlayers)?),
        Command::Balance { from } => print_output(&query(state, from, Call::GetBalance)?),
        Command::Manager => print_output(&query(state, None, Call::Manager)?),
        Command::Accounts => {
            let host = Host::load(state)?;
            println!("{}", serde_json::to_string_pretty(&host.ledger().snapshot())?);
            Ok(())
        }
        Command::Receipts => {
            let host = Host::load(state)?;
            println!("{}", serde_json::to_string_pretty(host.receipts())?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ (CliError::StateExists(_) | CliError::Io { .. })) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
