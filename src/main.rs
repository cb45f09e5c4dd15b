//! freight - operate an escrow-backed freight marketplace store.

use anyhow::Context;
use clap::{Parser, Subcommand};
use freight_escrow::config::PlatformConfig;
use freight_escrow::escrow::{EscrowId, EscrowStatus};
use freight_escrow::identity::Keypair;
use freight_escrow::ledger::AccountId;
use freight_escrow::logging::init_logging;
use freight_escrow::marketplace::LoadStatus;
use freight_escrow::Platform;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "freight", about = "Escrow-backed freight marketplace")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory; overrides the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level, e.g. "info" or "debug"; overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the auto-release sweeper until interrupted
    Run,
    /// Run one auto-release pass and exit
    Sweep,
    /// Generate a keypair and print its DID
    Keygen,
    /// Show the balances of an account (a DID, "treasury" or "escrow:<id>")
    Balance { account: String },
    /// List ledger transactions
    Transactions {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only transactions touching this account
        #[arg(long)]
        account: Option<String>,
    },
    /// Show one escrow, or list escrows by status
    Escrow {
        id: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// List loads; open loads by default
    Loads {
        #[arg(long)]
        status: Option<String>,
    },
    /// Summary counts across all three services
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PlatformConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PlatformConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    init_logging(config.log_format()?, &config.log_level);

    if let Command::Keygen = cli.command {
        let keypair = Keypair::generate();
        println!("did:    {}", keypair.did());
        println!("secret: {}", hex::encode(keypair.to_bytes()));
        return Ok(());
    }

    let platform = Platform::open(config).context("opening platform")?;

    match cli.command {
        Command::Keygen => {}
        Command::Run => {
            let mut sweeper = platform.spawn_sweeper();
            tokio::signal::ctrl_c().await?;
            tracing::info!("received SIGINT, shutting down");
            sweeper.stop().await;
        }
        Command::Sweep => {
            let released = platform.escrow().sweep_auto_release().await?;
            println!("released {} escrow(s)", released.len());
            for id in released {
                println!("  {}", id);
            }
        }
        Command::Balance { account } => {
            let account: AccountId = account.parse()?;
            let balances = platform.ledger().get_balances(&account)?;
            if balances.is_empty() {
                println!("{}: no funds", account);
            }
            for (asset, amount) in balances {
                println!("{}: {}", account, asset.format_amount(amount));
            }
        }
        Command::Transactions {
            offset,
            limit,
            account,
        } => {
            let txs = match account {
                Some(account) => {
                    let account: AccountId = account.parse()?;
                    platform.ledger().get_account_transactions(&account)?
                }
                None => platform.ledger().get_transactions(offset, limit)?,
            };
            for tx in txs {
                let from = tx.from.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
                let to = tx.to.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "#{:<6} {:<11} {:>24}  {} -> {}  {}",
                    tx.id,
                    format!("{:?}", tx.kind),
                    tx.asset.format_amount(tx.amount),
                    from,
                    to,
                    tx.memo
                );
            }
        }
        Command::Escrow { id, status } => {
            let escrows = match (id, status) {
                (Some(id), _) => vec![platform.escrow().get_escrow(&id.parse::<EscrowId>()?)?],
                (None, Some(status)) => platform
                    .escrow()
                    .get_escrows_by_status(status.parse::<EscrowStatus>()?)?,
                (None, None) => anyhow::bail!("give an escrow id or --status"),
            };
            for escrow in escrows {
                println!(
                    "{}  load {}  {:<17}  {}  fee {}",
                    escrow.id,
                    escrow.load_id,
                    escrow.status.to_string(),
                    escrow.asset.format_amount(escrow.amount),
                    escrow.asset.format_amount(escrow.platform_fee)
                );
                if let Some(dispute) = &escrow.dispute {
                    println!("    disputed by {}: {}", dispute.raised_by.short(), dispute.reason);
                }
            }
        }
        Command::Loads { status } => {
            let loads = match status {
                Some(status) => {
                    let status: LoadStatus = status.parse()?;
                    platform.marketplace().get_loads_by_status(status)?
                }
                None => platform.marketplace().get_available_loads()?,
            };
            for load in loads {
                println!(
                    "{}  {:<10}  {} -> {}  pickup {}  rate {}",
                    load.id, load.status.to_string(), load.origin, load.destination, load.pickup_date, load.rate
                );
            }
        }
        Command::Stats => {
            let market = platform.marketplace().stats()?;
            let escrow = platform.escrow().stats()?;
            let ledger = platform.ledger().stats()?;
            let storage = platform.store().stats()?;

            println!("loads:        {} ({} open)", market.total_loads, market.open_loads);
            println!("bids:         {}", market.total_bids);
            println!("escrows:      {} ({} held)", escrow.total, escrow.held);
            for (status, count) in &escrow.by_status {
                println!("  {:<18} {}", status, count);
            }
            println!("transactions: {}", ledger.transaction_count);
            println!(
                "withdrawals:  {} pending{}",
                ledger.pending_withdrawals,
                if ledger.withdrawals_paused { " (paused)" } else { "" }
            );
            println!("platform fee: {} bps", platform.escrow().platform_fee_bps());
            for (asset, fees) in &ledger.fees_collected {
                println!("fees:         {}", asset.format_amount(*fees));
            }
            println!("disk:         {} bytes", storage.disk_size_bytes);
        }
    }

    platform.flush()?;
    Ok(())
}
