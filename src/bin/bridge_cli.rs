use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use file_bridge_rs::config::Settings;
use file_bridge_rs::context::BridgeContext;
use file_bridge_rs::controller::{BridgeClient, OrderParams};
use file_bridge_rs::error::BridgeError;
use file_bridge_rs::telemetry;

#[derive(Parser)]
#[command(name = "bridge-cli", about = "Controller for the file bridge agent")]
struct Cli {
    /// Shared bridge directory (overrides configuration)
    #[arg(long, global = true)]
    files_dir: Option<PathBuf>,
    /// Primary symbol (overrides configuration)
    #[arg(long, global = true)]
    symbol: Option<String>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connection, price and account summary
    Status,
    /// Follow the heartbeat and result log until interrupted
    Watch {
        #[arg(long, default_value_t = 5000)]
        every_ms: u64,
    },
    Buy(OpenArgs),
    Sell(OpenArgs),
    Modify {
        ticket: u64,
        #[arg(long)]
        sl: Option<Decimal>,
        #[arg(long)]
        tp: Option<Decimal>,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    Close {
        ticket: u64,
        /// Partial close volume; whole position when omitted
        #[arg(long)]
        volume: Option<Decimal>,
        #[arg(long, default_value = "")]
        comment: String,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Result log rows, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reset the command slot
    Clear,
}

#[derive(Args)]
struct OpenArgs {
    lot: Decimal,
    #[arg(long)]
    sl: Option<Decimal>,
    #[arg(long)]
    tp: Option<Decimal>,
    #[arg(long, default_value = "")]
    comment: String,
    #[arg(long)]
    magic: Option<i64>,
    #[arg(long)]
    trade_id: Option<String>,
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

impl OpenArgs {
    fn params(&self) -> OrderParams {
        OrderParams {
            stop_loss: self.sl,
            take_profit: self.tp,
            comment: self.comment.clone(),
            magic_number: self.magic,
            trade_id: self.trade_id.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("❌ {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let mut settings = Settings::new()?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if let Some(dir) = cli.files_dir {
        settings.bridge.files_dir = Some(dir);
    }
    if let Some(symbol) = cli.symbol {
        settings.bridge.primary_symbol = symbol;
    }
    telemetry::init_tracing(&settings.logging)?;

    let mut client = BridgeClient::new(BridgeContext::new_system(), settings.bridge.clone())?;
    client.connect()?;

    match cli.command.unwrap_or(Command::Status) {
        Command::Status => print_status(&mut client),
        Command::Watch { every_ms } => watch_bridge(&mut client, Duration::from_millis(every_ms)).await,
        Command::Buy(args) => {
            let id = client.place_buy(args.lot, args.params())?;
            await_result(&mut client, &id, args.wait_secs).await
        }
        Command::Sell(args) => {
            let id = client.place_sell(args.lot, args.params())?;
            await_result(&mut client, &id, args.wait_secs).await
        }
        Command::Modify { ticket, sl, tp, wait_secs } => {
            let id = client.modify_position(ticket, sl, tp)?;
            await_result(&mut client, &id, wait_secs).await
        }
        Command::Close { ticket, volume, comment, wait_secs } => {
            let id = client.close_position(ticket, volume, &comment)?;
            await_result(&mut client, &id, wait_secs).await
        }
        Command::History { limit } => {
            for row in client.trade_history(limit)? {
                println!("{}", row.to_line());
            }
            Ok(())
        }
        Command::Clear => client.clear_command_file(),
    }
}

fn print_status(client: &mut BridgeClient) -> Result<(), BridgeError> {
    let test = client.test_connection();
    println!("{} {}", if test.ok { "✅" } else { "❌" }, test.message);

    let info = client.connection_info();
    println!(
        "{}",
        serde_json::to_string_pretty(&info).unwrap_or_else(|_| format!("{:?}", info))
    );

    if let Some(price) = client.market_data() {
        println!(
            "{} bid={} ask={} spread={}",
            price.symbol,
            price.bid,
            price.ask,
            price.spread()
        );
    }
    if let Some(account) = client.account() {
        println!(
            "account {} balance={} equity={} free_margin={} margin_level={:.2}%",
            account.login,
            account.balance,
            account.equity,
            account.free_margin,
            account.margin_level()
        );
    }
    if let Some(book) = client.order_book() {
        let show = |v: Option<Decimal>| v.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!("book best_bid={} best_ask={}", show(book.best_bid()), show(book.best_ask()));
    }
    for p in client.positions().unwrap_or_default() {
        println!(
            "#{} {} {} {} @ {} sl={} tp={} profit={}",
            p.ticket, p.symbol, p.side.as_str(), p.volume, p.price_open, p.sl, p.tp, p.profit
        );
    }
    for t in client.closed_trades(5).unwrap_or_default() {
        println!(
            "closed #{} {} {} {} {} -> {} {} ({})",
            t.ticket,
            t.close_time,
            t.symbol,
            t.side.as_str(),
            t.entry_price,
            t.exit_price,
            t.formatted_profit(),
            t.formatted_change()
        );
    }
    Ok(())
}

async fn await_result(client: &mut BridgeClient, trade_id: &str, wait_secs: u64) -> Result<(), BridgeError> {
    info!(trade_id = %trade_id, "Command sent, waiting for result");
    match client
        .wait_for_result(trade_id, Duration::from_secs(wait_secs))
        .await?
    {
        Some(row) => {
            println!("{}", row.to_line());
            Ok(())
        }
        None => {
            println!("no result for {} within {}s", trade_id, wait_secs);
            Ok(())
        }
    }
}

async fn watch_bridge(client: &mut BridgeClient, every: Duration) -> Result<(), BridgeError> {
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !client.check_heartbeat() {
                    warn!("Agent heartbeat stale");
                }
                for row in client.trade_results()? {
                    println!("{}", row.to_line());
                }
            }
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}
