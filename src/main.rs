use std::env;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use trade_guard::bot::{Bot, BotConfig, BotInput};
use trade_guard::config::Config;
use trade_guard::exchanges::Exchange;
use trade_guard::exchanges::bybit::BybitExchange;
use trade_guard::orders::OrderManager;
use trade_guard::safety::{ActivateOutcome, KillSwitch, ResetOutcome};
use trade_guard::storage::{SqliteStorage, SqliteStorageConfig, Storage};

const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";
const INPUT_BUFFER: usize = 256;

fn parse_config_path() -> String {
    for arg in env::args().skip(1) {
        if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}

fn arg_value(prefix: &str) -> Option<String> {
    env::args().skip(1).find_map(|arg| arg.strip_prefix(prefix).map(str::to_string))
}

fn init_tracing(log_level: Option<&str>) {
    let level = match log_level {
        Some("debug") => Level::DEBUG,
        Some("info") => Level::INFO,
        Some("warn") | Some("warning") => Level::WARN,
        Some("error") => Level::ERROR,
        Some("trace") => Level::TRACE,
        _ => Level::INFO,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // stdout carries nothing but logs; inputs arrive on stdin
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config_path = parse_config_path();
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(config.app.log_level.as_deref());

    let storage: Arc<dyn Storage> =
        match SqliteStorage::new(SqliteStorageConfig::from(&config.storage)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!(error = %e, path = %config.storage.path, "Failed to open storage");
                std::process::exit(1);
            }
        };

    let exchange: Arc<dyn Exchange> = match BybitExchange::from_config(&config.exchange) {
        Ok(ex) => Arc::new(ex),
        Err(e) => {
            error!(error = %e, "Failed to create exchange client");
            std::process::exit(1);
        }
    };

    let ok = if env::args().any(|arg| arg == "--status") {
        print_status(storage.clone()).await
    } else if let Some(reason) = arg_value("--kill=") {
        activate_kill_switch(&config, exchange, storage.clone(), &reason).await
    } else if let Some(token) = arg_value("--reset-kill-switch=") {
        reset_kill_switch(&config, storage.clone(), &token).await
    } else {
        run_bot(config, &config_path, exchange, storage.clone()).await
    };

    if let Err(e) = storage.close().await {
        warn!(error = %e, "Failed to close storage");
    }

    if !ok {
        std::process::exit(1);
    }
}

/// Runs the decision loop on NDJSON inputs read from stdin until EOF or Ctrl+C.
async fn run_bot(
    config: Config,
    config_path: &str,
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
) -> bool {
    let bot_config = BotConfig {
        app_config: config,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let bot = match Bot::new(bot_config, exchange, storage).await {
        Ok(bot) => Arc::new(bot),
        Err(e) => {
            error!(error = %e, "Failed to create bot");
            return false;
        }
    };

    info!(config = %config_path, "Bot initialized");

    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    tokio::spawn(read_inputs(tx));

    let stopper = bot.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received");
            stopper.request_stop();
        }
    });

    let result = bot.start(rx).await;
    if let Err(e) = &result {
        error!(error = %e, "Bot error");
    }

    if let Err(e) = bot.stop().await {
        error!(error = %e, "Bot stop failed");
    }

    result.is_ok()
}

/// One JSON object per line. Malformed lines are logged and skipped.
async fn read_inputs(tx: mpsc::Sender<BotInput>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<BotInput>(line) {
            Ok(input) => {
                if tx.send(input).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, line = %line, "ignoring malformed input"),
        }
    }
}

async fn print_status(storage: Arc<dyn Storage>) -> bool {
    let kill_switch = KillSwitch::new(storage.clone(), "");

    match kill_switch.status().await {
        Ok(Some(record)) => println!(
            "kill switch: ACTIVE since {} ({})",
            record.activated_at, record.reason
        ),
        Ok(None) => println!("kill switch: inactive"),
        Err(e) => {
            error!(error = %e, "Failed to read kill switch");
            return false;
        }
    }

    match storage.positions().await {
        Ok(positions) => {
            println!("positions: {}", positions.len());
            for p in positions {
                println!(
                    "  {} {:?} qty={} entry={} upnl={}",
                    p.symbol, p.side, p.quantity, p.entry_price, p.unrealized_pnl
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to read positions");
            return false;
        }
    }

    match storage.all_levels().await {
        Ok(levels) => {
            println!("protective levels: {}", levels.len());
            for l in levels {
                println!(
                    "  {} {} {:?} qty={} sl={} tp={} mode={:?}",
                    l.position_id, l.symbol, l.side, l.quantity, l.stop_price, l.take_profit_price, l.mode
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to read protective levels");
            return false;
        }
    }

    true
}

async fn activate_kill_switch(
    config: &Config,
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
    reason: &str,
) -> bool {
    let kill_switch = Arc::new(KillSwitch::new(storage.clone(), config.kill_switch.reset_token.clone()));

    match kill_switch.activate(reason).await {
        Ok(ActivateOutcome::Activated) => println!("kill switch activated: {}", reason),
        Ok(ActivateOutcome::AlreadyActive(record)) => {
            println!("kill switch already active since {} ({})", record.activated_at, record.reason);
            return true;
        }
        Err(e) => {
            error!(error = %e, "Failed to activate kill switch");
            return false;
        }
    }

    if !config.kill_switch.cancel_orders_on_activate {
        return true;
    }

    let orders = OrderManager::new(
        exchange,
        storage,
        kill_switch,
        config.execution.retry_policy(),
        config.execution.attempt_timeout(),
    );
    match orders.cancel_all(config.exchange.category, None).await {
        Ok(count) => {
            println!("cancelled {} open orders", count);
            true
        }
        Err(e) => {
            error!(error = %e, "Kill switch is active but open orders could not be cancelled");
            false
        }
    }
}

async fn reset_kill_switch(config: &Config, storage: Arc<dyn Storage>, token: &str) -> bool {
    let kill_switch = KillSwitch::new(storage, config.kill_switch.reset_token.clone());

    match kill_switch.reset(token).await {
        Ok(ResetOutcome::Reset) => {
            println!("kill switch reset");
            true
        }
        Ok(ResetOutcome::NotActive) => {
            println!("kill switch is not active");
            true
        }
        Ok(ResetOutcome::InvalidToken) => {
            eprintln!("invalid reset token");
            false
        }
        Err(e) => {
            error!(error = %e, "Failed to reset kill switch");
            false
        }
    }
}
