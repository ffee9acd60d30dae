//! File-level protocol shared by the agent and the controller.
//!
//! Every file lives directly in the configured bridge directory. State snapshots are
//! replaced atomically, the command slot is a single JSON object, and the result log is
//! append-only text.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod command;
pub mod result_log;
pub mod snapshot;

pub const ACCOUNT_FILE: &str = "account_info.json";
pub const POSITIONS_FILE: &str = "positions.json";
pub const ORDERS_FILE: &str = "orders.json";
pub const CLOSED_TRADES_FILE: &str = "closed_trades.json";
pub const RATES_FILE: &str = "rates_M1.json";
pub const SYMBOL_INFO_FILE: &str = "symbol_info.json";
pub const COMMAND_FILE: &str = "commands.json";
pub const RESULT_LOG_FILE: &str = "trade_results.txt";

pub const PRICE_SUFFIX: &str = "_price.json";
pub const TICK_SUFFIX: &str = "_tick.json";
pub const ORDER_BOOK_SUFFIX: &str = "_orderbook.json";

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
}

impl FileError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        FileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn price_file_name(symbol: &str) -> String {
    format!("{}{}", symbol, PRICE_SUFFIX)
}

pub fn tick_file_name(symbol: &str) -> String {
    format!("{}{}", symbol, TICK_SUFFIX)
}

pub fn order_book_file_name(symbol: &str) -> String {
    format!("{}{}", symbol, ORDER_BOOK_SUFFIX)
}

/// Symbol encoded in a `{SYMBOL}_price.json` name.
pub fn symbol_from_price_file(name: &str) -> Option<&str> {
    name.strip_suffix(PRICE_SUFFIX).filter(|s| !s.is_empty())
}
