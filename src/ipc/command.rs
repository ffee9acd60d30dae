use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::snapshot::{write_atomic, write_bytes_atomic};
use super::{COMMAND_FILE, FileError};
use crate::metrics;
use crate::model::{TradeAction, TradeCommand};

/// Anything shorter than this (after trimming) is an empty slot, `{}` included.
pub const MIN_COMMAND_LEN: usize = 10;

pub const EMPTY_SLOT: &[u8] = b"{}";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Missing field '{field}' for {action}")]
    MissingField {
        action: TradeAction,
        field: &'static str,
    },
    #[error("Invalid command: {0}")]
    Invalid(String),
}

/// Decodes slot content into a command and checks the per-action required fields.
pub fn decode(content: &str) -> Result<TradeCommand, CommandError> {
    let cmd: TradeCommand = serde_json::from_str(content.trim())?;
    validate(&cmd)?;
    Ok(cmd)
}

pub fn validate(cmd: &TradeCommand) -> Result<(), CommandError> {
    match cmd.action {
        TradeAction::Buy | TradeAction::Sell => {
            if cmd.symbol.trim().is_empty() {
                return Err(CommandError::MissingField {
                    action: cmd.action,
                    field: "symbol",
                });
            }
        }
        TradeAction::Modify | TradeAction::Close => {
            if cmd.ticket.is_none() {
                return Err(CommandError::MissingField {
                    action: cmd.action,
                    field: "ticket",
                });
            }
        }
    }
    // Both fields are written verbatim into the pipe-delimited result log.
    check_log_safe("symbol", &cmd.symbol)?;
    if let Some(id) = &cmd.trade_id {
        check_log_safe("trade_id", id)?;
    }
    Ok(())
}

fn check_log_safe(field: &str, value: &str) -> Result<(), CommandError> {
    if value.contains(['\n', '\r', '|']) {
        return Err(CommandError::Invalid(format!(
            "{} must not contain line breaks or '|': {:?}",
            field, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandPoll {
    /// Slot missing, empty or already acknowledged.
    Empty,
    /// A decodable command waiting to be dispatched.
    Pending(TradeCommand),
    /// Content present but not a valid command. Left in place for the next tick.
    Rejected,
}

/// The single-slot command file. The agent polls and acknowledges it, the controller
/// writes into it. Neither side locks; the reset to `{}` is the only handshake.
#[derive(Debug)]
pub struct CommandChannel {
    path: PathBuf,
    dir: PathBuf,
    last_rejected: Option<String>,
}

impl CommandChannel {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(COMMAND_FILE),
            dir: dir.to_path_buf(),
            last_rejected: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_raw(&self) -> Result<Option<String>, FileError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileError::io(&self.path, e)),
        }
    }

    // --- Agent side ---

    pub fn poll(&mut self) -> Result<CommandPoll, FileError> {
        let content = match self.read_raw()? {
            Some(c) if c.trim().len() >= MIN_COMMAND_LEN => c,
            _ => {
                self.last_rejected = None;
                return Ok(CommandPoll::Empty);
            }
        };

        match decode(&content) {
            Ok(cmd) => {
                self.last_rejected = None;
                Ok(CommandPoll::Pending(cmd))
            }
            Err(e) => {
                if self.last_rejected.as_deref() != Some(content.as_str()) {
                    warn!(error = %e, content = %content.trim(), "⚠️ Unparseable command left in slot");
                    metrics::inc_command_parse_failures();
                    self.last_rejected = Some(content);
                } else {
                    debug!("Command slot still holds rejected content");
                }
                Ok(CommandPoll::Rejected)
            }
        }
    }

    /// Marks the slot consumed.
    pub fn acknowledge(&self) -> Result<(), FileError> {
        write_bytes_atomic(&self.dir, COMMAND_FILE, EMPTY_SLOT)?;
        Ok(())
    }

    // --- Controller side ---

    /// Whether a command is sitting in the slot unconsumed.
    pub fn is_pending(&self) -> bool {
        matches!(self.read_raw(), Ok(Some(c)) if c.trim().len() >= MIN_COMMAND_LEN)
    }

    /// Writes a command into the slot. Returns true when it replaced one the agent had
    /// not consumed yet (last write wins).
    pub fn submit(&self, cmd: &TradeCommand) -> Result<bool, FileError> {
        let overwrote = self.is_pending();
        if overwrote {
            warn!(action = %cmd.action, "⚠️ Overwriting unconsumed command in slot");
        }
        write_atomic(&self.dir, COMMAND_FILE, cmd)?;
        info!(
            action = %cmd.action,
            symbol = %cmd.symbol,
            trade_id = cmd.trade_id.as_deref().unwrap_or(""),
            "📤 Command written"
        );
        Ok(overwrote)
    }

    pub fn clear(&self) -> Result<(), FileError> {
        self.acknowledge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn channel() -> (CommandChannel, PathBuf) {
        let dir = std::env::temp_dir().join(format!("bridge_cmd_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        (CommandChannel::new(&dir), dir)
    }

    #[test]
    fn test_short_content_is_empty() {
        let (mut ch, dir) = channel();
        assert_eq!(ch.poll().unwrap(), CommandPoll::Empty);

        fs::write(ch.path(), "{}").unwrap();
        assert_eq!(ch.poll().unwrap(), CommandPoll::Empty);

        fs::write(ch.path(), " {  }   \n").unwrap();
        assert_eq!(ch.poll().unwrap(), CommandPoll::Empty);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_submit_then_poll_then_acknowledge() {
        let (mut ch, dir) = channel();
        let mut cmd = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.1));
        cmd.trade_id = Some("t-1".into());

        assert!(!ch.submit(&cmd).unwrap());
        assert!(ch.is_pending());

        match ch.poll().unwrap() {
            CommandPoll::Pending(read) => assert_eq!(read, cmd),
            other => panic!("expected pending command, got {:?}", other),
        }

        ch.acknowledge().unwrap();
        assert_eq!(fs::read_to_string(ch.path()).unwrap(), "{}");
        assert!(!ch.is_pending());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_second_submit_overwrites() {
        let (mut ch, dir) = channel();
        let first = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.1));
        let second = TradeCommand::new(TradeAction::Sell, "XAUUSD", dec!(0.2));

        assert!(!ch.submit(&first).unwrap());
        assert!(ch.submit(&second).unwrap());

        match ch.poll().unwrap() {
            CommandPoll::Pending(read) => assert_eq!(read.action, TradeAction::Sell),
            other => panic!("expected pending command, got {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rejected_content_is_left_in_place() {
        let (mut ch, dir) = channel();
        let raw = r#"{"action":"modify","stop_loss":2300.0}"#;
        fs::write(ch.path(), raw).unwrap();

        assert_eq!(ch.poll().unwrap(), CommandPoll::Rejected);
        assert_eq!(ch.poll().unwrap(), CommandPoll::Rejected);
        assert_eq!(fs::read_to_string(ch.path()).unwrap(), raw);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_decode_required_fields() {
        assert!(matches!(
            decode(r#"{"action":"buy","lot_size":0.1}"#),
            Err(CommandError::MissingField { field: "symbol", .. })
        ));
        assert!(matches!(
            decode(r#"{"action":"close","ticket":0}"#),
            Err(CommandError::MissingField { field: "ticket", .. })
        ));
        assert!(matches!(decode("not json at all"), Err(CommandError::Malformed(_))));
        assert!(decode(r#"{"action":"close","ticket":77,"extra":[1,2]}"#).is_ok());
    }

    #[test]
    fn test_decode_rejects_log_separators() {
        assert!(matches!(
            decode(r#"{"action":"close","ticket":9,"trade_id":"a\nb"}"#),
            Err(CommandError::Invalid(_))
        ));
        assert!(matches!(
            decode(r#"{"action":"close","ticket":9,"trade_id":"a | b"}"#),
            Err(CommandError::Invalid(_))
        ));
        assert!(matches!(
            decode(r#"{"action":"buy","symbol":"XAU\rUSD","lot_size":0.1}"#),
            Err(CommandError::Invalid(_))
        ));
        assert!(decode(r#"{"action":"close","ticket":9,"trade_id":"T-1_ok"}"#).is_ok());
    }
}
