use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{FileError, RESULT_LOG_FILE};
use crate::model::{ResultQualifier, TradeOutcome, TradeResultRecord};

const FIELD_SEPARATOR: &str = " | ";
const FULL_FIELDS: usize = 6;
const LEGACY_MIN_FIELDS: usize = 3;

/// Agent-side writer. Only ever appends.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(RESULT_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TradeResultRecord) -> Result<(), FileError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FileError::io(&self.path, e))?;
        let line = format!("{}\n", record.to_line());
        file.write_all(line.as_bytes())
            .map_err(|e| FileError::io(&self.path, e))?;
        debug!(line = %line.trim_end(), "📝 Result appended");
        Ok(())
    }
}

/// Parses one log line. Six or more fields is the current format; three to five is the
/// legacy layout, which carries no symbol, so `default_symbol` fills it in.
pub fn parse_line(line: &str, default_symbol: &str) -> Option<TradeResultRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('#') {
        debug!(line = %line, "Skipping comment line in result log");
        return None;
    }

    let parts: Vec<&str> = line.split(FIELD_SEPARATOR).map(str::trim).collect();
    if parts.len() < LEGACY_MIN_FIELDS {
        warn!(line = %line, "Skipping short result log line");
        return None;
    }

    let outcome = match parts[2].parse::<TradeOutcome>() {
        Ok(o) => o,
        Err(e) => {
            warn!(line = %line, error = %e, "Skipping result log line");
            return None;
        }
    };

    let qualifier = parts
        .get(3)
        .map(|f| ResultQualifier::parse(f))
        .unwrap_or_else(|| ResultQualifier::Raw(String::new()));

    let (symbol, trade_id) = if parts.len() >= FULL_FIELDS {
        (parts[4].to_string(), parts[5].to_string())
    } else {
        (default_symbol.to_string(), String::new())
    };

    Some(TradeResultRecord {
        timestamp: parts[0].to_string(),
        action: parts[1].to_string(),
        outcome,
        qualifier,
        symbol,
        trade_id,
    })
}

/// Controller-side reader that remembers how far into the log it has read.
#[derive(Debug)]
pub struct ResultLogTail {
    path: PathBuf,
    offset: u64,
    default_symbol: String,
}

impl ResultLogTail {
    pub fn new(dir: &Path, default_symbol: &str) -> Self {
        Self {
            path: dir.join(RESULT_LOG_FILE),
            offset: 0,
            default_symbol: default_symbol.to_string(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_default_symbol(&mut self, symbol: &str) {
        self.default_symbol = symbol.to_string();
    }

    fn current_len(&self) -> Result<Option<u64>, FileError> {
        match fs::metadata(&self.path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileError::io(&self.path, e)),
        }
    }

    /// Skips everything already in the log.
    pub fn seek_to_end(&mut self) -> Result<(), FileError> {
        self.offset = self.current_len()?.unwrap_or(0);
        Ok(())
    }

    /// Returns the complete lines appended since the previous call. A trailing line
    /// without its newline stays unread until the writer finishes it.
    pub fn read_new(&mut self) -> Result<Vec<TradeResultRecord>, FileError> {
        let len = match self.current_len()? {
            Some(len) => len,
            None => return Ok(Vec::new()),
        };

        if len < self.offset {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Result log shrank, rereading from start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = fs::File::open(&self.path).map_err(|e| FileError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| FileError::io(&self.path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| FileError::io(&self.path, e))?;

        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(Vec::new()),
        };
        self.offset += complete as u64;

        let text = String::from_utf8_lossy(&buf[..complete]);
        Ok(text
            .lines()
            .filter_map(|line| parse_line(line, &self.default_symbol))
            .collect())
    }

    /// Whole log in file order, independent of the tail offset.
    pub fn read_all(&self) -> Result<Vec<TradeResultRecord>, FileError> {
        let text = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileError::io(&self.path, e)),
        };
        Ok(text
            .lines()
            .filter_map(|line| parse_line(line, &self.default_symbol))
            .collect())
    }
}
