use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ipc::snapshot::{modified_secs, read_json};
use crate::ipc::{price_file_name, symbol_from_price_file, PRICE_SUFFIX};
use crate::model::PriceSnapshot;

const GOLD: &str = "XAUUSD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSource {
    pub path: PathBuf,
    pub symbol: String,
}

/// Symbol names to try, most preferred first: the configured symbol, its broker alias
/// (`SYM` / `SYM!`), and the gold pair as a last resort.
pub fn candidate_symbols(primary: &str) -> Vec<String> {
    let mut out = vec![primary.to_string()];
    if primary.contains('!') {
        out.push(primary.replace('!', ""));
    } else {
        out.push(format!("{}!", primary));
    }
    if primary != GOLD {
        out.push(GOLD.to_string());
        out.push(format!("{}!", GOLD));
    }
    out.dedup();
    out
}

/// Freshness of a price file: newest of the embedded timestamp and the mtime.
fn freshness(path: &Path) -> Option<i64> {
    let embedded = read_json::<PriceSnapshot>(path).map(|p| p.timestamp);
    let mtime = modified_secs(path);
    match (embedded, mtime) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn newest(candidates: impl Iterator<Item = (PathBuf, String)>) -> Option<PriceSource> {
    let mut best: Option<(i64, PriceSource)> = None;
    for (path, symbol) in candidates {
        let score = match freshness(&path) {
            Some(s) => s,
            None => continue,
        };
        // Strictly newer wins; ties keep the earlier (more preferred) candidate.
        if best.as_ref().map(|(b, _)| score > *b).unwrap_or(true) {
            best = Some((score, PriceSource { path, symbol }));
        }
    }
    best.map(|(_, source)| source)
}

/// Finds the price file to follow. An explicit override is taken as is; otherwise the
/// freshest existing candidate, otherwise the freshest `*_price.json` in the directory.
pub fn resolve_price_file(dir: &Path, primary: &str, override_name: Option<&str>) -> Option<PriceSource> {
    if let Some(name) = override_name.filter(|n| !n.trim().is_empty()) {
        let path = dir.join(name);
        let symbol = path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(symbol_from_price_file)
            .unwrap_or(primary)
            .to_string();
        debug!(path = %path.display(), "Using configured price file");
        return Some(PriceSource { path, symbol });
    }

    let candidates = candidate_symbols(primary)
        .into_iter()
        .map(|s| (dir.join(price_file_name(&s)), s))
        .filter(|(p, _)| p.is_file());
    if let Some(found) = newest(candidates) {
        info!(path = %found.path.display(), symbol = %found.symbol, "🔎 Price file resolved");
        return Some(found);
    }

    let entries = fs::read_dir(dir).ok()?;
    let mut scanned: Vec<(PathBuf, String)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            if !name.ends_with(PRICE_SUFFIX) {
                return None;
            }
            let symbol = symbol_from_price_file(&name)?.to_string();
            Some((e.path(), symbol))
        })
        .collect();
    scanned.sort();
    let found = newest(scanned.into_iter())?;
    info!(path = %found.path.display(), symbol = %found.symbol, "🔎 Price file resolved by scan");
    Some(found)
}
