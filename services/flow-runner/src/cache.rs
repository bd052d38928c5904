//! Signal cache access
//!
//! The external poller writes provider data to a JSON file; the runner reads
//! it under a shared lock once per cycle. Unknown component names and
//! unparseable values are dropped so one bad field never hides a symbol.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::store::FileLock;
use crate::types::{SignalComponent, SignalFlag, SignalSnapshot};

/// Market-wide readings published alongside per-symbol data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSignals {
    /// Implied volatility index level (VIX-style)
    #[serde(default)]
    pub vol_index: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read-only view of the signal cache
pub trait SignalCache: Send + Sync {
    /// Reload from the backing store; called once at the start of each cycle
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self, symbol: &str) -> Option<SignalSnapshot>;

    fn symbols(&self) -> Vec<String>;

    fn market(&self) -> MarketSignals;
}

#[derive(Debug, Default, Deserialize)]
struct RawCacheFile {
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    market: MarketSignals,
    #[serde(default)]
    symbols: BTreeMap<String, RawSnapshot>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    components: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    theme: Option<String>,
    #[serde(default)]
    last_price: Option<f64>,
    #[serde(default)]
    price_change_pct: Option<f64>,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CacheData {
    market: MarketSignals,
    snapshots: HashMap<String, SignalSnapshot>,
}

/// Numeric values pass through; categorical labels map onto the signed scale
fn component_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "bullish" | "positive" | "high" => Some(1.0),
            "bearish" | "negative" | "low" => Some(-1.0),
            "neutral" | "none" => Some(0.0),
            other => other.parse::<f64>().ok().filter(|v| v.is_finite()),
        },
        _ => None,
    }
}

fn parse_cache(raw: RawCacheFile) -> CacheData {
    let fallback_as_of = raw
        .updated_at
        .or(raw.market.updated_at)
        .unwrap_or_default();

    let mut snapshots = HashMap::with_capacity(raw.symbols.len());
    let mut dropped = 0usize;

    for (symbol, entry) in raw.symbols {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let mut snapshot = SignalSnapshot::new(&symbol, entry.as_of.unwrap_or(fallback_as_of));

        for (name, value) in &entry.components {
            match (name.parse::<SignalComponent>(), component_value(value)) {
                (Ok(component), Some(v)) => {
                    snapshot.components.insert(component, v);
                }
                _ => dropped += 1,
            }
        }
        for flag in &entry.flags {
            match flag.parse::<SignalFlag>() {
                Ok(f) => {
                    snapshot.flags.insert(f);
                }
                Err(_) => dropped += 1,
            }
        }
        snapshot.theme = entry.theme;
        snapshot.last_price = entry.last_price.filter(|p| p.is_finite() && *p > 0.0);
        snapshot.price_change_pct = entry.price_change_pct.filter(|p| p.is_finite());
        snapshots.insert(symbol, snapshot);
    }

    if dropped > 0 {
        debug!("Signal cache: dropped {} unrecognized field(s)", dropped);
    }

    CacheData {
        market: raw.market,
        snapshots,
    }
}

/// Signal cache backed by the poller's JSON file
pub struct FileSignalCache {
    path: PathBuf,
    data: RwLock<CacheData>,
}

impl FileSignalCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(CacheData::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Option<RawCacheFile>> {
        let _lock = FileLock::shared(&self.path)?;
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let raw = serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed signal cache {}", self.path.display()))?;
        Ok(Some(raw))
    }
}

impl SignalCache for FileSignalCache {
    /// Keeps the previous contents when the file is unreadable
    fn refresh(&self) -> Result<()> {
        let raw = match self.read_file()? {
            Some(raw) => raw,
            None => {
                warn!("Signal cache {} not found", self.path.display());
                return Ok(());
            }
        };
        let parsed = parse_cache(raw);
        debug!("Signal cache refreshed: {} symbols", parsed.snapshots.len());

        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        *data = parsed;
        Ok(())
    }

    fn snapshot(&self, symbol: &str) -> Option<SignalSnapshot> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.snapshots.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        let mut symbols: Vec<String> = data.snapshots.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn market(&self) -> MarketSignals {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.market.clone()
    }
}

/// In-memory cache, fed directly by tests and the paper harness
#[derive(Default)]
pub struct MemorySignalCache {
    data: RwLock<CacheData>,
}

impl MemorySignalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: SignalSnapshot) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        data.snapshots.insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn remove(&self, symbol: &str) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        data.snapshots.remove(symbol);
    }

    pub fn set_market(&self, market: MarketSignals) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        data.market = market;
    }
}

impl SignalCache for MemorySignalCache {
    fn snapshot(&self, symbol: &str) -> Option<SignalSnapshot> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.snapshots.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        let mut symbols: Vec<String> = data.snapshots.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn market(&self) -> MarketSignals {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.market.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "updated_at": "2026-03-04T15:00:00Z",
        "market": { "vol_index": 21.5 },
        "symbols": {
            "nvda": {
                "components": {
                    "options_flow": 0.8,
                    "dark_pool": "bullish",
                    "iv_skew": "-0.2",
                    "astrology": 1.0,
                    "insider": null
                },
                "flags": ["whale_sweep", "moon_phase"],
                "theme": "semis",
                "last_price": 912.5,
                "as_of": "2026-03-04T14:59:00Z"
            },
            "AAPL": { "components": { "sentiment": 0.3 } }
        }
    }"#;

    #[test]
    fn test_refresh_parses_known_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_cache.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let cache = FileSignalCache::new(&path);
        cache.refresh().unwrap();

        assert_eq!(cache.symbols(), vec!["AAPL", "NVDA"]);
        let nvda = cache.snapshot("NVDA").unwrap();
        assert_eq!(nvda.value(SignalComponent::OptionsFlow), 0.8);
        assert_eq!(nvda.value(SignalComponent::DarkPool), 1.0);
        assert_eq!(nvda.value(SignalComponent::IvSkew), -0.2);
        assert_eq!(nvda.components.len(), 3);
        assert!(nvda.has_flag(SignalFlag::WhaleSweep));
        assert_eq!(nvda.flags.len(), 1);
        assert_eq!(nvda.last_price, Some(912.5));

        // Missing as_of falls back to the file timestamp
        let aapl = cache.snapshot("AAPL").unwrap();
        assert_eq!(aapl.as_of.to_rfc3339(), "2026-03-04T15:00:00+00:00");
        assert_eq!(cache.market().vol_index, Some(21.5));
    }

    #[test]
    fn test_malformed_file_keeps_previous_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_cache.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let cache = FileSignalCache::new(&path);
        cache.refresh().unwrap();

        std::fs::write(&path, "{ truncated").unwrap();
        assert!(cache.refresh().is_err());
        assert!(cache.snapshot("NVDA").is_some());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSignalCache::new(dir.path().join("absent.json"));
        cache.refresh().unwrap();
        assert!(cache.symbols().is_empty());
        assert!(cache.snapshot("SPY").is_none());
    }
}
