use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Tunables for one cell. Durations are carried as milliseconds so the
/// config can round-trip through JSON unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    pub name: String,
    /// Negotiated session TTL handed to new sessions.
    pub session_ttl_ms: u64,
    /// How long before TTL expiry a missed renewal trips jeopardy.
    pub jeopardy_margin_ms: u64,
    /// Fixed window a jeopardized session has to recover before expiry.
    /// Independent of the TTL; conventionally a small multiple of it.
    pub grace_period_ms: u64,
    /// Upper bound on one keep-alive store round-trip, retries included.
    /// Must stay below the jeopardy margin.
    pub keep_alive_timeout_ms: u64,
    /// Cadence of the session/lock sweeper task.
    pub sweep_interval_ms: u64,
    /// How long an empty lock record lingers before reclamation.
    pub lock_quiescence_ms: u64,
    /// Bound on each subscriber's undelivered event queue.
    pub event_queue_depth: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            session_ttl_ms: 12_000,
            jeopardy_margin_ms: 3_000,
            grace_period_ms: 45_000,
            keep_alive_timeout_ms: 2_000,
            sweep_interval_ms: 100,
            lock_quiescence_ms: 5_000,
            event_queue_depth: 128,
        }
    }
}

impl CellConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn jeopardy_margin(&self) -> Duration {
        Duration::from_millis(self.jeopardy_margin_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn lock_quiescence(&self) -> Duration {
        Duration::from_millis(self.lock_quiescence_ms)
    }
}

/// Deployment map from cell name to that cell's store endpoints. Cells
/// are independent: separate namespaces, no shared lock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellTopology {
    pub cells: BTreeMap<String, Vec<String>>,
}

impl Default for CellTopology {
    fn default() -> Self {
        let mut cells = BTreeMap::new();
        cells.insert(
            "local".to_string(),
            (10000..10005).map(|p| format!("http://localhost:{p}")).collect(),
        );
        cells.insert(
            "cell1".to_string(),
            (11000..11005).map(|p| format!("http://localhost:{p}")).collect(),
        );
        cells.insert(
            "cell2".to_string(),
            (12000..12005).map(|p| format!("http://localhost:{p}")).collect(),
        );
        Self { cells }
    }
}

impl CellTopology {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let topology = serde_json::from_str(&raw).map_err(anyhow::Error::from)?;
        Ok(topology)
    }

    pub fn endpoints(&self, cell: &str) -> Option<&[String]> {
        self.cells.get(cell).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_timeout_below_margin() {
        let config = CellConfig::default();
        assert!(config.keep_alive_timeout() < config.jeopardy_margin());
        assert!(config.grace_period() > config.session_ttl());
    }

    #[test]
    fn topology_round_trips_through_json() {
        let topology = CellTopology::default();
        let raw = serde_json::to_string(&topology).unwrap();
        let parsed: CellTopology = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.endpoints("cell1").unwrap().len(), 5);
        assert!(parsed.endpoints("cell9").is_none());
    }
}
