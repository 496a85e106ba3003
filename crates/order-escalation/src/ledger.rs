//! Outcome ledger: where terminal side effects land
//!
//! Finalization, conclusion and payment activities report what they did
//! through an [`OutcomeLedger`]. The worker binary appends to a JSONL file
//! per namespace:
//!
//! - `<state-dir>/<namespace>/outcomes.jsonl`: one [`Outcome`] per line

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::models::{ConclusionRecord, EscalationRecord};

pub const LEDGER_FILE: &str = "outcomes.jsonl";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger lock poisoned")]
    LockPoisoned,
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// One recorded side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    StaleFinalized {
        record: EscalationRecord,
        recorded_at: DateTime<Utc>,
    },
    OrderConcluded {
        record: ConclusionRecord,
        recorded_at: DateTime<Utc>,
    },
    PaymentProcessed {
        consent_id: String,
        version: u32,
        amount: f64,
        recorded_at: DateTime<Utc>,
    },
}

impl Outcome {
    pub fn order_id(&self) -> &str {
        match self {
            Self::StaleFinalized { record, .. } => &record.order_id,
            Self::OrderConcluded { record, .. } => &record.order_id,
            Self::PaymentProcessed { consent_id, .. } => consent_id,
        }
    }
}

#[async_trait]
pub trait OutcomeLedger: Send + Sync {
    async fn record(&self, outcome: &Outcome) -> LedgerResult<()>;
}

pub type SharedLedger = Arc<dyn OutcomeLedger>;

// =============================================================================
// Implementations
// =============================================================================

/// Logs outcomes and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLedger;

#[async_trait]
impl OutcomeLedger for TracingLedger {
    async fn record(&self, outcome: &Outcome) -> LedgerResult<()> {
        match outcome {
            Outcome::StaleFinalized { record, .. } => info!(
                order_id = %record.order_id,
                resolution = record.metadata.resolution_label(),
                "Stale workflow finalized"
            ),
            Outcome::OrderConcluded { record, .. } => info!(
                order_id = %record.order_id,
                resolution = %record.resolution,
                resolved_by = %record.resolved_by,
                "Order concluded"
            ),
            Outcome::PaymentProcessed {
                consent_id,
                version,
                amount,
                ..
            } => info!(consent_id = %consent_id, version, amount, "Payment processed"),
        }
        Ok(())
    }
}

/// Appends outcomes to a JSONL file.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlLedger {
    /// Ledger at `<dir>/outcomes.jsonl`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(LEDGER_FILE),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every outcome in the file. A missing file reads as empty.
    pub async fn read_all(&self) -> LedgerResult<Vec<Outcome>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(LedgerError::from))
            .collect()
    }
}

#[async_trait]
impl OutcomeLedger for JsonlLedger {
    async fn record(&self, outcome: &Outcome) -> LedgerResult<()> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        TracingLedger.record(outcome).await
    }
}

/// Keeps outcomes in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    outcomes: Mutex<Vec<Outcome>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Outcomes recorded for one order or consent id.
    pub fn for_order(&self, order_id: &str) -> Vec<Outcome> {
        self.outcomes()
            .into_iter()
            .filter(|o| o.order_id() == order_id)
            .collect()
    }
}

#[async_trait]
impl OutcomeLedger for MemoryLedger {
    async fn record(&self, outcome: &Outcome) -> LedgerResult<()> {
        self.outcomes
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?
            .push(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RESOLVED_BY_MANUAL;

    fn concluded(order_id: &str) -> Outcome {
        Outcome::OrderConcluded {
            record: ConclusionRecord {
                order_id: order_id.to_string(),
                resolution: "manual-resolution".to_string(),
                original_workflow_id: format!("payment-{order_id}"),
                resolved_at: Utc::now(),
                resolved_by: RESOLVED_BY_MANUAL.to_string(),
            },
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_ledger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonlLedger::in_dir(&dir.path().join("default"));
        assert!(ledger.read_all().await.unwrap().is_empty());

        ledger.record(&concluded("A1")).await.unwrap();
        ledger.record(&concluded("B2")).await.unwrap();

        let outcomes = ledger.read_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].order_id(), "A1");
        assert_eq!(outcomes[1].order_id(), "B2");

        let raw = std::fs::read_to_string(ledger.path()).unwrap();
        assert!(raw.lines().all(|l| l.contains("\"type\":\"order_concluded\"")));
    }

    #[tokio::test]
    async fn test_memory_ledger_filters_by_order() {
        let ledger = MemoryLedger::new();
        ledger.record(&concluded("A1")).await.unwrap();
        ledger.record(&concluded("B2")).await.unwrap();
        assert_eq!(ledger.outcomes().len(), 2);
        assert_eq!(ledger.for_order("B2").len(), 1);
    }
}
