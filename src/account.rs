// =============================================================================
// Capital Account & Trade History — account bookkeeping
// =============================================================================
//
// `debit` / `credit` are the only mutation entry points for capital, and
// `append` the only one for the trade log. Both are invoked exclusively from
// the position ledger's open/close paths so that concurrent instruments can
// never race on raw fields.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::TradeAction;

// ---------------------------------------------------------------------------
// Trade records
// ---------------------------------------------------------------------------

/// One append-only entry in the trade log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    /// ISO 8601 wall-clock stamp.
    pub timestamp: String,
    /// Present on Close records only.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

impl TradeRecord {
    pub fn open(symbol: &str, quantity: f64, price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: TradeAction::Open,
            quantity,
            price,
            timestamp: Utc::now().to_rfc3339(),
            realized_pnl: None,
        }
    }

    pub fn close(symbol: &str, quantity: f64, price: f64, realized_pnl: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: TradeAction::Close,
            quantity,
            price,
            timestamp: Utc::now().to_rfc3339(),
            realized_pnl: Some(realized_pnl),
        }
    }
}

/// Append-only trade log.
pub struct TradeHistory {
    records: RwLock<Vec<TradeRecord>>,
}

impl TradeHistory {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild the log from persisted records.
    pub fn with_records(records: Vec<TradeRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn append(&self, record: TradeRecord) {
        debug!(
            id = %record.id,
            symbol = %record.symbol,
            action = %record.action,
            price = record.price,
            "trade recorded"
        );
        self.records.write().push(record);
    }

    /// Snapshot of the full log, oldest first.
    pub fn snapshot(&self) -> Vec<TradeRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for TradeHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Capital account
// ---------------------------------------------------------------------------

/// Available virtual capital for the paper account.
pub struct CapitalAccount {
    available: RwLock<f64>,
}

impl CapitalAccount {
    pub fn new(starting_capital: f64) -> Self {
        info!(starting_capital, "capital account initialised");
        Self {
            available: RwLock::new(starting_capital),
        }
    }

    /// Withdraw `amount` if the account can cover it. Returns `false` (and
    /// leaves the balance untouched) when it cannot.
    pub fn debit(&self, amount: f64) -> bool {
        let mut available = self.available.write();
        if amount > *available {
            return false;
        }
        *available -= amount;
        debug!(amount, remaining = *available, "capital debited");
        true
    }

    pub fn credit(&self, amount: f64) {
        let mut available = self.available.write();
        *available += amount;
        debug!(amount, balance = *available, "capital credited");
    }

    pub fn available(&self) -> f64 {
        *self.available.read()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_fails_when_insufficient() {
        let account = CapitalAccount::new(100.0);
        assert!(!account.debit(100.01));
        assert!((account.available() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn debit_then_credit_restores_balance() {
        let account = CapitalAccount::new(1000.0);
        assert!(account.debit(400.0));
        assert!((account.available() - 600.0).abs() < f64::EPSILON);
        account.credit(400.0);
        assert!((account.available() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exact_balance_debit_succeeds() {
        let account = CapitalAccount::new(250.0);
        assert!(account.debit(250.0));
        assert!(account.available().abs() < f64::EPSILON);
    }

    #[test]
    fn history_is_append_only_and_ordered() {
        let history = TradeHistory::new();
        history.append(TradeRecord::open("RELIANCE", 10.0, 100.0));
        history.append(TradeRecord::close("RELIANCE", 10.0, 94.0, -60.0));

        let records = history.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, TradeAction::Open);
        assert_eq!(records[1].action, TradeAction::Close);
        assert_eq!(records[1].realized_pnl, Some(-60.0));
        assert_eq!(records[0].realized_pnl, None);
    }

    #[test]
    fn restored_history_keeps_records() {
        let original = TradeHistory::new();
        original.append(TradeRecord::open("INFY", 5.0, 1500.0));
        let restored = TradeHistory::with_records(original.snapshot());
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.snapshot()[0].symbol, "INFY");
    }
}
