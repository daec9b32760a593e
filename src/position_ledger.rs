// =============================================================================
// Position Ledger — state machine for open / closed paper positions
// =============================================================================
//
// Life-cycle:
//   Open  ->  Closed (stop-loss / manual)
//
// The close transition is terminal: `is_open` never flips back, and the
// `is_open` check happens under the same write lock as the transition, so a
// manual close racing a stop-loss produces exactly one Close record no matter
// which path wins.
//
// Capital debits/credits and trade-record appends happen only here; no other
// component touches the account directly.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::account::{CapitalAccount, TradeHistory, TradeRecord};
use crate::errors::LedgerError;
use crate::persistence::AccountState;
use crate::stop_loss::StopLossConfig;
use crate::types::{CloseReason, PriceTick, TradeDirection};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// A single paper position. Mutated only by price updates and by exactly one
/// close transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: TradeDirection,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub pnl_percent: f64,
    /// ISO 8601 wall-clock stamp.
    pub entry_time: String,
    pub is_open: bool,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    /// Owned exclusively by this position.
    #[serde(default)]
    pub stop_loss: Option<StopLossConfig>,
}

impl Position {
    fn recompute(&mut self, price: f64) {
        let price_diff = self.direction.sign() * (price - self.entry_price);
        self.current_price = price;
        self.pnl = price_diff * self.quantity;
        self.pnl_percent = if self.entry_price > 0.0 {
            price_diff / self.entry_price * 100.0
        } else {
            0.0
        };
    }
}

// ---------------------------------------------------------------------------
// Position Ledger
// ---------------------------------------------------------------------------

/// Thread-safe owner of the account's position set, capital, and trade log.
pub struct PositionLedger {
    positions: RwLock<Vec<Position>>,
    capital: CapitalAccount,
    history: TradeHistory,
    /// Feeds the background persistence worker; mutations never block on I/O.
    saver: RwLock<Option<mpsc::UnboundedSender<AccountState>>>,
}

impl PositionLedger {
    /// Create an empty ledger with the given starting capital.
    pub fn new(starting_capital: f64) -> Self {
        Self {
            positions: RwLock::new(Vec::new()),
            capital: CapitalAccount::new(starting_capital),
            history: TradeHistory::new(),
            saver: RwLock::new(None),
        }
    }

    /// Rebuild a ledger from persisted account state.
    pub fn with_state(state: AccountState) -> Self {
        let open = state.positions.iter().filter(|p| p.is_open).count();
        info!(
            positions = state.positions.len(),
            open,
            capital = state.capital,
            trades = state.trade_history.len(),
            "ledger restored from persisted state"
        );

        Self {
            positions: RwLock::new(state.positions),
            capital: CapitalAccount::new(state.capital),
            history: TradeHistory::with_records(state.trade_history),
            saver: RwLock::new(None),
        }
    }

    /// Attach the persistence channel. Mutations after this point schedule a
    /// background save.
    pub fn attach_saver(&self, sender: mpsc::UnboundedSender<AccountState>) {
        *self.saver.write() = Some(sender);
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a new position, debiting `quantity * entry_price` from the
    /// account. Fails without side effects when capital is insufficient.
    ///
    /// A Percent stop-loss is converted to its absolute trigger price here,
    /// once, and evaluated as a Price stop from then on.
    pub fn open(
        &self,
        symbol: &str,
        direction: TradeDirection,
        quantity: f64,
        entry_price: f64,
        stop_loss: Option<StopLossConfig>,
    ) -> Result<Position, LedgerError> {
        let entry_value = quantity * entry_price;

        if !self.capital.debit(entry_value) {
            let available = self.capital.available();
            warn!(
                symbol,
                required = entry_value,
                available,
                "open rejected — insufficient capital"
            );
            return Err(LedgerError::InsufficientCapital {
                required: entry_value,
                available,
            });
        }

        let now = Utc::now();
        let stop_loss = stop_loss.map(|sl| sl.armed(entry_price, direction, now.timestamp()));

        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            quantity,
            entry_price,
            current_price: entry_price,
            pnl: 0.0,
            pnl_percent: 0.0,
            entry_time: now.to_rfc3339(),
            is_open: true,
            exit_price: None,
            closed_at: None,
            close_reason: None,
            stop_loss,
        };

        info!(
            id = %position.id,
            symbol,
            direction = %direction,
            quantity,
            entry_price,
            stop_loss = ?position.stop_loss.as_ref().map(|sl| sl.kind),
            "position opened"
        );

        self.positions.write().push(position.clone());
        self.history
            .append(TradeRecord::open(symbol, quantity, entry_price));
        self.schedule_save();

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Recompute current price and unrealized P&L for every open position
    /// matching the tick's symbol. Returns updated snapshots so the stop-loss
    /// monitor can evaluate them without re-acquiring the lock.
    pub fn on_tick(&self, tick: &PriceTick) -> Vec<Position> {
        let mut positions = self.positions.write();
        let mut updated = Vec::new();

        for pos in positions
            .iter_mut()
            .filter(|p| p.is_open && p.symbol == tick.symbol)
        {
            pos.recompute(tick.price);
            updated.push(pos.clone());
        }

        updated
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position at `exit_price`.
    ///
    /// Returns `AlreadyClosed` when the position is gone or was closed by a
    /// competing path — the `is_open` check and the terminal transition share
    /// one write-lock section, so exactly one caller ever succeeds.
    pub fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        reason: CloseReason,
    ) -> Result<TradeRecord, LedgerError> {
        let (symbol, quantity, realized_pnl) = {
            let mut positions = self.positions.write();
            let pos = positions
                .iter_mut()
                .find(|p| p.id == id && p.is_open)
                .ok_or(LedgerError::AlreadyClosed(id))?;

            pos.recompute(exit_price);
            pos.is_open = false;
            pos.exit_price = Some(exit_price);
            pos.closed_at = Some(Utc::now().to_rfc3339());
            pos.close_reason = Some(reason);

            (pos.symbol.clone(), pos.quantity, pos.pnl)
        };

        let exit_value = quantity * exit_price;
        self.capital.credit(exit_value);

        let record = TradeRecord::close(&symbol, quantity, exit_price, realized_pnl);
        self.history.append(record.clone());
        self.schedule_save();

        info!(
            id = %id,
            symbol = %symbol,
            exit_price,
            realized_pnl,
            reason = %reason,
            "position closed"
        );

        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn position(&self, id: Uuid) -> Option<Position> {
        self.positions.read().iter().find(|p| p.id == id).cloned()
    }

    /// Snapshot of all currently open positions.
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .iter()
            .filter(|p| p.is_open)
            .cloned()
            .collect()
    }

    /// Snapshot of every position, open and closed.
    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.read().clone()
    }

    pub fn available_capital(&self) -> f64 {
        self.capital.available()
    }

    pub fn trade_history(&self) -> Vec<TradeRecord> {
        self.history.snapshot()
    }

    /// Serialisable state for the persistence collaborator.
    pub fn account_state(&self) -> AccountState {
        AccountState {
            positions: self.all_positions(),
            capital: self.capital.available(),
            trade_history: self.history.snapshot(),
            saved_at: Utc::now().timestamp(),
        }
    }

    fn schedule_save(&self) {
        if let Some(sender) = self.saver.read().as_ref() {
            // The worker coalesces bursts; a closed channel just means
            // persistence is disabled.
            let _ = sender.send(self.account_state());
        }
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let positions = self.positions.read();
        let open = positions.iter().filter(|p| p.is_open).count();
        f.debug_struct("PositionLedger")
            .field("open_positions", &open)
            .field("total_positions", &positions.len())
            .field("available_capital", &self.capital.available())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
