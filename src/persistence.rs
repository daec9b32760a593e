// =============================================================================
// Persistence — minimal load/save contract over an external store
// =============================================================================
//
// The engine treats durable storage as an external collaborator behind
// `AccountStore`. The bundled implementation is a JSON file per account with
// an atomic tmp + rename write to prevent corruption on crash.
//
// Saves run on a background worker fed by a channel: the tick path never
// blocks on I/O, bursts coalesce into the latest state, and each save retries
// with exponential backoff up to a bounded attempt count. An exhausted save
// is surfaced as a warning — in-memory state stays authoritative and is never
// rolled back.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::account::TradeRecord;
use crate::position_ledger::Position;

// ---------------------------------------------------------------------------
// State document
// ---------------------------------------------------------------------------

/// Everything the account needs to survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub positions: Vec<Position>,
    pub capital: f64,
    pub trade_history: Vec<TradeRecord>,
    /// Epoch seconds at save time.
    pub saved_at: i64,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Key-value load/save contract for account state.
pub trait AccountStore: Send + Sync {
    /// Returns `None` when no state has ever been saved for the account.
    fn load(&self, account_id: &str) -> Result<Option<AccountState>>;
    fn save(&self, account_id: &str, state: &AccountState) -> Result<()>;
}

/// One JSON document per account id, written atomically.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{account_id}.json"))
    }
}

impl AccountStore for JsonFileStore {
    fn load(&self, account_id: &str) -> Result<Option<AccountState>> {
        let path = self.path(account_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read account state from {}", path.display()))?;

        let state: AccountState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse account state from {}", path.display()))?;

        info!(
            account_id,
            positions = state.positions.len(),
            capital = state.capital,
            "account state loaded"
        );
        Ok(Some(state))
    }

    fn save(&self, account_id: &str, state: &AccountState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create state dir {}", self.dir.display()))?;

        let path = self.path(account_id);
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise account state")?;

        // Atomic write: tmp sibling, then rename.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

        debug!(account_id, path = %path.display(), "account state saved (atomic)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Save worker
// ---------------------------------------------------------------------------

/// Retry policy for one save request.
#[derive(Debug, Clone)]
pub struct SavePolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// Spawn the background save worker. Returns the sender side the ledger
/// writes into and the worker handle.
///
/// The worker drains the channel before each save so that a burst of
/// mutations persists only the most recent state.
pub fn spawn_save_worker(
    store: Arc<dyn AccountStore>,
    account_id: String,
    policy: SavePolicy,
) -> (mpsc::UnboundedSender<AccountState>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<AccountState>();

    let task = tokio::spawn(async move {
        while let Some(mut state) = receiver.recv().await {
            // Coalesce any queued-up states into the latest.
            while let Ok(newer) = receiver.try_recv() {
                state = newer;
            }

            save_with_retry(store.as_ref(), &account_id, &state, &policy).await;
        }
        debug!(account_id, "save worker stopped");
    });

    (sender, task)
}

/// Attempt one save, retrying with exponential backoff. Exhaustion is a
/// warning, never an error propagated to the caller.
async fn save_with_retry(
    store: &dyn AccountStore,
    account_id: &str,
    state: &AccountState,
    policy: &SavePolicy,
) {
    let mut delay = policy.base_delay;

    for attempt in 1..=policy.max_attempts {
        match store.save(account_id, state) {
            Ok(()) => return,
            Err(e) => {
                if attempt == policy.max_attempts {
                    warn!(
                        account_id,
                        attempts = attempt,
                        error = %e,
                        "account state save failed — in-memory state remains authoritative"
                    );
                    return;
                }
                debug!(
                    account_id,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "account state save failed — retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample_state(capital: f64) -> AccountState {
        AccountState {
            positions: Vec::new(),
            capital,
            trade_history: Vec::new(),
            saved_at: 1_700_000_000,
        }
    }

    fn temp_store() -> (JsonFileStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("paperdesk-test-{}", uuid::Uuid::new_v4()));
        (JsonFileStore::new(&dir), dir)
    }

    #[test]
    fn load_missing_account_returns_none() {
        let (store, dir) = temp_store();
        assert!(store.load("nobody").unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (store, dir) = temp_store();

        store.save("acct", &sample_state(1234.5)).unwrap();
        let loaded = store.load("acct").unwrap().unwrap();
        assert!((loaded.capital - 1234.5).abs() < f64::EPSILON);
        assert_eq!(loaded.saved_at, 1_700_000_000);

        // Second save overwrites in place.
        store.save("acct", &sample_state(99.0)).unwrap();
        let loaded = store.load("acct").unwrap().unwrap();
        assert!((loaded.capital - 99.0).abs() < f64::EPSILON);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let (store, dir) = temp_store();
        store.save("acct", &sample_state(1.0)).unwrap();
        assert!(!dir.join("acct.json.tmp").exists());
        assert!(dir.join("acct.json").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    /// Store that fails a configurable number of times before succeeding.
    struct FlakyStore {
        failures_remaining: AtomicU32,
        attempts: AtomicU32,
        saved: Mutex<Option<AccountState>>,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
                saved: Mutex::new(None),
            }
        }
    }

    impl AccountStore for FlakyStore {
        fn load(&self, _account_id: &str) -> Result<Option<AccountState>> {
            Ok(self.saved.lock().clone())
        }

        fn save(&self, _account_id: &str, state: &AccountState) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("simulated store failure");
            }
            *self.saved.lock() = Some(state.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retries_until_save_succeeds() {
        let store = Arc::new(FlakyStore::new(2));
        let (sender, task) = spawn_save_worker(
            store.clone(),
            "acct".into(),
            SavePolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(100),
            },
        );

        sender.send(sample_state(42.0)).unwrap();
        drop(sender);
        task.await.unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        let saved = store.saved.lock().clone().unwrap();
        assert!((saved.capital - 42.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_surfaces_exhaustion_without_crashing() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let (sender, task) = spawn_save_worker(
            store.clone(),
            "acct".into(),
            SavePolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
            },
        );

        sender.send(sample_state(1.0)).unwrap();
        drop(sender);
        // Worker finishes despite every attempt failing.
        task.await.unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.saved.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_coalesces_bursts_to_latest_state() {
        let store = Arc::new(FlakyStore::new(0));
        let (sender, task) = spawn_save_worker(
            store.clone(),
            "acct".into(),
            SavePolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
            },
        );

        for capital in [1.0, 2.0, 3.0] {
            sender.send(sample_state(capital)).unwrap();
        }
        drop(sender);
        task.await.unwrap();

        // One save, carrying the most recent state.
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        let saved = store.saved.lock().clone().unwrap();
        assert!((saved.capital - 3.0).abs() < f64::EPSILON);
    }
}
