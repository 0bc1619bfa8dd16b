//! In-memory ledger of keyed mutating executions.

use crate::error::ToolkitError;
use crate::operation::OperationResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone)]
enum Entry {
    InFlight { fingerprint: String },
    Completed { fingerprint: String, result: OperationResult },
}

impl Entry {
    fn fingerprint(&self) -> &str {
        match self {
            Entry::InFlight { fingerprint } | Entry::Completed { fingerprint, .. } => fingerprint,
        }
    }
}

/// Outcome of admitting a keyed request.
#[derive(Debug)]
pub enum Admission {
    /// First execution for the key; send the request.
    Proceed(LedgerTicket),
    /// The key already completed; here is the recorded result.
    Replay(OperationResult),
}

/// Tracks idempotency keys of mutating requests for the dispatcher's lifetime.
#[derive(Debug, Clone, Default)]
pub struct IdempotencyLedger {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key` for a request with `fingerprint`.
    pub fn admit(&self, key: &str, fingerprint: &str) -> Result<Admission, ToolkitError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            if entry.fingerprint() != fingerprint {
                return Err(ToolkitError::permanent(
                    "IdempotencyKeyMismatch",
                    &format!("idempotency key '{}' was already used for a different request", key),
                ));
            }
            return match entry {
                Entry::Completed { result, .. } => {
                    let mut replay = result.clone();
                    replay.replayed = true;
                    replay.calls = 0;
                    Ok(Admission::Replay(replay))
                }
                Entry::InFlight { .. } => Err(ToolkitError::permanent(
                    "IdempotencyKeyInFlight",
                    &format!("a request with idempotency key '{}' is still running", key),
                )),
            };
        }
        entries.insert(
            key.to_string(),
            Entry::InFlight {
                fingerprint: fingerprint.to_string(),
            },
        );
        Ok(Admission::Proceed(LedgerTicket {
            ledger: self.clone(),
            key: key.to_string(),
            done: false,
        }))
    }

    /// Number of keys with a recorded result.
    pub fn completed(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| matches!(e, Entry::Completed { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Reservation of a key. Dropping it without [`LedgerTicket::complete`]
/// releases the key so the request can be executed again.
#[derive(Debug)]
pub struct LedgerTicket {
    ledger: IdempotencyLedger,
    key: String,
    done: bool,
}

impl LedgerTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record the successful result for replay.
    pub fn complete(mut self, result: &OperationResult) {
        let mut entries = self.ledger.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            let fingerprint = entry.fingerprint().to_string();
            *entry = Entry::Completed {
                fingerprint,
                result: result.clone(),
            };
        }
        self.done = true;
    }
}

impl Drop for LedgerTicket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut entries = self.ledger.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(entries.get(&self.key), Some(Entry::InFlight { .. })) {
            entries.remove(&self.key);
        }
    }
}
