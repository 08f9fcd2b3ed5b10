//! Query context
//!
//! Every read, write and replication wait runs on behalf of a query. The
//! engine never preempts I/O; instead each blocking point calls
//! [`QueryContext::validate`] and gives up with `Cancelled` once the query
//! has been aborted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Handle shared by every operation issued for one query
#[derive(Debug)]
pub struct QueryContext {
    id: Uuid,
    aborted: AtomicBool,
    /// Replicas that could not be delivered, as (instance, reason)
    replica_failures: Mutex<Vec<(u32, String)>>,
}

impl QueryContext {
    /// Create a new live query
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            aborted: AtomicBool::new(false),
            replica_failures: Mutex::new(Vec::new()),
        })
    }

    /// Query id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Abort the query; blocked operations fail at their next check
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::debug!("Query {} aborted", self.id);
        }
    }

    /// Whether the query has been aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The "query still valid" predicate
    pub fn validate(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a replica that was not delivered
    pub fn record_replica_failure(&self, instance: u32, reason: String) {
        if let Ok(mut failures) = self.replica_failures.lock() {
            failures.push((instance, reason));
        }
    }

    /// Replica failures seen so far
    pub fn replica_failures(&self) -> Vec<(u32, String)> {
        self.replica_failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort() {
        let q = QueryContext::new();
        assert!(q.validate().is_ok());
        q.abort();
        assert!(matches!(q.validate(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_replica_failures() {
        let q = QueryContext::new();
        q.record_replica_failure(2, "disconnected".into());
        assert_eq!(q.replica_failures(), vec![(2, "disconnected".to_string())]);
    }
}
