//! Network transport seam
//!
//! Message framing and connections belong to the network layer. The
//! replication manager only needs a way to hand a payload to it and to hear
//! back when a destination's queue has room again.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

/// Outbound queue classes exposed by the network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Chunk replicas; subject to flow control
    Replication,
    /// Everything else
    Control,
}

/// Why a hand-off did not happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Destination queue is full; retry after a capacity notification
    Overflow,
    /// Destination is unreachable
    Disconnected(String),
}

/// Capacity notification from the network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub instance: u32,
    pub queue_class: QueueClass,
    /// Free slots in the destination's receive queue
    pub available: u64,
}

/// Outbound side of the network layer
pub trait Transport: Send + Sync {
    /// Queue `payload` for `instance`. Must not block on remote capacity.
    fn send_physical(&self, instance: u32, payload: Bytes, class: QueueClass) -> Result<(), SendError>;
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<(u32, Bytes)>,
    overflows: HashMap<u32, usize>,
    disconnected: HashMap<u32, String>,
}

/// In-process transport that records deliveries. Overflow and disconnects
/// can be scripted per destination.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Overflow` for the next `times` sends to `instance`
    pub fn overflow_next(&self, instance: u32, times: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.overflows.insert(instance, times);
        }
    }

    /// Fail every send to `instance` until reconnected
    pub fn disconnect(&self, instance: u32, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnected.insert(instance, reason.to_string());
        }
    }

    pub fn reconnect(&self, instance: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnected.remove(&instance);
        }
    }

    /// Payloads delivered so far, in hand-off order
    pub fn sent(&self) -> Vec<(u32, Bytes)> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Payloads delivered to one destination
    pub fn sent_to(&self, instance: u32) -> Vec<Bytes> {
        self.sent()
            .into_iter()
            .filter(|(dest, _)| *dest == instance)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn send_physical(&self, instance: u32, payload: Bytes, _class: QueueClass) -> Result<(), SendError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SendError::Disconnected("transport lock poisoned".into()))?;
        if let Some(reason) = state.disconnected.get(&instance) {
            return Err(SendError::Disconnected(reason.clone()));
        }
        if let Some(left) = state.overflows.get_mut(&instance) {
            if *left > 0 {
                *left -= 1;
                return Err(SendError::Overflow);
            }
        }
        state.sent.push((instance, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_overflow_and_disconnect() {
        let t = MemoryTransport::new();
        t.overflow_next(2, 1);
        assert_eq!(t.send_physical(2, Bytes::from_static(b"a"), QueueClass::Replication), Err(SendError::Overflow));
        assert!(t.send_physical(2, Bytes::from_static(b"a"), QueueClass::Replication).is_ok());

        t.disconnect(1, "peer down");
        assert!(matches!(
            t.send_physical(1, Bytes::from_static(b"b"), QueueClass::Replication),
            Err(SendError::Disconnected(_))
        ));
        t.reconnect(1);
        assert!(t.send_physical(1, Bytes::from_static(b"b"), QueueClass::Replication).is_ok());
        assert_eq!(t.sent_to(2), vec![Bytes::from_static(b"a")]);
        assert_eq!(t.sent().len(), 2);
    }
}
