//! Replication Manager
//!
//! Queues outbound replicas per destination and hands the head of each
//! queue to the transport. There is no replication thread: queues are
//! pumped by whoever calls [`send`](ReplicationManager::send),
//! [`wait`](ReplicationManager::wait) or
//! [`handle_connection_status`](ReplicationManager::handle_connection_status).
//! The queue lock is never held across a transport call.
//!
//! Flow control: a hand-off refused with `Overflow` leaves the item at the
//! head of its queue and marks the queue blocked. Nothing more goes to that
//! destination until the network layer reports free capacity for the
//! replication queue class.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::transport::{ConnectionStatus, QueueClass, SendError, Transport};
use crate::error::{Error, Result};
use crate::query::QueryContext;

enum ItemState {
    Pending,
    Done(Option<Error>),
}

/// One replica bound for one destination
pub struct ReplicationItem {
    instance: u32,
    payload: Bytes,
    query: Weak<QueryContext>,
    state: Mutex<ItemState>,
}

impl ReplicationItem {
    pub fn new(instance: u32, payload: Bytes, query: &Arc<QueryContext>) -> Arc<Self> {
        Arc::new(Self {
            instance,
            payload,
            query: Arc::downgrade(query),
            state: Mutex::new(ItemState::Pending),
        })
    }

    /// Destination instance
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state.lock().as_deref(), Ok(ItemState::Done(_)))
    }

    /// Whether the owning query is gone or aborted
    fn query_invalid(&self) -> bool {
        self.query.upgrade().map_or(true, |q| q.is_aborted())
    }

    /// Mark done; the first outcome wins
    fn finish(&self, outcome: Option<Error>) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, ItemState::Pending) {
                *state = ItemState::Done(outcome);
            }
        }
    }

    /// `None` while pending
    fn outcome(&self) -> Option<Result<()>> {
        match &*self.state.lock().ok()? {
            ItemState::Pending => None,
            ItemState::Done(None) => Some(Ok(())),
            ItemState::Done(Some(e)) => Some(Err(e.duplicate())),
        }
    }
}

#[derive(Default)]
struct DestQueue {
    items: VecDeque<Arc<ReplicationItem>>,
    /// Head is currently with the transport
    in_flight: bool,
    /// Last hand-off overflowed; wait for a capacity notification
    blocked: bool,
}

#[derive(Default)]
struct ManagerState {
    queues: HashMap<u32, DestQueue>,
    lost: HashSet<u32>,
    stopped: bool,
}

/// Per-destination replica queues with flow control
pub struct ReplicationManager {
    transport: Arc<dyn Transport>,
    state: Mutex<ManagerState>,
    event: Condvar,
    poll_interval: Duration,
}

impl ReplicationManager {
    pub fn new(transport: Arc<dyn Transport>, poll_interval: Duration) -> Self {
        Self {
            transport,
            state: Mutex::new(ManagerState::default()),
            event: Condvar::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("replication lock poisoned".into()))
    }

    /// Enqueue `item`; sends immediately when its queue was idle
    pub fn send(&self, item: &Arc<ReplicationItem>) -> Result<()> {
        let dest = item.instance;
        {
            let mut state = self.lock()?;
            if state.stopped {
                item.finish(Some(Error::ShuttingDown));
                return Err(Error::ShuttingDown);
            }
            if state.lost.contains(&dest) {
                item.finish(Some(Error::ReplicationFailure {
                    instance: dest,
                    reason: "instance lost".into(),
                }));
                self.event.notify_all();
                return Ok(());
            }
            let queue = state.queues.entry(dest).or_default();
            queue.items.push_back(item.clone());
            trace!("Queued replica for instance {} ({} pending)", dest, queue.items.len());
            if queue.items.len() > 1 {
                return Ok(());
            }
        }
        self.pump(dest)
    }

    /// Block until `item` has been handed to the transport or has failed
    pub fn wait(&self, item: &Arc<ReplicationItem>) -> Result<()> {
        let dest = item.instance;
        let mut state = self.lock()?;
        loop {
            if let Some(outcome) = item.outcome() {
                return outcome;
            }

            if item.query_invalid() {
                Self::remove_item(&mut state, item);
                item.finish(Some(Error::Cancelled));
                self.event.notify_all();
                return Err(Error::Cancelled);
            }

            let can_send = state
                .queues
                .get(&dest)
                .map_or(false, |q| !q.in_flight && !q.blocked && !q.items.is_empty());
            if can_send {
                drop(state);
                self.pump(dest)?;
                state = self.lock()?;
                continue;
            }

            state = self
                .event
                .wait_timeout(state, self.poll_interval)
                .map_err(|_| Error::Internal("replication lock poisoned".into()))?
                .0;
        }
    }

    /// Capacity notification from the network layer
    pub fn handle_connection_status(&self, status: ConnectionStatus) -> Result<()> {
        if status.queue_class != QueueClass::Replication || status.available == 0 {
            return Ok(());
        }
        {
            let mut state = self.lock()?;
            state.lost.remove(&status.instance);
            match state.queues.get_mut(&status.instance) {
                Some(queue) => queue.blocked = false,
                None => return Ok(()),
            }
            debug!(
                "Instance {} has room for {} replicas",
                status.instance, status.available
            );
            self.event.notify_all();
        }
        self.pump(status.instance)
    }

    /// Fail everything queued for `instance` and refuse new items for it
    /// until it reports capacity again
    pub fn handle_instance_lost(&self, instance: u32) -> Result<()> {
        let mut state = self.lock()?;
        state.lost.insert(instance);
        if let Some(queue) = state.queues.get_mut(&instance) {
            let failed = queue.items.len();
            for item in queue.items.drain(..) {
                item.finish(Some(Error::ReplicationFailure {
                    instance,
                    reason: "instance lost".into(),
                }));
            }
            queue.blocked = false;
            warn!("Instance {} lost, failed {} queued replicas", instance, failed);
        }
        self.event.notify_all();
        Ok(())
    }

    /// Fail one outstanding item
    pub fn abort(&self, item: &Arc<ReplicationItem>) -> Result<()> {
        let mut state = self.lock()?;
        Self::remove_item(&mut state, item);
        item.finish(Some(Error::Cancelled));
        self.event.notify_all();
        Ok(())
    }

    /// Shut down: every queued and future item fails
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.stopped = true;
        let mut failed = 0;
        for queue in state.queues.values_mut() {
            for item in queue.items.drain(..) {
                item.finish(Some(Error::ShuttingDown));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!("Replication stopped with {} replicas outstanding", failed);
        }
        self.event.notify_all();
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().map(|s| s.stopped).unwrap_or(true)
    }

    /// Items queued for `instance`, including one in flight
    pub fn queue_len(&self, instance: u32) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(&instance).map(|q| q.items.len()))
            .unwrap_or(0)
    }

    /// Drop `item` from its queue unless the transport currently holds it;
    /// an in-flight head is popped when its hand-off returns.
    fn remove_item(state: &mut ManagerState, item: &Arc<ReplicationItem>) {
        if let Some(queue) = state.queues.get_mut(&item.instance) {
            let skip = usize::from(queue.in_flight);
            if let Some(pos) = queue
                .items
                .iter()
                .skip(skip)
                .position(|i| Arc::ptr_eq(i, item))
            {
                queue.items.remove(pos + skip);
            }
        }
    }

    /// Hand queue heads for `dest` to the transport until the queue is
    /// empty, blocked or already being pumped by another thread.
    fn pump(&self, dest: u32) -> Result<()> {
        loop {
            let head = {
                let mut state = self.lock()?;
                let Some(queue) = state.queues.get_mut(&dest) else {
                    return Ok(());
                };
                if queue.in_flight || queue.blocked {
                    return Ok(());
                }
                let Some(head) = queue.items.front().cloned() else {
                    return Ok(());
                };
                if head.is_done() || head.query_invalid() {
                    queue.items.pop_front();
                    head.finish(Some(Error::Cancelled));
                    self.event.notify_all();
                    continue;
                }
                queue.in_flight = true;
                head
            };

            let result = self
                .transport
                .send_physical(dest, head.payload.clone(), QueueClass::Replication);

            let mut state = self.lock()?;
            let stopped = state.stopped;
            let Some(queue) = state.queues.get_mut(&dest) else {
                return Ok(());
            };
            queue.in_flight = false;
            let still_head = queue.items.front().map_or(false, |i| Arc::ptr_eq(i, &head));

            match result {
                Ok(()) => {
                    if still_head {
                        queue.items.pop_front();
                    }
                    head.finish(None);
                    trace!("Replica handed to instance {}", dest);
                }
                Err(SendError::Overflow) => {
                    if stopped || !still_head {
                        // Stopped or aborted while the transport had it
                        self.event.notify_all();
                        continue;
                    }
                    queue.blocked = true;
                    debug!("Instance {} replication queue full, holding {} replicas", dest, queue.items.len());
                    self.event.notify_all();
                    return Ok(());
                }
                Err(SendError::Disconnected(reason)) => {
                    if still_head {
                        queue.items.pop_front();
                    }
                    warn!("Replica to instance {} failed: {}", dest, reason);
                    head.finish(Some(Error::ReplicationFailure { instance: dest, reason }));
                }
            }
            self.event.notify_all();
        }
    }
}
