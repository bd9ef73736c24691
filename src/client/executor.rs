//! Request/response correlation for one connection.
//!
//! Every query gets a fresh [`CorrelationId`] and a pending entry holding the
//! channel its caller waits on. The connection's receive loop hands each
//! [`Reply`] to [`QueryExecutor::dispatch`], which routes it to the caller that
//! issued the matching id, whatever order replies arrive in.
//!
//! A pending entry leaves the table exactly once: when its reply is dispatched,
//! when its caller stops waiting (timeout, error or unwinding), or when the
//! connection dies and [`QueryExecutor::fail_all`] drops every entry. Replies
//! for ids that are no longer pending are logged and discarded.
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use log::{debug, warn};

use crate::protocol::{CONTROL_ID, Command, CorrelationId, Reply, Response};

use super::{ClientError, ClientResult};

/// Where the executor sends encoded commands.
pub trait CommandSink {
    fn submit(&self, command: &Command) -> ClientResult<()>;
}

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<CorrelationId, mpsc::Sender<Response>>,
    closed: bool,
}

#[derive(Debug)]
pub struct QueryExecutor {
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Removes a pending entry when its caller stops waiting, for any reason.
struct PendingEntry<'a> {
    executor: &'a QueryExecutor,
    id: CorrelationId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.executor.table().entries.remove(&self.id);
    }
}

impl QueryExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(CONTROL_ID + 1),
            timeout,
        }
    }

    /// Sends `text` through `sink` and blocks until the matching response
    /// arrives or the timeout elapses.
    pub fn execute<S>(&self, sink: &S, text: &str) -> ClientResult<Response>
    where
        S: CommandSink + ?Sized,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.register(id)?;
        let _entry = PendingEntry { executor: self, id };

        sink.submit(&Command::query(id, text))?;
        debug!("query #{id} submitted");

        match receiver.recv_timeout(self.timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                warn!("query #{id} timed out after {:?}", self.timeout);
                Err(ClientError::QueryTimeout {
                    id,
                    timeout: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Routes a reply to the caller waiting on its id.
    pub fn dispatch(&self, reply: Reply) {
        let Reply { id, response } = reply;
        let sender = self.table().entries.remove(&id);

        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("caller of query #{id} stopped waiting; reply dropped");
                }
            }
            None => warn!("discarding reply with unknown correlation id {id}"),
        }
    }

    /// Fails every pending query with `ConnectionClosed` and refuses new ones.
    pub fn fail_all(&self) {
        let mut table = self.table();
        table.closed = true;
        if !table.entries.is_empty() {
            debug!("failing {} pending queries", table.entries.len());
        }
        table.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    pub fn pending(&self) -> usize {
        self.table().entries.len()
    }

    fn register(&self, id: CorrelationId) -> ClientResult<mpsc::Receiver<Response>> {
        let mut table = self.table();
        if table.closed {
            return Err(ClientError::ConnectionClosed);
        }

        let (sender, receiver) = mpsc::channel();
        table.entries.insert(id, sender);
        Ok(receiver)
    }

    // The table is never left half-updated, so a poisoned lock is still usable.
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
