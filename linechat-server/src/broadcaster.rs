//! The broadcaster: sole owner of the client roster.
//!
//! Connection handlers never touch the roster directly. They send [`Event`]s
//! through a [`BroadcasterHandle`], and a single task applies them to the
//! [`Registry`] one at a time. Joins, leaves and fan-out therefore never
//! interleave, without any lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RelayError;

/// Process-unique identifier for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next id. Ids increase monotonically, so registry order is
    /// join order.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A joined client: its display name plus the sending side of its outgoing
/// queue.
///
/// The registry holds the only sender once the client has joined, so
/// dropping the `Client` is what closes the queue.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    tx: mpsc::Sender<String>,
}

impl Client {
    pub fn new(name: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ClientId::next(),
            name,
            tx,
        }
    }
}

/// Events processed by the broadcaster task.
#[derive(Debug)]
pub enum Event {
    Join(Client),
    Leave(ClientId),
    Message(String),
    /// Snapshot of current display names, in join order.
    Names(oneshot::Sender<Vec<String>>),
}

/// The set of joined clients. Owned by exactly one broadcaster task.
#[derive(Debug, Default)]
pub struct Registry {
    clients: BTreeMap<ClientId, Client>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn join(&mut self, client: Client) {
        tracing::debug!(client = %client.name, id = %client.id, "Join");
        self.clients.insert(client.id, client);
    }

    /// Remove a client and close its outgoing queue.
    ///
    /// Returns `false` if the id was not registered.
    pub fn leave(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(client) => {
                tracing::debug!(client = %client.name, %id, "Leave");
                // Last sender for this queue: dropping it ends the writer pump.
                drop(client);
                true
            }
            None => false,
        }
    }

    /// Queue `text` once for every joined client. Returns how many queues
    /// accepted it.
    ///
    /// Never waits: a client whose queue is full misses this message.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            match client.tx.try_send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(client = %client.name, "Outgoing queue full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::error!(client = %client.name, "Outgoing queue closed while still joined");
                }
            }
        }
        delivered
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.values().map(|c| c.name.clone()).collect()
    }

    /// Apply one event.
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Join(client) => self.join(client),
            Event::Leave(id) => {
                self.leave(id);
            }
            Event::Message(text) => {
                let delivered = self.broadcast(&text);
                tracing::trace!(delivered, "Broadcast");
            }
            Event::Names(reply) => {
                // The requester may have disconnected already; nothing to do.
                let _ = reply.send(self.names());
            }
        }
    }
}

/// Cloneable front end to the broadcaster task.
#[derive(Debug, Clone)]
pub struct BroadcasterHandle {
    tx: mpsc::Sender<Event>,
}

impl BroadcasterHandle {
    async fn send(&self, event: Event) -> Result<(), RelayError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::BroadcasterGone)
    }

    pub async fn join(&self, client: Client) -> Result<(), RelayError> {
        self.send(Event::Join(client)).await
    }

    pub async fn leave(&self, id: ClientId) -> Result<(), RelayError> {
        self.send(Event::Leave(id)).await
    }

    pub async fn broadcast(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.send(Event::Message(text.into())).await
    }

    /// Display names of the clients joined at the moment the request is
    /// processed. Clients joining concurrently may or may not be included.
    pub async fn names(&self) -> Result<Vec<String>, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::Names(reply_tx)).await?;
        reply_rx.await.map_err(|_| RelayError::BroadcasterGone)
    }
}

/// Spawn the broadcaster task.
///
/// The task runs until every handle has been dropped.
pub fn spawn(capacity: usize) -> (BroadcasterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run(rx));
    (BroadcasterHandle { tx }, handle)
}

async fn run(mut rx: mpsc::Receiver<Event>) {
    let mut registry = Registry::new();
    while let Some(event) = rx.recv().await {
        registry.apply(event);
    }
    tracing::debug!(remaining = registry.len(), "Broadcaster stopped");
}
