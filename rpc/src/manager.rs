//! Connection deduplication and connection-event unification.
//!
//! One authenticated session per peer is almost always enough; this module
//! keys established connections by peer identity and hands out the existing
//! one while it lives. The registry only ever holds weak references: it can
//! never keep a connection alive past its natural closure, and a lookup
//! that finds the connection gone or closed simply connects afresh.

use crate::{address::Address, connection::Shared, Connection, Error};
use futures::Stream;
use mangrove_stream::{transport::Sink, PublicKey};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, Weak},
};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// Values that can be buffered for slow [`Manager::outgoing_connections`]
/// subscribers before they start missing announcements.
const ANNOUNCE_CAPACITY: usize = 64;

/// Produces fresh, fully established outbound RPC connections.
///
/// Implementations own the whole ladder below this layer: resolving the
/// address, dialing the transport, running the handshake, and starting the
/// RPC loops.
pub trait Connector<Si: Sink>: Send + 'static {
    fn connect(
        &mut self,
        address: &Address,
    ) -> impl Future<Output = Result<Connection<Si>, Error>> + Send;
}

/// Yields established inbound RPC connections.
pub trait Acceptor<Si: Sink>: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = Result<Connection<Si>, Error>> + Send;
}

/// Observer of connect outcomes, for backoff or reputation bookkeeping
/// owned elsewhere. Reported before the caller sees the result.
pub trait FailureListener: Send + Sync + 'static {
    /// `failure` is true when the attempt failed.
    fn report(&self, address: &Address, failure: bool);
}

impl<F> FailureListener for F
where
    F: Fn(&Address, bool) + Send + Sync + 'static,
{
    fn report(&self, address: &Address, failure: bool) {
        self(address, failure)
    }
}

/// Deduplicates authenticated connections per peer and unifies
/// inbound/outbound connection events.
pub struct Manager<Si: Sink, D: Connector<Si>> {
    connector: AsyncMutex<D>,
    registry: Mutex<HashMap<PublicKey, Weak<Shared<Si>>>>,
    announce: broadcast::Sender<Connection<Si>>,
    failures: Box<dyn FailureListener>,
}

impl<Si: Sink, D: Connector<Si>> Manager<Si, D> {
    pub fn new(connector: D, failures: Box<dyn FailureListener>) -> Self {
        let (announce, _) = broadcast::channel(ANNOUNCE_CAPACITY);
        Self {
            connector: AsyncMutex::new(connector),
            registry: Mutex::new(HashMap::new()),
            announce,
            failures,
        }
    }

    /// A connection to the peer in `address`: the existing one when it is
    /// still open, a fresh one otherwise.
    ///
    /// The liveness check races benignly with closure: a connection that
    /// closes right after being returned is the caller's signal to retry.
    pub async fn get_connection_with(&self, address: &Address) -> Result<Connection<Si>, Error> {
        if let Some(connection) = self.lookup(&address.key) {
            debug!(peer = %address.key, "reusing existing connection");
            return Ok(connection);
        }
        self.connect(address).await
    }

    /// Establish a fresh outbound connection regardless of existing ones,
    /// report the outcome to the failure listener, and on success register
    /// the connection and announce it to outgoing-connection subscribers.
    pub async fn connect(&self, address: &Address) -> Result<Connection<Si>, Error> {
        let result = {
            let mut connector = self.connector.lock().await;
            connector.connect(address).await
        };
        match result {
            Err(error) => {
                debug!(%address, %error, "connect failed");
                self.failures.report(address, true);
                Err(error)
            }
            Ok(connection) => {
                self.failures.report(address, false);
                self.register(&connection);
                let _ = self.announce.send(connection.clone());
                Ok(connection)
            }
        }
    }

    /// Wrap an acceptor: every accepted connection is registered before it
    /// is yielded.
    pub fn listen<A: Acceptor<Si>>(
        &self,
        acceptor: A,
    ) -> impl Stream<Item = Result<Connection<Si>, Error>> + '_ {
        futures::stream::unfold((self, acceptor), |(manager, mut acceptor)| async move {
            let accepted = acceptor.accept().await;
            if let Ok(connection) = &accepted {
                manager.register(connection);
            }
            Some((accepted, (manager, acceptor)))
        })
    }

    /// An infinite sequence of connections established via
    /// [`Manager::connect`], starting from the moment of the call. Each
    /// call gets its own subscription; a subscriber that falls more than
    /// [`ANNOUNCE_CAPACITY`] announcements behind skips the missed ones.
    pub fn outgoing_connections(&self) -> impl Stream<Item = Connection<Si>> {
        let receiver = self.announce.subscribe();
        futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(connection) => return Some((connection, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outgoing-connection subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Close every currently tracked connection.
    pub async fn reset(&self) {
        let connections: Vec<Connection<Si>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .values()
                .filter_map(|weak| weak.upgrade().map(Connection::from_shared))
                .collect()
        };
        for connection in connections {
            connection.close().await;
        }
        self.registry.lock().unwrap().clear();
    }

    fn register(&self, connection: &Connection<Si>) {
        self.registry
            .lock()
            .unwrap()
            .insert(connection.peer(), connection.downgrade());
    }

    fn lookup(&self, peer: &PublicKey) -> Option<Connection<Si>> {
        let mut registry = self.registry.lock().unwrap();
        let weak = registry.get(peer)?;
        match weak.upgrade() {
            Some(shared) => {
                let connection = Connection::from_shared(shared);
                if connection.is_closed() {
                    // Closed entries are pruned lazily, on discovery.
                    registry.remove(peer);
                    None
                } else {
                    Some(connection)
                }
            }
            None => {
                registry.remove(peer);
                None
            }
        }
    }
}
