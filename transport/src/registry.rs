//! Owner of the one-connection-per-namespace rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use patrol_types::TokenProvider;

use crate::{Connection, Connector, Namespace, ReconnectPolicy};

/// Registry of live connections, one per namespace.
///
/// Explicitly owned (by the client session) and handed to consumers; there
/// is no process-wide instance.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connections: Mutex<HashMap<Namespace, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The connection for `namespace`, opening one if there is none or the
    /// previous one was disposed. An existing connection is returned as is,
    /// connected or not.
    pub fn connect(&self, namespace: Namespace, token: TokenProvider) -> Arc<Connection> {
        let mut connections = self.lock();
        if let Some(existing) = connections.get(&namespace) {
            if !existing.is_disposed() {
                return Arc::clone(existing);
            }
        }
        debug!(namespace = %namespace, "opening connection");
        let connection =
            Connection::open(namespace, Arc::clone(&self.connector), token, self.policy);
        connections.insert(namespace, Arc::clone(&connection));
        connection
    }

    /// The live connection for `namespace`, if any.
    pub fn get(&self, namespace: Namespace) -> Option<Arc<Connection>> {
        self.lock()
            .get(&namespace)
            .filter(|c| !c.is_disposed())
            .cloned()
    }

    /// Dispose and forget the connection for `namespace`. Returns whether one
    /// existed.
    pub fn dispose(&self, namespace: Namespace) -> bool {
        let removed = self.lock().remove(&namespace);
        match removed {
            Some(connection) => {
                connection.dispose();
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.dispose();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Namespace, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
