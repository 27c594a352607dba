use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info};
use tungstenite::protocol::frame::coding::CloseCode;

use super::session::WsSession;
use crate::utils::error::ProtocolViolation;

/// Hooks run when a session enters or leaves a registry.
pub trait WsSessionListener: Send + Sync {
    fn session_added(&self);
    fn session_removed(&self);
}

/// Builds the listeners of a session about to be registered under a key.
pub type ListenerProducer =
    Arc<dyn Fn(&str, &WsSession) -> Option<Box<dyn WsSessionListener>> + Send + Sync>;

struct SessionEntry {
    session: WsSession,
    listeners: Arc<[Box<dyn WsSessionListener>]>,
}

/// Sessions of one endpoint, keyed by feed id or UI client id.
///
/// At most one session is registered per key. A second session for a taken
/// key is closed with a policy-violation code and the first stays.
pub struct SessionRegistry {
    endpoint: String,
    sessions: DashMap<String, SessionEntry>,
    listener_producers: RwLock<Vec<ListenerProducer>>,
}

impl SessionRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sessions: DashMap::new(),
            listener_producers: RwLock::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn add_listener_producer(&self, producer: ListenerProducer) {
        self.listener_producers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(producer);
    }

    /// Registers `session` under `key` unless the key is taken.
    ///
    /// Returns `false` after closing `session` when another session already
    /// holds the key.
    pub fn add(&self, key: &str, session: WsSession) -> bool {
        let listeners: Arc<[Box<dyn WsSessionListener>]> = self
            .listener_producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|produce| produce(key, &session))
            .collect();

        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(_) => {
                let violation = ProtocolViolation::DuplicateSession {
                    key: key.to_string(),
                    endpoint: self.endpoint.clone(),
                };
                error!(
                    session = %session.id(),
                    error = %violation,
                    "rejecting duplicate WebSocket session"
                );
                session.close(
                    CloseCode::Policy,
                    "Cannot have multiple WebSocket sessions open, the new one will be closed",
                );
                false
            }
            Entry::Vacant(vacant) => {
                let session_id = session.id().to_string();
                vacant.insert(SessionEntry {
                    session,
                    listeners: listeners.clone(),
                });
                info!(
                    key,
                    session = %session_id,
                    endpoint = %self.endpoint,
                    "WebSocket session added"
                );
                for listener in listeners.iter() {
                    listener.session_added();
                }
                true
            }
        }
    }

    /// Removes the entry for `key`. When `session` is given the entry is
    /// only removed if that exact session is the one registered.
    pub fn remove(&self, key: &str, session: Option<&WsSession>) -> bool {
        let removed = match session {
            None => self.sessions.remove(key),
            Some(doomed) => self
                .sessions
                .remove_if(key, |_, entry| entry.session.id() == doomed.id()),
        };
        match removed {
            Some((_, entry)) => {
                info!(
                    key,
                    session = %entry.session.id(),
                    endpoint = %self.endpoint,
                    "WebSocket session removed"
                );
                for listener in entry.listeners.iter() {
                    listener.session_removed();
                }
                true
            }
            None => {
                debug!(key, endpoint = %self.endpoint, "no matching session to remove");
                false
            }
        }
    }

    pub fn lookup(&self, key: &str) -> Option<WsSession> {
        self.sessions.get(key).map(|entry| entry.session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes every session, running their removal hooks.
    pub fn destroy(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove(&key, None);
        }
    }
}

/// The registries of the two WebSocket endpoints.
pub struct WsEndpoints {
    feeds: SessionRegistry,
    ui_clients: SessionRegistry,
}

impl WsEndpoints {
    pub fn new(feed_path: &str, ui_path: &str) -> Self {
        Self {
            feeds: SessionRegistry::new(feed_path),
            ui_clients: SessionRegistry::new(ui_path),
        }
    }

    /// Feed sessions, keyed by feed id.
    pub fn feeds(&self) -> &SessionRegistry {
        &self.feeds
    }

    /// UI sessions, keyed by the server-issued session id.
    pub fn ui_clients(&self) -> &SessionRegistry {
        &self.ui_clients
    }

    pub fn destroy(&self) {
        self.feeds.destroy();
        self.ui_clients.destroy();
    }
}
