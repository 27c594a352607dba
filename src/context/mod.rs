//! The `context` module bundles the broker resources one producer or
//! consumer needs: a connection, a session, a destination, and the producer
//! or consumer itself.
//!
//! A context remembers which of its resources it owns. Closing it always
//! releases the producer or consumer, and the session and connection only
//! when they belong to it. Contexts derived from another context share its
//! connection and session and own neither.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::broker::{
    BrokerConnection, BrokerSession, ConnectionFactory, Destination, Endpoint, MessageConsumer,
    MessageProducer,
};
use crate::utils::error::{ResourceCleanupError, TransportError};

/// The connection and session a context runs on.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub connection: Arc<dyn BrokerConnection>,
    pub session: Arc<dyn BrokerSession>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

/// Creates producer and consumer contexts from a broker connection factory.
pub struct ConnectionContextFactory {
    factory: Arc<dyn ConnectionFactory>,
    reuse_connection: bool,
    cached: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionContextFactory {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            reuse_connection: false,
            cached: Mutex::new(None),
        }
    }

    /// With reuse on, every context from this factory shares one connection
    /// that the factory owns and closes in [`ConnectionContextFactory::close`].
    pub fn with_reuse_connection(mut self, reuse: bool) -> Self {
        self.reuse_connection = reuse;
        self
    }

    pub fn create_producer_context(
        &self,
        endpoint: &Endpoint,
    ) -> Result<ProducerContext, TransportError> {
        let (connection, owns_connection) = self.connection()?;
        let built = (|| -> Result<_, TransportError> {
            let session = connection.create_session()?;
            let release_session = |err: TransportError| {
                let _ = session.close();
                err
            };
            let destination = session
                .create_destination(endpoint)
                .map_err(release_session)?;
            let producer = session
                .create_producer(&destination)
                .map_err(release_session)?;
            Ok((session, destination, producer))
        })();
        let (session, destination, producer) =
            built.map_err(|err| release_connection(&connection, owns_connection, err))?;

        debug!(%destination, "created producer context");
        Ok(ProducerContext {
            resources: Resources::new(
                SessionHandle {
                    connection,
                    session,
                },
                destination,
                true,
                owns_connection,
            ),
            producer,
        })
    }

    pub fn create_consumer_context(
        &self,
        endpoint: &Endpoint,
        selector: Option<&str>,
    ) -> Result<ConsumerContext, TransportError> {
        let (connection, owns_connection) = self.connection()?;
        let built = (|| -> Result<_, TransportError> {
            let session = connection.create_session()?;
            let release_session = |err: TransportError| {
                let _ = session.close();
                err
            };
            let destination = session
                .create_destination(endpoint)
                .map_err(release_session)?;
            let consumer = session
                .create_consumer(&destination, selector)
                .map_err(release_session)?;
            Ok((session, destination, consumer))
        })();
        let (session, destination, consumer) =
            built.map_err(|err| release_connection(&connection, owns_connection, err))?;

        debug!(%destination, selector, "created consumer context");
        Ok(ConsumerContext {
            resources: Resources::new(
                SessionHandle {
                    connection,
                    session,
                },
                destination,
                true,
                owns_connection,
            ),
            consumer,
            selector: selector.map(str::to_string),
        })
    }

    /// Closes the cached connection, if any.
    pub fn close(&self) {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = cached {
            if let Err(e) = connection.close() {
                error!(error = %e, "failed to close cached connection");
            }
        }
    }

    /// Returns a started connection and whether the caller owns it.
    fn connection(&self) -> Result<(Arc<dyn BrokerConnection>, bool), TransportError> {
        if !self.reuse_connection {
            return Ok((self.start_connection()?, true));
        }
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = cached.as_ref() {
            return Ok((connection.clone(), false));
        }
        let connection = self.start_connection()?;
        *cached = Some(connection.clone());
        Ok((connection, false))
    }

    fn start_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = self.factory.create_connection()?;
        if let Err(err) = connection.start() {
            let _ = connection.close();
            return Err(err);
        }
        Ok(connection)
    }
}

fn release_connection(
    connection: &Arc<dyn BrokerConnection>,
    owned: bool,
    err: TransportError,
) -> TransportError {
    if owned {
        let _ = connection.close();
    }
    err
}

/// Resources shared by both context kinds.
struct Resources {
    handle: SessionHandle,
    destination: Destination,
    owns_session: bool,
    owns_connection: bool,
    closed: AtomicBool,
}

impl Resources {
    fn new(
        handle: SessionHandle,
        destination: Destination,
        owns_session: bool,
        owns_connection: bool,
    ) -> Self {
        Self {
            handle,
            destination,
            owns_session,
            owns_connection,
            closed: AtomicBool::new(false),
        }
    }

    /// Releases endpoint, then session, then connection. Each step runs even
    /// when an earlier one failed.
    fn release(&self, kind: &str, close_endpoint: impl FnOnce() -> Result<(), TransportError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut failures = Vec::new();
        if let Err(e) = close_endpoint() {
            failures.push(e);
        }
        if self.owns_session {
            if let Err(e) = self.handle.session.close() {
                failures.push(e);
            }
        }
        if self.owns_connection {
            if let Err(e) = self.handle.connection.close() {
                failures.push(e);
            }
        }
        if failures.is_empty() {
            debug!(destination = %self.destination, "closed {kind} context");
        } else {
            let err = ResourceCleanupError {
                context: format!("{kind} context for {}", self.destination),
                failures,
            };
            warn!(error = %err, "context closed with failures");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct ProducerContext {
    resources: Resources,
    producer: Box<dyn MessageProducer>,
}

impl ProducerContext {
    /// A producer on someone else's connection and session.
    pub(crate) fn derived(
        handle: SessionHandle,
        destination: Destination,
    ) -> Result<Self, TransportError> {
        let producer = handle.session.create_producer(&destination)?;
        Ok(Self {
            resources: Resources::new(handle, destination, false, false),
            producer,
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.resources.destination
    }

    pub fn producer(&self) -> &dyn MessageProducer {
        self.producer.as_ref()
    }

    pub fn owns_session(&self) -> bool {
        self.resources.owns_session
    }

    pub fn owns_connection(&self) -> bool {
        self.resources.owns_connection
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.resources.handle
    }

    /// Idempotent; failures are logged, never returned.
    pub fn close(&self) {
        self.resources.release("producer", || self.producer.close());
    }
}

impl Drop for ProducerContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ProducerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerContext")
            .field("destination", &self.resources.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct ConsumerContext {
    resources: Resources,
    consumer: Box<dyn MessageConsumer>,
    selector: Option<String>,
}

impl ConsumerContext {
    /// A consumer on someone else's connection and session.
    pub(crate) fn derived(
        handle: SessionHandle,
        destination: Destination,
        selector: Option<&str>,
    ) -> Result<Self, TransportError> {
        let consumer = handle.session.create_consumer(&destination, selector)?;
        Ok(Self {
            resources: Resources::new(handle, destination, false, false),
            consumer,
            selector: selector.map(str::to_string),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.resources.destination
    }

    pub fn consumer(&self) -> &dyn MessageConsumer {
        self.consumer.as_ref()
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn owns_session(&self) -> bool {
        self.resources.owns_session
    }

    pub fn owns_connection(&self) -> bool {
        self.resources.owns_connection
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.resources.handle
    }

    /// A producer sharing this context's connection and session. Closing it
    /// releases only the producer.
    pub fn derive_producer(&self, destination: &Destination) -> Result<ProducerContext, TransportError> {
        ProducerContext::derived(self.resources.handle.clone(), destination.clone())
    }

    /// Idempotent; failures are logged, never returned.
    pub fn close(&self) {
        self.resources.release("consumer", || self.consumer.close());
    }
}

impl Drop for ConsumerContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("destination", &self.resources.destination)
            .field("selector", &self.selector)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
