//! A single protocol session and its lifecycle.
//!
//! ```text
//! Unopened --open--> Connecting --ok--> Idle <--ok-- Busy
//!                        |                |            |
//!                        +--fail--> Closed  +--request--+--fail--> Bad
//! ```
//!
//! A connection in `Bad` or `Closed` is never used for another request.

use std::sync::Arc;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{PgError, PgResult, Stage};
use crate::message::Message;
use crate::pipeline::Rows;
use crate::transport::{Session, SessionStatus, Transport};
use crate::types::{CatalogEntry, Oid, TypeRegistry};

/// Resolves registered type names to OIDs.
const CATALOG_QUERY: &str = "SELECT typname, oid, typarray FROM pg_type WHERE typname = ANY($1)";

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Connecting,
    Idle,
    Busy,
    Bad,
    Closed,
}

/// An owned session handle plus the registry it encodes with.
pub struct Connection<S: Session> {
    session: Option<S>,
    registry: Arc<TypeRegistry>,
    state: ConnectionState,
    error_context: String,
}

impl<S: Session> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("has_session", &self.session.is_some())
            .field("error_context", &self.error_context)
            .finish()
    }
}

impl<S: Session> Connection<S> {
    /// A connection with no session yet.
    pub fn unopened(registry: Arc<TypeRegistry>) -> Self {
        Self {
            session: None,
            registry,
            state: ConnectionState::Unopened,
            error_context: String::new(),
        }
    }

    /// Wrap an already established session.
    pub fn from_session(session: S, registry: Arc<TypeRegistry>) -> Self {
        Self {
            session: Some(session),
            registry,
            state: ConnectionState::Idle,
            error_context: String::new(),
        }
    }

    /// Open a new connection through `transport`, failing at `deadline`.
    pub async fn connect<T>(
        transport: &T,
        registry: Arc<TypeRegistry>,
        deadline: Instant,
    ) -> PgResult<Self>
    where
        T: Transport<Session = S>,
    {
        let mut conn = Self::unopened(registry);
        conn.open(transport, deadline).await?;
        Ok(conn)
    }

    /// Establish the session and, when the registry asks for it, resolve
    /// registered type names from the server catalog.
    pub async fn open<T>(&mut self, transport: &T, deadline: Instant) -> PgResult<()>
    where
        T: Transport<Session = S>,
    {
        if self.state != ConnectionState::Unopened {
            return Err(PgError::Config(format!(
                "cannot open a connection in state {:?}",
                self.state
            )));
        }
        self.state = ConnectionState::Connecting;

        if Instant::now() >= deadline {
            self.state = ConnectionState::Closed;
            return Err(PgError::Timeout(Stage::Connect));
        }

        let session = match timeout_at(deadline, transport.connect()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                debug!(error = %e, "connection attempt failed");
                return Err(e);
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
                debug!("connection attempt timed out");
                return Err(PgError::Timeout(Stage::Connect));
            }
        };

        self.session = Some(session);
        self.state = ConnectionState::Idle;

        if self.registry.needs_catalog() {
            if let Err(e) = self.load_catalog(deadline).await {
                self.close().await;
                return Err(e);
            }
        }

        debug!("connection opened");
        Ok(())
    }

    async fn load_catalog(&mut self, deadline: Instant) -> PgResult<()> {
        let names = self.registry.unresolved_names();
        let message = Message::build(CATALOG_QUERY, (&names,), &self.registry);
        let rows = self
            .request(&message, deadline, Rows::<(String, Oid, Oid)>::new())
            .await?;

        let entries: Vec<CatalogEntry> = rows
            .into_iter()
            .map(|(name, oid, array_oid)| CatalogEntry {
                name,
                oid,
                array_oid,
            })
            .collect();

        if entries.len() < names.len() {
            let missing: Vec<&str> = names
                .iter()
                .filter(|n| !entries.iter().any(|e| &e.name == *n))
                .map(String::as_str)
                .collect();
            warn!(?missing, "types not found in pg_type, they will be sent as unknown");
        }
        debug!(resolved = entries.len(), "loaded type catalog");

        self.registry = Arc::new(self.registry.with_catalog(entries));
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection can serve a request: it is open and the
    /// session's own status flag reports healthy. No session means not good.
    pub fn is_good(&self) -> bool {
        matches!(self.state, ConnectionState::Idle | ConnectionState::Busy)
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.status() == SessionStatus::Good)
    }

    pub fn is_bad(&self) -> bool {
        !self.is_good()
    }

    /// Registry used to encode parameters for this connection.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn session(&self) -> Option<&S> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut S> {
        self.session.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Diagnostic text describing the last failed operation.
    pub fn error_context(&self) -> &str {
        &self.error_context
    }

    pub fn set_error_context(&mut self, context: impl Into<String>) {
        self.error_context = context.into();
    }

    pub fn reset_error_context(&mut self) {
        self.error_context.clear();
    }

    /// Error text from the native session, if it reported one.
    pub fn error_message(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.error_message())
    }

    /// Mark the session unusable. Closed connections stay closed.
    pub fn mark_bad(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Bad;
        }
    }

    /// Release the session.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.state = ConnectionState::Closed;
    }
}

/// Everything needed to open connections on demand: one fresh connection per
/// request, closed when the request's handle is dropped.
pub struct ConnectionInfo<T: Transport> {
    transport: T,
    registry: Arc<TypeRegistry>,
}

impl<T: Transport> ConnectionInfo<T> {
    pub fn new(transport: T, registry: TypeRegistry) -> Self {
        Self {
            transport,
            registry: Arc::new(registry),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Open a new connection before `deadline`.
    pub async fn connect(&self, deadline: Instant) -> PgResult<Connection<T::Session>> {
        Connection::connect(&self.transport, Arc::clone(&self.registry), deadline).await
    }
}
