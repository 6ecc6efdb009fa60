//! Request pipeline: acquire a connection, send, collect the result, release.
//!
//! Every step shares one absolute deadline. It is checked again before each
//! suspension point, and any failure leaves the connection `Bad` before the
//! error reaches the caller.

use std::marker::PhantomData;
use std::ops::DerefMut;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::error::{PgError, PgResult, Stage};
use crate::message::{Format, Message};
use crate::pool::{Lease, Pool};
use crate::transport::{
    FieldDescription, RawRow, ResultEvent, RowBatch, Session, SharedColumns, Transport,
};
use crate::types::{Decode, FromRow, PgValue, TypeRegistry};

// ============================================================================
// Result sinks
// ============================================================================

/// Receives response rows as they arrive.
pub trait ResultSink: Send {
    type Output: Send;

    fn push(&mut self, batch: RowBatch, registry: &Arc<TypeRegistry>) -> PgResult<()>;

    fn finish(self, command_tag: String) -> Self::Output;
}

/// Untyped rows, decoded on access.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    columns: SharedColumns,
    rows: Vec<RawRow>,
    command_tag: String,
    registry: Arc<TypeRegistry>,
}

impl RawResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    fn field(&self, column: usize) -> PgResult<&FieldDescription> {
        self.columns.get(column).ok_or_else(|| {
            PgError::Protocol(format!(
                "column {} has no description ({} described)",
                column,
                self.columns.len()
            ))
        })
    }

    fn cell(&self, row: usize, column: usize) -> PgResult<Option<&[u8]>> {
        let cells = self.rows.get(row).ok_or_else(|| {
            PgError::TypeMismatch(format!("row {} out of range ({} rows)", row, self.rows.len()))
        })?;
        let cell = cells.get(column).ok_or_else(|| {
            PgError::TypeMismatch(format!(
                "column {} out of range ({} columns)",
                column,
                cells.len()
            ))
        })?;
        Ok(cell.as_deref())
    }

    /// Decode one cell by the column's server-reported type.
    pub fn get(&self, row: usize, column: usize) -> PgResult<PgValue> {
        let data = self.cell(row, column)?;
        let field = self.field(column)?;
        match field.format {
            Format::Binary => PgValue::decode_binary(field.type_oid, data),
            Format::Text => PgValue::decode_text(field.type_oid, data),
        }
    }

    /// Decode one cell as `T`, checking the column type first.
    pub fn try_get<T: Decode>(&self, row: usize, column: usize) -> PgResult<T> {
        let data = self.cell(row, column)?;
        let field = self.field(column)?;
        if !T::accepts(field.type_oid, &self.registry) {
            return Err(PgError::TypeMismatch(format!(
                "column \"{}\" has type {}, cannot read it as {}",
                field.name,
                field.type_oid,
                T::type_name()
            )));
        }
        T::decode_nullable(data)
    }
}

impl ResultSink for RawResult {
    type Output = RawResult;

    fn push(&mut self, batch: RowBatch, registry: &Arc<TypeRegistry>) -> PgResult<()> {
        if self.rows.is_empty() {
            self.columns = batch.columns;
            self.registry = Arc::clone(registry);
        }
        self.rows.extend(batch.rows);
        Ok(())
    }

    fn finish(mut self, command_tag: String) -> RawResult {
        self.command_tag = command_tag;
        self
    }
}

/// Rows of a statically known shape, decoded as they arrive.
#[derive(Debug)]
pub struct Rows<T> {
    rows: Vec<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Rows<T> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Rows<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FromRow + Send> ResultSink for Rows<T> {
    type Output = Vec<T>;

    fn push(&mut self, batch: RowBatch, registry: &Arc<TypeRegistry>) -> PgResult<()> {
        self.rows.reserve(batch.rows.len());
        for row in &batch.rows {
            self.rows.push(T::from_row(row, &batch.columns, registry)?);
        }
        Ok(())
    }

    fn finish(self, _command_tag: String) -> Vec<T> {
        self.rows
    }
}

/// Parse rows affected from a PostgreSQL command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3" -> 3 rows
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n] | ["UPDATE", n] | ["DELETE", n] | ["SELECT", n] | ["MERGE", n] => {
            n.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

// ============================================================================
// Connection providers
// ============================================================================

/// Something a request can draw a connection from.
#[async_trait]
pub trait ConnectionProvider: Send {
    type Session: Session;
    type Handle: DerefMut<Target = Connection<Self::Session>> + Send;

    /// Obtain a usable connection before `deadline`. The connection's error
    /// context is cleared.
    async fn get_connection(self, deadline: Instant) -> PgResult<Self::Handle>;
}

#[async_trait]
impl<'a, S: Session> ConnectionProvider for &'a mut Connection<S> {
    type Session = S;
    type Handle = &'a mut Connection<S>;

    async fn get_connection(self, _deadline: Instant) -> PgResult<Self::Handle> {
        if self.state() != ConnectionState::Idle || !self.is_good() {
            return Err(PgError::ConnectionFailure(format!(
                "connection is not usable (state {:?})",
                self.state()
            )));
        }
        self.reset_error_context();
        Ok(self)
    }
}

#[async_trait]
impl<'a, T: Transport> ConnectionProvider for &'a Pool<T> {
    type Session = T::Session;
    type Handle = Lease<T>;

    async fn get_connection(self, deadline: Instant) -> PgResult<Lease<T>> {
        self.acquire(deadline).await
    }
}

#[async_trait]
impl<'a, T: Transport> ConnectionProvider for &'a ConnectionInfo<T> {
    type Session = T::Session;
    type Handle = Box<Connection<T::Session>>;

    async fn get_connection(self, deadline: Instant) -> PgResult<Self::Handle> {
        self.connect(deadline).await.map(Box::new)
    }
}

/// Run `message` on a connection from `provider` and collect the response
/// into `sink`. A pooled connection goes back to the pool when this returns.
pub async fn execute<P, K>(
    provider: P,
    message: &Message,
    deadline: Instant,
    sink: K,
) -> PgResult<K::Output>
where
    P: ConnectionProvider,
    K: ResultSink,
{
    let mut conn = provider.get_connection(deadline).await?;
    conn.request(message, deadline, sink).await
}

// ============================================================================
// Request cycle
// ============================================================================

impl<S: Session> Connection<S> {
    /// Send `message` and collect its response into `sink`.
    ///
    /// On any failure the connection becomes `Bad`, its error context is set,
    /// and the returned error carries that context. A connection whose
    /// previous request was abandoned mid-flight is refused.
    pub async fn request<K: ResultSink>(
        &mut self,
        message: &Message,
        deadline: Instant,
        mut sink: K,
    ) -> PgResult<K::Output> {
        if self.state() != ConnectionState::Idle || !self.is_good() {
            let err = PgError::ConnectionFailure(format!(
                "connection is not usable (state {:?})",
                self.state()
            ));
            return Err(self.fail(err, message));
        }

        self.set_state(ConnectionState::Busy);
        match self.drive(message, deadline, &mut sink).await {
            Ok(command_tag) => {
                self.set_state(ConnectionState::Idle);
                trace!(tag = %command_tag, "request complete");
                Ok(sink.finish(command_tag))
            }
            Err(err) => Err(self.fail(err, message)),
        }
    }

    async fn drive<K: ResultSink>(
        &mut self,
        message: &Message,
        deadline: Instant,
        sink: &mut K,
    ) -> PgResult<String> {
        let registry = Arc::clone(self.registry());
        let session = self.session_mut().ok_or(PgError::ConnectionClosed)?;

        if Instant::now() >= deadline {
            return Err(PgError::Timeout(Stage::Send));
        }
        timeout_at(deadline, session.send(message))
            .await
            .map_err(|_| PgError::Timeout(Stage::Send))??;

        loop {
            if Instant::now() >= deadline {
                return Err(PgError::Timeout(Stage::Response));
            }
            let event = timeout_at(deadline, session.poll_result())
                .await
                .map_err(|_| PgError::Timeout(Stage::Response))??;

            match event {
                ResultEvent::Rows(batch) => sink.push(batch, &registry)?,
                ResultEvent::Done { command_tag } => return Ok(command_tag),
            }
        }
    }

    fn fail(&mut self, err: PgError, message: &Message) -> PgError {
        self.mark_bad();

        let mut context = format!("while executing \"{}\"", message.text());
        if let Some(native) = self.error_message() {
            context.push_str(" (");
            context.push_str(native);
            context.push(')');
        }
        debug!(error = %err, %context, "request failed, connection marked bad");

        self.set_error_context(context.clone());
        err.with_context(context)
    }
}
