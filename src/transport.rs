//! Transport boundary.
//!
//! The driver core never touches sockets itself. A [`Transport`] knows how to
//! establish a session with one server; a [`Session`] sends a [`Message`] and
//! yields the response as a sequence of [`ResultEvent`]s. Deadlines are applied
//! by the caller around every future returned here.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::PgResult;
use crate::message::{Format, Message};
use crate::types::Oid;

/// Column metadata from a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Column metadata shared by every batch of one result.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// One result row; most rows fit inline.
pub type RawRow = SmallVec<[Option<Bytes>; 16]>;

/// A group of rows sharing one column description.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    pub columns: SharedColumns,
    pub rows: Vec<RawRow>,
}

/// What `poll_result` produced.
#[derive(Debug, Clone)]
pub enum ResultEvent {
    Rows(RowBatch),
    /// The request finished; the session is ready for the next one.
    Done { command_tag: String },
}

/// Native health flag of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Good,
    Bad,
}

/// Opens sessions to one server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> PgResult<Self::Session>;
}

/// One established protocol session.
#[async_trait]
pub trait Session: Send + 'static {
    /// Transmit one request.
    async fn send(&mut self, message: &Message) -> PgResult<()>;

    /// Next piece of the response to the last request.
    async fn poll_result(&mut self) -> PgResult<ResultEvent>;

    fn status(&self) -> SessionStatus;

    /// Release the session; it reports `Bad` afterwards.
    async fn close(&mut self);

    /// Last error text reported by the native session.
    fn error_message(&self) -> Option<&str> {
        None
    }
}
