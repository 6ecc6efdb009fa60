//! binpq - a binary-protocol PostgreSQL driver core.
//!
//! Typed values are encoded straight into the binary parameter format,
//! bundled into a [`Message`], and run through a [`Connection`], a
//! [`Pool`] or a [`ConnectionInfo`] under an absolute deadline:
//!
//! ```ignore
//! let pool = Pool::new(TcpTransport::from_url(url)?, PoolConfig::new(), TypeRegistry::default())?;
//! let message = Message::build("SELECT $1::int4 + 1", (41,), &pool.registry());
//! let rows = pool.execute(&message, Rows::<(i32,)>::new()).await?;
//! ```

pub mod connection;
pub mod error;
pub mod message;
pub mod pg;
pub mod pipeline;
pub mod pool;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use error::{ErrorKind, PgError, PgResult, Stage};
pub use message::{EncodedParam, Format, Message, Params, QueryBuilder, ToParam};
pub use pg::{TcpConfig, TcpTransport};
pub use pipeline::{execute, ConnectionProvider, RawResult, ResultSink, Rows};
pub use pool::{Lease, Pool, PoolConfig, PoolStats};
pub use transport::{ResultEvent, RowBatch, Session, SessionStatus, Transport};
pub use types::{Composite, Decode, Encode, FromRow, HasTypeId, Oid, PgValue, TypeRegistry};
