//! PostgreSQL over plain TCP.
//!
//! - `protocol`: wire message encoding/decoding
//! - `statement`: per-session prepared statement cache
//! - `transport`: the [`Transport`](crate::transport::Transport) implementation

pub mod protocol;
pub mod statement;
pub mod transport;


pub use transport::{TcpConfig, TcpSession, TcpTransport};
