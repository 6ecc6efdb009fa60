//! Binary wire codec: Rust values to PostgreSQL binary parameter format.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES
//!
//! Numbers are written big-endian. Floats are bit-cast to the unsigned integer
//! of the same width first, so NaN payloads and infinities survive intact.
//! Text and bytes carry no terminator and no length prefix; the enclosing
//! parameter (or array element) records the length.

use std::borrow::Cow;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use super::oid::Oid;
use super::registry::{HasTypeId, TypeRegistry};

/// Whether an encoder produced a value or an SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsNull {
    Yes,
    No,
}

/// A value that can be written in binary parameter format.
pub trait Encode: HasTypeId {
    /// Append the binary representation of `self` to `buf`.
    ///
    /// Returns `IsNull::Yes` without writing anything for absent values.
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull;
}

/// Write `value` preceded by its i32 length, or -1 with no bytes for NULL.
pub(crate) fn encode_length_prefixed<T: Encode + ?Sized>(
    value: &T,
    registry: &TypeRegistry,
    buf: &mut BytesMut,
) {
    let start = buf.len();
    buf.put_i32(0);
    let len = match value.encode(registry, buf) {
        IsNull::Yes => {
            buf.truncate(start + 4);
            -1
        }
        IsNull::No => (buf.len() - start - 4) as i32,
    };
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

// ============================================================================
// Scalars
// ============================================================================

impl Encode for bool {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_u8(u8::from(*self));
        IsNull::No
    }
}

macro_rules! encode_int {
    ($($ty:ty => $put:ident),*) => {$(
        impl Encode for $ty {
            fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
                buf.$put(*self);
                IsNull::No
            }
        }
    )*};
}

encode_int!(i8 => put_i8, i16 => put_i16, i32 => put_i32, i64 => put_i64);

impl Encode for f32 {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_u32(self.to_bits());
        IsNull::No
    }
}

impl Encode for f64 {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_u64(self.to_bits());
        IsNull::No
    }
}

impl Encode for Oid {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_u32(self.0);
        IsNull::No
    }
}

impl Encode for str {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_slice(self.as_bytes());
        IsNull::No
    }
}

impl Encode for String {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        self.as_str().encode(registry, buf)
    }
}

impl Encode for Bytes {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_slice(self);
        IsNull::No
    }
}

impl Encode for Uuid {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_slice(self.as_bytes());
        IsNull::No
    }
}

/// JSONB: a version byte (1) followed by the JSON text.
impl Encode for serde_json::Value {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_u8(1);
        buf.put_slice(self.to_string().as_bytes());
        IsNull::No
    }
}

// ============================================================================
// Date/time (days or microseconds since 2000-01-01)
// ============================================================================

pub(crate) fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

pub(crate) fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).unwrap_or_default()
}

impl Encode for NaiveDate {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        let days = self.signed_duration_since(pg_epoch_date()).num_days();
        buf.put_i32(days as i32);
        IsNull::No
    }
}

impl Encode for NaiveDateTime {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        let micros = self
            .signed_duration_since(pg_epoch())
            .num_microseconds()
            .unwrap_or(i64::MAX);
        buf.put_i64(micros);
        IsNull::No
    }
}

impl Encode for DateTime<Utc> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        self.naive_utc().encode(registry, buf)
    }
}

// ============================================================================
// Byte arrays
// ============================================================================

/// `bytea` wrapper for any byte container.
///
/// `Vec<u8>` on its own would collide with the generic array encoding, so raw
/// bytes go through this wrapper or through [`Bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bytea<T>(pub T);

impl<T: AsRef<[u8]>> HasTypeId for Bytea<T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Borrowed("bytea")
    }

    fn default_oid() -> Oid {
        Oid::BYTEA
    }

    fn default_array_oid() -> Oid {
        Oid::BYTEA_ARRAY
    }
}

impl<T: AsRef<[u8]>> Encode for Bytea<T> {
    fn encode(&self, _: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        buf.put_slice(self.0.as_ref());
        IsNull::No
    }
}

// ============================================================================
// Pointer types defer to the pointee
// ============================================================================

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        (**self).encode(registry, buf)
    }
}

impl<T: Encode + ?Sized> Encode for Box<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        (**self).encode(registry, buf)
    }
}

impl<T: Encode + ?Sized> Encode for Arc<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        (**self).encode(registry, buf)
    }
}

impl<T: Encode + ?Sized> Encode for Rc<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        (**self).encode(registry, buf)
    }
}

impl<T: Encode + ToOwned + ?Sized> Encode for Cow<'_, T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        self.as_ref().encode(registry, buf)
    }
}

/// Encode `value` into a fresh buffer. `None` means NULL.
pub fn encode_to_bytes<T: Encode + ?Sized>(value: &T, registry: &TypeRegistry) -> Option<Bytes> {
    let mut buf = BytesMut::new();
    match value.encode(registry, &mut buf) {
        IsNull::Yes => None,
        IsNull::No => Some(buf.freeze()),
    }
}
