//! Binary result decoding: the reverse of the wire codec.

use bytes::{Buf, Bytes};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::{PgError, PgResult};
use crate::transport::FieldDescription;

use super::codec::{pg_epoch, pg_epoch_date, Bytea};
use super::oid::Oid;
use super::registry::{HasTypeId, TypeRegistry};

/// A value that can be read from a binary result column.
pub trait Decode: HasTypeId + Sized {
    fn decode(raw: &[u8]) -> PgResult<Self>;

    /// Decode a possibly-NULL column. Only nullable types accept NULL.
    fn decode_nullable(raw: Option<&[u8]>) -> PgResult<Self> {
        match raw {
            Some(raw) => Self::decode(raw),
            None => Err(PgError::TypeMismatch(format!(
                "unexpected NULL for non-nullable type {}",
                Self::type_name()
            ))),
        }
    }

    /// Whether a column of type `oid` can be read as `Self`.
    fn accepts(oid: Oid, registry: &TypeRegistry) -> bool {
        let own = Self::type_oid(registry);
        own.is_unknown() || own == oid
    }
}

fn fixed<const N: usize>(raw: &[u8], what: &str) -> PgResult<[u8; N]> {
    raw.try_into().map_err(|_| {
        PgError::TypeMismatch(format!("invalid {} length: {}", what, raw.len()))
    })
}

impl Decode for bool {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(fixed::<1>(raw, "bool")?[0] != 0)
    }
}

macro_rules! decode_be {
    ($($ty:ty => $what:literal),*) => {$(
        impl Decode for $ty {
            fn decode(raw: &[u8]) -> PgResult<Self> {
                Ok(<$ty>::from_be_bytes(fixed(raw, $what)?))
            }
        }
    )*};
}

decode_be!(i8 => "char", i16 => "int2", i32 => "int4", i64 => "int8");

impl Decode for f32 {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(f32::from_bits(u32::from_be_bytes(fixed(raw, "float4")?)))
    }
}

impl Decode for f64 {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(f64::from_bits(u64::from_be_bytes(fixed(raw, "float8")?)))
    }
}

impl Decode for Oid {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(Oid(u32::from_be_bytes(fixed(raw, "oid")?)))
    }
}

impl Decode for String {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| PgError::TypeMismatch(format!("invalid UTF-8 in text: {}", e)))
    }

    fn accepts(oid: Oid, _: &TypeRegistry) -> bool {
        oid.is_text_like() || oid == Oid::UNKNOWN
    }
}

impl Decode for Bytes {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(Bytes::copy_from_slice(raw))
    }
}

impl Decode for Bytea<Vec<u8>> {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(Bytea(raw.to_vec()))
    }
}

impl Decode for Uuid {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        Ok(Uuid::from_bytes(fixed(raw, "uuid")?))
    }
}

impl Decode for serde_json::Value {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        // jsonb carries a version byte; plain json text never starts with 0x01.
        let text = match raw.split_first() {
            Some((1, rest)) => rest,
            _ => raw,
        };
        serde_json::from_slice(text)
            .map_err(|e| PgError::TypeMismatch(format!("invalid json: {}", e)))
    }

    fn accepts(oid: Oid, _: &TypeRegistry) -> bool {
        oid == Oid::JSONB || oid == Oid::JSON
    }
}

impl Decode for NaiveDate {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        let days = i32::from_be_bytes(fixed(raw, "date")?);
        pg_epoch_date()
            .checked_add_signed(Duration::days(days.into()))
            .ok_or_else(|| PgError::TypeMismatch(format!("date out of range: {}", days)))
    }
}

impl Decode for NaiveDateTime {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        let micros = i64::from_be_bytes(fixed(raw, "timestamp")?);
        pg_epoch()
            .checked_add_signed(Duration::microseconds(micros))
            .ok_or_else(|| PgError::TypeMismatch(format!("timestamp out of range: {}", micros)))
    }
}

impl Decode for DateTime<Utc> {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        NaiveDateTime::decode(raw).map(|naive| naive.and_utc())
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(raw: &[u8]) -> PgResult<Self> {
        T::decode(raw).map(Some)
    }

    fn decode_nullable(raw: Option<&[u8]>) -> PgResult<Self> {
        raw.map(T::decode).transpose()
    }

    fn accepts(oid: Oid, registry: &TypeRegistry) -> bool {
        T::accepts(oid, registry)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(mut raw: &[u8]) -> PgResult<Self> {
        if raw.remaining() < 12 {
            return Err(PgError::TypeMismatch("truncated array header".to_string()));
        }
        let ndim = raw.get_i32();
        let _has_null = raw.get_i32();
        let _element_oid = raw.get_u32();

        match ndim {
            // PostgreSQL sends empty arrays with no dimensions.
            0 => return Ok(Vec::new()),
            1 => {}
            n => {
                return Err(PgError::TypeMismatch(format!(
                    "expected a one-dimensional array, got {} dimensions",
                    n
                )))
            }
        }

        if raw.remaining() < 8 {
            return Err(PgError::TypeMismatch("truncated array dimension".to_string()));
        }
        let count = raw.get_i32().max(0) as usize;
        let _lower_bound = raw.get_i32();

        let mut items = Vec::with_capacity(count.min(raw.remaining() / 4));
        for _ in 0..count {
            if raw.remaining() < 4 {
                return Err(PgError::TypeMismatch("truncated array element".to_string()));
            }
            let len = raw.get_i32();
            if len < 0 {
                items.push(T::decode_nullable(None)?);
                continue;
            }
            let len = len as usize;
            if raw.remaining() < len {
                return Err(PgError::TypeMismatch("truncated array element".to_string()));
            }
            items.push(T::decode(&raw[..len])?);
            raw.advance(len);
        }
        Ok(items)
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A statically shaped result row.
pub trait FromRow: Sized {
    fn from_row(
        row: &[Option<Bytes>],
        columns: &[FieldDescription],
        registry: &TypeRegistry,
    ) -> PgResult<Self>;
}

fn decode_column<T: Decode>(
    row: &[Option<Bytes>],
    columns: &[FieldDescription],
    registry: &TypeRegistry,
    index: usize,
) -> PgResult<T> {
    let column = &columns[index];
    if !T::accepts(column.type_oid, registry) {
        return Err(PgError::TypeMismatch(format!(
            "column {} \"{}\" has type {}, cannot read it as {}",
            index,
            column.name,
            column.type_oid,
            T::type_name()
        )));
    }
    T::decode_nullable(row[index].as_deref())
        .map_err(|e| e.with_context(format!("column \"{}\"", column.name)))
}

macro_rules! tuple_from_row {
    ($count:literal; $($name:ident $idx:tt),+) => {
        impl<$($name: Decode),+> FromRow for ($($name,)+) {
            fn from_row(
                row: &[Option<Bytes>],
                columns: &[FieldDescription],
                registry: &TypeRegistry,
            ) -> PgResult<Self> {
                if columns.len() != $count || row.len() != $count {
                    return Err(PgError::TypeMismatch(format!(
                        "expected {} columns, got {}",
                        $count,
                        columns.len()
                    )));
                }
                Ok(($(decode_column::<$name>(row, columns, registry, $idx)?,)+))
            }
        }
    };
}

tuple_from_row!(1; A 0);
tuple_from_row!(2; A 0, B 1);
tuple_from_row!(3; A 0, B 1, C 2);
tuple_from_row!(4; A 0, B 1, C 2, D 3);
tuple_from_row!(5; A 0, B 1, C 2, D 3, E 4);
tuple_from_row!(6; A 0, B 1, C 2, D 3, E 4, F 5);
tuple_from_row!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
tuple_from_row!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
tuple_from_row!(9; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8);
tuple_from_row!(10; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9);
tuple_from_row!(11; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10);
tuple_from_row!(12; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11);
