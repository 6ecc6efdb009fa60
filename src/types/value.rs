//! Dynamically typed column values.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::{PgError, PgResult};

use super::codec::Bytea;
use super::decode::Decode;
use super::oid::Oid;

/// A column value decoded by its server-reported OID.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Char(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Oid(Oid),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<PgValue>),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Bytes },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Decode a binary-format column.
    pub fn decode_binary(oid: Oid, data: Option<&[u8]>) -> PgResult<Self> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };

        let value = match oid {
            Oid::BOOL => PgValue::Bool(bool::decode(data)?),
            Oid::CHAR => PgValue::Char(i8::decode(data)?),
            Oid::INT2 => PgValue::Int2(i16::decode(data)?),
            Oid::INT4 => PgValue::Int4(i32::decode(data)?),
            Oid::INT8 => PgValue::Int8(i64::decode(data)?),
            Oid::FLOAT4 => PgValue::Float4(f32::decode(data)?),
            Oid::FLOAT8 => PgValue::Float8(f64::decode(data)?),
            Oid::OID => PgValue::Oid(Oid::decode(data)?),
            _ if oid.is_text_like() => PgValue::Text(String::decode(data)?),
            Oid::BYTEA => PgValue::Bytea(Bytea::<Vec<u8>>::decode(data)?.0),
            Oid::UUID => PgValue::Uuid(Uuid::decode(data)?),
            Oid::DATE => PgValue::Date(NaiveDate::decode(data)?),
            Oid::TIMESTAMP => PgValue::Timestamp(NaiveDateTime::decode(data)?),
            Oid::TIMESTAMPTZ => PgValue::Timestamptz(DateTime::<Utc>::decode(data)?),
            Oid::JSON | Oid::JSONB => PgValue::Json(serde_json::Value::decode(data)?),
            _ => match element_oid(oid) {
                Some(element) => decode_array(element, data)?,
                None => PgValue::Raw {
                    oid,
                    data: Bytes::copy_from_slice(data),
                },
            },
        };
        Ok(value)
    }

    /// Decode a text-format column.
    pub fn decode_text(oid: Oid, data: Option<&[u8]>) -> PgResult<Self> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::TypeMismatch(format!("invalid UTF-8 in text column: {}", e)))?;

        fn parse<T: std::str::FromStr>(text: &str, what: &str) -> PgResult<T>
        where
            T::Err: std::fmt::Display,
        {
            text.parse::<T>()
                .map_err(|e| PgError::TypeMismatch(format!("invalid {}: {}", what, e)))
        }

        let value = match oid {
            Oid::BOOL => PgValue::Bool(matches!(text, "t" | "true" | "1")),
            Oid::INT2 => PgValue::Int2(parse(text, "int2")?),
            Oid::INT4 => PgValue::Int4(parse(text, "int4")?),
            Oid::INT8 => PgValue::Int8(parse(text, "int8")?),
            Oid::FLOAT4 => PgValue::Float4(parse(text, "float4")?),
            Oid::FLOAT8 => PgValue::Float8(parse(text, "float8")?),
            Oid::OID => PgValue::Oid(Oid(parse(text, "oid")?)),
            Oid::UUID => PgValue::Uuid(parse(text, "uuid")?),
            Oid::JSON | Oid::JSONB => PgValue::Json(
                serde_json::from_str(text)
                    .map_err(|e| PgError::TypeMismatch(format!("invalid json: {}", e)))?,
            ),
            _ => PgValue::Text(text.to_owned()),
        };
        Ok(value)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            PgValue::Int2(v) => Some(v.into()),
            PgValue::Int4(v) => Some(v.into()),
            PgValue::Int8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            PgValue::Float4(v) => Some(v.into()),
            PgValue::Float8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PgValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

fn element_oid(array: Oid) -> Option<Oid> {
    let element = match array {
        Oid::BOOL_ARRAY => Oid::BOOL,
        Oid::BYTEA_ARRAY => Oid::BYTEA,
        Oid::CHAR_ARRAY => Oid::CHAR,
        Oid::NAME_ARRAY => Oid::NAME,
        Oid::INT2_ARRAY => Oid::INT2,
        Oid::INT4_ARRAY => Oid::INT4,
        Oid::INT8_ARRAY => Oid::INT8,
        Oid::TEXT_ARRAY => Oid::TEXT,
        Oid::VARCHAR_ARRAY => Oid::VARCHAR,
        Oid::OID_ARRAY => Oid::OID,
        Oid::FLOAT4_ARRAY => Oid::FLOAT4,
        Oid::FLOAT8_ARRAY => Oid::FLOAT8,
        Oid::DATE_ARRAY => Oid::DATE,
        Oid::TIMESTAMP_ARRAY => Oid::TIMESTAMP,
        Oid::TIMESTAMPTZ_ARRAY => Oid::TIMESTAMPTZ,
        Oid::UUID_ARRAY => Oid::UUID,
        Oid::JSONB_ARRAY => Oid::JSONB,
        _ => return None,
    };
    Some(element)
}

fn decode_array(element: Oid, data: &[u8]) -> PgResult<PgValue> {
    Vec::<Option<Bytes>>::decode(data)?
        .into_iter()
        .map(|item| PgValue::decode_binary(element, item.as_deref()))
        .collect::<PgResult<Vec<_>>>()
        .map(PgValue::Array)
}
