//! Type identity, binary encoding and decoding.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

mod array;
mod codec;
mod composite;
mod decode;
mod nullable;
mod oid;
mod registry;
mod value;

pub use array::encode_array;
pub use codec::{encode_to_bytes, Bytea, Encode, IsNull};
pub use composite::{encode_composite, Composite, Layout};
pub use decode::{Decode, FromRow};
pub use nullable::{encode_nullable, Null, Nullable};
pub use oid::Oid;
pub use registry::{
    array_type_name, CatalogEntry, CompositeField, CompositeLayout, HasTypeId, RegistryBuilder,
    TypeRegistry,
};
pub use value::PgValue;

#[cfg(test)]
pub(crate) use composite::fixtures;
