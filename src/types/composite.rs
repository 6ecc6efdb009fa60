//! Composite (row) types.
//!
//! A composite is described once by listing its fields in declaration order.
//! The same description drives both catalog registration and encoding:
//!
//! ```ignore
//! struct Point { x: i64, y: i64 }
//!
//! impl HasTypeId for Point {
//!     fn type_name() -> Cow<'static, str> { Cow::Borrowed("point2d") }
//!     fn register(builder: &mut RegistryBuilder) { builder.composite::<Self>(); }
//! }
//!
//! impl Composite for Point {
//!     fn describe<L: Layout<Self>>(layout: &mut L) {
//!         layout.field("x", |p| &p.x).field("y", |p| &p.y);
//!     }
//! }
//!
//! impl Encode for Point {
//!     fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
//!         encode_composite(self, registry, buf)
//!     }
//! }
//! ```
//!
//! Wire layout: field count (i32), then per field its OID (u32), its length
//! (i32, -1 for NULL) and its bytes.

use bytes::{BufMut, BytesMut};

use super::codec::{encode_length_prefixed, Encode, IsNull};
use super::registry::{CompositeField, HasTypeId, RegistryBuilder, TypeRegistry};

/// A user-defined row type with an explicit field list.
pub trait Composite: HasTypeId + Sized + 'static {
    /// Visit every field in declaration order.
    fn describe<L: Layout<Self>>(layout: &mut L);
}

/// Receives the field list of a composite `T`.
pub trait Layout<T> {
    fn field<F: Encode + ?Sized>(&mut self, name: &'static str, get: fn(&T) -> &F) -> &mut Self;
}

/// Records field names and types, registering each field type on the way.
pub(crate) struct LayoutCollector<'a> {
    builder: &'a mut RegistryBuilder,
    fields: Vec<CompositeField>,
}

impl<'a> LayoutCollector<'a> {
    pub(crate) fn new(builder: &'a mut RegistryBuilder) -> Self {
        Self {
            builder,
            fields: Vec::new(),
        }
    }

    pub(crate) fn into_fields(self) -> Vec<CompositeField> {
        self.fields
    }
}

impl<T> Layout<T> for LayoutCollector<'_> {
    fn field<F: Encode + ?Sized>(&mut self, name: &'static str, _get: fn(&T) -> &F) -> &mut Self {
        F::register(self.builder);
        self.fields.push(CompositeField {
            name,
            type_name: F::type_name().into_owned(),
        });
        self
    }
}

struct FieldWriter<'a, T> {
    value: &'a T,
    registry: &'a TypeRegistry,
    buf: &'a mut BytesMut,
    count: i32,
}

impl<T> Layout<T> for FieldWriter<'_, T> {
    fn field<F: Encode + ?Sized>(&mut self, _name: &'static str, get: fn(&T) -> &F) -> &mut Self {
        self.buf.put_u32(F::type_oid(self.registry).as_u32());
        encode_length_prefixed(get(self.value), self.registry, self.buf);
        self.count += 1;
        self
    }
}

/// Encode a composite value in record binary format.
pub fn encode_composite<T: Composite>(
    value: &T,
    registry: &TypeRegistry,
    buf: &mut BytesMut,
) -> IsNull {
    let start = buf.len();
    buf.put_i32(0);

    let mut writer = FieldWriter {
        value,
        registry,
        buf: &mut *buf,
        count: 0,
    };
    T::describe(&mut writer);
    let count = writer.count;

    buf[start..start + 4].copy_from_slice(&count.to_be_bytes());
    IsNull::No
}
