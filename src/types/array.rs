//! One-dimensional arrays.
//!
//! Layout: ndim (i32, always 1), has_null flag (i32, always 0), element OID
//! (u32), then one dimension {count (i32), lower bound (i32, 0)}, then each
//! element with its own i32 length prefix (-1 for NULL elements).

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use super::codec::{encode_length_prefixed, Encode, IsNull};
use super::oid::Oid;
use super::registry::{array_type_name, HasTypeId, RegistryBuilder, TypeRegistry};

/// Write `items` as a one-dimensional array of `T`.
pub fn encode_array<T: Encode>(items: &[T], registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
    buf.put_i32(1);
    buf.put_i32(0);
    buf.put_u32(T::type_oid(registry).as_u32());

    buf.put_i32(items.len() as i32);
    buf.put_i32(0);

    for item in items {
        encode_length_prefixed(item, registry, buf);
    }
    IsNull::No
}

macro_rules! array_type_id {
    ($elem:ident) => {
        fn type_name() -> Cow<'static, str> {
            Cow::Owned(array_type_name(&$elem::type_name()))
        }

        fn default_oid() -> Oid {
            $elem::default_array_oid()
        }

        fn register(builder: &mut RegistryBuilder) {
            $elem::register(builder)
        }
    };
}

impl<T: HasTypeId> HasTypeId for Vec<T> {
    array_type_id!(T);
}

impl<T: HasTypeId> HasTypeId for [T] {
    array_type_id!(T);
}

impl<T: HasTypeId, const N: usize> HasTypeId for [T; N] {
    array_type_id!(T);
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_array(self, registry, buf)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_array(self, registry, buf)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_array(self, registry, buf)
    }
}
