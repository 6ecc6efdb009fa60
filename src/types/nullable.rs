//! Nullable wrappers.
//!
//! Every wrapper that may or may not hold a value goes through [`Nullable`],
//! so there is exactly one null-check-then-defer path in the codec. An empty
//! wrapper is sent as NULL (length -1, no bytes); a full one is byte-identical
//! to its contents. The OID is always the contained type's OID.

use std::borrow::Cow;
use std::rc;
use std::sync;

use bytes::BytesMut;

use super::codec::{Encode, IsNull};
use super::oid::Oid;
use super::registry::{forward_type_id, HasTypeId, RegistryBuilder, TypeRegistry};

/// An "optional view" over a possibly absent value.
pub trait Nullable {
    type Value: Encode + ?Sized;

    /// Call `f` with the contained value, or with `None` when absent.
    fn with_value<R>(&self, f: impl FnOnce(Option<&Self::Value>) -> R) -> R;

    fn is_null(&self) -> bool {
        self.with_value(|value| value.is_none())
    }
}

/// Encode any [`Nullable`].
pub fn encode_nullable<N: Nullable + ?Sized>(
    value: &N,
    registry: &TypeRegistry,
    buf: &mut BytesMut,
) -> IsNull {
    value.with_value(|inner| match inner {
        Some(inner) => inner.encode(registry, buf),
        None => IsNull::Yes,
    })
}

impl<T: Encode> Nullable for Option<T> {
    type Value = T;

    fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.as_ref())
    }
}

impl<T: Encode + ?Sized> Nullable for sync::Weak<T> {
    type Value = T;

    fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        match self.upgrade() {
            Some(strong) => f(Some(&*strong)),
            None => f(None),
        }
    }
}

impl<T: Encode + ?Sized> Nullable for rc::Weak<T> {
    type Value = T;

    fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        match self.upgrade() {
            Some(strong) => f(Some(&*strong)),
            None => f(None),
        }
    }
}

impl<T: HasTypeId> HasTypeId for Option<T> {
    forward_type_id!(T);
}

impl<T: HasTypeId + ?Sized> HasTypeId for sync::Weak<T> {
    forward_type_id!(T);
}

impl<T: HasTypeId + ?Sized> HasTypeId for rc::Weak<T> {
    forward_type_id!(T);
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_nullable(self, registry, buf)
    }
}

impl<T: Encode + ?Sized> Encode for sync::Weak<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_nullable(self, registry, buf)
    }
}

impl<T: Encode + ?Sized> Encode for rc::Weak<T> {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_nullable(self, registry, buf)
    }
}

/// An untyped NULL. Its OID is 0 and the server infers the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Null;

impl HasTypeId for Null {
    fn type_name() -> Cow<'static, str> {
        Cow::Borrowed("unknown")
    }

    fn type_oid(_: &TypeRegistry) -> Oid {
        Oid::UNKNOWN
    }
}

impl Nullable for Null {
    type Value = Null;

    fn with_value<R>(&self, f: impl FnOnce(Option<&Null>) -> R) -> R {
        f(None)
    }
}

impl Encode for Null {
    fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
        encode_nullable(self, registry, buf)
    }
}
