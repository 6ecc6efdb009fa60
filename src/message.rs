//! Parameterized query messages.
//!
//! A [`Message`] is the protocol-ready form of a query: the text with `$1..$n`
//! placeholders plus one binary-encoded parameter per placeholder. Building a
//! message never touches the network.

use bytes::Bytes;

use crate::types::{encode_to_bytes, Encode, Oid, TypeRegistry};

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl From<i16> for Format {
    fn from(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// One encoded parameter: its OID and its bytes (`None` for NULL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedParam {
    oid: Oid,
    value: Option<Bytes>,
}

impl EncodedParam {
    pub fn encode<T: Encode + ?Sized>(value: &T, registry: &TypeRegistry) -> Self {
        Self {
            oid: T::type_oid(registry),
            value: encode_to_bytes(value, registry),
        }
    }

    /// An untyped NULL.
    pub fn null() -> Self {
        Self {
            oid: Oid::UNKNOWN,
            value: None,
        }
    }

    #[inline]
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Byte length, or -1 for NULL.
    #[inline]
    pub fn length(&self) -> i32 {
        self.value.as_ref().map_or(-1, |v| v.len() as i32)
    }

    #[inline]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    #[inline]
    pub fn format(&self) -> Format {
        Format::Binary
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Object-safe encoding, for parameter lists built at runtime.
pub trait ToParam {
    fn to_param(&self, registry: &TypeRegistry) -> EncodedParam;
}

impl<T: Encode + ?Sized> ToParam for T {
    fn to_param(&self, registry: &TypeRegistry) -> EncodedParam {
        EncodedParam::encode(self, registry)
    }
}

/// An ordered, heterogeneous parameter pack.
pub trait Params {
    fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>);
}

impl Params for () {
    fn encode_into(&self, _: &TypeRegistry, _: &mut Vec<EncodedParam>) {}
}

impl<P: Params + ?Sized> Params for &P {
    fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>) {
        (**self).encode_into(registry, out)
    }
}

impl Params for [&dyn ToParam] {
    fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>) {
        out.extend(self.iter().map(|p| p.to_param(registry)));
    }
}

impl<const N: usize> Params for [&dyn ToParam; N] {
    fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>) {
        self.as_slice().encode_into(registry, out)
    }
}

impl Params for Vec<&dyn ToParam> {
    fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>) {
        self.as_slice().encode_into(registry, out)
    }
}

impl Params for [EncodedParam] {
    fn encode_into(&self, _: &TypeRegistry, out: &mut Vec<EncodedParam>) {
        out.extend_from_slice(self);
    }
}

macro_rules! tuple_params {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Encode),+> Params for ($($name,)+) {
            fn encode_into(&self, registry: &TypeRegistry, out: &mut Vec<EncodedParam>) {
                $(out.push(EncodedParam::encode(&self.$idx, registry));)+
            }
        }
    };
}

tuple_params!(A 0);
tuple_params!(A 0, B 1);
tuple_params!(A 0, B 1, C 2);
tuple_params!(A 0, B 1, C 2, D 3);
tuple_params!(A 0, B 1, C 2, D 3, E 4);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13, O 14);
tuple_params!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13, O 14, P 15);

/// A query ready to be sent: text plus binary parameters in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    text: String,
    params: Vec<EncodedParam>,
}

impl Message {
    /// Build against an explicitly constructed default registry.
    pub fn new<P: Params>(text: impl Into<String>, params: P) -> Self {
        Self::build(text, params, &TypeRegistry::default())
    }

    /// Build against `registry`, normally the one bound to the target connection.
    pub fn build<P: Params>(text: impl Into<String>, params: P, registry: &TypeRegistry) -> Self {
        let mut encoded = Vec::new();
        params.encode_into(registry, &mut encoded);
        Self {
            text: text.into(),
            params: encoded,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[EncodedParam] {
        &self.params
    }

    pub fn params_count(&self) -> usize {
        self.params.len()
    }

    pub fn types(&self) -> Vec<Oid> {
        self.params.iter().map(EncodedParam::oid).collect()
    }

    pub fn formats(&self) -> Vec<Format> {
        self.params.iter().map(EncodedParam::format).collect()
    }

    pub fn lengths(&self) -> Vec<i32> {
        self.params.iter().map(EncodedParam::length).collect()
    }

    pub fn values(&self) -> Vec<Option<&[u8]>> {
        self.params.iter().map(EncodedParam::value).collect()
    }
}

/// Incremental construction from SQL fragments and typed binds.
///
/// Each bind appends the next `$n` placeholder, so
/// `push_sql("SELECT ").push_bind(&1i32)` yields the same message as
/// `Message::build("SELECT $1", (1i32,), registry)`.
#[derive(Debug)]
pub struct QueryBuilder<'r> {
    text: String,
    params: Vec<EncodedParam>,
    registry: &'r TypeRegistry,
}

impl<'r> QueryBuilder<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            text: String::new(),
            params: Vec::new(),
            registry,
        }
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.text.push_str(sql);
        self
    }

    pub fn push_bind<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.params.push(EncodedParam::encode(value, self.registry));
        self.text.push_str(&format!("${}", self.params.len()));
        self
    }

    /// Bind a runtime-typed value.
    pub fn push_param(&mut self, value: &dyn ToParam) -> &mut Self {
        self.params.push(value.to_param(self.registry));
        self.text.push_str(&format!("${}", self.params.len()));
        self
    }

    pub fn params_count(&self) -> usize {
        self.params.len()
    }

    pub fn build(&self) -> Message {
        Message {
            text: self.text.clone(),
            params: self.params.clone(),
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            text: self.text,
            params: self.params,
        }
    }
}
