//! Type registry: maps Rust types to PostgreSQL OIDs.
//!
//! Built-in types carry a static default OID. Composite types are registered
//! explicitly and resolved through the `pg_type` catalog, whose answers land in
//! the override table consulted before any static default. A type that resolves
//! nowhere gets `Oid::UNKNOWN` and the server infers it from context.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use super::composite::{Composite, LayoutCollector};
use super::oid::Oid;

// ============================================================================
// HasTypeId
// ============================================================================

/// A Rust type with a PostgreSQL type identity.
pub trait HasTypeId {
    /// Name of the type in `pg_type.typname`; the override table is keyed by it.
    fn type_name() -> Cow<'static, str>;

    /// Static OID used when the registry has no override.
    fn default_oid() -> Oid {
        Oid::UNKNOWN
    }

    /// Static OID of the array type whose elements are `Self`.
    fn default_array_oid() -> Oid {
        Oid::UNKNOWN
    }

    /// Resolve the OID through `registry`.
    fn type_oid(registry: &TypeRegistry) -> Oid {
        registry.resolve(Self::type_name, Self::default_oid())
    }

    /// Record whatever `Self` needs resolved from the catalog. Composite types
    /// call [`RegistryBuilder::composite`] here.
    fn register(_builder: &mut RegistryBuilder) {}
}

macro_rules! builtin_type {
    ($($ty:ty => $name:literal, $oid:expr, $array_oid:expr;)*) => {$(
        impl HasTypeId for $ty {
            fn type_name() -> Cow<'static, str> {
                Cow::Borrowed($name)
            }

            fn default_oid() -> Oid {
                $oid
            }

            fn default_array_oid() -> Oid {
                $array_oid
            }
        }
    )*};
}

builtin_type! {
    bool => "bool", Oid::BOOL, Oid::BOOL_ARRAY;
    i8 => "char", Oid::CHAR, Oid::CHAR_ARRAY;
    i16 => "int2", Oid::INT2, Oid::INT2_ARRAY;
    i32 => "int4", Oid::INT4, Oid::INT4_ARRAY;
    i64 => "int8", Oid::INT8, Oid::INT8_ARRAY;
    f32 => "float4", Oid::FLOAT4, Oid::FLOAT4_ARRAY;
    f64 => "float8", Oid::FLOAT8, Oid::FLOAT8_ARRAY;
    str => "text", Oid::TEXT, Oid::TEXT_ARRAY;
    String => "text", Oid::TEXT, Oid::TEXT_ARRAY;
    Bytes => "bytea", Oid::BYTEA, Oid::BYTEA_ARRAY;
    Uuid => "uuid", Oid::UUID, Oid::UUID_ARRAY;
    Oid => "oid", Oid::OID, Oid::OID_ARRAY;
    serde_json::Value => "jsonb", Oid::JSONB, Oid::JSONB_ARRAY;
    NaiveDate => "date", Oid::DATE, Oid::DATE_ARRAY;
    NaiveDateTime => "timestamp", Oid::TIMESTAMP, Oid::TIMESTAMP_ARRAY;
    DateTime<Utc> => "timestamptz", Oid::TIMESTAMPTZ, Oid::TIMESTAMPTZ_ARRAY;
}

/// Implements `HasTypeId` for a pointer-like type by deferring to `$inner`.
macro_rules! forward_type_id {
    ($inner:ident) => {
        fn type_name() -> Cow<'static, str> {
            $inner::type_name()
        }

        fn default_oid() -> Oid {
            $inner::default_oid()
        }

        fn default_array_oid() -> Oid {
            $inner::default_array_oid()
        }

        fn type_oid(registry: &TypeRegistry) -> Oid {
            $inner::type_oid(registry)
        }

        fn register(builder: &mut RegistryBuilder) {
            $inner::register(builder)
        }
    };
}

pub(crate) use forward_type_id;

impl<T: HasTypeId + ?Sized> HasTypeId for &T {
    forward_type_id!(T);
}

impl<T: HasTypeId + ?Sized> HasTypeId for Box<T> {
    forward_type_id!(T);
}

impl<T: HasTypeId + ?Sized> HasTypeId for Arc<T> {
    forward_type_id!(T);
}

impl<T: HasTypeId + ?Sized> HasTypeId for Rc<T> {
    forward_type_id!(T);
}

impl<T: HasTypeId + ToOwned + ?Sized> HasTypeId for Cow<'_, T> {
    forward_type_id!(T);
}

// ============================================================================
// Registry
// ============================================================================

/// One field of a registered composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeField {
    pub name: &'static str,
    pub type_name: String,
}

/// Field layout recorded when a composite type is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeLayout {
    pub name: String,
    pub fields: Vec<CompositeField>,
}

/// A row of the `pg_type` catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub oid: Oid,
    pub array_oid: Oid,
}

/// Type-to-OID mapping shared by every connection built against one catalog
/// snapshot. Immutable once built; derive a new one with
/// [`with_catalog`](Self::with_catalog) or [`to_builder`](Self::to_builder).
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    overrides: HashMap<String, Oid>,
    composites: HashMap<String, CompositeLayout>,
    catalog_names: Vec<String>,
    /// Names already asked of the catalog, found or not.
    looked_up: HashSet<String>,
}

impl TypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn to_builder(&self) -> RegistryBuilder {
        RegistryBuilder {
            registry: self.clone(),
        }
    }

    /// OID of `T` under this registry.
    pub fn type_oid<T: HasTypeId + ?Sized>(&self) -> Oid {
        T::type_oid(self)
    }

    /// Look a type name up in the override table.
    pub fn lookup(&self, name: &str) -> Option<Oid> {
        self.overrides.get(name).copied()
    }

    /// Override lookup that skips computing the name when there is nothing to find.
    pub fn resolve<F>(&self, name: F, default: Oid) -> Oid
    where
        F: FnOnce() -> Cow<'static, str>,
    {
        if self.overrides.is_empty() {
            return default;
        }
        self.lookup(&name()).unwrap_or(default)
    }

    pub fn composite(&self, name: &str) -> Option<&CompositeLayout> {
        self.composites.get(name)
    }

    /// Names registered for catalog resolution, in registration order.
    pub fn catalog_names(&self) -> &[String] {
        &self.catalog_names
    }

    /// Registered names that have no override and were never looked up.
    pub fn unresolved_names(&self) -> Vec<String> {
        self.catalog_names
            .iter()
            .filter(|name| self.is_unresolved(name))
            .cloned()
            .collect()
    }

    pub fn needs_catalog(&self) -> bool {
        self.catalog_names.iter().any(|name| self.is_unresolved(name))
    }

    fn is_unresolved(&self, name: &str) -> bool {
        !self.overrides.contains_key(name) && !self.looked_up.contains(name)
    }

    /// A copy of this registry with catalog answers merged into the override
    /// table. Array types are keyed by PostgreSQL's `_<name>` convention.
    pub fn with_catalog<I>(&self, entries: I) -> TypeRegistry
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let mut registry = self.clone();
        registry.looked_up.extend(self.unresolved_names());
        for entry in entries {
            if !entry.array_oid.is_unknown() {
                registry
                    .overrides
                    .insert(array_type_name(&entry.name), entry.array_oid);
            }
            registry.overrides.insert(entry.name, entry.oid);
        }
        registry
    }
}

/// Name PostgreSQL gives the array type of `element`.
pub fn array_type_name(element: &str) -> String {
    format!("_{}", element)
}

/// Builder for [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: TypeRegistry,
}

impl RegistryBuilder {
    /// Register `T` and everything reachable from it.
    pub fn register<T: HasTypeId + ?Sized>(&mut self) -> &mut Self {
        T::register(self);
        self
    }

    /// Register a composite type, recursing into its fields in declaration order.
    pub fn composite<T: Composite>(&mut self) -> &mut Self {
        let name = T::type_name().into_owned();
        if self.registry.composites.contains_key(&name) {
            return self;
        }

        // Placeholder first so self-referencing layouts terminate.
        self.registry.composites.insert(
            name.clone(),
            CompositeLayout {
                name: name.clone(),
                fields: Vec::new(),
            },
        );

        let mut collector = LayoutCollector::new(self);
        T::describe(&mut collector);
        let fields = collector.into_fields();

        self.registry.composites.insert(
            name.clone(),
            CompositeLayout {
                name: name.clone(),
                fields,
            },
        );
        self.add_catalog_name(name);
        self
    }

    /// Pin the OID of `T` (and every encoding of it) regardless of defaults.
    pub fn set_type_oid<T: HasTypeId + ?Sized>(&mut self, oid: Oid) -> &mut Self {
        self.set_oid(T::type_name(), oid)
    }

    pub fn set_oid(&mut self, name: impl Into<String>, oid: Oid) -> &mut Self {
        self.registry.overrides.insert(name.into(), oid);
        self
    }

    /// Ask the catalog lookup to resolve `name` (and its array type).
    pub fn add_catalog_name(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if !self.registry.catalog_names.contains(&name) {
            self.registry.catalog_names.push(name);
        }
        self
    }

    pub fn build(&mut self) -> TypeRegistry {
        std::mem::take(&mut self.registry)
    }
}
