//! PostgreSQL type object identifiers.

use std::fmt;

/// PostgreSQL type object identifier (OID).
///
/// `Oid::UNKNOWN` (0) tells the server to infer the parameter type from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(pub u32);

impl Oid {
    pub const UNKNOWN: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);
    pub const BOOL_ARRAY: Oid = Oid(1000);

    // Binary data
    pub const BYTEA: Oid = Oid(17);
    pub const BYTEA_ARRAY: Oid = Oid(1001);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME: Oid = Oid(19);
    pub const NAME_ARRAY: Oid = Oid(1003);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const INT2: Oid = Oid(21);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4: Oid = Oid(23);
    pub const INT4_ARRAY: Oid = Oid(1007);

    // Text types
    pub const TEXT: Oid = Oid(25);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR: Oid = Oid(1043);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const BPCHAR: Oid = Oid(1042);

    // OID type
    pub const OID: Oid = Oid(26);
    pub const OID_ARRAY: Oid = Oid(1028);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8: Oid = Oid(701);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);

    // UUID
    pub const UUID: Oid = Oid(2950);
    pub const UUID_ARRAY: Oid = Oid(2951);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    // Composite records
    pub const RECORD: Oid = Oid(2249);

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        self == Oid::UNKNOWN
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME
        )
    }
}

impl From<u32> for Oid {
    fn from(oid: u32) -> Self {
        Oid(oid)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
