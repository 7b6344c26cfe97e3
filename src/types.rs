//! Mapping between server type oids and the type vocabulary of the driver.
//!
//! The server identifies column types by oid, the application binds buffers by C type and
//! describes columns by SQL type. This module owns the conversion matrix between the three and
//! the per type size, precision, scale and display size rules.

use crate::client::Oid;

pub const PG_TYPE_BOOL: Oid = 16;
pub const PG_TYPE_BYTEA: Oid = 17;
pub const PG_TYPE_CHAR: Oid = 18;
pub const PG_TYPE_NAME: Oid = 19;
pub const PG_TYPE_INT8: Oid = 20;
pub const PG_TYPE_INT2: Oid = 21;
pub const PG_TYPE_INT2VECTOR: Oid = 22;
pub const PG_TYPE_INT4: Oid = 23;
pub const PG_TYPE_REGPROC: Oid = 24;
pub const PG_TYPE_TEXT: Oid = 25;
pub const PG_TYPE_OID: Oid = 26;
pub const PG_TYPE_TID: Oid = 27;
pub const PG_TYPE_XID: Oid = 28;
pub const PG_TYPE_CID: Oid = 29;
pub const PG_TYPE_FLOAT4: Oid = 700;
pub const PG_TYPE_FLOAT8: Oid = 701;
pub const PG_TYPE_ABSTIME: Oid = 702;
pub const PG_TYPE_MONEY: Oid = 790;
pub const PG_TYPE_BPCHAR: Oid = 1042;
pub const PG_TYPE_VARCHAR: Oid = 1043;
pub const PG_TYPE_DATE: Oid = 1082;
pub const PG_TYPE_TIME: Oid = 1083;
pub const PG_TYPE_TIMESTAMP_NO_TMZONE: Oid = 1114;
pub const PG_TYPE_DATETIME: Oid = 1184;
pub const PG_TYPE_INTERVAL: Oid = 1186;
pub const PG_TYPE_TIME_WITH_TMZONE: Oid = 1266;
pub const PG_TYPE_NUMERIC: Oid = 1700;

/// Length of the variable length header the protocol prepends to the declared type modifier.
const VARHDRSZ: i32 = 4;

/// SQL data types the driver reports for result columns. Follows the ODBC vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    /// `Char(n)`. Character string of fixed length.
    Char { length: usize },
    /// `Varchar(n)`. Variable length character string.
    Varchar { length: usize },
    /// Unbounded character data, e.g. `text`.
    LongVarchar,
    /// 16 bit integer.
    SmallInt,
    /// 32 bit integer.
    Integer,
    /// 64 bit integer.
    BigInt,
    /// 32 bit float.
    Real,
    /// 64 bit float.
    Double,
    /// Exact numeric with precision and scale.
    Numeric { precision: usize, scale: i16 },
    Date,
    Time,
    Timestamp,
    /// Fixed size binary, only produced for the row locator pseudo column.
    Binary { length: usize },
    /// `bytea` under the default presentation option.
    VarBinary,
    /// `bytea` with `bytea_as_longvarbinary`, and large objects.
    LongVarBinary,
    Bit,
    /// The oid is not in the table, values pass through as text.
    Unknown,
}

/// C types the application may bind buffers as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CDataType {
    /// Let the driver pick the C type matching the SQL type.
    #[default]
    Default,
    Char,
    WChar,
    SShort,
    UShort,
    SLong,
    ULong,
    SBigInt,
    UBigInt,
    Float,
    Double,
    Bit,
    Binary,
    Date,
    Time,
    Timestamp,
    Numeric,
}

/// Presentation of `int8` columns, selectable through the `int8_as` connect option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Int8Presentation {
    #[default]
    Default,
    BigInt,
    Numeric,
    Varchar,
    Double,
    Integer,
}

/// Type presentation knobs captured from the connect options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypePresentation {
    pub int8_as: Int8Presentation,
    pub bytea_as_longvarbinary: bool,
    pub true_is_minus1: bool,
}

/// Per connection view of the server's type table. The large object type has no fixed oid, it is
/// resolved by a connect time catalog lookup.
#[derive(Debug, Clone, Default)]
pub struct TypeMap {
    pub presentation: TypePresentation,
    /// Oid of the `lo` domain when the large object support table is installed.
    pub lo_oid: Option<Oid>,
}

impl TypeMap {
    /// SQL type reported for a column of type `oid` with declared modifier `typmod` (already
    /// stripped of the protocol header, see [`strip_typmod_header`]).
    pub fn sql_type(&self, oid: Oid, typmod: i32) -> SqlType {
        if Some(oid) == self.lo_oid {
            return SqlType::LongVarBinary;
        }
        match oid {
            PG_TYPE_BOOL => SqlType::Bit,
            PG_TYPE_BYTEA => {
                if self.presentation.bytea_as_longvarbinary {
                    SqlType::LongVarBinary
                } else {
                    SqlType::VarBinary
                }
            }
            PG_TYPE_CHAR => SqlType::Char { length: 1 },
            PG_TYPE_NAME => SqlType::Varchar { length: 64 },
            PG_TYPE_INT8 => match self.presentation.int8_as {
                Int8Presentation::Default | Int8Presentation::BigInt => SqlType::BigInt,
                Int8Presentation::Numeric => SqlType::Numeric {
                    precision: 19,
                    scale: 0,
                },
                Int8Presentation::Varchar => SqlType::Varchar { length: 20 },
                Int8Presentation::Double => SqlType::Double,
                Int8Presentation::Integer => SqlType::Integer,
            },
            PG_TYPE_INT2 => SqlType::SmallInt,
            PG_TYPE_INT4 | PG_TYPE_XID | PG_TYPE_CID => SqlType::Integer,
            PG_TYPE_OID | PG_TYPE_REGPROC => SqlType::Integer,
            PG_TYPE_TEXT | PG_TYPE_INT2VECTOR => SqlType::LongVarchar,
            PG_TYPE_TID => SqlType::Varchar { length: 12 },
            PG_TYPE_FLOAT4 => SqlType::Real,
            PG_TYPE_FLOAT8 => SqlType::Double,
            PG_TYPE_MONEY => SqlType::Double,
            PG_TYPE_BPCHAR => SqlType::Char {
                length: char_column_length(typmod),
            },
            PG_TYPE_VARCHAR => SqlType::Varchar {
                length: char_column_length(typmod),
            },
            PG_TYPE_DATE => SqlType::Date,
            PG_TYPE_TIME | PG_TYPE_TIME_WITH_TMZONE => SqlType::Time,
            PG_TYPE_TIMESTAMP_NO_TMZONE | PG_TYPE_DATETIME | PG_TYPE_ABSTIME => SqlType::Timestamp,
            PG_TYPE_INTERVAL => SqlType::Varchar { length: 30 },
            PG_TYPE_NUMERIC => {
                let (precision, scale) = numeric_precision_scale(typmod);
                SqlType::Numeric { precision, scale }
            }
            _ => SqlType::Unknown,
        }
    }

    /// Column size in the sense of `SQLDescribeCol`: characters for text, digits for exact
    /// numerics, bytes for binary.
    pub fn column_size(&self, oid: Oid, typmod: i32) -> usize {
        match self.sql_type(oid, typmod) {
            SqlType::Char { length } | SqlType::Varchar { length } => length,
            SqlType::Binary { length } => length,
            SqlType::SmallInt => 5,
            SqlType::Integer => 10,
            SqlType::BigInt => 19,
            SqlType::Real => 7,
            SqlType::Double => 15,
            SqlType::Numeric { precision, .. } => precision,
            SqlType::Date => 10,
            SqlType::Time => 8,
            SqlType::Timestamp => 26,
            SqlType::Bit => 1,
            SqlType::LongVarchar | SqlType::VarBinary | SqlType::LongVarBinary => 0x7fffffff,
            SqlType::Unknown => 0x7fffffff,
        }
    }

    /// Number of digits right of the decimal point, where the type has any.
    pub fn decimal_digits(&self, oid: Oid, typmod: i32) -> Option<i16> {
        match self.sql_type(oid, typmod) {
            SqlType::Numeric { scale, .. } => Some(scale),
            SqlType::Timestamp | SqlType::Time => Some(6),
            _ => None,
        }
    }

    /// Width in characters needed to display any value of the type.
    pub fn display_size(&self, oid: Oid, typmod: i32) -> usize {
        match self.sql_type(oid, typmod) {
            SqlType::SmallInt => 6,
            SqlType::Integer => 11,
            SqlType::BigInt => 20,
            SqlType::Real => 14,
            SqlType::Double => 24,
            SqlType::Numeric { precision, .. } => precision + 2,
            SqlType::Bit => 1,
            other => self.column_size_of(other),
        }
    }

    fn column_size_of(&self, sql_type: SqlType) -> usize {
        match sql_type {
            SqlType::Char { length } | SqlType::Varchar { length } => length,
            SqlType::Binary { length } => length * 2,
            SqlType::Date => 10,
            SqlType::Time => 8,
            SqlType::Timestamp => 26,
            _ => 0x7fffffff,
        }
    }

    /// Default C type used for `SQL_C_DEFAULT` bindings against a column of the given oid.
    pub fn default_c_type(&self, oid: Oid) -> CDataType {
        match oid {
            PG_TYPE_BOOL => CDataType::Bit,
            PG_TYPE_BYTEA => CDataType::Binary,
            PG_TYPE_INT2 => CDataType::SShort,
            PG_TYPE_INT4 | PG_TYPE_OID | PG_TYPE_XID => CDataType::SLong,
            PG_TYPE_INT8 => CDataType::SBigInt,
            PG_TYPE_FLOAT4 => CDataType::Float,
            PG_TYPE_FLOAT8 | PG_TYPE_MONEY => CDataType::Double,
            PG_TYPE_DATE => CDataType::Date,
            PG_TYPE_TIME | PG_TYPE_TIME_WITH_TMZONE => CDataType::Time,
            PG_TYPE_TIMESTAMP_NO_TMZONE | PG_TYPE_DATETIME | PG_TYPE_ABSTIME => {
                CDataType::Timestamp
            }
            _ => CDataType::Char,
        }
    }

    /// `true` for types the driver transfers through the large object protocol.
    pub fn is_lo_type(&self, oid: Oid) -> bool {
        Some(oid) == self.lo_oid
    }
}

/// Strips the protocol's variable length header from a declared type modifier. Temporal types
/// carry their sub-second precision directly and are exempt.
pub fn strip_typmod_header(oid: Oid, typmod: i32) -> i32 {
    match oid {
        PG_TYPE_DATE | PG_TYPE_TIME | PG_TYPE_TIME_WITH_TMZONE | PG_TYPE_TIMESTAMP_NO_TMZONE
        | PG_TYPE_DATETIME | PG_TYPE_INTERVAL => typmod,
        _ if typmod >= VARHDRSZ => typmod - VARHDRSZ,
        _ => typmod,
    }
}

fn char_column_length(typmod: i32) -> usize {
    if typmod < 0 {
        // Unconstrained, e.g. `varchar` without length.
        255
    } else {
        typmod as usize
    }
}

fn numeric_precision_scale(typmod: i32) -> (usize, i16) {
    if typmod < 0 {
        (28, 6)
    } else {
        (((typmod >> 16) & 0xffff) as usize, (typmod & 0xffff) as i16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varchar_length_from_typmod() {
        let map = TypeMap::default();
        // Declared varchar(20), wire typmod 24.
        let typmod = strip_typmod_header(PG_TYPE_VARCHAR, 24);
        assert_eq!(SqlType::Varchar { length: 20 }, map.sql_type(PG_TYPE_VARCHAR, typmod));
    }

    #[test]
    fn temporal_typmod_is_not_stripped() {
        assert_eq!(3, strip_typmod_header(PG_TYPE_TIMESTAMP_NO_TMZONE, 3));
    }

    #[test]
    fn numeric_precision_and_scale() {
        let map = TypeMap::default();
        // numeric(12, 5) declares typmod ((12 << 16) | 5) + 4.
        let typmod = strip_typmod_header(PG_TYPE_NUMERIC, ((12 << 16) | 5) + 4);
        assert_eq!(
            SqlType::Numeric {
                precision: 12,
                scale: 5
            },
            map.sql_type(PG_TYPE_NUMERIC, typmod)
        );
    }

    #[test]
    fn int8_presentation_option() {
        let mut map = TypeMap::default();
        assert_eq!(SqlType::BigInt, map.sql_type(PG_TYPE_INT8, -1));
        map.presentation.int8_as = Int8Presentation::Numeric;
        assert_eq!(
            SqlType::Numeric {
                precision: 19,
                scale: 0
            },
            map.sql_type(PG_TYPE_INT8, -1)
        );
    }

    #[test]
    fn bytea_presentation_option() {
        let mut map = TypeMap::default();
        assert_eq!(SqlType::VarBinary, map.sql_type(PG_TYPE_BYTEA, -1));
        map.presentation.bytea_as_longvarbinary = true;
        assert_eq!(SqlType::LongVarBinary, map.sql_type(PG_TYPE_BYTEA, -1));
    }

    #[test]
    fn resolved_lo_type_maps_to_long_varbinary() {
        let map = TypeMap {
            lo_oid: Some(33001),
            ..TypeMap::default()
        };
        assert_eq!(SqlType::LongVarBinary, map.sql_type(33001, -1));
        assert!(map.is_lo_type(33001));
    }
}
