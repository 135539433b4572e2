//! Fixed mapping from source storage type names to storage classes and
//! Arrow in-memory representations.
//!
//! Declared types are normalized before lookup: upper-cased, parenthesized
//! arguments dropped, `ZEROFILL` ignored. `VARCHAR(255)` becomes `VARCHAR`
//! and `int(11) unsigned` becomes `INT UNSIGNED`. Names that are not in the
//! table classify as [`StorageClass::Unknown`]; callers report them instead
//! of guessing.

use arrow::datatypes::{DataType, TimeUnit};

/// SQL dialect the declared type names come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// MariaDB / MySQL type names with their fixed widths.
    MySql,
    /// SQLite: declared names are kept verbatim, but every integer is stored
    /// as a 64-bit value, so plain `INTEGER` maps to 64 bits.
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Integer { signed: bool, bits: u8 },
    Float { bits: u8 },
    Decimal,
    Boolean,
    Date,
    /// Time of day (`TIME`).
    Time,
    /// `DATETIME` and `TIMESTAMP`.
    DateTime,
    /// Fixed or bounded character data (`CHAR`, `VARCHAR`).
    Char,
    /// Unbounded character data (`TEXT` family).
    Text,
    Enum,
    Set,
    Binary,
    Unknown,
}

impl StorageClass {
    /// In-memory Arrow representation for values of this class, or `None`
    /// when the class is unknown.
    pub fn arrow_type(&self) -> Option<DataType> {
        let dt = match *self {
            StorageClass::Integer { signed: true, bits: 8 } => DataType::Int8,
            StorageClass::Integer { signed: true, bits: 16 } => DataType::Int16,
            StorageClass::Integer { signed: true, bits: 32 } => DataType::Int32,
            StorageClass::Integer { signed: true, .. } => DataType::Int64,
            StorageClass::Integer { signed: false, bits: 8 } => DataType::UInt8,
            StorageClass::Integer { signed: false, bits: 16 } => DataType::UInt16,
            StorageClass::Integer { signed: false, bits: 32 } => DataType::UInt32,
            StorageClass::Integer { signed: false, .. } => DataType::UInt64,
            StorageClass::Float { bits: 32 } => DataType::Float32,
            StorageClass::Float { .. } | StorageClass::Decimal => DataType::Float64,
            StorageClass::Boolean => DataType::Boolean,
            StorageClass::Date => DataType::Date32,
            StorageClass::Time => DataType::Utf8,
            StorageClass::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
            StorageClass::Char | StorageClass::Text | StorageClass::Set => DataType::Utf8,
            StorageClass::Enum => {
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
            }
            StorageClass::Binary => DataType::Binary,
            StorageClass::Unknown => return None,
        };
        Some(dt)
    }
}

/// Strip arguments and modifiers from a declared type name.
pub fn normalize_type_name(declared: &str) -> String {
    let mut out = String::with_capacity(declared.len());
    let mut depth = 0usize;
    for c in declared.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c.to_ascii_uppercase()),
            _ => {}
        }
    }
    out.split_whitespace()
        .filter(|w| *w != "ZEROFILL")
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify a declared storage type name.
pub fn classify(declared: &str, dialect: Dialect) -> StorageClass {
    let name = normalize_type_name(declared);
    let (base, unsigned) = match name.strip_suffix(" UNSIGNED") {
        Some(base) => (base, true),
        None => (name.as_str(), false),
    };
    let int = |bits: u8| StorageClass::Integer {
        signed: !unsigned,
        bits,
    };

    match base {
        "TINYINT" => int(8),
        "SMALLINT" => int(16),
        "MEDIUMINT" | "INT" => int(32),
        "INTEGER" if dialect == Dialect::Sqlite => int(64),
        "INTEGER" => int(32),
        "BIGINT" => int(64),
        "FLOAT" => StorageClass::Float { bits: 32 },
        "DOUBLE" | "DOUBLE PRECISION" | "REAL" => StorageClass::Float { bits: 64 },
        "DECIMAL" | "NUMERIC" => StorageClass::Decimal,
        "BOOL" | "BOOLEAN" => StorageClass::Boolean,
        "DATE" => StorageClass::Date,
        "TIME" => StorageClass::Time,
        "DATETIME" | "TIMESTAMP" => StorageClass::DateTime,
        "CHAR" | "VARCHAR" | "CHARACTER" | "NCHAR" | "NVARCHAR" => StorageClass::Char,
        "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "CLOB" => StorageClass::Text,
        "ENUM" => StorageClass::Enum,
        "SET" => StorageClass::Set,
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            StorageClass::Binary
        }
        _ => StorageClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type_name() {
        assert_eq!(normalize_type_name("varchar(255)"), "VARCHAR");
        assert_eq!(normalize_type_name("int(11) unsigned"), "INT UNSIGNED");
        assert_eq!(normalize_type_name("enum('a','b(c)')"), "ENUM");
        assert_eq!(normalize_type_name("INT(4) UNSIGNED ZEROFILL"), "INT UNSIGNED");
        assert_eq!(normalize_type_name("  double   precision "), "DOUBLE PRECISION");
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(
            classify("TINYINT UNSIGNED", Dialect::MySql).arrow_type(),
            Some(DataType::UInt8)
        );
        assert_eq!(
            classify("mediumint", Dialect::MySql).arrow_type(),
            Some(DataType::Int32)
        );
        assert_eq!(
            classify("INTEGER", Dialect::MySql).arrow_type(),
            Some(DataType::Int32)
        );
        assert_eq!(
            classify("INTEGER", Dialect::Sqlite).arrow_type(),
            Some(DataType::Int64)
        );
        assert_eq!(
            classify("bigint(20) unsigned", Dialect::MySql).arrow_type(),
            Some(DataType::UInt64)
        );
    }

    #[test]
    fn test_non_integer_mappings() {
        let d = Dialect::MySql;
        assert_eq!(classify("FLOAT", d).arrow_type(), Some(DataType::Float32));
        assert_eq!(classify("decimal(10,2)", d).arrow_type(), Some(DataType::Float64));
        assert_eq!(classify("DATE", d).arrow_type(), Some(DataType::Date32));
        assert_eq!(classify("TIME", d).arrow_type(), Some(DataType::Utf8));
        assert_eq!(
            classify("timestamp", d).arrow_type(),
            Some(DataType::Timestamp(TimeUnit::Microsecond, None))
        );
        assert_eq!(classify("LONGTEXT", d), StorageClass::Text);
        assert_eq!(classify("varchar(12)", d), StorageClass::Char);
        assert!(matches!(
            classify("enum('x','y')", d).arrow_type(),
            Some(DataType::Dictionary(_, _))
        ));
        assert_eq!(classify("MEDIUMBLOB", d).arrow_type(), Some(DataType::Binary));
    }

    #[test]
    fn test_unknown_types_are_reported() {
        assert_eq!(classify("GEOMETRY", Dialect::MySql), StorageClass::Unknown);
        assert_eq!(classify("", Dialect::Sqlite), StorageClass::Unknown);
        assert_eq!(StorageClass::Unknown.arrow_type(), None);
    }
}
