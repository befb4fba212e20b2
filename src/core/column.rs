//! Purpose: Describe result columns: ordinal, name, type tag, nullability, and derived flags.
//! Exports: `DataType`, `ColumnInfo`.
//! Role: Column metadata consumed by the row codec, result sets, and exporters.
//! Invariants: Flags are derived from the type tag once at construction; descriptors are immutable.
//! Invariants: Anonymous engine names (`?column?`, empty) become `Column{N}` with a 1-based N.
use serde::Serialize;

const ANONYMOUS_COLUMN: &str = "?column?";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Oid,
    Real,
    Double,
    Numeric,
    Char,
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Uuid,
    Json,
    Jsonb,
    Xml,
    Bytes,
    /// A type the engine reports that is not one of the system types.
    UserDefined(String),
    /// No declared type (expression columns).
    Unknown,
}

impl DataType {
    /// Maps an engine type name (PostgreSQL spelling, case-insensitive) to a tag.
    pub fn from_name(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        match base {
            "" => DataType::Unknown,
            "bool" | "boolean" => DataType::Bool,
            "int2" | "smallint" => DataType::SmallInt,
            "int4" | "int" | "integer" => DataType::Int,
            "int8" | "bigint" => DataType::BigInt,
            "oid" => DataType::Oid,
            "float4" | "real" => DataType::Real,
            "float8" | "double precision" | "double" => DataType::Double,
            "numeric" | "decimal" | "money" => DataType::Numeric,
            "char" | "bpchar" | "character" => DataType::Char,
            "varchar" | "character varying" => DataType::Varchar,
            "text" | "name" => DataType::Text,
            "date" => DataType::Date,
            "time" | "timetz" | "time without time zone" | "time with time zone" => {
                DataType::Time
            }
            "timestamp" | "timestamp without time zone" | "datetime" => DataType::Timestamp,
            "timestamptz" | "timestamp with time zone" => DataType::TimestampTz,
            "interval" => DataType::Interval,
            "uuid" => DataType::Uuid,
            "json" => DataType::Json,
            "jsonb" => DataType::Jsonb,
            "xml" => DataType::Xml,
            "bytea" | "blob" => DataType::Bytes,
            _ => DataType::UserDefined(base.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DataType::Bool => "bool",
            DataType::SmallInt => "int2",
            DataType::Int => "int4",
            DataType::BigInt => "int8",
            DataType::Oid => "oid",
            DataType::Real => "float4",
            DataType::Double => "float8",
            DataType::Numeric => "numeric",
            DataType::Char => "bpchar",
            DataType::Varchar => "varchar",
            DataType::Text => "text",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::Timestamp => "timestamp",
            DataType::TimestampTz => "timestamptz",
            DataType::Interval => "interval",
            DataType::Uuid => "uuid",
            DataType::Json => "json",
            DataType::Jsonb => "jsonb",
            DataType::Xml => "xml",
            DataType::Bytes => "bytea",
            DataType::UserDefined(name) => name,
            DataType::Unknown => "unknown",
        }
    }

    pub fn is_chars(&self) -> bool {
        matches!(
            self,
            DataType::Text | DataType::Varchar | DataType::Json | DataType::Jsonb
        )
    }

    pub fn is_json(&self) -> bool {
        matches!(self, DataType::Json | DataType::Jsonb)
    }

    pub fn is_xml(&self) -> bool {
        matches!(self, DataType::Xml)
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, DataType::Bytes)
    }

    pub fn is_udt(&self) -> bool {
        matches!(self, DataType::UserDefined(_))
    }

    pub fn is_long(&self) -> bool {
        self.is_chars() || self.is_xml() || self.is_bytes() || self.is_udt() || self.is_json()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub ordinal: usize,
    pub name: String,
    pub data_type: DataType,
    pub allow_null: bool,
    pub is_key: bool,
    pub is_unique: bool,
    pub is_auto_increment: bool,
    pub is_updatable: bool,
    pub is_long: bool,
    pub is_chars: bool,
    pub is_bytes: bool,
    pub is_json: bool,
    pub is_xml: bool,
    pub is_udt: bool,
}

impl ColumnInfo {
    pub fn new(ordinal: usize, name: &str, data_type: DataType) -> Self {
        let name = if name.is_empty() || name == ANONYMOUS_COLUMN {
            format!("Column{}", ordinal + 1)
        } else {
            name.to_string()
        };
        Self {
            ordinal,
            name,
            allow_null: true,
            is_key: false,
            is_unique: false,
            is_auto_increment: false,
            is_updatable: false,
            is_long: data_type.is_long(),
            is_chars: data_type.is_chars(),
            is_bytes: data_type.is_bytes(),
            is_json: data_type.is_json(),
            is_xml: data_type.is_xml(),
            is_udt: data_type.is_udt(),
            data_type,
        }
    }

    pub fn with_allow_null(mut self, allow_null: bool) -> Self {
        self.allow_null = allow_null;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self.is_unique = self.is_unique || is_key;
        self
    }

    pub fn with_unique(mut self, is_unique: bool) -> Self {
        self.is_unique = is_unique;
        self
    }

    pub fn with_auto_increment(mut self, is_auto_increment: bool) -> Self {
        self.is_auto_increment = is_auto_increment;
        self
    }

    pub fn with_updatable(mut self, is_updatable: bool) -> Self {
        self.is_updatable = is_updatable;
        self
    }
}
