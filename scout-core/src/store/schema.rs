//! Mapping between polars columns and SQLite storage classes.
//!
//! Every supported column type lands in one of three storage classes.
//! Temporal columns are stored as their physical integer and rebuilt from
//! the catalog schema on the way out, so a Date column loads back as Date.

use polars::prelude::*;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Ms,
    Us,
    Ns,
}

impl From<TimeUnit> for Unit {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Milliseconds => Unit::Ms,
            TimeUnit::Microseconds => Unit::Us,
            TimeUnit::Nanoseconds => Unit::Ns,
        }
    }
}

impl From<Unit> for TimeUnit {
    fn from(unit: Unit) -> Self {
        match unit {
            Unit::Ms => TimeUnit::Milliseconds,
            Unit::Us => TimeUnit::Microseconds,
            Unit::Ns => TimeUnit::Nanoseconds,
        }
    }
}

/// Column type as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredType {
    Boolean,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Date,
    Datetime { unit: Unit, tz: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Integer,
    Real,
    Text,
}

impl StorageClass {
    pub fn sql_type(self) -> &'static str {
        match self {
            StorageClass::Integer => "INTEGER",
            StorageClass::Real => "REAL",
            StorageClass::Text => "TEXT",
        }
    }
}

impl StoredType {
    pub fn from_dtype(dtype: &DataType) -> Option<Self> {
        Some(match dtype {
            DataType::Boolean => StoredType::Boolean,
            DataType::Int32 => StoredType::Int32,
            DataType::Int64 => StoredType::Int64,
            DataType::UInt32 => StoredType::UInt32,
            DataType::UInt64 => StoredType::UInt64,
            DataType::Float32 => StoredType::Float32,
            DataType::Float64 => StoredType::Float64,
            DataType::String => StoredType::String,
            DataType::Date => StoredType::Date,
            DataType::Datetime(unit, tz) => StoredType::Datetime {
                unit: (*unit).into(),
                tz: tz.as_ref().map(|tz| tz.to_string()),
            },
            _ => return None,
        })
    }

    pub fn to_dtype(&self) -> DataType {
        match self {
            StoredType::Boolean => DataType::Boolean,
            StoredType::Int32 => DataType::Int32,
            StoredType::Int64 => DataType::Int64,
            StoredType::UInt32 => DataType::UInt32,
            StoredType::UInt64 => DataType::UInt64,
            StoredType::Float32 => DataType::Float32,
            StoredType::Float64 => DataType::Float64,
            StoredType::String => DataType::String,
            StoredType::Date => DataType::Date,
            StoredType::Datetime { unit, tz } => {
                DataType::Datetime((*unit).into(), tz.as_deref().map(Into::into))
            }
        }
    }

    pub fn storage(&self) -> StorageClass {
        match self {
            StoredType::Float32 | StoredType::Float64 => StorageClass::Real,
            StoredType::String => StorageClass::Text,
            _ => StorageClass::Integer,
        }
    }
}

/// One column of a stored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(flatten)]
    pub ty: StoredType,
}

/// A column flattened to SQL values, ready for row-wise insertion.
pub struct EncodedColumn {
    pub spec: ColumnSpec,
    pub values: Vec<SqlValue>,
}

pub fn describe(frame: &DataFrame) -> Result<Vec<ColumnSpec>, StoreError> {
    frame
        .get_columns()
        .iter()
        .map(|col| {
            let ty = StoredType::from_dtype(col.dtype()).ok_or_else(|| {
                StoreError::UnsupportedType {
                    column: col.name().to_string(),
                    dtype: col.dtype().to_string(),
                }
            })?;
            Ok(ColumnSpec {
                name: col.name().to_string(),
                ty,
            })
        })
        .collect()
}

pub fn encode_columns(frame: &DataFrame) -> Result<Vec<EncodedColumn>, StoreError> {
    let specs = describe(frame)?;
    frame
        .get_columns()
        .iter()
        .zip(specs)
        .map(|(col, spec)| {
            let values = encode_column(col, &spec.ty)?;
            Ok(EncodedColumn { spec, values })
        })
        .collect()
}

fn encode_column(col: &Column, ty: &StoredType) -> Result<Vec<SqlValue>, StoreError> {
    let values = match ty.storage() {
        StorageClass::Integer => {
            let ints = col
                .as_materialized_series()
                .to_physical_repr()
                .cast(&DataType::Int64)?;
            ints.i64()?
                .into_iter()
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Integer))
                .collect()
        }
        StorageClass::Real => {
            let floats = col.as_materialized_series().cast(&DataType::Float64)?;
            floats
                .f64()?
                .into_iter()
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Real))
                .collect()
        }
        StorageClass::Text => col
            .as_materialized_series()
            .str()?
            .into_iter()
            .map(|v| v.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string())))
            .collect(),
    };
    Ok(values)
}

/// Accumulates one result column while rows stream out of SQLite.
pub enum ColumnBuffer {
    Integer(Vec<Option<i64>>),
    Real(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnBuffer {
    pub fn for_type(ty: &StoredType) -> Self {
        match ty.storage() {
            StorageClass::Integer => ColumnBuffer::Integer(Vec::new()),
            StorageClass::Real => ColumnBuffer::Real(Vec::new()),
            StorageClass::Text => ColumnBuffer::Text(Vec::new()),
        }
    }

    pub fn push(&mut self, row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<()> {
        match self {
            ColumnBuffer::Integer(v) => v.push(row.get(idx)?),
            ColumnBuffer::Real(v) => v.push(row.get(idx)?),
            ColumnBuffer::Text(v) => v.push(row.get(idx)?),
        }
        Ok(())
    }

    /// Materialize as a column of the catalog's logical type.
    pub fn finish(self, spec: &ColumnSpec) -> Result<Column, StoreError> {
        let name: PlSmallStr = spec.name.as_str().into();
        let raw = match self {
            ColumnBuffer::Integer(v) => Column::new(name, v),
            ColumnBuffer::Real(v) => Column::new(name, v),
            ColumnBuffer::Text(v) => Column::new(name, v),
        };
        let logical = spec.ty.to_dtype();
        let physical = logical.to_physical();
        Ok(raw.cast(&physical)?.cast(&logical)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_mapping_round_trips() {
        let dtypes = [
            DataType::Boolean,
            DataType::Int32,
            DataType::Int64,
            DataType::UInt64,
            DataType::Float32,
            DataType::String,
            DataType::Date,
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ];
        for dtype in dtypes {
            let stored = StoredType::from_dtype(&dtype).unwrap();
            assert_eq!(stored.to_dtype(), dtype);
        }
    }

    #[test]
    fn unsupported_dtype_is_reported() {
        let frame = DataFrame::new(vec![Column::from(Series::new_null("nothing".into(), 2))]).unwrap();
        assert!(matches!(
            describe(&frame),
            Err(StoreError::UnsupportedType { ref column, .. }) if column == "nothing"
        ));
    }

    #[test]
    fn spec_serializes_flat() {
        let spec = ColumnSpec {
            name: "kickoff".into(),
            ty: StoredType::Datetime {
                unit: Unit::Us,
                tz: Some("UTC".into()),
            },
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(
            json,
            r#"{"name":"kickoff","type":"datetime","unit":"us","tz":"UTC"}"#
        );
        let back: ColumnSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn nulls_survive_encoding() {
        let frame = df!(
            "goals" => [Some(1i64), None, Some(3)],
            "xg" => [Some(0.5f64), Some(1.2), None],
            "scorer" => [Some("Kane"), None, Some("Son")],
        )
        .unwrap();
        let encoded = encode_columns(&frame).unwrap();
        assert_eq!(encoded[0].values[1], SqlValue::Null);
        assert_eq!(encoded[1].values[2], SqlValue::Null);
        assert_eq!(encoded[2].values[0], SqlValue::Text("Kane".into()));
    }
}
