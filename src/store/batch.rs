//! Column-oriented record batches and the schemas they are checked against.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Utf8,
    Boolean,
    /// Microseconds since the Unix epoch, UTC.
    TimestampMicros,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Exact match on names, order, types and nullability.
    pub fn check_matches(&self, expected: &Schema, table: &str) -> Result<(), StorageError> {
        if self == expected {
            return Ok(());
        }
        let describe = |s: &Schema| {
            s.fields
                .iter()
                .map(|f| {
                    let null = if f.nullable { "?" } else { "" };
                    format!("{}:{:?}{null}", f.name, f.data_type)
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        Err(StorageError::SchemaMismatch {
            table: table.to_string(),
            detail: format!("expected [{}], got [{}]", describe(expected), describe(self)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    Utf8(Vec<Option<String>>),
    Boolean(Vec<Option<bool>>),
    TimestampMicros(Vec<Option<i64>>),
}

impl Column {
    pub fn data_type(&self) -> DataType {
        match self {
            Column::Utf8(_) => DataType::Utf8,
            Column::Boolean(_) => DataType::Boolean,
            Column::TimestampMicros(_) => DataType::TimestampMicros,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Utf8(v) => v.len(),
            Column::Boolean(v) => v.len(),
            Column::TimestampMicros(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn null_count(&self) -> usize {
        match self {
            Column::Utf8(v) => v.iter().filter(|x| x.is_none()).count(),
            Column::Boolean(v) => v.iter().filter(|x| x.is_none()).count(),
            Column::TimestampMicros(v) => v.iter().filter(|x| x.is_none()).count(),
        }
    }
}

/// Equal-length columns under one schema. Only constructible through
/// `try_new`, so a batch in hand is always internally consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    schema: Schema,
    columns: Vec<Column>,
    num_rows: usize,
}

impl RecordBatch {
    pub fn try_new(
        table: &str,
        schema: Schema,
        columns: Vec<Column>,
    ) -> Result<Self, StorageError> {
        let mismatch = |detail: String| StorageError::SchemaMismatch {
            table: table.to_string(),
            detail,
        };

        if schema.fields.len() != columns.len() {
            return Err(mismatch(format!(
                "{} fields but {} columns",
                schema.fields.len(),
                columns.len()
            )));
        }
        let num_rows = columns.first().map(Column::len).unwrap_or(0);
        for (field, col) in schema.fields.iter().zip(&columns) {
            if col.data_type() != field.data_type {
                return Err(mismatch(format!(
                    "column {} is {:?}, schema says {:?}",
                    field.name,
                    col.data_type(),
                    field.data_type
                )));
            }
            if col.len() != num_rows {
                return Err(mismatch(format!(
                    "column {} has {} rows, expected {num_rows}",
                    field.name,
                    col.len()
                )));
            }
            if !field.nullable && col.null_count() > 0 {
                return Err(mismatch(format!("null in non-nullable column {}", field.name)));
            }
        }

        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    /// Re-check a batch that came from disk.
    pub fn validated(self, table: &str) -> Result<Self, StorageError> {
        Self::try_new(table, self.schema, self.columns)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("flag", DataType::Boolean, true),
        ])
    }

    #[test]
    fn consistent_columns_build_a_batch() {
        let b = RecordBatch::try_new(
            "t",
            schema(),
            vec![
                Column::Utf8(vec![Some("a".into()), Some("b".into())]),
                Column::Boolean(vec![None, Some(true)]),
            ],
        )
        .unwrap();
        assert_eq!(b.num_rows(), 2);
        assert!(matches!(b.column("flag"), Some(Column::Boolean(_))));
    }

    #[test]
    fn type_length_and_null_violations_are_rejected() {
        let wrong_type = RecordBatch::try_new(
            "t",
            schema(),
            vec![Column::Utf8(vec![]), Column::Utf8(vec![])],
        );
        assert!(matches!(wrong_type, Err(StorageError::SchemaMismatch { .. })));

        let ragged = RecordBatch::try_new(
            "t",
            schema(),
            vec![Column::Utf8(vec![Some("a".into())]), Column::Boolean(vec![])],
        );
        assert!(matches!(ragged, Err(StorageError::SchemaMismatch { .. })));

        let null_id = RecordBatch::try_new(
            "t",
            schema(),
            vec![Column::Utf8(vec![None]), Column::Boolean(vec![Some(false)])],
        );
        assert!(matches!(null_id, Err(StorageError::SchemaMismatch { .. })));
    }

    #[test]
    fn schema_comparison_reports_both_sides() {
        let other = Schema::new(vec![Field::new("id", DataType::Utf8, true)]);
        let err = other.check_matches(&schema(), "t").unwrap_err();
        assert!(err.to_string().contains("expected [id:Utf8, flag:Boolean?]"));
    }
}
