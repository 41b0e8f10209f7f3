//! Row buffering and parquet construction. Rows accumulate per
//! `(plugin, lod)` while a batch streams through, then flush to one parquet
//! file whose name carries the buffered tick range.

use crate::plugin::{validate_row, ColumnSpec, ColumnType, Row, RowError, Value};
use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int32Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use evochora_error::{ErrorCodes, EvochoraError};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error(transparent)]
    Row(#[from] RowError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl EvochoraError for OutputError {
    fn code(&self) -> ErrorCodes {
        match self {
            OutputError::Row(err) => err.code(),
            OutputError::Arrow(_) => ErrorCodes::Internal,
            OutputError::Parquet(_) => ErrorCodes::Internal,
        }
    }
}

/////////////////////////////////////////////// buffer /////////////////////////////////////////////

/// Rows buffered for one `(plugin, lod)` pair within one input batch.
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: Vec<Row>,
    min_tick: Option<i64>,
    max_tick: Option<i64>,
}

impl RowBuffer {
    pub fn append(
        &mut self,
        schema: &[ColumnSpec],
        tick: i64,
        rows: Vec<Row>,
    ) -> Result<(), OutputError> {
        for row in &rows {
            validate_row(schema, row)?;
        }
        if !rows.is_empty() {
            self.min_tick = Some(self.min_tick.map_or(tick, |t| t.min(tick)));
            self.max_tick = Some(self.max_tick.map_or(tick, |t| t.max(tick)));
            self.rows.extend(rows);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn tick_range(&self) -> Option<(i64, i64)> {
        Some((self.min_tick?, self.max_tick?))
    }

    /// Drain the buffer for the next batch, returning the rows and range.
    pub fn take(&mut self) -> (Vec<Row>, Option<(i64, i64)>) {
        let range = self.tick_range();
        self.min_tick = None;
        self.max_tick = None;
        (std::mem::take(&mut self.rows), range)
    }
}

/////////////////////////////////////////////// parquet ////////////////////////////////////////////

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::BigInt => DataType::Int64,
        ColumnType::Integer => DataType::Int32,
        ColumnType::Double => DataType::Float64,
        ColumnType::Varchar => DataType::Utf8,
        ColumnType::Boolean => DataType::Boolean,
    }
}

/// Build one parquet file from validated rows. Columns come out in schema
/// order; every column is nullable so plugins can emit partial rows.
pub fn rows_to_parquet(schema: &[ColumnSpec], rows: &[Row]) -> Result<Vec<u8>, OutputError> {
    let fields: Vec<Field> = schema
        .iter()
        .map(|spec| Field::new(&spec.name, arrow_type(spec.column_type), true))
        .collect();
    let arrow_schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());
    for (index, spec) in schema.iter().enumerate() {
        let column: ArrayRef = match spec.column_type {
            ColumnType::BigInt => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row.0[index] {
                        Value::BigInt(v) => builder.append_value(*v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Integer => {
                let mut builder = Int32Builder::with_capacity(rows.len());
                for row in rows {
                    match &row.0[index] {
                        Value::Integer(v) => builder.append_value(*v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Double => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row.0[index] {
                        Value::Double(v) => builder.append_value(*v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Varchar => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match &row.0[index] {
                        Value::Varchar(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for row in rows {
                    match &row.0[index] {
                        Value::Boolean(v) => builder.append_value(*v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        columns.push(column);
    }

    let batch = RecordBatch::try_new(arrow_schema.clone(), columns)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut buffer = vec![];
    let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}
