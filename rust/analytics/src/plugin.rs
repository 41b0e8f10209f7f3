//! The analytics plugin contract: a declared column schema, per-tick row
//! extraction, and the manifest entries the frontend consumes.

use crate::manifest::{ManifestEntry, QuerySpec};
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_types::{MutableCellState, OrganismState};
use thiserror::Error;

/////////////////////////////////////////////// schema /////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ColumnType {
    BigInt,
    Integer,
    Double,
    Varchar,
    Boolean,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            column_type,
        }
    }
}

/// One typed cell of an extracted row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    BigInt(i64),
    Integer(i32),
    Double(f64),
    Varchar(String),
    Boolean(bool),
    Null,
}

impl Value {
    fn matches(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::BigInt(_), ColumnType::BigInt)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Varchar(_), ColumnType::Varchar)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Null, _)
        )
    }
}

/// One extracted row; shape is validated against the plugin schema when the
/// row is buffered, not when it is produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Row(pub Vec<Value>);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("row has {got} values, schema has {want} columns")]
    ArityMismatch { got: usize, want: usize },
    #[error("column '{column}' expects {expected:?}")]
    TypeMismatch { column: String, expected: ColumnType },
}

impl EvochoraError for RowError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

pub fn validate_row(schema: &[ColumnSpec], row: &Row) -> Result<(), RowError> {
    if row.0.len() != schema.len() {
        return Err(RowError::ArityMismatch {
            got: row.0.len(),
            want: schema.len(),
        });
    }
    for (value, spec) in row.0.iter().zip(schema.iter()) {
        if !value.matches(spec.column_type) {
            return Err(RowError::TypeMismatch {
                column: spec.name.clone(),
                expected: spec.column_type,
            });
        }
    }
    Ok(())
}

/////////////////////////////////////////////// ticks //////////////////////////////////////////////

/// The materialized view of one tick handed to `extract_rows`. Snapshot and
/// delta ticks present identically; the cell state is only populated for
/// plugins that declared `needs_environment_data`.
pub struct TickView<'a> {
    pub simulation_run_id: &'a str,
    pub tick_number: i64,
    pub capture_time_ms: i64,
    pub organisms: &'a [OrganismState],
    pub total_organisms_created: i64,
    pub total_unique_genomes: i64,
    pub cell_state: Option<&'a MutableCellState>,
}

////////////////////////////////////////////// plugin //////////////////////////////////////////////

/// A metric extractor. Plugins that will run under competing consumers MUST
/// be stateless across ticks (`is_stateful() == false`); stateful plugins
/// (deltas, lineage) are deployed as a single consumer.
pub trait AnalyticsPlugin: Send + Sync {
    fn metric_id(&self) -> &str;

    /// The on-disk prefix; several manifest entries may share it.
    fn storage_metric_id(&self) -> &str {
        self.metric_id()
    }

    fn sampling_interval(&self) -> i64 {
        1
    }

    fn lod_factor(&self) -> i64 {
        10
    }

    fn lod_levels(&self) -> u32 {
        1
    }

    fn max_data_points(&self) -> Option<i64> {
        None
    }

    fn needs_environment_data(&self) -> bool {
        false
    }

    /// Whether `extract_rows` reads organism fields. `true` (the safe
    /// default) keeps organisms in the wire filter.
    fn needs_organism_data(&self) -> bool {
        true
    }

    fn is_stateful(&self) -> bool {
        false
    }

    /// Ordered column list; extracted rows must match it exactly.
    fn schema(&self) -> Vec<ColumnSpec>;

    fn extract_rows(&mut self, tick: &TickView<'_>) -> Vec<Row>;

    fn manifest_entries(&self) -> Vec<ManifestEntry>;

    fn query_spec(&self) -> Option<QuerySpec> {
        None
    }
}

/// Effective sampling at LOD level `level`.
pub fn effective_sampling(sampling_interval: i64, lod_factor: i64, level: u32) -> i64 {
    sampling_interval.max(1) * lod_factor.max(1).pow(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("tick", ColumnType::BigInt),
            ColumnSpec::new("count", ColumnType::Integer),
            ColumnSpec::new("label", ColumnType::Varchar),
        ]
    }

    #[test]
    fn rows_matching_the_schema_validate() {
        let row = Row(vec![
            Value::BigInt(7),
            Value::Integer(3),
            Value::Varchar("alive".to_string()),
        ]);
        validate_row(&schema(), &row).unwrap();
        // Nulls are allowed in any column.
        let with_null = Row(vec![Value::BigInt(7), Value::Null, Value::Null]);
        validate_row(&schema(), &with_null).unwrap();
    }

    #[test]
    fn arity_and_type_mismatches_are_rejected() {
        let short = Row(vec![Value::BigInt(7)]);
        assert!(matches!(
            validate_row(&schema(), &short),
            Err(RowError::ArityMismatch { got: 1, want: 3 })
        ));
        let wrong = Row(vec![
            Value::Integer(7),
            Value::Integer(3),
            Value::Varchar("x".to_string()),
        ]);
        assert!(matches!(
            validate_row(&schema(), &wrong),
            Err(RowError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn effective_sampling_scales_by_lod_factor() {
        assert_eq!(effective_sampling(1, 10, 0), 1);
        assert_eq!(effective_sampling(1, 10, 1), 10);
        assert_eq!(effective_sampling(5, 10, 2), 500);
        assert_eq!(effective_sampling(3, 4, 1), 12);
    }
}
