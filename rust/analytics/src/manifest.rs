//! The per-metric manifest consumed by the visualization frontend, plus the
//! declarative query specs the core renders to SQL.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One metric as the frontend sees it. `data_sources` maps `lodK` to a glob
/// over that level's parquet files, relative to the analytics root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_metric_id: Option<String>,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub data_sources: BTreeMap<String, String>,
    pub visualization: VisualizationSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_data_points: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_visualizer_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisualizationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl VisualizationSpec {
    pub fn line_chart() -> VisualizationSpec {
        VisualizationSpec {
            kind: "line".to_string(),
            config: serde_json::json!({ "x": "tick" }),
        }
    }
}

/// The glob for one `(storage_metric_id, lod)` pair, relative to the run's
/// analytics root.
pub fn lod_glob(storage_metric_id: &str, level: u32) -> String {
    format!("{}/lod{}/**/*.parquet", storage_metric_id, level)
}

////////////////////////////////////////////// queries /////////////////////////////////////////////

/// Placeholder the query renderer leaves for the client's table reference.
pub const TABLE_PLACEHOLDER: &str = "{table}";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub base_columns: Vec<String>,
    #[serde(default)]
    pub computed: Vec<ComputedColumn>,
    pub output_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputedColumn {
    pub name: String,
    #[serde(flatten)]
    pub kind: ComputedKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum ComputedKind {
    Delta { source: String },
    Lag { source: String },
    Expression { expr: String },
}

impl QuerySpec {
    /// Render to SQL with a `{table}` placeholder. The window functions
    /// order by the spec's `order_by` column (default `tick`).
    pub fn render_sql(&self) -> String {
        let order_by = self.order_by.as_deref().unwrap_or("tick");
        let mut selected: Vec<String> = self.base_columns.clone();
        for computed in &self.computed {
            let expression = match &computed.kind {
                ComputedKind::Delta { source } => format!(
                    "{} - LAG({}) OVER (ORDER BY {})",
                    source, source, order_by
                ),
                ComputedKind::Lag { source } => {
                    format!("LAG({}) OVER (ORDER BY {})", source, order_by)
                }
                ComputedKind::Expression { expr } => expr.clone(),
            };
            selected.push(format!("{} AS {}", expression, computed.name));
        }
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            selected.join(", "),
            TABLE_PLACEHOLDER,
            order_by
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_spec_renders_window_functions() {
        let spec = QuerySpec {
            base_columns: vec!["tick".to_string(), "organism_count".to_string()],
            computed: vec![
                ComputedColumn {
                    name: "births".to_string(),
                    kind: ComputedKind::Delta {
                        source: "total_created".to_string(),
                    },
                },
                ComputedColumn {
                    name: "previous_count".to_string(),
                    kind: ComputedKind::Lag {
                        source: "organism_count".to_string(),
                    },
                },
            ],
            output_columns: vec!["tick".to_string(), "births".to_string()],
            order_by: None,
        };
        assert_eq!(
            spec.render_sql(),
            "SELECT tick, organism_count, \
             total_created - LAG(total_created) OVER (ORDER BY tick) AS births, \
             LAG(organism_count) OVER (ORDER BY tick) AS previous_count \
             FROM {table} ORDER BY tick"
        );
    }

    #[test]
    fn manifest_serializes_without_empty_optionals() {
        let entry = ManifestEntry {
            id: "organism_count".to_string(),
            storage_metric_id: None,
            name: "Organisms".to_string(),
            description: "Population over time".to_string(),
            data_sources: [("lod0".to_string(), lod_glob("organism_count", 0))]
                .into_iter()
                .collect(),
            visualization: VisualizationSpec::line_chart(),
            generated_query: None,
            output_columns: None,
            max_data_points: None,
            custom_visualizer_path: None,
        };
        let json = serde_json::to_string_pretty(&entry).unwrap();
        assert!(json.contains("\"lod0\": \"organism_count/lod0/**/*.parquet\""));
        assert!(!json.contains("generated_query"));
        let parsed: ManifestEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
