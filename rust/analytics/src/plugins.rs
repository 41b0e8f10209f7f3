//! Built-in metric plugins. Both are stateless per tick and safe under
//! competing consumers; they double as reference implementations of the
//! plugin contract.

use crate::config::PluginOptions;
use crate::manifest::{
    ComputedColumn, ComputedKind, ManifestEntry, QuerySpec, VisualizationSpec,
};
use crate::plugin::{AnalyticsPlugin, ColumnSpec, ColumnType, Row, TickView, Value};

/////////////////////////////////////// OrganismCountPlugin ////////////////////////////////////////

/// Population counts per sampled tick.
pub struct OrganismCountPlugin {
    metric_id: String,
    sampling_interval: i64,
    lod_factor: i64,
    lod_levels: u32,
    max_data_points: Option<i64>,
}

impl OrganismCountPlugin {
    pub fn new(options: &PluginOptions) -> OrganismCountPlugin {
        OrganismCountPlugin {
            metric_id: options
                .metric_id
                .clone()
                .unwrap_or_else(|| "organism_count".to_string()),
            sampling_interval: options.sampling_interval,
            lod_factor: options.lod_factor,
            lod_levels: options.lod_levels,
            max_data_points: options.max_data_points,
        }
    }
}

impl AnalyticsPlugin for OrganismCountPlugin {
    fn metric_id(&self) -> &str {
        &self.metric_id
    }

    fn sampling_interval(&self) -> i64 {
        self.sampling_interval
    }

    fn lod_factor(&self) -> i64 {
        self.lod_factor
    }

    fn lod_levels(&self) -> u32 {
        self.lod_levels
    }

    fn max_data_points(&self) -> Option<i64> {
        self.max_data_points
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("tick", ColumnType::BigInt),
            ColumnSpec::new("organism_count", ColumnType::Integer),
            ColumnSpec::new("dead_count", ColumnType::Integer),
            ColumnSpec::new("total_created", ColumnType::BigInt),
            ColumnSpec::new("unique_genomes", ColumnType::BigInt),
        ]
    }

    fn extract_rows(&mut self, tick: &TickView<'_>) -> Vec<Row> {
        let dead = tick.organisms.iter().filter(|o| o.is_dead).count();
        let alive = tick.organisms.len() - dead;
        vec![Row(vec![
            Value::BigInt(tick.tick_number),
            Value::Integer(alive as i32),
            Value::Integer(dead as i32),
            Value::BigInt(tick.total_organisms_created),
            Value::BigInt(tick.total_unique_genomes),
        ])]
    }

    fn manifest_entries(&self) -> Vec<ManifestEntry> {
        vec![ManifestEntry {
            id: self.metric_id.clone(),
            storage_metric_id: None,
            name: "Organism count".to_string(),
            description: "Alive and dead organisms per sampled tick".to_string(),
            data_sources: Default::default(),
            visualization: VisualizationSpec::line_chart(),
            generated_query: None,
            output_columns: None,
            max_data_points: self.max_data_points,
            custom_visualizer_path: None,
        }]
    }

    fn query_spec(&self) -> Option<QuerySpec> {
        Some(QuerySpec {
            base_columns: vec![
                "tick".to_string(),
                "organism_count".to_string(),
                "dead_count".to_string(),
            ],
            computed: vec![ComputedColumn {
                name: "births".to_string(),
                kind: ComputedKind::Delta {
                    source: "total_created".to_string(),
                },
            }],
            output_columns: vec![
                "tick".to_string(),
                "organism_count".to_string(),
                "dead_count".to_string(),
                "births".to_string(),
            ],
            order_by: None,
        })
    }
}

//////////////////////////////////////// EnergyStatsPlugin /////////////////////////////////////////

/// Energy totals over living organisms.
pub struct EnergyStatsPlugin {
    metric_id: String,
    sampling_interval: i64,
    lod_factor: i64,
    lod_levels: u32,
    max_data_points: Option<i64>,
}

impl EnergyStatsPlugin {
    pub fn new(options: &PluginOptions) -> EnergyStatsPlugin {
        EnergyStatsPlugin {
            metric_id: options
                .metric_id
                .clone()
                .unwrap_or_else(|| "energy_stats".to_string()),
            sampling_interval: options.sampling_interval,
            lod_factor: options.lod_factor,
            lod_levels: options.lod_levels,
            max_data_points: options.max_data_points,
        }
    }
}

impl AnalyticsPlugin for EnergyStatsPlugin {
    fn metric_id(&self) -> &str {
        &self.metric_id
    }

    fn sampling_interval(&self) -> i64 {
        self.sampling_interval
    }

    fn lod_factor(&self) -> i64 {
        self.lod_factor
    }

    fn lod_levels(&self) -> u32 {
        self.lod_levels
    }

    fn max_data_points(&self) -> Option<i64> {
        self.max_data_points
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("tick", ColumnType::BigInt),
            ColumnSpec::new("total_energy", ColumnType::BigInt),
            ColumnSpec::new("mean_energy", ColumnType::Double),
            ColumnSpec::new("max_energy", ColumnType::BigInt),
        ]
    }

    fn extract_rows(&mut self, tick: &TickView<'_>) -> Vec<Row> {
        let alive: Vec<&evochora_types::OrganismState> =
            tick.organisms.iter().filter(|o| !o.is_dead).collect();
        let total: i64 = alive.iter().map(|o| o.energy).sum();
        let max = alive.iter().map(|o| o.energy).max();
        let mean = if alive.is_empty() {
            Value::Null
        } else {
            Value::Double(total as f64 / alive.len() as f64)
        };
        vec![Row(vec![
            Value::BigInt(tick.tick_number),
            Value::BigInt(total),
            mean,
            max.map(Value::BigInt).unwrap_or(Value::Null),
        ])]
    }

    fn manifest_entries(&self) -> Vec<ManifestEntry> {
        vec![ManifestEntry {
            id: self.metric_id.clone(),
            storage_metric_id: None,
            name: "Energy".to_string(),
            description: "Total and mean energy of living organisms".to_string(),
            data_sources: Default::default(),
            visualization: VisualizationSpec::line_chart(),
            generated_query: None,
            output_columns: None,
            max_data_points: self.max_data_points,
            custom_visualizer_path: None,
        }]
    }
}
