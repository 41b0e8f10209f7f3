//! The analytics indexer: one competing consumer bound to one run.
//!
//! Startup polls the metadata store (the simulation may not have published
//! yet), derives the LOD plan, and emits manifests. Steady state consumes
//! `BatchInfo` messages, streams the referenced batch file with the
//! narrowest viable field filter, routes ticks through the plugin set, and
//! flushes one parquet file per `(plugin, lod)` before acknowledging. A
//! message is only acked after every output file is durably renamed, so a
//! crash anywhere in between redelivers the batch by lease expiry.

use crate::config::{IndexerConfig, PluginBuildError, PluginRegistry};
use crate::manifest::{lod_glob, TABLE_PLACEHOLDER};
use crate::output::{rows_to_parquet, OutputError, RowBuffer};
use crate::plugin::{effective_sampling, AnalyticsPlugin, ColumnSpec, TickView};
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_metrics::{MetricsSnapshot, Monitored, OperationTimer, UsageType, WindowedMetrics};
use evochora_storage::{layout, BatchStorage, FieldFilter, ReadError, WriteBatchError};
use evochora_sysdb::{SysDb, SysDbError};
use evochora_topic::{ClaimedMessage, Topic};
use evochora_types::{
    BatchInfo, MutableCellState, RunId, SimulationMetadata, TickDataChunk,
};
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexerState {
    Created,
    Starting,
    Running,
    Error,
    Stopped,
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("run metadata did not appear within {waited_ms} ms")]
    MetadataTimeout { waited_ms: u64 },
    #[error("run '{0}' declares no environment shape but a plugin needs environment data")]
    MissingEnvironmentShape(String),
    #[error(transparent)]
    PluginBuild(#[from] PluginBuildError),
    #[error(transparent)]
    SysDb(#[from] SysDbError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Write(#[from] WriteBatchError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("undecodable batch info: {0}")]
    BadBatchInfo(#[from] prost::DecodeError),
    #[error("manifest encoding failed: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("topic error: {0}")]
    Topic(#[source] Box<dyn EvochoraError>),
}

impl EvochoraError for IndexerError {
    fn code(&self) -> ErrorCodes {
        match self {
            IndexerError::MetadataTimeout { .. } => ErrorCodes::DeadlineExceeded,
            IndexerError::MissingEnvironmentShape(_) => ErrorCodes::FailedPrecondition,
            IndexerError::PluginBuild(err) => err.code(),
            IndexerError::SysDb(err) => err.code(),
            IndexerError::Read(err) => err.code(),
            IndexerError::Write(err) => err.code(),
            IndexerError::Output(err) => err.code(),
            IndexerError::BadBatchInfo(_) => ErrorCodes::DataLoss,
            IndexerError::Manifest(_) => ErrorCodes::Internal,
            IndexerError::Topic(err) => err.code(),
        }
    }
}

////////////////////////////////////////////// metrics /////////////////////////////////////////////

#[derive(Default)]
struct IndexerCounters {
    batches_processed: AtomicU64,
    ticks_processed: AtomicU64,
    parquet_files_written: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexerMetricsSnapshot {
    pub batches_processed: u64,
    pub ticks_processed: u64,
    pub parquet_files_written: u64,
    pub write_errors: u64,
}

/////////////////////////////////////////// plugin runtime /////////////////////////////////////////

struct PluginRuntime {
    plugin: Box<dyn AnalyticsPlugin>,
    schema: Vec<ColumnSpec>,
    storage_metric_id: String,
    sampling_interval: i64,
    lod_factor: i64,
    lod_levels: u32,
    buffers: Vec<RowBuffer>,
    /// Populated only for plugins that need environment data.
    cell_state: Option<MutableCellState>,
}

impl PluginRuntime {
    fn new(plugin: Box<dyn AnalyticsPlugin>) -> PluginRuntime {
        let schema = plugin.schema();
        let storage_metric_id = plugin.storage_metric_id().to_string();
        let sampling_interval = plugin.sampling_interval();
        let lod_factor = plugin.lod_factor();
        let lod_levels = plugin.lod_levels().max(1);
        let buffers = (0..lod_levels).map(|_| RowBuffer::default()).collect();
        PluginRuntime {
            plugin,
            schema,
            storage_metric_id,
            sampling_interval,
            lod_factor,
            lod_levels,
            buffers,
            cell_state: None,
        }
    }

}

/// Extract rows once per qualifying tick and fan them out to every LOD
/// buffer whose effective sampling hits this tick. Free function over the
/// runtime's destructured fields so the tick view can keep borrowing the
/// runtime's cell state.
#[allow(clippy::too_many_arguments)]
fn offer_tick(
    plugin: &mut Box<dyn AnalyticsPlugin>,
    schema: &[ColumnSpec],
    buffers: &mut [RowBuffer],
    sampling_interval: i64,
    lod_factor: i64,
    lod_levels: u32,
    view: &TickView<'_>,
) -> Result<(), OutputError> {
    let qualifying: Vec<u32> = (0..lod_levels)
        .filter(|&level| {
            let sampling = effective_sampling(sampling_interval, lod_factor, level);
            view.tick_number % sampling == 0
        })
        .collect();
    if qualifying.is_empty() {
        return Ok(());
    }
    let rows = plugin.extract_rows(view);
    for level in qualifying {
        buffers[level as usize].append(schema, view.tick_number, rows.clone())?;
    }
    Ok(())
}

////////////////////////////////////////// AnalyticsIndexer ////////////////////////////////////////

pub struct AnalyticsIndexer {
    run_id: RunId,
    storage: BatchStorage,
    topic: Topic,
    sysdb: Monitored<SysDb>,
    metadata_reads: Arc<WindowedMetrics>,
    consumer_group: String,
    metadata_poll_interval: Duration,
    metadata_max_poll_duration: Duration,
    bucket_levels: Vec<i64>,
    plugins: Vec<PluginRuntime>,
    filter: FieldFilter,
    state: Arc<Mutex<IndexerState>>,
    counters: Arc<IndexerCounters>,
    timing: Arc<WindowedMetrics>,
}

impl AnalyticsIndexer {
    pub fn new(
        storage: BatchStorage,
        topic: Topic,
        sysdb: SysDb,
        config: &IndexerConfig,
        registry: &PluginRegistry,
    ) -> Result<AnalyticsIndexer, Box<dyn EvochoraError>> {
        let run_id = RunId::new(config.run_id.clone()).map_err(|err| err.boxed())?;
        let mut plugins = Vec::with_capacity(config.plugins.len());
        for plugin_config in &config.plugins {
            let plugin = registry.build(plugin_config).map_err(|err| err.boxed())?;
            plugins.push(PluginRuntime::new(plugin));
        }

        // The narrowest filter the plugin set allows: cells dominate batch
        // size, so dropping them wins over dropping organisms.
        let needs_cells = plugins.iter().any(|p| p.plugin.needs_environment_data());
        let needs_organisms = plugins.iter().any(|p| p.plugin.needs_organism_data());
        let filter = if !needs_cells {
            FieldFilter::SkipCells
        } else if !needs_organisms {
            FieldFilter::SkipOrganisms
        } else {
            FieldFilter::All
        };

        // The metadata store does not meter itself, so it goes behind the
        // capability wrapper and this consumer times its own reads.
        let sysdb = Monitored::new(sysdb, Duration::from_secs(5));
        let metadata_reads = sysdb
            .for_usage(UsageType::DbMetaRead)
            .map_err(|err| err.boxed())?;

        Ok(AnalyticsIndexer {
            run_id,
            storage,
            topic,
            sysdb,
            metadata_reads,
            consumer_group: config.consumer_group.clone(),
            metadata_poll_interval: Duration::from_millis(config.metadata_poll_interval_ms.max(1)),
            metadata_max_poll_duration: Duration::from_millis(config.metadata_max_poll_duration_ms),
            bucket_levels: config.folder_structure.levels.clone(),
            plugins,
            filter,
            state: Arc::new(Mutex::new(IndexerState::Created)),
            counters: Arc::new(IndexerCounters::default()),
            timing: Arc::new(WindowedMetrics::new(Duration::from_secs(5))),
        })
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock()
    }

    /// The wire filter chosen from the plugin set's declared needs.
    pub fn selected_filter(&self) -> FieldFilter {
        self.filter
    }

    /// Metrics stay readable in every state, including `Error`.
    pub fn metrics(&self) -> IndexerMetricsSnapshot {
        IndexerMetricsSnapshot {
            batches_processed: self.counters.batches_processed.load(Ordering::Relaxed),
            ticks_processed: self.counters.ticks_processed.load(Ordering::Relaxed),
            parquet_files_written: self.counters.parquet_files_written.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }

    pub fn timing(&self) -> Arc<WindowedMetrics> {
        self.timing.clone()
    }

    /// Counters for this consumer's metadata-store reads, from the
    /// `db-meta-read` window of the wrapped store.
    pub fn metadata_read_metrics(&self) -> MetricsSnapshot {
        self.metadata_reads.snapshot()
    }

    /// Run until cancelled. Graceful shutdown drains the in-flight batch
    /// and leaves unprocessed messages un-acked for redelivery.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), IndexerError> {
        *self.state.lock() = IndexerState::Starting;
        let metadata = match self.await_metadata(cancel).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                *self.state.lock() = IndexerState::Stopped;
                return Ok(());
            }
            Err(err) => {
                *self.state.lock() = IndexerState::Error;
                return Err(err);
            }
        };
        if let Err(err) = self.prepare_outputs(&metadata).await {
            *self.state.lock() = IndexerState::Error;
            return Err(err);
        }
        *self.state.lock() = IndexerState::Running;

        let subscription = self.topic.subscribe(self.run_id.as_str(), &self.consumer_group);
        loop {
            let message = match subscription.next(cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "topic poll failed, backing off");
                    self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.metadata_poll_interval).await;
                    continue;
                }
            };
            let timing = self.timing.clone();
            let timer = OperationTimer::start(&timing);
            match self.process_message(&message, cancel).await {
                Ok(()) => {
                    timer.finish();
                    if let Err(err) = subscription.ack(&message).await {
                        tracing::warn!(%err, "ack failed; message will redeliver");
                    }
                    self.counters.batches_processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(IndexerError::Read(ReadError::Cancelled)) => {
                    // Shutdown mid-batch: do not ack, the lease redelivers.
                    timer.finish_with_error();
                    self.discard_buffers();
                    break;
                }
                Err(err) => {
                    timer.finish_with_error();
                    tracing::warn!(%err, message_id = message.id, "batch processing failed; leaving un-acked");
                    self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    self.discard_buffers();
                    tokio::time::sleep(self.metadata_poll_interval).await;
                }
            }
        }
        *self.state.lock() = IndexerState::Stopped;
        Ok(())
    }

    /// Poll the metadata store until the run appears. `Ok(None)` means the
    /// wait was cancelled.
    async fn await_metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SimulationMetadata>, IndexerError> {
        let started = std::time::Instant::now();
        loop {
            let timer = OperationTimer::start(&self.metadata_reads);
            let polled = self.sysdb.inner().get_metadata(&self.run_id).await;
            match &polled {
                Ok(_) => timer.finish(),
                Err(_) => timer.finish_with_error(),
            }
            if let Some(metadata) = polled? {
                return Ok(Some(metadata));
            }
            if started.elapsed() >= self.metadata_max_poll_duration {
                return Err(IndexerError::MetadataTimeout {
                    waited_ms: self.metadata_max_poll_duration.as_millis() as u64,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.metadata_poll_interval) => {}
            }
        }
    }

    /// Derive the LOD plan, size cell states, pre-create lod folders, and
    /// emit one manifest per plugin.
    async fn prepare_outputs(&mut self, metadata: &SimulationMetadata) -> Result<(), IndexerError> {
        let total_cells = total_cells_from_config(&metadata.resolved_config_json);
        for runtime in &mut self.plugins {
            if runtime.plugin.needs_environment_data() {
                let total_cells = total_cells.ok_or_else(|| {
                    IndexerError::MissingEnvironmentShape(metadata.simulation_run_id.clone())
                })?;
                runtime.cell_state = Some(MutableCellState::new(total_cells));
            }
        }

        for runtime in &self.plugins {
            for level in 0..runtime.lod_levels {
                self.storage
                    .ensure_analytics_dir(
                        self.run_id.as_str(),
                        &format!("{}/lod{}", runtime.storage_metric_id, level),
                    )
                    .await?;
            }

            let mut entries = runtime.plugin.manifest_entries();
            let generated_query = runtime.plugin.query_spec().map(|spec| {
                let table = format!("read_parquet('{}')", lod_glob(&runtime.storage_metric_id, 0));
                (spec.render_sql().replace(TABLE_PLACEHOLDER, &table), spec)
            });
            for entry in &mut entries {
                entry
                    .storage_metric_id
                    .get_or_insert_with(|| runtime.storage_metric_id.clone());
                entry.data_sources = (0..runtime.lod_levels)
                    .map(|level| {
                        (
                            format!("lod{}", level),
                            lod_glob(&runtime.storage_metric_id, level),
                        )
                    })
                    .collect();
                if let Some((sql, spec)) = &generated_query {
                    entry.generated_query = Some(sql.clone());
                    entry
                        .output_columns
                        .get_or_insert_with(|| spec.output_columns.clone());
                }
            }
            let json = serde_json::to_vec_pretty(&entries)?;
            self.storage
                .put_analytics_file(
                    self.run_id.as_str(),
                    &format!("{}/metadata.json", runtime.storage_metric_id),
                    &json,
                )
                .await?;
        }
        Ok(())
    }

    /// One batch in, at most one parquet file out per `(plugin, lod)`.
    async fn process_message(
        &mut self,
        message: &ClaimedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let info = BatchInfo::decode(&message.payload[..])?;
        tracing::debug!(
            storage_path = %info.storage_path,
            tick_start = info.tick_start,
            tick_end = info.tick_end,
            "processing batch"
        );

        let storage = self.storage.clone();
        let filter = self.filter;
        let mut route_error: Option<OutputError> = None;
        let plugins = &mut self.plugins;
        let counters = &self.counters;
        let streamed = storage
            .for_each_chunk(&info.storage_path, filter, cancel, |chunk| {
                counters
                    .ticks_processed
                    .fetch_add(chunk.tick_count.max(0) as u64, Ordering::Relaxed);
                for runtime in plugins.iter_mut() {
                    if let Err(err) = route_chunk(runtime, &chunk) {
                        route_error = Some(err);
                        return Err(Box::new(RoutingFailed) as Box<dyn EvochoraError>);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(err) = streamed {
            return Err(match route_error.take() {
                Some(output_err) => IndexerError::Output(output_err),
                None => IndexerError::Read(err),
            });
        }

        self.flush_buffers().await
    }

    async fn flush_buffers(&mut self) -> Result<(), IndexerError> {
        for runtime in &mut self.plugins {
            for level in 0..runtime.lod_levels as usize {
                let (rows, range) = runtime.buffers[level].take();
                let Some((min_tick, max_tick)) = range else {
                    continue;
                };
                let bytes = rows_to_parquet(&runtime.schema, &rows)?;
                let relative = format!(
                    "{}/lod{}/{}/batch_{:020}_{:020}.parquet",
                    runtime.storage_metric_id,
                    level,
                    layout::bucket_path(min_tick, &self.bucket_levels),
                    min_tick,
                    max_tick
                );
                self.storage
                    .put_analytics_file(self.run_id.as_str(), &relative, &bytes)
                    .await?;
                self.counters
                    .parquet_files_written
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// A failed batch leaves partial rows behind; drop them so the
    /// redelivered batch starts clean.
    fn discard_buffers(&mut self) {
        for runtime in &mut self.plugins {
            for buffer in &mut runtime.buffers {
                let _ = buffer.take();
            }
        }
    }
}

/// Marker error so the streaming reader aborts on a routing failure; the
/// real cause is carried out of the closure separately.
#[derive(Error, Debug)]
#[error("tick routing failed")]
struct RoutingFailed;

impl EvochoraError for RoutingFailed {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

fn route_chunk(runtime: &mut PluginRuntime, chunk: &TickDataChunk) -> Result<(), OutputError> {
    let PluginRuntime {
        plugin,
        schema,
        sampling_interval,
        lod_factor,
        lod_levels,
        buffers,
        cell_state,
        ..
    } = runtime;
    let Some(snapshot) = chunk.snapshot.as_ref() else {
        return Ok(());
    };
    if let Some(state) = cell_state.as_mut() {
        match snapshot.cell_columns.as_ref() {
            Some(columns) => state.apply_snapshot(columns),
            None => state.reset(),
        }
    }
    let view = TickView {
        simulation_run_id: &chunk.simulation_run_id,
        tick_number: snapshot.tick_number,
        capture_time_ms: snapshot.capture_time_ms,
        organisms: &snapshot.organisms,
        total_organisms_created: snapshot.total_organisms_created,
        total_unique_genomes: snapshot.total_unique_genomes,
        cell_state: cell_state.as_ref(),
    };
    offer_tick(
        plugin,
        schema,
        buffers,
        *sampling_interval,
        *lod_factor,
        *lod_levels,
        &view,
    )?;

    for delta in &chunk.deltas {
        if let Some(state) = cell_state.as_mut() {
            if let Some(columns) = delta.changed_cells.as_ref() {
                state.apply_delta(columns);
            }
        }
        let view = TickView {
            simulation_run_id: &chunk.simulation_run_id,
            tick_number: delta.tick_number,
            capture_time_ms: delta.capture_time_ms,
            organisms: &delta.organisms,
            total_organisms_created: delta.total_organisms_created,
            total_unique_genomes: delta.total_unique_genomes,
            cell_state: cell_state.as_ref(),
        };
        offer_tick(
            plugin,
            schema,
            buffers,
            *sampling_interval,
            *lod_factor,
            *lod_levels,
            &view,
        )?;
    }
    Ok(())
}

/// Pull `environment.shape` out of the resolved config and multiply it into
/// a flat cell count.
fn total_cells_from_config(resolved_config_json: &str) -> Option<usize> {
    let config: serde_json::Value = serde_json::from_str(resolved_config_json).ok()?;
    let shape = config.get("environment")?.get("shape")?.as_array()?;
    let mut total: usize = 1;
    for dimension in shape {
        total = total.checked_mul(dimension.as_u64()? as usize)?;
    }
    (total > 0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cells_multiplies_the_shape() {
        assert_eq!(
            total_cells_from_config(r#"{"environment":{"shape":[100,100]}}"#),
            Some(10_000)
        );
        assert_eq!(
            total_cells_from_config(r#"{"environment":{"shape":[4,4,4]}}"#),
            Some(64)
        );
        assert_eq!(total_cells_from_config(r#"{"environment":{}}"#), None);
        assert_eq!(total_cells_from_config("not json"), None);
        assert_eq!(
            total_cells_from_config(r#"{"environment":{"shape":[0,5]}}"#),
            None
        );
    }
}
