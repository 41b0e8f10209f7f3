//! The atomic write paths: streaming batch writes, the metadata blob, and
//! analytics output files. Everything lands via temp-file-plus-rename so a
//! reader never observes a partial file under a final name.

use crate::codec::{write_delimited, CodecError};
use crate::layout::{self, KeyError};
use crate::BatchStorage;
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_metrics::{OperationTimer, UsageType};
use evochora_types::{BatchInfo, ChunkValidationError, SimulationMetadata, TickDataChunk};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WriteBatchError {
    #[error("cannot write an empty batch")]
    EmptyBatch,
    #[error("chunk run id '{found}' does not match batch run id '{expected}'")]
    MismatchedRunId { expected: String, found: String },
    #[error("chunk first_tick {next_first} precedes previous last_tick {previous_last}")]
    OutOfOrderChunks { previous_last: i64, next_first: i64 },
    #[error(transparent)]
    InvalidChunk(#[from] ChunkValidationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvochoraError for WriteBatchError {
    fn code(&self) -> ErrorCodes {
        match self {
            WriteBatchError::EmptyBatch => ErrorCodes::InvalidArgument,
            WriteBatchError::MismatchedRunId { .. } => ErrorCodes::InvalidArgument,
            WriteBatchError::OutOfOrderChunks { .. } => ErrorCodes::FailedPrecondition,
            WriteBatchError::InvalidChunk(err) => err.code(),
            WriteBatchError::Codec(err) => err.code(),
            WriteBatchError::Key(err) => err.code(),
            WriteBatchError::Io(err) => err.code(),
        }
    }
}

/// The receipt returned once a batch file is durably in place.
#[derive(Clone, Debug, PartialEq)]
pub struct WrittenBatch {
    /// Root-relative path with `/` separators, as published to the topic.
    pub storage_path: String,
    pub simulation_run_id: String,
    pub first_tick: i64,
    pub last_tick: i64,
    pub chunk_count: u64,
    pub total_tick_count: i64,
    pub bytes_written: u64,
}

impl WrittenBatch {
    pub fn to_batch_info(&self, written_at_ms: i64) -> BatchInfo {
        BatchInfo {
            simulation_run_id: self.simulation_run_id.clone(),
            storage_path: self.storage_path.clone(),
            tick_start: self.first_tick,
            tick_end: self.last_tick,
            written_at_ms,
        }
    }
}

/////////////////////////////////////////// plumbing ///////////////////////////////////////////////

/// Small Write adapter that counts bytes written.
pub(crate) struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, written: 0 }
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.written
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Removes the temp file on drop unless the write reached its rename.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> TempFileGuard {
        TempFileGuard { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best effort; an orphaned .tmp is ignored by every reader.
            if let Err(err) = fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), %err, "failed to remove temp file");
            }
        }
    }
}

fn temp_sibling(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}.{}{}", stem, Uuid::new_v4(), layout::TEMP_FILE_SUFFIX))
}

////////////////////////////////////////////// writes //////////////////////////////////////////////

impl BatchStorage {
    /// Stream an ordered, non-empty sequence of chunks into a single batch
    /// file. The file is named from the first chunk's `first_tick` and the
    /// last observed `last_tick` and renamed into place only after the
    /// iterator is drained.
    pub async fn write_batch<I>(&self, chunks: I) -> Result<WrittenBatch, WriteBatchError>
    where
        I: IntoIterator<Item = TickDataChunk>,
    {
        let mut timer = OperationTimer::start(self.window(UsageType::StorageWrite));
        match self.write_batch_inner(chunks) {
            Ok(written) => {
                timer.add_bytes(written.bytes_written);
                timer.finish();
                Ok(written)
            }
            Err(err) => {
                timer.finish_with_error();
                Err(err)
            }
        }
    }

    fn write_batch_inner<I>(&self, chunks: I) -> Result<WrittenBatch, WriteBatchError>
    where
        I: IntoIterator<Item = TickDataChunk>,
    {
        let mut iter = chunks.into_iter();
        let first = iter.next().ok_or(WriteBatchError::EmptyBatch)?;
        first.validate()?;

        let run_id = first.simulation_run_id.clone();
        layout::validate_key(&run_id)?;
        let first_tick = first.first_tick;
        let buckets = layout::bucket_path(first_tick, self.levels());
        let dir = self
            .run_root(&run_id)
            .join(layout::RAW_DIR)
            .join(&buckets);
        fs::create_dir_all(&dir)?;

        let temp_path = temp_sibling(&dir, &format!("batch_{:020}", first_tick));
        let guard = TempFileGuard::new(temp_path.clone());
        let file = File::create(&temp_path)?;
        let counting = CountingWriter::new(file);
        let mut writer = self
            .compression_codec()
            .wrap_writer(counting, self.compression_level())?;

        write_delimited(&mut writer, &first)?;
        let mut chunk_count = 1u64;
        let mut total_tick_count = first.tick_count;
        let mut last_tick = first.last_tick;
        drop(first);

        for chunk in iter {
            chunk.validate()?;
            if chunk.simulation_run_id != run_id {
                return Err(WriteBatchError::MismatchedRunId {
                    expected: run_id,
                    found: chunk.simulation_run_id,
                });
            }
            if chunk.first_tick < last_tick {
                return Err(WriteBatchError::OutOfOrderChunks {
                    previous_last: last_tick,
                    next_first: chunk.first_tick,
                });
            }
            write_delimited(&mut writer, &chunk)?;
            chunk_count += 1;
            total_tick_count += chunk.tick_count;
            last_tick = chunk.last_tick;
        }

        let counting = writer.finish()?;
        let bytes_written = counting.bytes_written();
        let file = counting.into_inner();
        file.sync_all()?;
        drop(file);

        let file_name = layout::batch_file_name(
            first_tick,
            last_tick,
            self.compression_codec().extension(),
        );
        let final_path = dir.join(&file_name);
        fs::rename(&temp_path, &final_path)?;
        guard.disarm();

        let storage_path = format!(
            "{}/{}/{}/{}",
            run_id,
            layout::RAW_DIR,
            buckets,
            file_name
        );
        tracing::debug!(
            %storage_path,
            first_tick,
            last_tick,
            chunk_count,
            bytes_written,
            "wrote batch file"
        );
        Ok(WrittenBatch {
            storage_path,
            simulation_run_id: run_id,
            first_tick,
            last_tick,
            chunk_count,
            total_tick_count,
            bytes_written,
        })
    }

    /// Write the run's metadata blob at `<run>/raw/metadata.pb[.<ext>]`.
    pub async fn write_metadata(
        &self,
        run_id: &str,
        metadata: &SimulationMetadata,
    ) -> Result<String, WriteBatchError> {
        let timer = OperationTimer::start(self.window(UsageType::StorageWrite));
        let result = self.write_metadata_inner(run_id, metadata);
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }
        result
    }

    fn write_metadata_inner(
        &self,
        run_id: &str,
        metadata: &SimulationMetadata,
    ) -> Result<String, WriteBatchError> {
        layout::validate_key(run_id)?;
        let dir = self.run_root(run_id).join(layout::RAW_DIR);
        fs::create_dir_all(&dir)?;
        let file_name = format!(
            "{}{}",
            layout::METADATA_FILE_STEM,
            self.compression_codec().extension()
        );
        let temp_path = temp_sibling(&dir, layout::METADATA_FILE_STEM);
        let guard = TempFileGuard::new(temp_path.clone());

        let file = File::create(&temp_path)?;
        let mut writer = self
            .compression_codec()
            .wrap_writer(file, self.compression_level())?;
        write_delimited(&mut writer, metadata)?;
        let file = writer.finish()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, dir.join(&file_name))?;
        guard.disarm();
        Ok(format!("{}/{}/{}", run_id, layout::RAW_DIR, file_name))
    }

    /// Write an analytics output file under `<run>/analytics/<relative>`.
    /// The relative key is validated as a pure string and then checked for
    /// containment after canonicalization.
    pub async fn put_analytics_file(
        &self,
        run_id: &str,
        relative: &str,
        bytes: &[u8],
    ) -> Result<String, WriteBatchError> {
        let mut timer = OperationTimer::start(self.window(UsageType::AnalyticsWrite));
        match self.put_analytics_file_inner(run_id, relative, bytes) {
            Ok(path) => {
                timer.add_bytes(bytes.len() as u64);
                timer.finish();
                Ok(path)
            }
            Err(err) => {
                timer.finish_with_error();
                Err(err)
            }
        }
    }

    /// Create an analytics directory (e.g. a metric's lod folder) ahead of
    /// the first file landing in it.
    pub async fn ensure_analytics_dir(
        &self,
        run_id: &str,
        relative: &str,
    ) -> Result<(), WriteBatchError> {
        layout::validate_key(run_id)?;
        layout::validate_key(relative)?;
        fs::create_dir_all(self.analytics_root(run_id).join(relative))?;
        Ok(())
    }

    fn put_analytics_file_inner(
        &self,
        run_id: &str,
        relative: &str,
        bytes: &[u8],
    ) -> Result<String, WriteBatchError> {
        layout::validate_key(run_id)?;
        layout::validate_key(relative)?;
        let analytics_root = self.analytics_root(run_id);
        let joined = analytics_root.join(relative);
        if let Some(parent) = joined.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&analytics_root)?;
        let target = layout::resolve_under_root(&analytics_root, relative)?;

        let dir = target
            .parent()
            .expect("resolved analytics path always has a parent");
        let stem = target
            .file_name()
            .and_then(|name| name.to_str())
            .expect("resolved analytics path always has a file name");
        let temp_path = temp_sibling(dir, stem);
        let guard = TempFileGuard::new(temp_path.clone());

        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &target)?;
        guard.disarm();

        Ok(format!(
            "{}/{}/{}",
            run_id,
            layout::ANALYTICS_DIR,
            relative
        ))
    }
}
