//! Streaming read paths over batch files. All readers decompress on the
//! fly, check the cancellation token between frames, and surface corruption
//! without attempting partial recovery.

use crate::codec::{self, CodecError, FieldFilter, RawChunk};
use crate::compression::{CodecReader, CompressionCodec};
use crate::layout;
use crate::listing::ListError;
use crate::BatchStorage;
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_metrics::{OperationTimer, UsageType};
use evochora_types::{SimulationMetadata, TickData, TickDataChunk};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("file '{0}' contains no messages")]
    EmptyFile(String),
    #[error("file '{0}' contains more than one message")]
    MultipleMessages(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] layout::KeyError),
    #[error(transparent)]
    List(#[from] ListError),
    #[error("read cancelled")]
    Cancelled,
    #[error("consumer failed: {0}")]
    Consumer(#[source] Box<dyn EvochoraError>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvochoraError for ReadError {
    fn code(&self) -> ErrorCodes {
        match self {
            ReadError::NotFound(_) => ErrorCodes::NotFound,
            ReadError::EmptyFile(_) => ErrorCodes::DataLoss,
            ReadError::MultipleMessages(_) => ErrorCodes::DataLoss,
            ReadError::Codec(err) => err.code(),
            ReadError::Key(err) => err.code(),
            ReadError::List(err) => err.code(),
            ReadError::Cancelled => ErrorCodes::Cancelled,
            ReadError::Consumer(err) => err.code(),
            ReadError::Io(err) => err.code(),
        }
    }
}

impl BatchStorage {
    fn resolve_key(&self, key: &str) -> Result<PathBuf, ReadError> {
        layout::validate_key(key)?;
        Ok(self.root().join(key))
    }

    fn open_chunk_reader(
        &self,
        path: &PathBuf,
    ) -> Result<(CodecReader<BufReader<File>>, u64), ReadError> {
        let file = File::open(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ReadError::NotFound(path.display().to_string())
            } else {
                ReadError::Io(err)
            }
        })?;
        let compressed_len = file.metadata()?.len();
        let mut buffered = BufReader::new(file);
        // Extension first, magic bytes as the fallback for unlabeled files.
        let compression = match CompressionCodec::from_extension(path) {
            Some(compression) => compression,
            None => CompressionCodec::from_magic(buffered.fill_buf()?),
        };
        Ok((compression.wrap_reader(buffered)?, compressed_len))
    }

    /// Read a file holding exactly one length-delimited message.
    pub async fn read_message<M>(&self, key: &str) -> Result<M, ReadError>
    where
        M: prost::Message + Default,
    {
        let timer = OperationTimer::start(self.window(UsageType::StorageRead));
        let result = self.read_message_inner(key);
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }
        result
    }

    fn read_message_inner<M>(&self, key: &str) -> Result<M, ReadError>
    where
        M: prost::Message + Default,
    {
        let path = self.resolve_key(key)?;
        let (mut reader, _) = self.open_chunk_reader(&path)?;
        let frame = codec::read_delimited_frame(&mut reader)?
            .ok_or_else(|| ReadError::EmptyFile(key.to_string()))?;
        let message = M::decode(&frame[..]).map_err(CodecError::Decode)?;
        if codec::read_delimited_frame(&mut reader)?.is_some() {
            return Err(ReadError::MultipleMessages(key.to_string()));
        }
        Ok(message)
    }

    /// Locate and read the run's metadata blob.
    pub async fn read_metadata(&self, run_id: &str) -> Result<SimulationMetadata, ReadError> {
        let key = self
            .find_metadata_path(run_id)
            .await?
            .ok_or_else(|| ReadError::NotFound(format!("{}/raw/metadata.pb", run_id)))?;
        self.read_message(&key).await
    }

    /// The snapshot of the last chunk that still parses. Used to resume a
    /// run from the most recent complete state; trailing corruption is
    /// tolerated as long as at least one chunk parsed.
    pub async fn read_last_snapshot(&self, key: &str) -> Result<TickData, ReadError> {
        let timer = OperationTimer::start(self.window(UsageType::StorageRead));
        let result = self.read_last_snapshot_inner(key);
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }
        result
    }

    fn read_last_snapshot_inner(&self, key: &str) -> Result<TickData, ReadError> {
        let path = self.resolve_key(key)?;
        let (mut reader, _) = self.open_chunk_reader(&path)?;
        let mut last_snapshot: Option<TickData> = None;
        loop {
            let frame = match codec::read_delimited_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    if last_snapshot.is_some() {
                        tracing::warn!(key, %err, "stopping at trailing corruption");
                        break;
                    }
                    return Err(err.into());
                }
            };
            match codec::parse_chunk_snapshot_only(&frame) {
                Ok(chunk) => {
                    if let Some(snapshot) = chunk.snapshot {
                        last_snapshot = Some(snapshot);
                    }
                }
                Err(err) => {
                    if last_snapshot.is_some() {
                        tracing::warn!(key, %err, "stopping at unparseable chunk");
                        break;
                    }
                    return Err(err.into());
                }
            }
        }
        last_snapshot.ok_or_else(|| ReadError::EmptyFile(key.to_string()))
    }

    /// Stream each chunk's raw bytes plus its header to the consumer. The
    /// bytes are handed over exactly as framed, for zero-copy forwarding.
    pub async fn for_each_raw_chunk<F>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut consumer: F,
    ) -> Result<u64, ReadError>
    where
        F: FnMut(RawChunk) -> Result<(), Box<dyn EvochoraError>>,
    {
        let mut timer = OperationTimer::start(self.window(UsageType::StorageRead));
        let result = self.stream_frames(key, cancel, |frame| {
            let header = codec::parse_chunk_header(&frame)?;
            consumer(RawChunk {
                first_tick: header.first_tick,
                last_tick: header.last_tick,
                tick_count: header.tick_count,
                bytes: frame,
            })
            .map_err(ReadError::Consumer)
        });
        match &result {
            Ok((_, compressed)) => {
                timer.add_bytes(*compressed);
                timer.finish();
            }
            Err(_) => timer.finish_with_error(),
        }
        result.map(|(chunks, _)| chunks)
    }

    /// Stream parsed chunks to the consumer, using the filtered parse when
    /// a filter other than `All` is requested.
    pub async fn for_each_chunk<F>(
        &self,
        key: &str,
        filter: FieldFilter,
        cancel: &CancellationToken,
        mut consumer: F,
    ) -> Result<u64, ReadError>
    where
        F: FnMut(TickDataChunk) -> Result<(), Box<dyn EvochoraError>>,
    {
        let mut timer = OperationTimer::start(self.window(UsageType::StorageRead));
        let result = self.stream_frames(key, cancel, |frame| {
            let chunk = codec::parse_chunk_filtered(&frame, filter)?;
            consumer(chunk).map_err(ReadError::Consumer)
        });
        match &result {
            Ok((_, compressed)) => {
                timer.add_bytes(*compressed);
                timer.finish();
            }
            Err(_) => timer.finish_with_error(),
        }
        result.map(|(chunks, _)| chunks)
    }

    /// Shared frame loop: returns `(frames_delivered, compressed_bytes)`
    /// and records the decompressed batch size gauge.
    fn stream_frames<F>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut on_frame: F,
    ) -> Result<(u64, u64), ReadError>
    where
        F: FnMut(Vec<u8>) -> Result<(), ReadError>,
    {
        let path = self.resolve_key(key)?;
        let (mut reader, compressed_len) = self.open_chunk_reader(&path)?;
        let mut frames = 0u64;
        let mut decompressed = 0u64;
        while let Some(frame) = codec::read_delimited_frame(&mut reader)? {
            if cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }
            decompressed += frame.len() as u64;
            on_frame(frame)?;
            frames += 1;
        }
        self.window(UsageType::StorageRead)
            .record_batch_mb(decompressed as f64 / (1024.0 * 1024.0));
        Ok((frames, compressed_len))
    }
}
