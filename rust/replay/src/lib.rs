//! Frame reconstruction from batch files.
//!
//! A frame is the full sparse environment state at one tick. Chunks are
//! self-contained (snapshot plus deltas), so they parallelize naturally: a
//! bounded pool of workers renders chunks concurrently, each worker owning
//! its own `MutableCellState`, and a reorder buffer hands frames to the
//! consumer in chunk order. Coordination is channels only; no worker ever
//! shares mutable state.

use evochora_error::{ErrorCodes, EvochoraError};
use evochora_storage::{BatchStorage, FieldFilter, ReadError};
use evochora_types::{CellDataColumns, MutableCellState, OrganismState, TickDataChunk};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One reconstructed tick, ready for rasterization.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub tick_number: i64,
    pub capture_time_ms: i64,
    /// Sparse export of the full environment state at this tick.
    pub cell_columns: CellDataColumns,
    pub organisms: Vec<OrganismState>,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("frame consumer failed: {0}")]
    Consumer(#[source] Box<dyn EvochoraError>),
    #[error("render worker exited unexpectedly")]
    WorkerLost,
}

impl EvochoraError for RenderError {
    fn code(&self) -> ErrorCodes {
        match self {
            RenderError::Read(err) => err.code(),
            RenderError::Consumer(err) => err.code(),
            RenderError::WorkerLost => ErrorCodes::Internal,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FrameRendererConfig {
    #[serde(default = "FrameRendererConfig::default_worker_count")]
    pub worker_count: usize,
}

impl FrameRendererConfig {
    fn default_worker_count() -> usize {
        2
    }
}

impl Default for FrameRendererConfig {
    fn default() -> Self {
        FrameRendererConfig {
            worker_count: FrameRendererConfig::default_worker_count(),
        }
    }
}

//////////////////////////////////////////// rendering /////////////////////////////////////////////

/// Replay one chunk against a worker-owned state. The state is fully
/// overwritten by the snapshot, so reuse across chunks needs no reset.
fn render_chunk(state: &mut MutableCellState, chunk: &TickDataChunk) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(1 + chunk.deltas.len());
    let Some(snapshot) = chunk.snapshot.as_ref() else {
        return frames;
    };
    match snapshot.cell_columns.as_ref() {
        Some(columns) => state.apply_snapshot(columns),
        None => state.reset(),
    }
    frames.push(Frame {
        tick_number: snapshot.tick_number,
        capture_time_ms: snapshot.capture_time_ms,
        cell_columns: state.to_columns(),
        organisms: snapshot.organisms.clone(),
    });
    for delta in &chunk.deltas {
        if let Some(columns) = delta.changed_cells.as_ref() {
            state.apply_delta(columns);
        }
        frames.push(Frame {
            tick_number: delta.tick_number,
            capture_time_ms: delta.capture_time_ms,
            cell_columns: state.to_columns(),
            organisms: delta.organisms.clone(),
        });
    }
    frames
}

pub struct FrameRenderer {
    storage: BatchStorage,
    total_cells: usize,
    worker_count: usize,
}

impl FrameRenderer {
    pub fn new(
        storage: BatchStorage,
        total_cells: usize,
        config: &FrameRendererConfig,
    ) -> FrameRenderer {
        FrameRenderer {
            storage,
            total_cells,
            worker_count: config.worker_count.max(1),
        }
    }

    /// Stream every frame of a batch file, in tick order, to the consumer.
    /// Returns the number of frames delivered.
    pub async fn render_batch<F>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut on_frame: F,
    ) -> Result<u64, RenderError>
    where
        F: FnMut(Frame) -> Result<(), Box<dyn EvochoraError>>,
    {
        // Child token so a consumer failure can stop the reader without
        // cancelling the caller's token.
        let read_cancel = cancel.child_token();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(u64, Vec<Frame>)>();
        let mut chunk_txs = Vec::with_capacity(self.worker_count);
        let mut workers = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(u64, TickDataChunk)>();
            chunk_txs.push(chunk_tx);
            let frame_tx = frame_tx.clone();
            let total_cells = self.total_cells;
            workers.push(tokio::spawn(async move {
                let mut state = MutableCellState::new(total_cells);
                while let Some((seq, chunk)) = chunk_rx.recv().await {
                    let frames = render_chunk(&mut state, &chunk);
                    if frame_tx.send((seq, frames)).is_err() {
                        break;
                    }
                }
            }));
        }
        // Workers hold the only remaining frame senders; the channel closes
        // once they all finish.
        drop(frame_tx);

        let reader = {
            let storage = self.storage.clone();
            let key = key.to_string();
            let read_cancel = read_cancel.clone();
            let worker_count = self.worker_count;
            tokio::spawn(async move {
                let mut seq = 0u64;
                let result = storage
                    .for_each_chunk(&key, FieldFilter::All, &read_cancel, |chunk| {
                        let target = (seq % worker_count as u64) as usize;
                        if chunk_txs[target].send((seq, chunk)).is_err() {
                            return Err(RenderError::WorkerLost.boxed());
                        }
                        seq += 1;
                        Ok(())
                    })
                    .await;
                // Dropping the senders lets the workers drain and exit.
                drop(chunk_txs);
                result
            })
        };

        // Reassemble in submission order: frames for chunk N are held back
        // until every chunk before N has been delivered.
        let mut pending: BTreeMap<u64, Vec<Frame>> = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut delivered = 0u64;
        let mut consumer_error: Option<Box<dyn EvochoraError>> = None;
        while let Some((seq, frames)) = frame_rx.recv().await {
            if consumer_error.is_some() {
                continue;
            }
            pending.insert(seq, frames);
            'emit: while let Some(frames) = pending.remove(&next_seq) {
                for frame in frames {
                    if let Err(err) = on_frame(frame) {
                        consumer_error = Some(err);
                        read_cancel.cancel();
                        break 'emit;
                    }
                    delivered += 1;
                }
                next_seq += 1;
            }
        }

        for worker in workers {
            if worker.await.is_err() {
                return Err(RenderError::WorkerLost);
            }
        }
        let read_result = reader.await.map_err(|_| RenderError::WorkerLost)?;
        if let Some(err) = consumer_error {
            return Err(RenderError::Consumer(err));
        }
        match read_result {
            Ok(_) => Ok(delivered),
            Err(ReadError::Cancelled) if cancel.is_cancelled() => Err(ReadError::Cancelled.into()),
            Err(ReadError::Consumer(err)) => Err(RenderError::Consumer(err)),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evochora_types::{TickData, TickDelta};

    fn chunk_with_cells(first_tick: i64, cells_per_tick: &[(i32, i32, i32)]) -> TickDataChunk {
        let columns = |entry: (i32, i32, i32)| CellDataColumns {
            flat_indices: vec![entry.0],
            molecule_data: vec![entry.1],
            owner_ids: vec![entry.2],
        };
        TickDataChunk {
            simulation_run_id: "run".to_string(),
            first_tick,
            last_tick: first_tick + cells_per_tick.len() as i64 - 1,
            tick_count: cells_per_tick.len() as i64,
            snapshot: Some(TickData {
                simulation_run_id: "run".to_string(),
                tick_number: first_tick,
                cell_columns: Some(columns(cells_per_tick[0])),
                ..Default::default()
            }),
            deltas: cells_per_tick[1..]
                .iter()
                .enumerate()
                .map(|(offset, &entry)| TickDelta {
                    tick_number: first_tick + 1 + offset as i64,
                    changed_cells: Some(columns(entry)),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn render_chunk_produces_one_frame_per_tick() {
        let mut state = MutableCellState::new(16);
        let chunk = chunk_with_cells(5, &[(0, 1, 1), (1, 2, 1), (0, 0, 0)]);
        let frames = render_chunk(&mut state, &chunk);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].tick_number, 5);
        assert_eq!(frames[0].cell_columns.flat_indices, vec![0]);
        assert_eq!(frames[1].cell_columns.flat_indices, vec![0, 1]);
        // The zero pair cleared cell 0 again.
        assert_eq!(frames[2].cell_columns.flat_indices, vec![1]);
    }

    #[test]
    fn snapshot_overwrites_leftover_worker_state() {
        let mut state = MutableCellState::new(16);
        let first = chunk_with_cells(0, &[(3, 9, 9)]);
        let second = chunk_with_cells(1, &[(7, 1, 1)]);
        render_chunk(&mut state, &first);
        let frames = render_chunk(&mut state, &second);
        assert_eq!(frames[0].cell_columns.flat_indices, vec![7]);
    }
}
