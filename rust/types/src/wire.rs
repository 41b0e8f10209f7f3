//! Wire messages for tick capture. These are hand-annotated prost messages;
//! the field tags are frozen and shared with the wire-level partial parsers
//! in the storage crate, so any change here is a format change.

use evochora_error::{ErrorCodes, EvochoraError};
use thiserror::Error;

/// Field tags for [`TickData`]. Shared with the filtered wire walker.
pub mod tick_data_tags {
    pub const SIMULATION_RUN_ID: u32 = 1;
    pub const TICK_NUMBER: u32 = 2;
    pub const CAPTURE_TIME_MS: u32 = 3;
    pub const ORGANISMS: u32 = 4;
    pub const CELL_COLUMNS: u32 = 5;
    pub const RNG_STATE: u32 = 6;
    pub const PLUGIN_STATES: u32 = 7;
    pub const TOTAL_ORGANISMS_CREATED: u32 = 8;
    pub const TOTAL_UNIQUE_GENOMES: u32 = 9;
    pub const ALL_GENOME_HASHES_EVER_SEEN: u32 = 10;
}

/// Field tags for [`TickDelta`].
pub mod tick_delta_tags {
    pub const TICK_NUMBER: u32 = 1;
    pub const CAPTURE_TIME_MS: u32 = 2;
    pub const DELTA_TYPE: u32 = 3;
    pub const CHANGED_CELLS: u32 = 4;
    pub const ORGANISMS: u32 = 5;
    pub const TOTAL_ORGANISMS_CREATED: u32 = 6;
    pub const RNG_STATE: u32 = 7;
    pub const PLUGIN_STATES: u32 = 8;
    pub const TOTAL_UNIQUE_GENOMES: u32 = 9;
}

/// Field tags for [`TickDataChunk`].
pub mod chunk_tags {
    pub const SIMULATION_RUN_ID: u32 = 1;
    pub const FIRST_TICK: u32 = 2;
    pub const LAST_TICK: u32 = 3;
    pub const TICK_COUNT: u32 = 4;
    pub const SNAPSHOT: u32 = 5;
    pub const DELTAS: u32 = 6;
}

/// Sparse column-oriented view of a cell grid. The three columns are
/// parallel: entry `i` describes the cell at `flat_indices[i]`. A cell is
/// empty iff `molecule_data == 0 && owner_id == 0`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CellDataColumns {
    #[prost(int32, repeated, tag = "1")]
    pub flat_indices: ::prost::alloc::vec::Vec<i32>,
    #[prost(int32, repeated, tag = "2")]
    pub molecule_data: ::prost::alloc::vec::Vec<i32>,
    #[prost(int32, repeated, tag = "3")]
    pub owner_ids: ::prost::alloc::vec::Vec<i32>,
}

impl CellDataColumns {
    pub fn len(&self) -> usize {
        self.flat_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat_indices.is_empty()
    }

    /// The columns are only meaningful when all three are the same length.
    pub fn is_well_formed(&self) -> bool {
        self.flat_indices.len() == self.molecule_data.len()
            && self.flat_indices.len() == self.owner_ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i32, i32)> + '_ {
        self.flat_indices
            .iter()
            .zip(self.molecule_data.iter())
            .zip(self.owner_ids.iter())
            .map(|((&index, &molecule), &owner)| (index, molecule, owner))
    }
}

/// The per-organism subset consumed by indexers. The simulation attaches
/// more state than this; fields it does not populate decode to defaults.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrganismState {
    #[prost(int64, tag = "1")]
    pub organism_id: i64,
    #[prost(int64, optional, tag = "2")]
    pub parent_id: ::core::option::Option<i64>,
    #[prost(int64, tag = "3")]
    pub birth_tick: i64,
    #[prost(int64, tag = "4")]
    pub energy: i64,
    #[prost(int64, tag = "5")]
    pub entropy_register: i64,
    #[prost(bool, tag = "6")]
    pub is_dead: bool,
    #[prost(int64, tag = "7")]
    pub genome_hash: i64,
    #[prost(int32, optional, tag = "8")]
    pub instruction_opcode_id: ::core::option::Option<i32>,
}

/// Opaque per-plugin simulation state carried through snapshots and deltas.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginState {
    #[prost(string, tag = "1")]
    pub plugin_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub state: ::prost::alloc::vec::Vec<u8>,
}

/// A complete environment snapshot at one tick. Applying a snapshot fully
/// determines the environment; no prior state is needed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickData {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub tick_number: i64,
    #[prost(int64, tag = "3")]
    pub capture_time_ms: i64,
    #[prost(message, repeated, tag = "4")]
    pub organisms: ::prost::alloc::vec::Vec<OrganismState>,
    #[prost(message, optional, tag = "5")]
    pub cell_columns: ::core::option::Option<CellDataColumns>,
    #[prost(bytes = "vec", tag = "6")]
    pub rng_state: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub plugin_states: ::prost::alloc::vec::Vec<PluginState>,
    #[prost(int64, tag = "8")]
    pub total_organisms_created: i64,
    #[prost(int64, tag = "9")]
    pub total_unique_genomes: i64,
    #[prost(int64, repeated, tag = "10")]
    pub all_genome_hashes_ever_seen: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeltaType {
    Full = 0,
    Incremental = 1,
}

/// The change set between two consecutive ticks. `changed_cells` lists only
/// cells mutated since the immediately preceding tick; a zero pair
/// explicitly clears a cell.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickDelta {
    #[prost(int64, tag = "1")]
    pub tick_number: i64,
    #[prost(int64, tag = "2")]
    pub capture_time_ms: i64,
    #[prost(enumeration = "DeltaType", tag = "3")]
    pub delta_type: i32,
    #[prost(message, optional, tag = "4")]
    pub changed_cells: ::core::option::Option<CellDataColumns>,
    #[prost(message, repeated, tag = "5")]
    pub organisms: ::prost::alloc::vec::Vec<OrganismState>,
    #[prost(int64, tag = "6")]
    pub total_organisms_created: i64,
    #[prost(bytes = "vec", tag = "7")]
    pub rng_state: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub plugin_states: ::prost::alloc::vec::Vec<PluginState>,
    #[prost(int64, tag = "9")]
    pub total_unique_genomes: i64,
}

/// One snapshot plus a contiguous run of deltas, addressed by
/// `[first_tick, last_tick]`. The batch file format is a sequence of these.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickDataChunk {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub first_tick: i64,
    #[prost(int64, tag = "3")]
    pub last_tick: i64,
    #[prost(int64, tag = "4")]
    pub tick_count: i64,
    #[prost(message, optional, tag = "5")]
    pub snapshot: ::core::option::Option<TickData>,
    #[prost(message, repeated, tag = "6")]
    pub deltas: ::prost::alloc::vec::Vec<TickDelta>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkValidationError {
    #[error("chunk has no snapshot")]
    MissingSnapshot,
    #[error("snapshot tick {snapshot} != first_tick {first_tick}")]
    SnapshotTickMismatch { snapshot: i64, first_tick: i64 },
    #[error("deltas are not strictly ascending at tick {tick}")]
    UnorderedDeltas { tick: i64 },
    #[error("last delta tick {delta} != last_tick {last_tick}")]
    LastTickMismatch { delta: i64, last_tick: i64 },
    #[error("tick_count {tick_count} != 1 + {deltas} deltas")]
    TickCountMismatch { tick_count: i64, deltas: usize },
}

impl EvochoraError for ChunkValidationError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::FailedPrecondition
    }
}

impl TickDataChunk {
    /// Check the structural invariants: the snapshot sits at `first_tick`,
    /// deltas ascend strictly to `last_tick`, and `tick_count` covers the
    /// snapshot plus every delta.
    pub fn validate(&self) -> Result<(), ChunkValidationError> {
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or(ChunkValidationError::MissingSnapshot)?;
        if snapshot.tick_number != self.first_tick {
            return Err(ChunkValidationError::SnapshotTickMismatch {
                snapshot: snapshot.tick_number,
                first_tick: self.first_tick,
            });
        }
        let mut previous = self.first_tick;
        for delta in &self.deltas {
            if delta.tick_number <= previous {
                return Err(ChunkValidationError::UnorderedDeltas {
                    tick: delta.tick_number,
                });
            }
            previous = delta.tick_number;
        }
        if previous != self.last_tick {
            return Err(ChunkValidationError::LastTickMismatch {
                delta: previous,
                last_tick: self.last_tick,
            });
        }
        if self.tick_count != 1 + self.deltas.len() as i64 {
            return Err(ChunkValidationError::TickCountMismatch {
                tick_count: self.tick_count,
                deltas: self.deltas.len(),
            });
        }
        Ok(())
    }
}

/// Published to the batch topic once a batch file has been durably renamed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchInfo {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub storage_path: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub tick_start: i64,
    #[prost(int64, tag = "4")]
    pub tick_end: i64,
    #[prost(int64, tag = "5")]
    pub written_at_ms: i64,
}
