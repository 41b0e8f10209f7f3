//! Shared builders for the batch storage integration tests.

use evochora_storage::{BatchStorage, BatchStorageConfig, CompressionConfig};
use evochora_types::{CellDataColumns, DeltaType, OrganismState, TickData, TickDataChunk, TickDelta};

pub const RUN_ID: &str = "20240301-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";

/// Route `tracing` output through the test harness when `RUST_LOG` is set.
#[allow(dead_code)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn storage_at(root: &std::path::Path) -> BatchStorage {
    BatchStorage::new_test_storage_at(root)
}

#[allow(dead_code)]
pub fn uncompressed_storage_at(root: &std::path::Path) -> BatchStorage {
    let mut config = BatchStorageConfig::with_root(root.to_str().unwrap());
    config.compression = CompressionConfig {
        enabled: false,
        ..Default::default()
    };
    BatchStorage::new(&config).unwrap()
}

pub fn organism(id: i64, energy: i64) -> OrganismState {
    OrganismState {
        organism_id: id,
        parent_id: (id > 1).then_some(id - 1),
        birth_tick: 0,
        energy,
        entropy_register: id % 7,
        is_dead: false,
        genome_hash: 0x1000 + id,
        instruction_opcode_id: Some((id % 11) as i32),
    }
}

pub fn cells(seed: i32) -> CellDataColumns {
    CellDataColumns {
        flat_indices: vec![seed, seed + 1, seed + 2],
        molecule_data: vec![seed * 3, 0, -seed],
        owner_ids: vec![1, 2, 0],
    }
}

/// A chunk with its snapshot at `first_tick` and `delta_count` deltas on
/// the consecutive ticks after it.
pub fn chunk(run_id: &str, first_tick: i64, delta_count: usize) -> TickDataChunk {
    let snapshot = TickData {
        simulation_run_id: run_id.to_string(),
        tick_number: first_tick,
        capture_time_ms: 1_000 + first_tick,
        organisms: vec![organism(1, 500), organism(2, 250)],
        cell_columns: Some(cells(first_tick as i32 % 100)),
        rng_state: vec![0xde, 0xad, 0xbe, 0xef],
        plugin_states: vec![],
        total_organisms_created: 2,
        total_unique_genomes: 2,
        all_genome_hashes_ever_seen: vec![0x1001, 0x1002],
    };
    let deltas = (1..=delta_count as i64)
        .map(|offset| TickDelta {
            tick_number: first_tick + offset,
            capture_time_ms: 1_000 + first_tick + offset,
            delta_type: DeltaType::Incremental as i32,
            changed_cells: Some(cells((first_tick + offset) as i32 % 100)),
            organisms: vec![organism(1, 500 - offset), organism(2, 250 + offset)],
            total_organisms_created: 2,
            rng_state: vec![offset as u8],
            plugin_states: vec![],
            total_unique_genomes: 2,
        })
        .collect::<Vec<_>>();
    let last_tick = first_tick + delta_count as i64;
    TickDataChunk {
        simulation_run_id: run_id.to_string(),
        first_tick,
        last_tick,
        tick_count: 1 + delta_count as i64,
        snapshot: Some(snapshot),
        deltas,
    }
}
