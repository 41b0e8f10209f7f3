//! Property tests for the tick codec read modes.

use evochora_storage::codec::{
    parse_chunk, parse_chunk_filtered, parse_chunk_header, parse_chunk_snapshot_only, FieldFilter,
};
use evochora_types::{
    CellDataColumns, DeltaType, MutableCellState, OrganismState, TickData, TickDataChunk, TickDelta,
};
use proptest::prelude::*;
use prost::Message;

const TOTAL_CELLS: usize = 64;

fn arb_organism() -> impl Strategy<Value = OrganismState> {
    (
        1..1000i64,
        proptest::option::of(1..1000i64),
        0..100i64,
        -1000..1000i64,
        any::<bool>(),
        any::<i64>(),
        proptest::option::of(0..256i32),
    )
        .prop_map(
            |(organism_id, parent_id, birth_tick, energy, is_dead, genome_hash, opcode)| {
                OrganismState {
                    organism_id,
                    parent_id,
                    birth_tick,
                    energy,
                    entropy_register: energy % 13,
                    is_dead,
                    genome_hash,
                    instruction_opcode_id: opcode,
                }
            },
        )
}

fn arb_cells() -> impl Strategy<Value = CellDataColumns> {
    proptest::collection::vec(
        (0..TOTAL_CELLS as i32, -500..500i32, 0..8i32),
        0..TOTAL_CELLS,
    )
    .prop_map(|entries| CellDataColumns {
        flat_indices: entries.iter().map(|e| e.0).collect(),
        molecule_data: entries.iter().map(|e| e.1).collect(),
        owner_ids: entries.iter().map(|e| e.2).collect(),
    })
}

fn arb_chunk() -> impl Strategy<Value = TickDataChunk> {
    (
        0..10_000i64,
        1..12usize,
        proptest::collection::vec(arb_organism(), 0..4),
        arb_cells(),
        proptest::collection::vec(arb_cells(), 12),
        proptest::collection::vec(any::<i64>(), 0..6),
    )
        .prop_map(
            |(first_tick, delta_count, organisms, snapshot_cells, delta_cells, hashes)| {
                let deltas = (1..=delta_count as i64)
                    .map(|offset| TickDelta {
                        tick_number: first_tick + offset,
                        capture_time_ms: offset,
                        delta_type: DeltaType::Incremental as i32,
                        changed_cells: Some(delta_cells[(offset - 1) as usize].clone()),
                        organisms: organisms.clone(),
                        total_organisms_created: organisms.len() as i64,
                        rng_state: vec![offset as u8; 3],
                        plugin_states: vec![],
                        total_unique_genomes: hashes.len() as i64,
                    })
                    .collect::<Vec<_>>();
                TickDataChunk {
                    simulation_run_id: "prop-run".to_string(),
                    first_tick,
                    last_tick: first_tick + delta_count as i64,
                    tick_count: 1 + delta_count as i64,
                    snapshot: Some(TickData {
                        simulation_run_id: "prop-run".to_string(),
                        tick_number: first_tick,
                        capture_time_ms: 0,
                        organisms,
                        cell_columns: Some(snapshot_cells),
                        rng_state: vec![7, 7, 7],
                        plugin_states: vec![],
                        total_organisms_created: 9,
                        total_unique_genomes: hashes.len() as i64,
                        all_genome_hashes_ever_seen: hashes,
                    }),
                    deltas,
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn full_parse_round_trips(chunk in arb_chunk()) {
        let bytes = chunk.encode_to_vec();
        prop_assert_eq!(parse_chunk(&bytes).unwrap(), chunk);
    }

    #[test]
    fn filtered_parse_only_clears_the_filtered_field(chunk in arb_chunk()) {
        let bytes = chunk.encode_to_vec();

        let no_organisms = parse_chunk_filtered(&bytes, FieldFilter::SkipOrganisms).unwrap();
        let mut expected = chunk.clone();
        expected.snapshot.as_mut().unwrap().organisms.clear();
        for delta in &mut expected.deltas {
            delta.organisms.clear();
        }
        prop_assert_eq!(no_organisms, expected);

        let no_cells = parse_chunk_filtered(&bytes, FieldFilter::SkipCells).unwrap();
        let mut expected = chunk;
        expected.snapshot.as_mut().unwrap().cell_columns = None;
        for delta in &mut expected.deltas {
            delta.changed_cells = None;
        }
        prop_assert_eq!(no_cells, expected);
    }

    #[test]
    fn header_and_snapshot_parses_agree_with_full(chunk in arb_chunk()) {
        let bytes = chunk.encode_to_vec();
        let header = parse_chunk_header(&bytes).unwrap();
        prop_assert_eq!(header.first_tick, chunk.first_tick);
        prop_assert_eq!(header.last_tick, chunk.last_tick);
        prop_assert_eq!(header.tick_count, chunk.tick_count);

        let snapshot_only = parse_chunk_snapshot_only(&bytes).unwrap();
        prop_assert_eq!(snapshot_only.snapshot, chunk.snapshot);
        prop_assert!(snapshot_only.deltas.is_empty());
    }

    #[test]
    fn replaying_deltas_reaches_each_tick_state(chunk in arb_chunk()) {
        // Build the reference states by replaying columns directly, then
        // check the incremental path lands on the same dense state at every
        // delta boundary.
        let mut incremental = MutableCellState::new(TOTAL_CELLS);
        incremental.apply_snapshot(chunk.snapshot.as_ref().unwrap().cell_columns.as_ref().unwrap());
        for upto in 0..chunk.deltas.len() {
            incremental.apply_delta(chunk.deltas[upto].changed_cells.as_ref().unwrap());

            let mut replayed = MutableCellState::new(TOTAL_CELLS);
            replayed.apply_snapshot(chunk.snapshot.as_ref().unwrap().cell_columns.as_ref().unwrap());
            for delta in &chunk.deltas[..=upto] {
                replayed.apply_delta(delta.changed_cells.as_ref().unwrap());
            }
            prop_assert_eq!(incremental.to_columns(), replayed.to_columns());
        }
    }
}
