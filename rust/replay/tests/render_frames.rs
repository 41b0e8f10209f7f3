use evochora_error::EvochoraError;
use evochora_replay::{FrameRenderer, FrameRendererConfig, RenderError};
use evochora_storage::BatchStorage;
use evochora_types::{
    CellDataColumns, MutableCellState, TickData, TickDataChunk, TickDelta,
};
use tokio_util::sync::CancellationToken;

const RUN_ID: &str = "20240301-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";
const TOTAL_CELLS: usize = 64;

fn cells(tick: i64) -> CellDataColumns {
    CellDataColumns {
        flat_indices: vec![(tick % TOTAL_CELLS as i64) as i32],
        molecule_data: vec![(tick % 7) as i32 + 1],
        owner_ids: vec![(tick % 3) as i32],
    }
}

fn chunk(first_tick: i64, delta_count: usize) -> TickDataChunk {
    TickDataChunk {
        simulation_run_id: RUN_ID.to_string(),
        first_tick,
        last_tick: first_tick + delta_count as i64,
        tick_count: 1 + delta_count as i64,
        snapshot: Some(TickData {
            simulation_run_id: RUN_ID.to_string(),
            tick_number: first_tick,
            capture_time_ms: first_tick * 2,
            cell_columns: Some(cells(first_tick)),
            ..Default::default()
        }),
        deltas: (1..=delta_count as i64)
            .map(|offset| TickDelta {
                tick_number: first_tick + offset,
                capture_time_ms: (first_tick + offset) * 2,
                changed_cells: Some(cells(first_tick + offset)),
                ..Default::default()
            })
            .collect(),
    }
}

#[tokio::test]
async fn frames_arrive_in_tick_order_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let storage = BatchStorage::new_test_storage_at(dir.path());
    // Uneven chunk sizes so fast workers finish out of submission order.
    let chunks: Vec<TickDataChunk> = vec![
        chunk(0, 19),
        chunk(20, 0),
        chunk(21, 8),
        chunk(30, 2),
        chunk(33, 16),
    ];
    let written = storage.write_batch(chunks.clone()).await.unwrap();

    let renderer = FrameRenderer::new(
        storage.clone(),
        TOTAL_CELLS,
        &FrameRendererConfig { worker_count: 3 },
    );
    let cancel = CancellationToken::new();
    let mut frames = Vec::new();
    let delivered = renderer
        .render_batch(&written.storage_path, &cancel, |frame| {
            frames.push(frame);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(delivered, 50);
    let ticks: Vec<i64> = frames.iter().map(|f| f.tick_number).collect();
    assert_eq!(ticks, (0..=49).collect::<Vec<_>>());

    // Every frame matches a sequential replay of the same chunks.
    let mut state = MutableCellState::new(TOTAL_CELLS);
    let mut frame_iter = frames.iter();
    for source in &chunks {
        let snapshot = source.snapshot.as_ref().unwrap();
        state.apply_snapshot(snapshot.cell_columns.as_ref().unwrap());
        assert_eq!(frame_iter.next().unwrap().cell_columns, state.to_columns());
        for delta in &source.deltas {
            state.apply_delta(delta.changed_cells.as_ref().unwrap());
            assert_eq!(frame_iter.next().unwrap().cell_columns, state.to_columns());
        }
    }
}

#[tokio::test]
async fn consumer_failure_stops_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let storage = BatchStorage::new_test_storage_at(dir.path());
    let written = storage
        .write_batch((0..8).map(|i| chunk(i * 10, 9)))
        .await
        .unwrap();

    let renderer = FrameRenderer::new(
        storage.clone(),
        TOTAL_CELLS,
        &FrameRendererConfig { worker_count: 2 },
    );
    let cancel = CancellationToken::new();
    let mut seen = 0u64;
    let result = renderer
        .render_batch(&written.storage_path, &cancel, |frame| {
            seen += 1;
            if frame.tick_number >= 5 {
                Err(evochora_storage::ReadError::Cancelled.boxed())
            } else {
                Ok(())
            }
        })
        .await;
    assert!(matches!(result, Err(RenderError::Consumer(_))));
    assert!(seen < 80, "stream must stop early, saw {} frames", seen);
    // The caller's token is untouched by the internal stop.
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn cancellation_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let storage = BatchStorage::new_test_storage_at(dir.path());
    let written = storage
        .write_batch(vec![chunk(0, 9)])
        .await
        .unwrap();

    let renderer = FrameRenderer::new(storage, TOTAL_CELLS, &FrameRendererConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = renderer
        .render_batch(&written.storage_path, &cancel, |_| Ok(()))
        .await;
    assert!(matches!(
        result,
        Err(RenderError::Read(evochora_storage::ReadError::Cancelled))
    ));
}
