use crate::CellDataColumns;

/// Dense, reusable reconstruction of a cell grid. One instance belongs to
/// exactly one processing pipeline (an indexer plugin or a frame-render
/// worker); it is never shared across threads.
///
/// The two arrays are parallel over flat cell indices. A cell is empty iff
/// both entries are zero; owners may be non-zero while the molecule is zero
/// (a claimed-but-vacant cell).
#[derive(Clone, Debug)]
pub struct MutableCellState {
    molecule_data: Vec<i32>,
    owner_ids: Vec<i32>,
}

impl MutableCellState {
    pub fn new(total_cells: usize) -> MutableCellState {
        MutableCellState {
            molecule_data: vec![0; total_cells],
            owner_ids: vec![0; total_cells],
        }
    }

    pub fn total_cells(&self) -> usize {
        self.molecule_data.len()
    }

    pub fn molecule_at(&self, flat_index: usize) -> Option<i32> {
        self.molecule_data.get(flat_index).copied()
    }

    pub fn owner_at(&self, flat_index: usize) -> Option<i32> {
        self.owner_ids.get(flat_index).copied()
    }

    /// Replace the state with a snapshot: zero everything, then write both
    /// fields for every listed cell. Out-of-range indices are skipped.
    pub fn apply_snapshot(&mut self, columns: &CellDataColumns) {
        self.reset();
        self.write_columns(columns);
    }

    /// Apply a delta on top of the current state. Both fields are written
    /// unconditionally for every entry: a zero pair clears the cell.
    pub fn apply_delta(&mut self, columns: &CellDataColumns) {
        self.write_columns(columns);
    }

    /// Zero both arrays so the allocation can be reused for another chunk.
    pub fn reset(&mut self) {
        self.molecule_data.fill(0);
        self.owner_ids.fill(0);
    }

    /// Export sparse columns for every cell that is not empty.
    pub fn to_columns(&self) -> CellDataColumns {
        let mut columns = CellDataColumns::default();
        for (index, (&molecule, &owner)) in self
            .molecule_data
            .iter()
            .zip(self.owner_ids.iter())
            .enumerate()
        {
            if molecule != 0 || owner != 0 {
                columns.flat_indices.push(index as i32);
                columns.molecule_data.push(molecule);
                columns.owner_ids.push(owner);
            }
        }
        columns
    }

    fn write_columns(&mut self, columns: &CellDataColumns) {
        let total = self.molecule_data.len();
        for (flat_index, molecule, owner) in columns.iter() {
            let index = flat_index as usize;
            if flat_index < 0 || index >= total {
                tracing::warn!(flat_index, total, "skipping out-of-range cell index");
                continue;
            }
            self.molecule_data[index] = molecule;
            self.owner_ids[index] = owner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(entries: &[(i32, i32, i32)]) -> CellDataColumns {
        CellDataColumns {
            flat_indices: entries.iter().map(|e| e.0).collect(),
            molecule_data: entries.iter().map(|e| e.1).collect(),
            owner_ids: entries.iter().map(|e| e.2).collect(),
        }
    }

    #[test]
    fn snapshot_resets_previous_state() {
        let mut state = MutableCellState::new(8);
        state.apply_snapshot(&columns(&[(0, 5, 1), (3, 7, 2)]));
        state.apply_snapshot(&columns(&[(1, 9, 4)]));
        assert_eq!(state.molecule_at(0), Some(0));
        assert_eq!(state.molecule_at(1), Some(9));
        assert_eq!(state.owner_at(3), Some(0));
    }

    #[test]
    fn delta_zero_pair_clears_cell() {
        let mut state = MutableCellState::new(4);
        state.apply_snapshot(&columns(&[(2, 11, 3)]));
        state.apply_delta(&columns(&[(2, 0, 0)]));
        assert_eq!(state.molecule_at(2), Some(0));
        assert_eq!(state.owner_at(2), Some(0));
    }

    #[test]
    fn delta_preserves_untouched_cells() {
        let mut state = MutableCellState::new(4);
        state.apply_snapshot(&columns(&[(0, 1, 1), (1, 2, 2)]));
        state.apply_delta(&columns(&[(1, 5, 2)]));
        assert_eq!(state.molecule_at(0), Some(1));
        assert_eq!(state.molecule_at(1), Some(5));
    }

    #[test]
    fn owner_without_molecule_is_not_empty() {
        let mut state = MutableCellState::new(4);
        state.apply_delta(&columns(&[(1, 0, 9)]));
        let exported = state.to_columns();
        assert_eq!(exported.flat_indices, vec![1]);
        assert_eq!(exported.molecule_data, vec![0]);
        assert_eq!(exported.owner_ids, vec![9]);
    }

    #[test]
    fn out_of_range_indices_are_skipped() {
        let mut state = MutableCellState::new(2);
        state.apply_snapshot(&columns(&[(5, 1, 1), (-1, 2, 2), (1, 3, 3)]));
        assert_eq!(state.molecule_at(1), Some(3));
        assert_eq!(state.to_columns().len(), 1);
    }

    #[test]
    fn reset_allows_reuse() {
        let mut state = MutableCellState::new(4);
        state.apply_snapshot(&columns(&[(0, 1, 1)]));
        state.reset();
        assert!(state.to_columns().is_empty());
        assert_eq!(state.total_cells(), 4);
    }
}
