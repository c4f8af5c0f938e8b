//! Content-based cell matching across a bulk replacement.
//!
//! After the host re-parses a notebook from bytes every cell arrives blank:
//! no identity, no outputs. The matcher pairs each new cell with a previous
//! cell carrying identical source text so the identity can be transplanted.
//!
//! Matching is greedy in document order. Duplicate texts pair up first with
//! first, so `N` copies on one side and `M` on the other yield `min(N, M)`
//! pairs; the rest fall through to deletions or insertions. Ambiguity never
//! produces an error, only a cell that is treated as new.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::document::NotebookCell;
use crate::identity::{CellId, identity_of};

/// A previous cell paired with the new cell that replaces it.
#[derive(Debug, Clone, Copy)]
pub struct MatchedCell<'a> {
    /// Position of the new cell in the `next` list.
    pub position: usize,
    pub previous: &'a NotebookCell,
    pub next: &'a NotebookCell,
}

/// A new cell with no previous counterpart.
#[derive(Debug, Clone, Copy)]
pub struct NewCell<'a> {
    /// Position of the cell in the `next` list.
    pub position: usize,
    pub cell: &'a NotebookCell,
}

/// Three-way partition produced by [`match_cells`].
#[derive(Debug, Default)]
pub struct CellMatch<'a> {
    /// Previous identity → pairing, in `next` order.
    pub matched: Vec<(CellId, MatchedCell<'a>)>,
    /// Previous cells nobody claimed: true deletions.
    pub unmatched_previous: Vec<&'a NotebookCell>,
    /// Next cells nobody claimed: true insertions.
    pub new_cells: Vec<NewCell<'a>>,
}

impl<'a> CellMatch<'a> {
    /// The new cell that inherited `id`, if any.
    pub fn get(&self, id: &CellId) -> Option<&'a NotebookCell> {
        self.matched
            .iter()
            .find(|(matched_id, _)| matched_id == id)
            .map(|(_, pair)| pair.next)
    }

    /// Matched pairs as a map from previous identity to new cell.
    pub fn matched_map(&self) -> FxHashMap<CellId, &'a NotebookCell> {
        self.matched
            .iter()
            .map(|(id, pair)| (id.clone(), pair.next))
            .collect()
    }

    /// Identities of previous cells that were deleted.
    pub fn deleted_ids(&self) -> Vec<CellId> {
        self.unmatched_previous
            .iter()
            .filter_map(|cell| identity_of(cell))
            .collect()
    }
}

/// Partition `previous` and `next` into matched, deleted and new cells.
pub fn match_cells<'a>(previous: &'a [NotebookCell], next: &'a [NotebookCell]) -> CellMatch<'a> {
    // Source text → queue of previous positions, in document order.
    let mut by_source: FxHashMap<&str, VecDeque<(usize, CellId)>> = FxHashMap::default();
    for (position, cell) in previous.iter().enumerate() {
        if let Some(id) = identity_of(cell) {
            by_source
                .entry(cell.source.as_str())
                .or_default()
                .push_back((position, id));
        }
    }

    let mut consumed = vec![false; previous.len()];
    let mut result = CellMatch::default();

    for (position, cell) in next.iter().enumerate() {
        let claimed = by_source
            .get_mut(cell.source.as_str())
            .and_then(VecDeque::pop_front);

        match claimed {
            Some((previous_position, id)) => {
                consumed[previous_position] = true;
                result.matched.push((
                    id,
                    MatchedCell {
                        position,
                        previous: &previous[previous_position],
                        next: cell,
                    },
                ));
            }
            None => result.new_cells.push(NewCell { position, cell }),
        }
    }

    result.unmatched_previous = previous
        .iter()
        .zip(consumed)
        .filter(|(_, consumed)| !consumed)
        .map(|(cell, _)| cell)
        .collect();

    result
}
