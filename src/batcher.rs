//! Splits a workspace set into grouped-call batches

use crate::error::{FleetError, Result};
use crate::model::WorkspaceId;
use itertools::Itertools;

/// Ordered group of workspaces queried together in one call
pub type Batch = Vec<WorkspaceId>;

/// Sort and de-duplicate `workspaces`, then slice them into groups of at most
/// `max_fanout`. Membership is stable across runs for the same input.
pub fn batches<I>(workspaces: I, max_fanout: usize) -> Result<Vec<Batch>>
where
    I: IntoIterator<Item = WorkspaceId>,
{
    if max_fanout == 0 {
        return Err(FleetError::InvalidInput("max_fanout must be at least 1".to_string()));
    }

    let sorted: Vec<WorkspaceId> = workspaces.into_iter().sorted().dedup().collect();
    Ok(sorted.chunks(max_fanout).map(|chunk| chunk.to_vec()).collect())
}

/// Number of grouped calls needed for `count` workspaces
pub fn batch_count(count: usize, max_fanout: usize) -> usize {
    if max_fanout == 0 {
        return 0;
    }
    count.div_ceil(max_fanout)
}
