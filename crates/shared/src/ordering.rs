//! Dense position ordering for items held in ordered containers.
//!
//! Cards inside a list and lists inside a board share the same rule: the
//! positions of the items in one container are exactly `0..len`. The
//! functions here never touch storage. They take the current order of the
//! affected containers and return the minimal set of position writes that
//! carries them to the new order, so the storage layer can apply the whole
//! set inside one transaction and clients can replay it on a cached view.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A container and the ids it holds, in position order (`items[k]` sits at
/// position `k`).
#[derive(Debug, Clone, Copy)]
pub struct Lane<'a, C, I> {
    pub container: C,
    pub items: &'a [I],
}

impl<'a, C, I> Lane<'a, C, I> {
    pub fn new(container: C, items: &'a [I]) -> Self {
        Self { container, items }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionWrite<C, I> {
    pub item: I,
    pub container: C,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan<C, I> {
    pub item: I,
    pub container: C,
    pub position: i64,
    /// Every item whose `(container, position)` changes, the moved item
    /// included. Empty when the move lands on the current slot.
    pub writes: Vec<PositionWrite<C, I>>,
}

impl<C, I> MovePlan<C, I> {
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OrderingError {
    #[error("item is not present in its source container")]
    ItemNotInLane,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "position", rename_all = "snake_case")]
pub enum DenseViolation {
    Duplicate(i64),
    Missing(i64),
    OutOfRange(i64),
}

/// Clamps a requested slot into `[0, len]`, where `len` is the number of
/// items in the destination once the moving item has been taken out.
pub fn clamp_position(requested: i64, len: usize) -> usize {
    if requested <= 0 {
        return 0;
    }
    usize::try_from(requested).map_or(len, |requested| requested.min(len))
}

/// Position a newly created item receives: the tail of its container.
pub fn append_position(len: usize) -> i64 {
    len as i64
}

/// Plans moving `item` out of `source` into `target` at `requested`.
///
/// `target` of `None`, or a target naming the source container, is a
/// reorder within the source.
pub fn plan_move<C, I>(
    item: I,
    source: Lane<'_, C, I>,
    target: Option<Lane<'_, C, I>>,
    requested: i64,
) -> Result<MovePlan<C, I>, OrderingError>
where
    C: Copy + Eq,
    I: Copy + Eq,
{
    let from = source
        .items
        .iter()
        .position(|candidate| *candidate == item)
        .ok_or(OrderingError::ItemNotInLane)?;

    let mut remaining = source.items.to_vec();
    remaining.remove(from);

    match target.filter(|target| target.container != source.container) {
        None => {
            let to = clamp_position(requested, remaining.len());
            remaining.insert(to, item);
            Ok(MovePlan {
                item,
                container: source.container,
                position: to as i64,
                writes: changed_positions(source.container, source.items, &remaining),
            })
        }
        Some(target) => {
            let mut destination: Vec<I> = target
                .items
                .iter()
                .copied()
                .filter(|candidate| *candidate != item)
                .collect();
            let to = clamp_position(requested, destination.len());
            destination.insert(to, item);

            let mut writes = changed_positions(source.container, source.items, &remaining);
            writes.extend(changed_positions(
                target.container,
                target.items,
                &destination,
            ));
            Ok(MovePlan {
                item,
                container: target.container,
                position: to as i64,
                writes,
            })
        }
    }
}

/// Writes that close the gap left behind when `item` leaves `lane`.
pub fn plan_removal<C, I>(
    item: I,
    lane: Lane<'_, C, I>,
) -> Result<Vec<PositionWrite<C, I>>, OrderingError>
where
    C: Copy,
    I: Copy + Eq,
{
    let from = lane
        .items
        .iter()
        .position(|candidate| *candidate == item)
        .ok_or(OrderingError::ItemNotInLane)?;
    let mut remaining = lane.items.to_vec();
    remaining.remove(from);
    Ok(changed_positions(lane.container, lane.items, &remaining))
}

/// Writes that renumber an arbitrary order to `0..len`. Used to heal a
/// container whose stored positions are already out of shape.
pub fn plan_renumber<C, I>(container: C, current: &[(I, i64)]) -> Vec<PositionWrite<C, I>>
where
    C: Copy,
    I: Copy,
{
    current
        .iter()
        .enumerate()
        .filter(|(index, (_, position))| *position != *index as i64)
        .map(|(index, (item, _))| PositionWrite {
            item: *item,
            container,
            position: index as i64,
        })
        .collect()
}

/// Reports every way `positions` fails to be exactly `0..positions.len()`.
pub fn dense_violations(positions: &[i64]) -> Vec<DenseViolation> {
    let len = positions.len();
    let mut seen = vec![false; len];
    let mut violations = Vec::new();

    for &position in positions {
        let slot = usize::try_from(position)
            .ok()
            .and_then(|index| seen.get_mut(index));
        match slot {
            None => violations.push(DenseViolation::OutOfRange(position)),
            Some(slot) if *slot => violations.push(DenseViolation::Duplicate(position)),
            Some(slot) => *slot = true,
        }
    }

    violations.extend(
        seen.iter()
            .enumerate()
            .filter(|(_, present)| !**present)
            .map(|(index, _)| DenseViolation::Missing(index as i64)),
    );
    violations
}

fn changed_positions<C, I>(container: C, before: &[I], after: &[I]) -> Vec<PositionWrite<C, I>>
where
    C: Copy,
    I: Copy + Eq,
{
    after
        .iter()
        .enumerate()
        .filter(|(index, item)| before.get(*index) != Some(*item))
        .map(|(index, item)| PositionWrite {
            item: *item,
            container,
            position: index as i64,
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/ordering_tests.rs"]
mod tests;
