//! Sibling reordering for drag-and-drop style moves.
//!
//! Planning is pure: the caller hands over the current sibling ids and gets
//! back the complete new sequence. Orders are always re-derived from list
//! positions, so a list whose stored orders drifted comes out dense again.

use crate::model::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub item: EntityId,
    pub from: usize,
    pub to: usize,
    pub previous: Vec<EntityId>,
    pub ordered: Vec<EntityId>,
}

impl MovePlan {
    #[cfg(test)]
    /// `(id, order)` pairs for every sibling after the move.
    pub fn assignments(&self) -> impl Iterator<Item = (&EntityId, u32)> + '_ {
        self.ordered
            .iter()
            .enumerate()
            .map(|(index, id)| (id, index as u32))
    }
}

/// Moves the element at `from` to `to` (clamped to the last slot) and returns
/// the full new sequence. Out-of-range `from` yields the input unchanged.
pub fn reorder(ids: &[EntityId], from: usize, to: usize) -> Vec<EntityId> {
    let mut ordered = ids.to_vec();
    if from >= ordered.len() {
        return ordered;
    }
    let item = ordered.remove(from);
    let to = to.min(ordered.len());
    ordered.insert(to, item);
    ordered
}

/// Plans moving `item` to `to_index` within `siblings`. Returns `None` for
/// no-ops: unknown item, single-element list, or unchanged position.
pub fn plan_move(siblings: &[EntityId], item: &EntityId, to_index: usize) -> Option<MovePlan> {
    let from = siblings.iter().position(|id| id == item)?;
    if siblings.len() < 2 {
        return None;
    }
    let to = to_index.min(siblings.len() - 1);
    if from == to {
        return None;
    }
    Some(MovePlan {
        item: item.clone(),
        from,
        to,
        previous: siblings.to_vec(),
        ordered: reorder(siblings, from, to),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<EntityId> {
        names.iter().map(|name| EntityId::from(*name)).collect()
    }

    #[test]
    fn moving_third_item_to_front_shifts_the_rest() {
        let siblings = ids(&["item0", "item1", "item2", "item3", "item4"]);
        let plan = plan_move(&siblings, &EntityId::from("item2"), 0).unwrap();
        assert_eq!(
            plan.ordered,
            ids(&["item2", "item0", "item1", "item3", "item4"])
        );
        let orders: Vec<u32> = plan.assignments().map(|(_, order)| order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        assert_eq!(plan.previous, siblings);
    }

    #[test]
    fn moving_down_inserts_after_the_target_slot() {
        let siblings = ids(&["a", "b", "c", "d"]);
        assert_eq!(reorder(&siblings, 0, 2), ids(&["b", "c", "a", "d"]));
        assert_eq!(reorder(&siblings, 1, 99), ids(&["a", "c", "d", "b"]));
    }

    #[test]
    fn no_ops_produce_no_plan() {
        let siblings = ids(&["a", "b", "c"]);
        assert!(plan_move(&siblings, &EntityId::from("b"), 1).is_none());
        assert!(plan_move(&siblings, &EntityId::from("ghost"), 0).is_none());
        assert!(plan_move(&ids(&["solo"]), &EntityId::from("solo"), 3).is_none());
        // clamped to the last slot, which is where "c" already is
        assert!(plan_move(&siblings, &EntityId::from("c"), 10).is_none());
    }
}
