use std::sync::Arc;

use log::debug;

use crate::{
    config::{FANOUT, HierarchySpec, MAX_LEVELS},
    error::{HierarchyErr, Result},
    gradient::{Segment, even_segments},
    node::{Node, NodeId},
};

/// The id of the root node.
pub const ROOT: NodeId = 0;

/// Plans how many nodes every level gets.
///
/// Level 0 holds the root, every further level holds up to 12 children per node of
/// the level above, the plan stops when the thread budget or the depth runs out.
///
/// # Arguments
/// * `threads` - Upper bound of nodes.
/// * `max_depth` - Upper bound of levels, root included.
///
/// # Returns
/// The amount of nodes per level or an `InvalidTopology` error.
pub fn plan_levels(threads: usize, max_depth: usize) -> Result<Vec<usize>> {
    if threads == 0 || max_depth == 0 || max_depth > MAX_LEVELS {
        return Err(HierarchyErr::InvalidTopology { threads, max_depth });
    }

    let mut levels = vec![1];
    let mut remaining = threads - 1;

    while levels.len() < max_depth && remaining > 0 {
        let capacity = levels[levels.len() - 1] * FANOUT;
        let count = remaining.min(capacity);
        levels.push(count);
        remaining -= count;
    }

    Ok(levels)
}

/// The hierarchy owned storage of every live node, indexed by id.
#[derive(Debug)]
pub struct Arena<W> {
    slots: Vec<Option<Arc<Node<W>>>>,
    live: Vec<usize>,
    issued: Vec<usize>,
}

impl<W> Arena<W> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: vec![0; MAX_LEVELS],
            issued: vec![0; MAX_LEVELS],
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<Node<W>>> {
        self.slots.get(id)?.as_ref()
    }

    pub fn root(&self) -> Option<&Arc<Node<W>>> {
        self.get(ROOT)
    }

    /// Iterates over the live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node<W>>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.live.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the amount of live nodes per level, trailing empty levels trimmed.
    pub fn nodes_per_level(&self) -> Vec<usize> {
        let depth = self.live.iter().rposition(|&n| n > 0).map_or(0, |i| i + 1);
        self.live[..depth].to_vec()
    }

    /// Returns the next free index within `level`.
    pub fn next_index(&self, level: usize) -> usize {
        self.issued[level]
    }

    pub fn insert(&mut self, node: Arc<Node<W>>) {
        let id = node.id();
        let level = node.level();

        if self.slots.len() <= id {
            self.slots.resize_with(id + 1, || None);
        }

        self.live[level] += 1;
        self.issued[level] += 1;
        self.slots[id] = Some(node);
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Arc<Node<W>>> {
        let node = self.slots.get_mut(id)?.take()?;
        self.live[node.level()] -= 1;
        Some(node)
    }

    /// Returns the leaf nodes in depth first order.
    pub fn workers(&self) -> Vec<Arc<Node<W>>> {
        let mut workers = Vec::new();
        let mut stack: Vec<NodeId> = vec![ROOT];

        while let Some(id) = stack.pop() {
            let Some(node) = self.get(id) else {
                continue;
            };

            let children = node.children();
            if children.is_empty() {
                workers.push(Arc::clone(node));
            } else {
                stack.extend(children.into_iter().rev());
            }
        }

        workers
    }

    /// Pairs every worker with its slice of the gradient.
    ///
    /// # Arguments
    /// * `gradient_size` - The amount of model parameters.
    pub fn worker_segments(&self, gradient_size: usize) -> Vec<(NodeId, Segment)> {
        let workers = self.workers();
        let segments = even_segments(gradient_size, workers.len());

        workers.iter().map(|w| w.id()).zip(segments).collect()
    }

    /// Groups the live nodes by level.
    pub fn by_level(&self) -> Vec<Vec<Arc<Node<W>>>> {
        let mut levels: Vec<Vec<_>> = vec![Vec::new(); MAX_LEVELS];

        for node in self.nodes() {
            levels[node.level()].push(Arc::clone(node));
        }

        levels.retain(|level| !level.is_empty());
        levels
    }

    /// Points every child of `parent` at every other child.
    ///
    /// Must be called with the parent's links already updated, the caller holds the
    /// parent's state mutex so the siblings are swapped as one.
    pub fn rewire_siblings(&self, children: &[NodeId]) {
        for &child in children {
            let Some(node) = self.get(child) else {
                continue;
            };

            let siblings: Arc<[NodeId]> =
                children.iter().copied().filter(|&c| c != child).collect();
            node.links().siblings = siblings;
        }
    }
}

/// Builds every node of a hierarchy without starting any thread.
///
/// # Arguments
/// * `spec` - The shape of the hierarchy.
///
/// # Returns
/// The populated arena and the next unused id, or the first construction error. On
/// error, every node built so far is dropped.
pub fn build<W>(spec: &HierarchySpec) -> Result<(Arena<W>, NodeId)> {
    let plan = plan_levels(spec.threads, spec.max_depth)?;
    let mut arena = Arena::new();
    let mut next_id = ROOT;

    let root = Node::new(next_id, 0, 0, 0, None, spec.gradient_size)?;
    arena.insert(Arc::new(root));
    next_id += 1;

    let mut parents = vec![ROOT];

    for (level, &count) in plan.iter().enumerate().skip(1) {
        let base = count / parents.len();
        let extra = count % parents.len();
        let mut current = Vec::with_capacity(count);

        for (p, &parent_id) in parents.iter().enumerate() {
            let fanout = base + usize::from(p < extra);
            let mut children = Vec::with_capacity(fanout);

            for c in 0..fanout {
                let index = arena.next_index(level);
                let group = (c % FANOUT) as u8;
                let node = Node::new(
                    next_id,
                    level,
                    index,
                    group,
                    Some(parent_id),
                    spec.gradient_size,
                )?;

                arena.insert(Arc::new(node));
                children.push(next_id);
                next_id += 1;
            }

            if let Some(parent) = arena.get(parent_id) {
                let mut links = parent.links();
                links.children = children.clone();
                links.baseline = children.len();
                arena.rewire_siblings(&links.children);
            }

            current.extend(children);
        }

        debug!(level = level, nodes = current.len(); "built level");
        parents = current;
    }

    Ok((arena, next_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;

    #[test]
    fn plans() {
        assert_eq!(plan_levels(1, 1).unwrap(), [1]);
        assert_eq!(plan_levels(13, 2).unwrap(), [1, 12]);
        assert_eq!(plan_levels(5, 4).unwrap(), [1, 4]);
        assert_eq!(plan_levels(25, 3).unwrap(), [1, 12, 12]);
        assert_eq!(plan_levels(200, 3).unwrap(), [1, 12, 144]);
        assert_eq!(plan_levels(2000, 4).unwrap(), [1, 12, 144, 1728]);
        assert_eq!(plan_levels(100, 1).unwrap(), [1]);
    }

    #[test]
    fn invalid_plans() {
        assert!(matches!(
            plan_levels(0, 2),
            Err(HierarchyErr::InvalidTopology { threads: 0, max_depth: 2 })
        ));
        assert!(plan_levels(4, 0).is_err());
        assert!(plan_levels(4, 5).is_err());
    }

    #[test]
    fn level_two_is_spread_across_parents() {
        let spec = HierarchySpec::new(20, 3, 16);
        let (arena, next_id) = build::<u32>(&spec).unwrap();

        assert_eq!(next_id, 20);
        assert_eq!(arena.nodes_per_level(), [1, 12, 7]);

        let fanouts: Vec<_> = (1..=12)
            .map(|id| arena.get(id).unwrap().child_count())
            .collect();
        assert_eq!(fanouts, [1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn siblings_share_a_parent() {
        let spec = HierarchySpec::new(25, 3, 16);
        let (arena, _) = build::<u32>(&spec).unwrap();

        for node in arena.nodes() {
            let siblings = node.siblings();
            assert!(!siblings.contains(&node.id()));

            for &sibling in siblings.iter() {
                assert_eq!(arena.get(sibling).unwrap().parent(), node.parent());
            }
        }

        let root = arena.root().unwrap();
        assert!(root.siblings().is_empty());
        assert_eq!(root.role(), Role::Control);
        assert_eq!(arena.get(1).unwrap().siblings().len(), 11);
    }

    #[test]
    fn workers_are_leaves_in_depth_first_order() {
        let spec = HierarchySpec::new(15, 3, 10);
        let (arena, _) = build::<u32>(&spec).unwrap();

        // Nodes 1 and 2 own the two level 2 nodes 13 and 14.
        let ids: Vec<_> = arena.workers().iter().map(|w| w.id()).collect();
        assert_eq!(ids, [13, 14, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let segments = arena.worker_segments(10);
        assert_eq!(segments.len(), 12);
        assert_eq!(segments.iter().map(|(_, s)| s.len()).sum::<usize>(), 10);
    }

    #[test]
    fn single_node_hierarchy_is_a_worker() {
        let spec = HierarchySpec::new(1, 4, 3);
        let (arena, _) = build::<u32>(&spec).unwrap();

        assert_eq!(arena.len(), 1);
        assert_eq!(arena.root().unwrap().role(), Role::Worker);
        assert_eq!(arena.worker_segments(3), [(ROOT, Segment::new(0, 3))]);
    }

    #[test]
    fn groups_follow_sibling_position() {
        let spec = HierarchySpec::new(13, 2, 1);
        let (arena, _) = build::<u32>(&spec).unwrap();

        let groups: Vec<_> = (1..13).map(|id| arena.get(id).unwrap().group()).collect();
        assert_eq!(groups, (0..12).collect::<Vec<u8>>());
    }
}
