//! World transform and bounds propagation
//!
//! A change to a cell's local transform recomputes the world transform of
//! the cell and of every descendant in preorder. Each touched cell stores
//! its own world bounds; the aggregate over the subtree is only returned.

use std::sync::Arc;
use tracing::trace;

use crate::cell::Cell;
use crate::events::{CellEvent, CellEventSink};
use crate::transform::{CellBounds, CellTransform};
use crate::tree::CellTree;
use crate::types::ChangeSource;

/// Result of one propagation pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransformUpdate {
    /// Cells whose world transform was recomputed
    pub touched: usize,
    /// World bounds of every touched cell merged together
    pub subtree_bounds: Option<CellBounds>,
}

impl TransformUpdate {
    /// Whether nothing was recomputed
    pub fn is_empty(&self) -> bool {
        self.touched == 0
    }
}

/// Set a cell's local transform and propagate the change down its subtree.
///
/// Returns an empty update when `local` equals the current local transform.
/// `None` makes the cell inherit the world transform of its nearest ancestor
/// that has one; with no such ancestor its world transform is left as is.
pub fn set_local_transform(
    tree: &CellTree,
    cell: &Arc<Cell>,
    local: Option<CellTransform>,
    source: ChangeSource,
    sink: &dyn CellEventSink,
) -> TransformUpdate {
    if cell.local_transform() == local {
        return TransformUpdate::default();
    }
    cell.set_local_field(local);
    refresh_subtree(tree, cell, source, sink)
}

/// Recompute world transforms of `cell` and its descendants from their
/// current local transforms, e.g. after the cell moved to a new parent.
pub fn refresh_subtree(
    tree: &CellTree,
    cell: &Arc<Cell>,
    source: ChangeSource,
    sink: &dyn CellEventSink,
) -> TransformUpdate {
    let inherited = tree
        .ancestors(cell.id())
        .iter()
        .find_map(|ancestor| ancestor.world_transform());

    let mut update = TransformUpdate::default();
    let mut stack = vec![(cell.clone(), inherited)];
    while let Some((current, parent_world)) = stack.pop() {
        let world = match current.local_transform() {
            Some(local) => Some(parent_world.unwrap_or(CellTransform::IDENTITY).mul(&local)),
            None => parent_world.or_else(|| current.world_transform()),
        };
        let world_bounds = match world {
            Some(world) => current.set_world(world),
            None => current.local_bounds(),
        };

        update.touched += 1;
        update.subtree_bounds = match (update.subtree_bounds, world_bounds) {
            (Some(acc), Some(b)) => Some(acc.merge(&b)),
            (acc, b) => acc.or(b),
        };

        sink.on_event(&CellEvent::TransformChanged {
            cell: current.id(),
            source,
            world,
            world_bounds,
        });
        current.notify_transform_listeners(source);

        for child in current.children().into_iter().rev() {
            if let Some(child) = tree.get(child) {
                stack.push((child, world));
            }
        }
    }

    trace!(cell = %cell.id(), touched = update.touched, ?source, "Transforms propagated");
    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::MockRendererBinding;
    use crate::testing::RecordingSink;
    use crate::types::CellId;
    use glam::{Quat, Vec3};

    fn add(tree: &CellTree, id: u64, parent: Option<u64>, bounds: Option<CellBounds>) -> Arc<Cell> {
        let cell = Arc::new(Cell::new(CellId::new(id), "box", None, bounds, Vec::new()));
        tree.insert(cell.clone(), parent.map(CellId::new)).unwrap();
        cell
    }

    fn moved(x: f32, y: f32, z: f32) -> Option<CellTransform> {
        Some(CellTransform::from_translation(Vec3::new(x, y, z)))
    }

    #[test]
    fn test_root_world_equals_local() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, None);
        let sink = RecordingSink::default();

        let local = CellTransform::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_y(0.5),
            Vec3::splat(2.0),
        );
        let update = set_local_transform(&tree, &root, Some(local), ChangeSource::Local, &sink);
        assert_eq!(update.touched, 1);
        assert_eq!(root.local_transform(), Some(local));
        assert_eq!(root.world_transform(), Some(local));

        // Same value again is a no-op
        let update = set_local_transform(&tree, &root, Some(local), ChangeSource::Local, &sink);
        assert!(update.is_empty());
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_child_composes_with_parent() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, None);
        let child = add(&tree, 2, Some(1), None);
        let sink = RecordingSink::default();

        let child_local = CellTransform::from_translation(Vec3::X);
        set_local_transform(&tree, &child, Some(child_local), ChangeSource::Remote, &sink);
        assert_eq!(child.world_transform(), Some(child_local));

        let parent_local = CellTransform::from_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2))
            .with_scale(Vec3::splat(2.0));
        let update = set_local_transform(&tree, &root, Some(parent_local), ChangeSource::Remote, &sink);
        assert_eq!(update.touched, 2);

        let expected = parent_local.mul(&child_local);
        let world = child.world_transform().unwrap();
        assert!(world.abs_diff_eq(&expected, 1e-5));
        assert!((world.translation - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_none_inherits_nearest_ancestor() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, None);
        let middle = add(&tree, 2, Some(1), None);
        let leaf = add(&tree, 3, Some(2), None);
        let sink = RecordingSink::default();

        set_local_transform(&tree, &root, moved(5.0, 0.0, 0.0), ChangeSource::Local, &sink);
        set_local_transform(&tree, &middle, moved(1.0, 0.0, 0.0), ChangeSource::Local, &sink);
        assert_eq!(leaf.world_transform(), moved(6.0, 0.0, 0.0));

        set_local_transform(&tree, &middle, None, ChangeSource::Local, &sink);
        assert_eq!(middle.world_transform(), moved(5.0, 0.0, 0.0));
        assert_eq!(leaf.world_transform(), moved(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_none_without_ancestor_world_is_unchanged() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, None);
        let sink = RecordingSink::default();

        set_local_transform(&tree, &root, moved(1.0, 1.0, 1.0), ChangeSource::Local, &sink);
        set_local_transform(&tree, &root, None, ChangeSource::Local, &sink);
        assert_eq!(root.local_transform(), None);
        assert_eq!(root.world_transform(), moved(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_bounds_without_world_transform_are_local() {
        let tree = CellTree::new();
        let bounds = CellBounds::cuboid(Vec3::ZERO, Vec3::ONE);
        let root = add(&tree, 1, None, Some(bounds));
        let child = add(&tree, 2, Some(1), Some(CellBounds::sphere(Vec3::X, 0.5)));
        let sink = RecordingSink::default();

        let update = refresh_subtree(&tree, &root, ChangeSource::ServerAdjust, &sink);
        assert_eq!(update.touched, 2);
        assert_eq!(root.world_bounds(), Some(bounds));
        assert_eq!(child.world_bounds(), Some(CellBounds::sphere(Vec3::X, 0.5)));
        assert_eq!(
            update.subtree_bounds,
            Some(bounds.merge(&CellBounds::sphere(Vec3::X, 0.5)))
        );
    }

    #[test]
    fn test_subtree_bounds_aggregate() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, Some(CellBounds::cuboid(Vec3::ZERO, Vec3::ONE)));
        let child = add(&tree, 2, Some(1), Some(CellBounds::cuboid(Vec3::ZERO, Vec3::ONE)));
        let sink = RecordingSink::default();

        set_local_transform(&tree, &child, moved(4.0, 0.0, 0.0), ChangeSource::Local, &sink);
        let update = set_local_transform(&tree, &root, moved(0.0, 1.0, 0.0), ChangeSource::Local, &sink);

        let (min, max) = update.subtree_bounds.unwrap().min_max();
        assert!((min - Vec3::new(-1.0, 0.0, -1.0)).length() < 1e-5);
        assert!((max - Vec3::new(5.0, 2.0, 1.0)).length() < 1e-5);

        // Stored bounds stay per cell
        let (min, max) = root.world_bounds().unwrap().min_max();
        assert!((min - Vec3::new(-1.0, 0.0, -1.0)).length() < 1e-5);
        assert!((max - Vec3::new(1.0, 2.0, 1.0)).length() < 1e-5);
        assert_eq!(tree.subtree_bounds(CellId::new(1)), update.subtree_bounds);
    }

    #[test]
    fn test_notifications_and_renderer() {
        let tree = CellTree::new();
        let root = add(&tree, 1, None, None);
        let child = add(&tree, 2, Some(1), None);
        let sink = RecordingSink::default();

        let mut renderer = MockRendererBinding::new();
        renderer
            .expect_transform_updated()
            .withf(|cell, world| *cell == CellId::new(2) && world.translation == Vec3::new(3.0, 0.0, 0.0))
            .times(1)
            .return_const(());
        child.bind_renderer(Arc::new(renderer));

        set_local_transform(&tree, &root, moved(3.0, 0.0, 0.0), ChangeSource::ServerAdjust, &sink);

        let touched: Vec<(CellId, ChangeSource)> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                CellEvent::TransformChanged { cell, source, .. } => Some((*cell, *source)),
                _ => None,
            })
            .collect();
        assert_eq!(
            touched,
            vec![
                (CellId::new(1), ChangeSource::ServerAdjust),
                (CellId::new(2), ChangeSource::ServerAdjust)
            ]
        );
    }
}
