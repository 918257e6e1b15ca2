//! Uniform spatial grid.
//!
//! The world is split into square cells. Each object is listed in every
//! cell its bounding rectangle touches, and the grid keeps the inverse map
//! so moving an object only touches the cells that changed.
//!
//! Queries are broad phase: they return every object sharing a cell with
//! the query shape, so callers re-test candidates with exact geometry.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use crate::hitbox::{Hitbox, RectangleHitbox};
use crate::math::Vec2;
use crate::object::ObjectId;

/// Objects beyond this count in one cell are not inserted into it.
pub const MAX_OBJECTS_PER_CELL: usize = 512;

/// Anything the grid can index.
pub trait GridObject {
    fn object_id(&self) -> ObjectId;
    fn bounding_rect(&self) -> RectangleHitbox;
}

#[derive(Debug)]
pub struct Grid {
    width: usize,
    height: usize,
    cell_size: f32,
    cells: Vec<HashSet<ObjectId>>,
    object_cells: HashMap<ObjectId, Vec<usize>>,
}

impl Grid {
    /// Grid covering `[0, world_width] x [0, world_height]`.
    ///
    /// # Panics
    /// If `cell_size` is not positive.
    pub fn new(world_width: f32, world_height: f32, cell_size: f32) -> Self {
        assert!(cell_size > 0.0, "grid cell size must be positive");
        let width = ((world_width / cell_size).ceil() as usize).max(1);
        let height = ((world_height / cell_size).ceil() as usize).max(1);
        Self {
            width,
            height,
            cell_size,
            cells: vec![HashSet::new(); width * height],
            object_cells: HashMap::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.object_cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_cells.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.object_cells.contains_key(&id)
    }

    /// Flattened indices of the cells holding `id`.
    pub fn cells_of(&self, id: ObjectId) -> Option<&[usize]> {
        self.object_cells.get(&id).map(Vec::as_slice)
    }

    /// Cell coordinates of `p`, clamped onto the grid.
    pub fn cell_coords(&self, p: Vec2) -> (usize, usize) {
        let cx = (p.x / self.cell_size).floor().max(0.0) as usize;
        let cy = (p.y / self.cell_size).floor().max(0.0) as usize;
        (cx.min(self.width - 1), cy.min(self.height - 1))
    }

    fn cells_for(&self, rect: &RectangleHitbox) -> Vec<usize> {
        let (x0, y0) = self.cell_coords(rect.min);
        let (x1, y1) = self.cell_coords(rect.max);
        let mut out = Vec::with_capacity((x1 - x0 + 1) * (y1 - y0 + 1));
        for y in y0..=y1 {
            for x in x0..=x1 {
                out.push(y * self.width + x);
            }
        }
        out
    }

    fn insert_into(&mut self, cell: usize, id: ObjectId) -> bool {
        let set = &mut self.cells[cell];
        if set.len() >= MAX_OBJECTS_PER_CELL && !set.contains(&id) {
            warn!(object = %id, cell, "grid cell full, skipping");
            return false;
        }
        set.insert(id);
        true
    }

    /// Indexes `obj`. Adding an object twice behaves like an update.
    pub fn add_object<O: GridObject + ?Sized>(&mut self, obj: &O) {
        self.update_object(obj);
    }

    /// Re-indexes `obj` after it moved or changed shape.
    pub fn update_object<O: GridObject + ?Sized>(&mut self, obj: &O) {
        let id = obj.object_id();
        let wanted = self.cells_for(&obj.bounding_rect());
        let old: HashSet<usize> = self
            .object_cells
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let keep: HashSet<usize> = wanted.iter().copied().collect();

        for &cell in old.difference(&keep) {
            self.cells[cell].remove(&id);
        }
        let mut placed = Vec::with_capacity(wanted.len());
        for cell in wanted {
            if old.contains(&cell) || self.insert_into(cell, id) {
                placed.push(cell);
            }
        }
        self.object_cells.insert(id, placed);
    }

    /// Drops `id` from every cell. Unknown ids are ignored.
    pub fn remove_object(&mut self, id: ObjectId) {
        if let Some(cells) = self.object_cells.remove(&id) {
            for cell in cells {
                self.cells[cell].remove(&id);
            }
        }
    }

    /// Objects sharing a cell with `rect`.
    pub fn intersects_rect(&self, rect: &RectangleHitbox) -> BTreeSet<ObjectId> {
        self.cells_for(rect)
            .into_iter()
            .flat_map(|cell| self.cells[cell].iter().copied())
            .collect()
    }

    /// Objects sharing a cell with `hitbox`'s bounding rectangle.
    pub fn intersects_hitbox(&self, hitbox: &Hitbox) -> BTreeSet<ObjectId> {
        self.intersects_rect(&hitbox.to_rectangle())
    }

    /// Objects sharing a cell with the segment's bounding rectangle.
    ///
    /// Long diagonal segments over-report; callers cast against each
    /// candidate anyway.
    pub fn intersect_line_segment(&self, a: Vec2, b: Vec2) -> BTreeSet<ObjectId> {
        self.intersects_rect(&RectangleHitbox::new(a, b))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    struct Thing {
        id: ObjectId,
        hitbox: Hitbox,
    }

    impl GridObject for Thing {
        fn object_id(&self) -> ObjectId {
            self.id
        }

        fn bounding_rect(&self) -> RectangleHitbox {
            self.hitbox.to_rectangle()
        }
    }

    fn thing(id: u16, x: f32, y: f32, r: f32) -> Thing {
        Thing {
            id: ObjectId(id),
            hitbox: Hitbox::circle(r, Vec2::new(x, y)),
        }
    }

    #[test]
    fn object_spans_every_touched_cell() {
        let mut grid = Grid::new(100.0, 100.0, 10.0);
        grid.add_object(&thing(1, 10.0, 10.0, 2.0));
        // Bounds (8,8)-(12,12) touch cells (0,0), (1,0), (0,1), (1,1).
        let mut cells = grid.cells_of(ObjectId(1)).unwrap().to_vec();
        cells.sort_unstable();
        assert_eq!(cells, vec![0, 1, 10, 11]);
    }

    #[test]
    fn moving_object_leaves_old_cells() {
        let mut grid = Grid::new(100.0, 100.0, 10.0);
        let mut t = thing(1, 5.0, 5.0, 1.0);
        grid.add_object(&t);

        t.hitbox = Hitbox::circle(1.0, Vec2::new(55.0, 55.0));
        grid.update_object(&t);

        let near_origin = grid.intersects_rect(&RectangleHitbox::new(Vec2::ZERO, Vec2::new(9.0, 9.0)));
        assert!(near_origin.is_empty());
        let near_target = grid.intersects_hitbox(&Hitbox::circle(1.0, Vec2::new(55.0, 55.0)));
        assert!(near_target.contains(&ObjectId(1)));
        assert_eq!(grid.cells_of(ObjectId(1)).unwrap(), &[55]);
    }

    #[test]
    fn out_of_world_positions_clamp_to_edge_cells() {
        let grid = Grid::new(100.0, 50.0, 10.0);
        assert_eq!(grid.cell_coords(Vec2::new(-30.0, -1.0)), (0, 0));
        assert_eq!(grid.cell_coords(Vec2::new(1000.0, 49.9)), (9, 4));
        assert_eq!(grid.cell_coords(Vec2::new(100.0, 50.0)), (9, 4));
    }

    #[test]
    fn remove_clears_all_cells() {
        let mut grid = Grid::new(100.0, 100.0, 10.0);
        grid.add_object(&thing(7, 50.0, 50.0, 12.0));
        assert!(grid.contains(ObjectId(7)));
        grid.remove_object(ObjectId(7));
        assert!(!grid.contains(ObjectId(7)));
        let all = grid.intersects_rect(&RectangleHitbox::new(Vec2::ZERO, Vec2::new(100.0, 100.0)));
        assert!(all.is_empty());
        // Removing again is a no-op.
        grid.remove_object(ObjectId(7));
    }

    #[test]
    fn query_results_are_deduplicated_and_sorted() {
        let mut grid = Grid::new(100.0, 100.0, 10.0);
        grid.add_object(&thing(3, 20.0, 20.0, 8.0));
        grid.add_object(&thing(1, 25.0, 25.0, 8.0));
        grid.add_object(&thing(2, 90.0, 90.0, 1.0));
        let hits: Vec<_> = grid
            .intersects_rect(&RectangleHitbox::new(Vec2::new(10.0, 10.0), Vec2::new(30.0, 30.0)))
            .into_iter()
            .collect();
        assert_eq!(hits, vec![ObjectId(1), ObjectId(3)]);
    }

    #[test]
    fn segment_query_uses_bounds() {
        let mut grid = Grid::new(100.0, 100.0, 10.0);
        grid.add_object(&thing(1, 50.0, 5.0, 1.0));
        grid.add_object(&thing(2, 5.0, 95.0, 1.0));
        let hits = grid.intersect_line_segment(Vec2::new(0.0, 5.0), Vec2::new(99.0, 5.0));
        assert!(hits.contains(&ObjectId(1)));
        assert!(!hits.contains(&ObjectId(2)));
    }

    #[test]
    fn full_cell_skips_new_objects() {
        let mut grid = Grid::new(10.0, 10.0, 10.0);
        for i in 0..MAX_OBJECTS_PER_CELL as u16 {
            grid.add_object(&thing(i + 1, 5.0, 5.0, 1.0));
        }
        let extra = MAX_OBJECTS_PER_CELL as u16 + 1;
        grid.add_object(&thing(extra, 5.0, 5.0, 1.0));
        assert_eq!(grid.cells_of(ObjectId(extra)).unwrap().len(), 0);
        // Updating an object already in the full cell keeps it there.
        grid.update_object(&thing(1, 5.0, 5.0, 2.0));
        assert_eq!(grid.cells_of(ObjectId(1)).unwrap(), &[0]);
    }

    fn overlaps(a: &RectangleHitbox, b: &RectangleHitbox) -> bool {
        a.min.x <= b.max.x && b.min.x <= a.max.x && a.min.y <= b.max.y && b.min.y <= a.max.y
    }

    /// `rect` grown to the edges of the cells it touches. Edge cells also
    /// hold everything clamped onto them, so they reach to infinity.
    fn rounded_out(grid: &Grid, rect: &RectangleHitbox) -> RectangleHitbox {
        let (x0, y0) = grid.cell_coords(rect.min);
        let (x1, y1) = grid.cell_coords(rect.max);
        let low = |c: usize| if c == 0 { f32::NEG_INFINITY } else { c as f32 * grid.cell_size() };
        let high = |c: usize, last: usize| {
            if c == last {
                f32::INFINITY
            } else {
                (c + 1) as f32 * grid.cell_size()
            }
        };
        RectangleHitbox {
            min: Vec2::new(low(x0), low(y0)),
            max: Vec2::new(high(x1, grid.width() - 1), high(y1, grid.height() - 1)),
        }
    }

    #[test]
    fn arbitrary_queries_are_complete_and_cell_bounded() {
        let mut rng = StdRng::seed_from_u64(29);
        let mut grid = Grid::new(200.0, 200.0, 16.0);
        let mut live: HashMap<u16, Thing> = HashMap::new();

        for step in 0..1500 {
            let id = rng.gen_range(1..64u16);
            if rng.gen_bool(0.8) {
                let t = thing(
                    id,
                    rng.gen_range(-10.0..210.0),
                    rng.gen_range(-10.0..210.0),
                    rng.gen_range(0.5..24.0),
                );
                grid.update_object(&t);
                live.insert(id, t);
            } else {
                grid.remove_object(ObjectId(id));
                live.remove(&id);
            }

            if step % 10 != 0 {
                continue;
            }
            let min = Vec2::new(rng.gen_range(-20.0..220.0), rng.gen_range(-20.0..220.0));
            let size = Vec2::new(rng.gen_range(0.0..60.0), rng.gen_range(0.0..60.0));
            let query = RectangleHitbox::new(min, min + size);
            let found = grid.intersects_rect(&query);

            for t in live.values() {
                if overlaps(&t.bounding_rect(), &query) {
                    assert!(found.contains(&t.id), "{} overlaps {query:?} but was missed", t.id);
                }
            }
            let cells = rounded_out(&grid, &query);
            for id in &found {
                let t = live.get(&id.0).expect("query returned a removed object");
                assert!(
                    overlaps(&t.bounding_rect(), &cells),
                    "{id} returned but outside {cells:?}"
                );
            }
        }
    }

    #[test]
    fn random_churn_never_loses_objects() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut grid = Grid::new(200.0, 200.0, 16.0);
        let mut live: HashMap<u16, Thing> = HashMap::new();

        for step in 0..2000 {
            let id = rng.gen_range(1..64u16);
            match rng.gen_range(0..3) {
                0 | 1 => {
                    let t = thing(
                        id,
                        rng.gen_range(-10.0..210.0),
                        rng.gen_range(-10.0..210.0),
                        rng.gen_range(0.5..20.0),
                    );
                    grid.update_object(&t);
                    live.insert(id, t);
                }
                _ => {
                    grid.remove_object(ObjectId(id));
                    live.remove(&id);
                }
            }

            if step % 100 == 0 {
                assert_eq!(grid.len(), live.len());
                for t in live.values() {
                    assert!(
                        grid.intersects_hitbox(&t.hitbox).contains(&t.id),
                        "{} missing from its own query",
                        t.id
                    );
                }
                let everything = grid.intersects_rect(&RectangleHitbox::new(
                    Vec2::new(-100.0, -100.0),
                    Vec2::new(400.0, 400.0),
                ));
                assert!(everything.iter().all(|id| live.contains_key(&id.0)));
            }
        }
    }
}
