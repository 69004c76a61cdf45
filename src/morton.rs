//! Routines for working with Morton keys.
//!
//! A key interleaves the normalized coordinates of a point, one bit per
//! dimension per level, behind a leading sentinel bit. The sentinel
//! makes the depth recoverable from the bit width and gives keys of
//! equal depth the property that the raw integer order is the Morton
//! order. Two distinct points in the same deepest voxel share a key;
//! callers that need uniqueness tie-break by particle id.

use mpi::traits::Equivalence;

use crate::constants::{DEEPEST_LEVEL, DIMENSION, NCHILDREN};
use crate::geometry::{Coord, DomainRange};

/// A Morton key bounded to a domain range.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Equivalence)]
pub struct MortonKey {
    value: u64,
}

impl MortonKey {
    /// The root key (depth 0).
    pub fn root() -> Self {
        Self { value: 1 }
    }

    /// The invalid key. Entities not yet inserted carry it.
    pub fn invalid() -> Self {
        Self { value: 0 }
    }

    /// First key of the deepest level.
    pub fn first() -> Self {
        Self {
            value: 1u64 << (DIMENSION as u32 * DEEPEST_LEVEL),
        }
    }

    /// Last key of the deepest level.
    pub fn last() -> Self {
        let shift = DIMENSION as u32 * DEEPEST_LEVEL;
        Self {
            value: (1u64 << shift) | ((1u64 << shift) - 1),
        }
    }

    /// Whether this key is valid, i.e. has a sentinel bit.
    pub fn is_valid(&self) -> bool {
        self.value != 0
    }

    /// Raw integer value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Encode a point of the given range at `depth`.
    ///
    /// Points outside the range violate the tree contract; this
    /// asserts rather than clamping silently.
    pub fn from_point(range: &DomainRange, point: Coord, depth: u32) -> Self {
        assert!(depth <= DEEPEST_LEVEL);
        assert!(
            range.contains(point),
            "point {:?} outside key range {}",
            point,
            range
        );

        let min = range.min();
        let scale = range.scale();
        let cells = 1u64 << depth;

        // Normalized integer coordinate per dimension, clamped so that
        // the upper domain face still maps to the last voxel.
        let mut index = [0u64; DIMENSION];
        for d in 0..DIMENSION {
            let normalized = (point[d] - min[d]) / scale[d];
            index[d] = ((normalized * cells as f64) as u64).min(cells - 1);
        }

        let mut value = 1u64;
        for b in (0..depth).rev() {
            for idx in &index {
                value = (value << 1) | ((idx >> b) & 1);
            }
        }

        Self { value }
    }

    /// Depth of the key, recovered from the sentinel position.
    pub fn depth(&self) -> u32 {
        debug_assert!(self.is_valid());
        (63 - self.value.leading_zeros()) / DIMENSION as u32
    }

    /// Append a child selector, descending one level.
    pub fn push(&self, child: usize) -> Self {
        debug_assert!(child < NCHILDREN);
        debug_assert!(self.depth() < DEEPEST_LEVEL);
        Self {
            value: (self.value << DIMENSION) | child as u64,
        }
    }

    /// Discard the last child selector, ascending one level.
    pub fn pop(&self) -> Self {
        debug_assert!(self.depth() > 0);
        Self {
            value: self.value >> DIMENSION,
        }
    }

    /// The parent key.
    pub fn parent(&self) -> Self {
        self.pop()
    }

    /// The ancestor at depth `depth`.
    pub fn truncate(&self, depth: u32) -> Self {
        let own = self.depth();
        debug_assert!(depth <= own);
        Self {
            value: self.value >> (DIMENSION as u32 * (own - depth)),
        }
    }

    /// Child selector relative to the parent.
    pub fn child_index(&self) -> usize {
        debug_assert!(self.depth() > 0);
        (self.value & (NCHILDREN as u64 - 1)) as usize
    }

    /// True if `self` is an ancestor of `other` (a key is its own
    /// ancestor).
    pub fn is_ancestor(&self, other: MortonKey) -> bool {
        let own = self.depth();
        let theirs = other.depth();
        own <= theirs && other.truncate(own) == *self
    }

    /// Centroid of the key's voxel in physical coordinates.
    pub fn coordinates(&self, range: &DomainRange) -> Coord {
        let depth = self.depth();
        let min = range.min();
        let scale = range.scale();
        let cells = 1u64 << depth;

        // Decode the per-dimension voxel index.
        let mut index = [0u64; DIMENSION];
        for b in 0..depth {
            for (d, idx) in index.iter_mut().enumerate() {
                let shift = (depth - 1 - b) * DIMENSION as u32 + (DIMENSION - 1 - d) as u32;
                *idx = (*idx << 1) | ((self.value >> shift) & 1);
            }
        }

        let mut centroid = [0.0; DIMENSION];
        for d in 0..DIMENSION {
            centroid[d] = min[d] + (index[d] as f64 + 0.5) * scale[d] / cells as f64;
        }
        centroid
    }

    /// The axis-aligned box of the key's voxel.
    pub fn voxel(&self, range: &DomainRange) -> (Coord, Coord) {
        let centroid = self.coordinates(range);
        let scale = range.scale();
        let cells = (1u64 << self.depth()) as f64;
        let mut min = centroid;
        let mut max = centroid;
        for d in 0..DIMENSION {
            let half = 0.5 * scale[d] / cells;
            min[d] -= half;
            max[d] += half;
        }
        (min, max)
    }
}

impl std::fmt::Debug for MortonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MortonKey")
            .field("depth", &self.depth())
            .field("value", &format_args!("{:#o}", self.value))
            .finish()
    }
}

impl std::fmt::Display for MortonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit_range() -> DomainRange {
        DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION])
    }

    #[test]
    fn test_root_and_bounds() {
        assert_eq!(MortonKey::root().depth(), 0);
        assert!(!MortonKey::invalid().is_valid());
        assert_eq!(MortonKey::first().depth(), DEEPEST_LEVEL);
        assert_eq!(MortonKey::last().depth(), DEEPEST_LEVEL);
        assert!(MortonKey::first() <= MortonKey::last());
    }

    #[test]
    fn test_push_pop() {
        let key = MortonKey::root().push(1).push(0).push(NCHILDREN - 1);
        assert_eq!(key.depth(), 3);
        assert_eq!(key.child_index(), NCHILDREN - 1);
        assert_eq!(key.pop().pop().pop(), MortonKey::root());
        assert_eq!(key.truncate(1), MortonKey::root().push(1));
    }

    #[test]
    fn test_ancestors() {
        let range = unit_range();
        let key = MortonKey::from_point(&range, [0.3; DIMENSION], DEEPEST_LEVEL);
        for depth in 0..DEEPEST_LEVEL {
            assert!(key.truncate(depth).is_ancestor(key));
        }
        assert!(key.is_ancestor(key));
        assert!(!key.is_ancestor(key.parent()));
        assert_eq!(key.truncate(0), MortonKey::root());
    }

    #[test]
    fn test_key_roundtrip_through_centroid() {
        let range = unit_range();
        for depth in [1, 4, DEEPEST_LEVEL] {
            let key = MortonKey::from_point(&range, [0.641; DIMENSION], depth);
            let lifted = MortonKey::from_point(&range, key.coordinates(&range), depth);
            assert_eq!(key, lifted);
        }
    }

    #[test]
    fn test_morton_order_along_axis() {
        // Points ordered along the first axis must have non-decreasing
        // keys when the remaining coordinates agree.
        let range = unit_range();
        let mut previous = MortonKey::invalid();
        for i in 0..64 {
            let mut p = [0.25; DIMENSION];
            p[0] = (i as f64 + 0.5) / 64.0;
            let key = MortonKey::from_point(&range, p, DEEPEST_LEVEL);
            if previous.is_valid() {
                assert!(previous < key);
            }
            previous = key;
        }
    }

    #[test]
    fn test_voxel_contains_centroid() {
        let range = unit_range();
        let key = MortonKey::from_point(&range, [0.77; DIMENSION], 5);
        let (min, max) = key.voxel(&range);
        let c = key.coordinates(&range);
        for d in 0..DIMENSION {
            assert!(min[d] < c[d] && c[d] < max[d]);
        }
    }

    #[test]
    fn test_same_voxel_same_key() {
        let range = unit_range();
        let a = MortonKey::from_point(&range, [0.5001; DIMENSION], 4);
        let b = MortonKey::from_point(&range, [0.5002; DIMENSION], 4);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic]
    fn test_point_outside_range_panics() {
        let range = unit_range();
        MortonKey::from_point(&range, [1.5; DIMENSION], DEEPEST_LEVEL);
    }
}
