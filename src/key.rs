use std::fmt;

use smallvec::SmallVec;

/// Ordered chunk identifier.
///
/// Keys are sequences of integers compared lexicographically, which gives
/// the chunk index a natural sort order and makes prefix scans cheap. Keys
/// whose first element is `-1` are anonymous: they name pool-internal
/// allocations owned by no catalog entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkKey(SmallVec<[i32; 4]>);

impl ChunkKey {
    pub fn new(parts: impl IntoIterator<Item = i32>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// Key for an allocation owned by no catalog chunk.
    pub fn anonymous(id: i32) -> Self {
        Self(SmallVec::from_slice(&[-1, id]))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.first() == Some(&-1)
    }

    pub fn starts_with(&self, prefix: &ChunkKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[i32]> for ChunkKey {
    fn from(parts: &[i32]) -> Self {
        Self(SmallVec::from_slice(parts))
    }
}

impl From<Vec<i32>> for ChunkKey {
    fn from(parts: Vec<i32>) -> Self {
        Self(SmallVec::from_vec(parts))
    }
}

impl<const N: usize> From<[i32; N]> for ChunkKey {
    fn from(parts: [i32; N]) -> Self {
        Self(SmallVec::from_slice(&parts))
    }
}

impl FromIterator<i32> for ChunkKey {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
