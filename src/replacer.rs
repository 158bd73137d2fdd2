//! Frame replacement policies. Only frames currently tracked by the policy
//! are eligible for eviction; pinned frames are removed from it entirely.

use std::num::NonZeroUsize;

use lru::LruCache;

/// The interface the buffer pool drives. Frames enter the policy on unpin and
/// leave it on pin or on being chosen as a victim.
pub trait Replacer {
    /// Removes and returns the eviction candidate, or `None` when every frame
    /// is pinned.
    fn victim(&mut self) -> Option<usize>;

    /// Marks a frame unevictable, removing it from the policy.
    fn pin(&mut self, frame_id: usize);

    /// Re-admits a frame whose pin count dropped to zero. Newly unpinned
    /// frames become the most-recently-used candidates.
    fn unpin(&mut self, frame_id: usize);

    /// Number of frames currently eligible for eviction.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Least-recently-used replacement: `victim` takes the frame whose unpin is
/// the oldest.
pub struct LruReplacer {
    frames: LruCache<usize, ()>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<usize> {
        self.frames.pop_lru().map(|(frame_id, ())| frame_id)
    }

    fn pin(&mut self, frame_id: usize) {
        self.frames.pop(&frame_id);
    }

    fn unpin(&mut self, frame_id: usize) {
        if !self.frames.contains(&frame_id) {
            self.frames.put(frame_id, ());
        }
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_order() {
        let mut r = LruReplacer::new(8);
        r.unpin(1);
        r.unpin(2);
        r.unpin(3);
        assert_eq!(r.len(), 3);

        assert_eq!(r.victim(), Some(1));
        assert_eq!(r.victim(), Some(2));
        assert_eq!(r.victim(), Some(3));
        assert_eq!(r.victim(), None);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let mut r = LruReplacer::new(8);
        r.unpin(1);
        r.unpin(2);
        r.pin(1);
        assert_eq!(r.len(), 1);
        assert_eq!(r.victim(), Some(2));
        assert_eq!(r.victim(), None);
    }

    #[test]
    fn test_repeated_unpin_keeps_first_position() {
        let mut r = LruReplacer::new(8);
        r.unpin(1);
        r.unpin(2);
        r.unpin(1);
        assert_eq!(r.victim(), Some(1));
    }
}
