use std::{cell::RefCell, num::NonZeroUsize};

use lru::LruCache;

use crate::{Error, FrameProtection, Gfn, MappedFrame};

struct CachedFrame {
    frame: MappedFrame,
    protection: FrameProtection,
}

/// A bounded cache of mapped guest frames, keyed by PFN and evicted in LRU
/// order.
///
/// The cache owns the mappings it holds; eviction or [`flush`] drops the
/// frame, which is the paired release of the backend resource. A soft cap
/// of zero makes the cache unbounded, which the file backend uses because
/// its "mappings" are cheap copies.
///
/// The cache does no synchronization of its own; the caller serializes
/// access to the owning instance.
///
/// [`flush`]: Self::flush
pub struct PageCache {
    frames: RefCell<LruCache<Gfn, CachedFrame>>,
}

impl PageCache {
    /// The default soft cap used by the live backends.
    pub const DEFAULT_CAPACITY: usize = 512;

    /// Creates a cache with the given soft cap (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        let frames = match NonZeroUsize::new(capacity) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };

        Self {
            frames: RefCell::new(frames),
        }
    }

    /// Returns the cached frame for `gfn`, touching its recency, or maps it
    /// via `map` and inserts it, possibly evicting the LRU entry.
    ///
    /// A cached read-only frame is remapped if the caller asks for a
    /// writable one.
    pub fn get_or_map(
        &self,
        gfn: Gfn,
        protection: FrameProtection,
        map: impl FnOnce() -> Result<MappedFrame, Error>,
    ) -> Result<MappedFrame, Error> {
        let mut frames = self.frames.borrow_mut();

        if let Some(entry) = frames.get(&gfn) {
            let sufficient = entry.protection == protection
                || entry.protection == FrameProtection::ReadWrite;

            if sufficient {
                return Ok(entry.frame.clone());
            }
        }

        let frame = map()?;
        tracing::trace!(%gfn, ?protection, "mapped frame");
        frames.put(
            gfn,
            CachedFrame {
                frame: frame.clone(),
                protection,
            },
        );

        Ok(frame)
    }

    /// Drops the cached frame for `gfn`, if present.
    pub fn invalidate(&self, gfn: Gfn) -> bool {
        self.frames.borrow_mut().pop(&gfn).is_some()
    }

    /// Drops every cached frame.
    pub fn flush(&self) {
        self.frames.borrow_mut().clear();
    }

    /// The number of frames currently resident.
    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Checks whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn frame_with(byte: u8) -> MappedFrame {
        MappedFrame::new(vec![byte; 4096])
    }

    #[test]
    fn hit_does_not_remap() -> Result<(), Error> {
        let cache = PageCache::new(4);
        let maps = Cell::new(0usize);

        for _ in 0..3 {
            cache.get_or_map(Gfn(1), FrameProtection::Read, || {
                maps.set(maps.get() + 1);
                Ok(frame_with(0xaa))
            })?;
        }

        assert_eq!(maps.get(), 1);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn lru_eviction_respects_recency() -> Result<(), Error> {
        let cache = PageCache::new(2);

        cache.get_or_map(Gfn(1), FrameProtection::Read, || Ok(frame_with(1)))?;
        cache.get_or_map(Gfn(2), FrameProtection::Read, || Ok(frame_with(2)))?;

        // Touch 1 so that 2 becomes the LRU entry.
        cache.get_or_map(Gfn(1), FrameProtection::Read, || unreachable!())?;
        cache.get_or_map(Gfn(3), FrameProtection::Read, || Ok(frame_with(3)))?;

        assert_eq!(cache.len(), 2);
        assert!(!cache.invalidate(Gfn(2)));
        assert!(cache.invalidate(Gfn(1)));
        assert!(cache.invalidate(Gfn(3)));
        Ok(())
    }

    #[test]
    fn zero_capacity_is_unbounded() -> Result<(), Error> {
        let cache = PageCache::new(0);

        for gfn in 0..1000 {
            cache.get_or_map(Gfn(gfn), FrameProtection::Read, || Ok(frame_with(0)))?;
        }

        assert_eq!(cache.len(), 1000);
        Ok(())
    }

    #[test]
    fn flush_releases_every_mapping() -> Result<(), Error> {
        let cache = PageCache::new(8);

        for gfn in 0..4 {
            cache.get_or_map(Gfn(gfn), FrameProtection::Read, || Ok(frame_with(0)))?;
        }

        cache.flush();
        assert!(cache.is_empty());
        assert!(!cache.invalidate(Gfn(0)));
        Ok(())
    }

    #[test]
    fn writable_request_remaps_readonly_entry() -> Result<(), Error> {
        let cache = PageCache::new(4);
        let maps = Cell::new(0usize);

        cache.get_or_map(Gfn(1), FrameProtection::Read, || {
            maps.set(maps.get() + 1);
            Ok(frame_with(0))
        })?;
        cache.get_or_map(Gfn(1), FrameProtection::ReadWrite, || {
            maps.set(maps.get() + 1);
            Ok(frame_with(0))
        })?;

        // A read request is now satisfied by the writable mapping.
        cache.get_or_map(Gfn(1), FrameProtection::Read, || unreachable!())?;

        assert_eq!(maps.get(), 2);
        Ok(())
    }

    #[test]
    fn map_failure_leaves_no_entry() {
        let cache = PageCache::new(4);

        let result = cache.get_or_map(Gfn(9), FrameProtection::Read, || {
            Err(Error::AccessDenied)
        });

        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
