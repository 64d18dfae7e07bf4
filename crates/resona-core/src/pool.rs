//! Handle-addressed slab storage for runtime objects
//!
//! Sources, buffers, effects, and filters all live in pools of 64-slot
//! sub-lists, each carrying a free-bit mask. Allocation takes the lowest
//! set bit of the first non-full sub-list; addressing is a two-step array
//! index with no hashing. A handle keeps addressing the same slot until
//! the object is freed, which is what makes ids stable for object
//! lifetime even while the mixer is running.

/// Slots per sub-list; one bit of the free mask per slot
const SUBLIST_SLOTS: usize = 64;

/// One 64-slot block of a pool
struct SubList<T> {
    /// Bit set = slot free
    free_mask: u64,
    slots: Vec<Option<T>>,
}

impl<T> SubList<T> {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(SUBLIST_SLOTS);
        slots.resize_with(SUBLIST_SLOTS, || None);
        SubList {
            free_mask: !0u64,
            slots,
        }
    }

    fn live_count(&self) -> usize {
        (!self.free_mask).count_ones() as usize
    }
}

/// A growable slab of handle-addressed objects
///
/// Handles are nonzero `u32` values: `(sublist_index * 64 + slot) + 1`.
/// Freeing and re-allocating may reuse a handle, but never before the
/// free completed.
pub struct Pool<T> {
    lists: Vec<SubList<T>>,
    /// Upper bound on live objects; allocation fails beyond it
    limit: usize,
}

impl<T> Pool<T> {
    /// Create a pool bounded to `limit` live objects
    pub fn new(limit: usize) -> Self {
        Pool {
            lists: Vec::new(),
            limit,
        }
    }

    /// Change the object limit (existing objects are never evicted)
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Insert an object, returning its handle, or `None` at the limit
    pub fn insert(&mut self, value: T) -> Option<u32> {
        if self.live_count() >= self.limit {
            return None;
        }

        for (li, list) in self.lists.iter_mut().enumerate() {
            if list.free_mask != 0 {
                let slot = list.free_mask.trailing_zeros() as usize;
                list.free_mask &= !(1u64 << slot);
                list.slots[slot] = Some(value);
                return Some((li * SUBLIST_SLOTS + slot) as u32 + 1);
            }
        }

        let mut list = SubList::new();
        list.free_mask &= !1u64;
        list.slots[0] = Some(value);
        self.lists.push(list);
        Some(((self.lists.len() - 1) * SUBLIST_SLOTS) as u32 + 1)
    }

    fn locate(id: u32) -> Option<(usize, usize)> {
        if id == 0 {
            return None;
        }
        let index = (id - 1) as usize;
        Some((index / SUBLIST_SLOTS, index % SUBLIST_SLOTS))
    }

    /// Borrow the object addressed by `id`
    pub fn get(&self, id: u32) -> Option<&T> {
        let (li, slot) = Self::locate(id)?;
        self.lists.get(li)?.slots[slot].as_ref()
    }

    /// Mutably borrow the object addressed by `id`
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let (li, slot) = Self::locate(id)?;
        self.lists.get_mut(li)?.slots[slot].as_mut()
    }

    /// Remove and return the object addressed by `id`
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let (li, slot) = Self::locate(id)?;
        let list = self.lists.get_mut(li)?;
        let value = list.slots[slot].take()?;
        list.free_mask |= 1u64 << slot;
        Some(value)
    }

    /// Number of live objects across all sub-lists
    pub fn live_count(&self) -> usize {
        self.lists.iter().map(SubList::live_count).sum()
    }

    /// Iterate over (handle, object) pairs of live entries
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.lists.iter().enumerate().flat_map(|(li, list)| {
            list.slots.iter().enumerate().filter_map(move |(si, slot)| {
                slot.as_ref()
                    .map(|v| ((li * SUBLIST_SLOTS + si) as u32 + 1, v))
            })
        })
    }

    /// Iterate mutably over (handle, object) pairs of live entries
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.lists.iter_mut().enumerate().flat_map(|(li, list)| {
            list.slots
                .iter_mut()
                .enumerate()
                .filter_map(move |(si, slot)| {
                    slot.as_mut()
                        .map(|v| ((li * SUBLIST_SLOTS + si) as u32 + 1, v))
                })
        })
    }

    /// Drop every live object, returning how many there were
    ///
    /// Containers call this on teardown and warn when the application
    /// leaked objects.
    pub fn clear(&mut self) -> usize {
        let count = self.live_count();
        self.lists.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_returns_nonzero_stable_handles() {
        let mut pool: Pool<String> = Pool::new(256);
        let a = pool.insert("a".into()).unwrap();
        let b = pool.insert("b".into()).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(pool.get(a).unwrap(), "a");
        assert_eq!(pool.get(b).unwrap(), "b");
    }

    #[test]
    fn test_handle_zero_is_invalid() {
        let pool: Pool<u32> = Pool::new(16);
        assert!(pool.get(0).is_none());
    }

    #[test]
    fn test_free_then_alloc_may_reuse_handle() {
        let mut pool: Pool<u32> = Pool::new(64);
        let a = pool.insert(1).unwrap();
        assert_eq!(pool.remove(a), Some(1));
        assert!(pool.get(a).is_none());

        let b = pool.insert(2).unwrap();
        // Lowest-set-bit allocation reuses the freed slot.
        assert_eq!(b, a);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn test_never_two_live_objects_per_handle() {
        let mut pool: Pool<u32> = Pool::new(256);
        let ids: Vec<u32> = (0..100).map(|i| pool.insert(i).unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[test]
    fn test_grows_past_one_sublist() {
        let mut pool: Pool<usize> = Pool::new(1000);
        let ids: Vec<u32> = (0..130).map(|i| pool.insert(i).unwrap()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(pool.get(*id), Some(&i));
        }
        assert_eq!(pool.live_count(), 130);
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut pool: Pool<u32> = Pool::new(2);
        assert!(pool.insert(1).is_some());
        assert!(pool.insert(2).is_some());
        assert!(pool.insert(3).is_none());

        let id = pool.iter().next().unwrap().0;
        pool.remove(id);
        assert!(pool.insert(4).is_some());
    }

    #[test]
    fn test_live_count_via_popcount() {
        let mut pool: Pool<u32> = Pool::new(512);
        let ids: Vec<u32> = (0..70).map(|i| pool.insert(i).unwrap()).collect();
        pool.remove(ids[0]);
        pool.remove(ids[65]);
        assert_eq!(pool.live_count(), 68);
        assert_eq!(pool.clear(), 68);
        assert_eq!(pool.live_count(), 0);
    }
}
