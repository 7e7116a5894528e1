use crate::resource::{PageIndex, PageKey, ResourceId};
use nanopage_containers::prelude::FreeList;
use std::collections::HashMap;

const NIL: u32 = u32::MAX;

/// Bookkeeping of one streaming page slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPageInfo {
    /// Page the slot is assigned to, set as soon as the page is selected
    pub registered_key: Option<PageKey>,
    /// Page whose data physically occupies the slot
    pub resident_key: Option<PageKey>,
    pub slot: u32,
    pub last_touch: u64,
    /// Registered pages that list this page as a dependency
    pub ref_count: u32,
    /// Update in which the page was protected as a dependency of new selections
    pub protected_update: u64,
    /// A pending install targets this slot
    pub in_flight: bool,
    /// The owning resource was removed while the install was in flight
    pub orphaned: bool,
    prev: u32,
    next: u32,
}

impl StreamingPageInfo {
    fn free(slot: u32, resident_key: Option<PageKey>) -> Self {
        Self {
            registered_key: None,
            resident_key,
            slot,
            last_touch: 0,
            ref_count: 0,
            protected_update: 0,
            in_flight: false,
            orphaned: false,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Slot table of the streaming page pool with an intrusive LRU.
///
/// The LRU is a circular doubly linked list over slot indices with a sentinel stored past the
/// last slot. The head (`sentinel.next`) is the most recently touched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRegistry {
    infos: Vec<StreamingPageInfo>,
    free_list: FreeList,
    registered: HashMap<PageKey, u32>,
    now: u64,
}

impl PageRegistry {
    pub fn new(capacity: u32) -> Self {
        let mut infos: Vec<StreamingPageInfo> = (0..=capacity)
            .map(|slot| StreamingPageInfo::free(slot, None))
            .collect();
        let sentinel = &mut infos[capacity as usize];
        sentinel.prev = capacity;
        sentinel.next = capacity;
        Self {
            infos,
            free_list: FreeList::with_capacity(capacity),
            registered: HashMap::with_capacity(capacity as usize),
            now: 1,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.free_list.capacity()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Current update number
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn begin_cycle(&mut self) {
        self.now += 1;
    }

    pub fn info(&self, slot: u32) -> &StreamingPageInfo {
        &self.infos[slot as usize]
    }

    pub fn slot_of(&self, key: PageKey) -> Option<u32> {
        self.registered.get(&key).copied()
    }

    pub fn is_registered(&self, key: PageKey) -> bool {
        self.registered.contains_key(&key)
    }

    /// Registered and physically resident. Root pages are not tracked here.
    pub fn is_committed(&self, key: PageKey) -> bool {
        self.slot_of(key)
            .is_some_and(|slot| self.infos[slot as usize].resident_key == Some(key))
    }

    pub fn ref_count(&self, key: PageKey) -> Option<u32> {
        self.slot_of(key).map(|slot| self.infos[slot as usize].ref_count)
    }

    pub fn acquire_free_slot(&mut self) -> Option<u32> {
        self.free_list.acquire()
    }

    /// Assigns `key` to `slot`, which must come from [`PageRegistry::acquire_free_slot`].
    ///
    /// Every non-root dependency must already be registered.
    pub fn register(&mut self, slot: u32, key: PageKey, dependencies: &[PageIndex]) {
        assert!(!key.is_root(), "Root pages are never registered");
        assert!(
            !self.free_list.is_free(slot) && self.infos[slot as usize].registered_key.is_none(),
            "Slot {slot} was not acquired before registering {key:?}"
        );
        let previous = self.registered.insert(key, slot);
        assert!(previous.is_none(), "{key:?} is already registered");

        let info = &mut self.infos[slot as usize];
        info.registered_key = Some(key);
        info.last_touch = self.now;
        info.ref_count = 0;
        self.push_head(slot);

        for dependency in dependencies.iter().filter(|page| **page != 0) {
            let dependency = PageKey::new(key.resource, *dependency);
            match self.registered.get(&dependency) {
                Some(dependency_slot) => self.infos[*dependency_slot as usize].ref_count += 1,
                None => panic!("{key:?} depends on unregistered {dependency:?}"),
            }
        }
    }

    /// Releases the slot of `key` back to the free list. Residency is left untouched.
    pub fn unregister(&mut self, key: PageKey, dependencies: &[PageIndex]) {
        let slot = match self.registered.remove(&key) {
            Some(slot) => slot,
            None => panic!("Unregistering unknown {key:?}"),
        };
        for dependency in dependencies.iter().filter(|page| **page != 0) {
            let dependency = PageKey::new(key.resource, *dependency);
            match self.registered.get(&dependency) {
                Some(dependency_slot) => {
                    let info = &mut self.infos[*dependency_slot as usize];
                    assert!(info.ref_count > 0, "{dependency:?} ref count underflow");
                    info.ref_count -= 1;
                }
                None => panic!("{key:?} depends on unregistered {dependency:?}"),
            }
        }
        self.unlink(slot);
        let resident_key = self.infos[slot as usize].resident_key;
        self.infos[slot as usize] = StreamingPageInfo::free(slot, resident_key);
        if let Err(e) = self.free_list.release(slot) {
            panic!("Slot {slot} released twice: {e}");
        }
    }

    /// Moves `key` to the LRU head. Repeated touches within one update are no-ops.
    pub fn touch(&mut self, key: PageKey) {
        let slot = match self.slot_of(key) {
            Some(slot) => slot,
            None => panic!("Touching unregistered {key:?}"),
        };
        if self.infos[slot as usize].last_touch == self.now {
            return;
        }
        self.unlink(slot);
        self.push_head(slot);
        self.infos[slot as usize].last_touch = self.now;
    }

    /// Shields a registered page from eviction for the rest of the update. Unregistered keys are
    /// ignored since they have nothing to evict.
    pub fn protect(&mut self, key: PageKey) {
        if let Some(slot) = self.slot_of(key) {
            self.infos[slot as usize].protected_update = self.now;
        }
    }

    pub fn set_in_flight(&mut self, slot: u32, in_flight: bool) {
        self.infos[slot as usize].in_flight = in_flight;
    }

    pub fn set_resident(&mut self, slot: u32, key: Option<PageKey>) {
        self.infos[slot as usize].resident_key = key;
    }

    /// Least recently used slot that may be reassigned, scanning from the LRU tail.
    pub fn eviction_candidate(&self) -> Option<u32> {
        let sentinel = self.capacity();
        let mut slot = self.infos[sentinel as usize].prev;
        while slot != sentinel {
            let info = &self.infos[slot as usize];
            if info.ref_count == 0
                && info.last_touch != self.now
                && info.protected_update != self.now
                && !info.in_flight
            {
                return Some(slot);
            }
            slot = info.prev;
        }
        None
    }

    /// Drops every registration of `resource` without dependency bookkeeping.
    ///
    /// Idle slots go back to the free list and are returned. Slots with an install in flight are
    /// marked orphaned and must be handed to [`PageRegistry::release_orphan`] once it lands.
    pub fn drop_resource(&mut self, resource: ResourceId) -> Vec<u32> {
        let mut keys: Vec<(PageKey, u32)> = self
            .registered
            .iter()
            .filter(|(key, _)| key.resource == resource)
            .map(|(key, slot)| (*key, *slot))
            .collect();
        keys.sort_unstable();

        let mut freed = Vec::new();
        for (key, slot) in keys {
            self.registered.remove(&key);
            self.unlink(slot);
            let info = &mut self.infos[slot as usize];
            if info.in_flight {
                info.orphaned = true;
                info.ref_count = 0;
            } else {
                *info = StreamingPageInfo::free(slot, None);
                if let Err(e) = self.free_list.release(slot) {
                    panic!("Slot {slot} released twice: {e}");
                }
                freed.push(slot);
            }
        }
        freed
    }

    pub fn release_orphan(&mut self, slot: u32) {
        let info = &mut self.infos[slot as usize];
        assert!(info.orphaned, "Slot {slot} is not orphaned");
        *info = StreamingPageInfo::free(slot, None);
        if let Err(e) = self.free_list.release(slot) {
            panic!("Slot {slot} released twice: {e}");
        }
    }

    /// Registered slots from least to most recently used.
    pub fn lru(&self) -> impl Iterator<Item = &StreamingPageInfo> + '_ {
        let sentinel = self.capacity();
        let mut slot = self.infos[sentinel as usize].prev;
        std::iter::from_fn(move || {
            if slot == sentinel {
                return None;
            }
            let info = &self.infos[slot as usize];
            slot = info.prev;
            Some(info)
        })
    }

    fn push_head(&mut self, slot: u32) {
        let sentinel = self.capacity();
        let head = self.infos[sentinel as usize].next;
        self.infos[slot as usize].prev = sentinel;
        self.infos[slot as usize].next = head;
        self.infos[head as usize].prev = slot;
        self.infos[sentinel as usize].next = slot;
    }

    fn unlink(&mut self, slot: u32) {
        let StreamingPageInfo { prev, next, .. } = self.infos[slot as usize];
        if prev == NIL {
            return;
        }
        self.infos[prev as usize].next = next;
        self.infos[next as usize].prev = prev;
        self.infos[slot as usize].prev = NIL;
        self.infos[slot as usize].next = NIL;
    }
}
