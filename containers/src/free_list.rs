use crate::error::ContainerErrors;
use crate::slot::Slot;

/// Fixed capacity free list of indices.
///
/// Indices are handed out as a stack, so releasing an index and acquiring again yields the same
/// index. All storage is allocated up front and never grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    free: Vec<u32>,
    is_free: Vec<bool>,
}

impl FreeList {
    /// Every index in `0..capacity` starts free. Index 0 is handed out first.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            free: (0..capacity).rev().collect(),
            is_free: vec![true; capacity as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.is_free.len() as u32
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn acquire(&mut self) -> Option<u32> {
        let index = self.free.pop()?;
        self.is_free[index as usize] = false;
        Some(index)
    }

    pub fn release(&mut self, index: u32) -> Result<(), ContainerErrors> {
        match self.is_free.get_mut(index as usize) {
            None => Err(ContainerErrors::NonexistentSlot),
            Some(true) => Err(ContainerErrors::DoubleFree),
            Some(flag) => {
                *flag = true;
                self.free.push(index);
                Ok(())
            }
        }
    }

    pub fn is_free(&self, index: u32) -> bool {
        self.is_free.get(index as usize).copied().unwrap_or(false)
    }
}

/// [`FreeList`] whose indices carry a generation which is bumped on every release.
#[derive(Debug)]
pub struct GenerationalFreeList<T> {
    free_list: FreeList,
    generations: Vec<u32>,
    generation_bits: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T> GenerationalFreeList<T> {
    pub fn new(capacity: u32, generation_bits: u32) -> Self {
        Self {
            free_list: FreeList::with_capacity(capacity),
            generations: vec![0; capacity as usize],
            generation_bits,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.free_list.capacity()
    }

    pub fn len(&self) -> usize {
        self.capacity() as usize - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocate(&mut self) -> Option<Slot<T>> {
        let id = self.free_list.acquire()?;
        Some(Slot::new(id, self.generations[id as usize]))
    }

    pub fn release(&mut self, slot: Slot<T>) -> Result<(), ContainerErrors> {
        if !self.is_valid(&slot) {
            return Err(match self.generations.get(slot.id() as usize) {
                None => ContainerErrors::NonexistentSlot,
                Some(_) => ContainerErrors::GenerationMismatch,
            });
        }
        let generation = &mut self.generations[slot.id() as usize];
        *generation = generation.wrapping_add(1) & Slot::<T>::generation_mask(self.generation_bits);
        self.free_list.release(slot.id())
    }

    pub fn is_valid(&self, slot: &Slot<T>) -> bool {
        self.generations
            .get(slot.id() as usize)
            .is_some_and(|generation| *generation == slot.generation())
            && !self.free_list.is_free(slot.id())
    }
}
