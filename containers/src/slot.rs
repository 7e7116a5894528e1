use derivative::Derivative;
use std::marker::PhantomData;

/// Index + generation pair handed out by [`crate::free_list::GenerationalFreeList`].
///
/// The generation is bumped every time the underlying index is recycled, so a stale slot can be
/// told apart from the live one even though both point at the same index.
#[derive(Derivative)]
#[derivative(Debug, PartialEq, Eq, Hash)]
pub struct Slot<T> {
    id: u32,
    generation: u32,
    #[derivative(Debug = "ignore", PartialEq = "ignore", Hash = "ignore")]
    _marker: PhantomData<T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> Slot<T> {
    pub fn new(id: u32, generation: u32) -> Self {
        Self {
            id,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the slot into a single `u32` with the generation in the low `generation_bits`.
    pub fn pack(&self, generation_bits: u32) -> u32 {
        assert!(generation_bits < 32, "Generation must leave room for an id");
        assert!(
            self.id < (1u32 << (32 - generation_bits)),
            "ID must fit within {} bits",
            32 - generation_bits
        );
        (self.id << generation_bits) | (self.generation & Self::generation_mask(generation_bits))
    }

    pub fn unpack(raw: u32, generation_bits: u32) -> Self {
        Self::new(
            raw >> generation_bits,
            raw & Self::generation_mask(generation_bits),
        )
    }

    pub fn generation_mask(generation_bits: u32) -> u32 {
        ((1u64 << generation_bits) - 1) as u32
    }
}
