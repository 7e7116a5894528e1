use crate::error::ContainerErrors;

/// First fit allocator of contiguous `u32` ranges within `0..capacity`.
///
/// Freed spans are merged with their neighbours so the free set stays sorted and minimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanAllocator {
    /// Sorted, non-overlapping, non-adjacent `(start, len)` pairs
    free_spans: Vec<(u32, u32)>,
    capacity: u32,
}

impl SpanAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            free_spans: if capacity > 0 {
                vec![(0, capacity)]
            } else {
                Vec::new()
            },
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_count(&self) -> u32 {
        self.free_spans.iter().map(|(_, len)| *len).sum()
    }

    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return Some(0);
        }
        let position = self.free_spans.iter().position(|(_, len)| *len >= count)?;
        let (start, len) = self.free_spans[position];
        if len == count {
            self.free_spans.remove(position);
        } else {
            self.free_spans[position] = (start + count, len - count);
        }
        Some(start)
    }

    pub fn free(&mut self, start: u32, count: u32) -> Result<(), ContainerErrors> {
        if count == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(count)
            .filter(|end| *end <= self.capacity)
            .ok_or(ContainerErrors::NonexistentSlot)?;
        let position = self.free_spans.partition_point(|(free_start, _)| *free_start < start);
        if let Some((prev_start, prev_len)) = position
            .checked_sub(1)
            .map(|prev| self.free_spans[prev])
            && prev_start + prev_len > start
        {
            return Err(ContainerErrors::DoubleFree);
        }
        if let Some((next_start, _)) = self.free_spans.get(position).copied()
            && next_start < end
        {
            return Err(ContainerErrors::DoubleFree);
        }

        self.free_spans.insert(position, (start, count));
        // merge with next
        if let Some((next_start, next_len)) = self.free_spans.get(position + 1).copied()
            && next_start == end
        {
            self.free_spans[position].1 += next_len;
            self.free_spans.remove(position + 1);
        }
        // merge with previous
        if position > 0 {
            let (prev_start, prev_len) = self.free_spans[position - 1];
            if prev_start + prev_len == start {
                self.free_spans[position - 1].1 += self.free_spans[position].1;
                self.free_spans.remove(position);
            }
        }
        Ok(())
    }
}
