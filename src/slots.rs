use std::sync::{Mutex, MutexGuard};

use metrics::{counter, gauge};
use tracing::error;

#[cfg(test)]
use crate::error::CacheError;
use crate::error::{precondition, Result};
use crate::layout::CacheLayout;
use crate::vmm::{PageAllocator, Reservation};

/// Acquire the table lock, recovering from poison so a panicking caller does
/// not take the cache down with it.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("slot table mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

struct SlotTableInner {
    allocator: Box<dyn PageAllocator>,
    key: Reservation,
    value: Reservation,
    /// Pages mapped at the base of each slot, in both reservations.
    mapped_pages: Vec<usize>,
}

/// Tracks how much of each sequence slot is physically backed.
///
/// Owns the key and value reservations. `mapped_pages[slot] * page_bytes`
/// bytes at the slot base are mapped in both reservations; the rest of the
/// slot range is unmapped and must not be dereferenced. Operations on
/// disjoint slots are independent; bookkeeping is serialized under one
/// mutex.
pub struct SlotTable {
    layout: CacheLayout,
    inner: Mutex<SlotTableInner>,
}

impl SlotTable {
    pub fn new(layout: CacheLayout, allocator: Box<dyn PageAllocator>) -> Result<Self> {
        precondition!(
            allocator.page_bytes() == layout.page_bytes(),
            "allocator page size {} disagrees with the layout page size {}",
            allocator.page_bytes(),
            layout.page_bytes()
        );
        let key = allocator.reserve(layout.total_pages())?;
        let value = allocator.reserve(layout.total_pages())?;
        Ok(Self {
            layout,
            inner: Mutex::new(SlotTableInner {
                allocator,
                key,
                value,
                mapped_pages: vec![0; layout.max_batch_size()],
            }),
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Grows each slot to cover at least the given token count, mapping the
    /// page delta into both reservations. Already-satisfied demands are
    /// no-ops. A failed map leaves the slot's counter unchanged and the
    /// caller must treat the step as impossible to admit.
    pub fn ensure_capacity(&self, demands: &[(usize, usize)]) -> Result<()> {
        let mut inner = lock_or_recover(&self.inner);
        for &(slot, tokens) in demands {
            precondition!(
                slot < self.layout.max_batch_size(),
                "slot {slot} out of range for batch size {}",
                self.layout.max_batch_size()
            );
            precondition!(
                tokens <= self.layout.max_seq_len(),
                "cannot grow slot {slot} to {tokens} tokens, max_seq_len is {}",
                self.layout.max_seq_len()
            );
            let needed = self.layout.pages_for_tokens(tokens);
            let current = inner.mapped_pages[slot];
            if needed <= current {
                continue;
            }
            let delta = needed - current;
            let base_page = slot * self.layout.pages_per_slot() + current;

            let SlotTableInner {
                allocator,
                key,
                value,
                mapped_pages,
            } = &mut *inner;
            if let Err(err) = allocator.map(key, base_page, delta) {
                counter!("kv_cache.map_failures").increment(1);
                error!(slot, delta, %err, "failed to map key pages");
                return Err(err);
            }
            if let Err(err) = allocator.map(value, base_page, delta) {
                // Keep the invariant that key and value are mapped in
                // lockstep: roll the key pages back before reporting.
                allocator.unmap(key, base_page, delta)?;
                counter!("kv_cache.map_failures").increment(1);
                error!(slot, delta, %err, "failed to map value pages");
                return Err(err);
            }
            mapped_pages[slot] = needed;
        }
        gauge!("kv_cache.mapped_pages").set(inner.mapped_pages.iter().sum::<usize>() as f64);
        Ok(())
    }

    /// Unmaps everything mapped for each slot and zeroes its counter. The
    /// slot is reusable immediately afterwards.
    pub fn release(&self, slots: &[usize]) -> Result<()> {
        let mut inner = lock_or_recover(&self.inner);
        for &slot in slots {
            precondition!(
                slot < self.layout.max_batch_size(),
                "slot {slot} out of range for batch size {}",
                self.layout.max_batch_size()
            );
            let mapped = inner.mapped_pages[slot];
            if mapped == 0 {
                continue;
            }
            let base_page = slot * self.layout.pages_per_slot();
            let SlotTableInner {
                allocator,
                key,
                value,
                mapped_pages,
            } = &mut *inner;
            allocator.unmap(key, base_page, mapped)?;
            allocator.unmap(value, base_page, mapped)?;
            mapped_pages[slot] = 0;
        }
        gauge!("kv_cache.mapped_pages").set(inner.mapped_pages.iter().sum::<usize>() as f64);
        Ok(())
    }

    pub fn mapped_pages(&self, slot: usize) -> usize {
        lock_or_recover(&self.inner).mapped_pages[slot]
    }

    /// Base addresses of the (key, value) reservations, for the external
    /// pointer-to-tensor wrapper.
    pub fn base_addrs(&self) -> (u64, u64) {
        let inner = lock_or_recover(&self.inner);
        (inner.key.base_addr(), inner.value.base_addr())
    }

    /// Runs `f` with shared access to the (key, value) reservations.
    pub fn with_reservations<R>(&self, f: impl FnOnce(&Reservation, &Reservation) -> R) -> R {
        let inner = lock_or_recover(&self.inner);
        f(&inner.key, &inner.value)
    }

    /// Runs `f` with exclusive access to the (key, value) reservations.
    pub fn with_reservations_mut<R>(
        &self,
        f: impl FnOnce(&mut Reservation, &mut Reservation) -> R,
    ) -> R {
        let mut inner = lock_or_recover(&self.inner);
        let SlotTableInner { key, value, .. } = &mut *inner;
        f(key, value)
    }
}
