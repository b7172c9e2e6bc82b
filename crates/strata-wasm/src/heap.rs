//! Memory bridge: copies buffers in and out of guest linear memory and frees
//! what the host allocated once the invocation is over.

use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::error::HeapError;
use crate::guest::Guest;

/// A guest allocation made by the host during one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: u32,
    pub len: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeapState {
    /// Nothing written since the last successful clear.
    #[default]
    Idle,
    Active,
    /// A clear failed part way. Only [`Heap::reset`] leaves this state.
    Draining,
}

/// Host-side ledger of guest allocations.
///
/// The heap never owns guest memory; every operation takes the [`Guest`]
/// whose allocator and memory it should use.
#[derive(Debug, Default)]
pub struct Heap {
    tracked: BTreeMap<u32, u32>,
    state: HeapState,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    /// Tracked allocations in ascending pointer order.
    pub fn tracked(&self) -> impl Iterator<Item = Allocation> + '_ {
        self.tracked
            .iter()
            .map(|(&ptr, &len)| Allocation { ptr, len })
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Allocate, copy `bytes` in and track the allocation for [`Heap::clear`].
    pub fn write<G: Guest + ?Sized>(&mut self, guest: &mut G, bytes: &[u8]) -> Result<u32, HeapError> {
        self.write_and_track(guest, bytes, true)
    }

    /// Allocate exactly `bytes.len()` and copy `bytes` in. With `track` unset
    /// the guest owns the allocation and `clear` never frees it.
    pub fn write_and_track<G: Guest + ?Sized>(
        &mut self,
        guest: &mut G,
        bytes: &[u8],
        track: bool,
    ) -> Result<u32, HeapError> {
        self.ensure_usable()?;
        let len = u32::try_from(bytes.len()).map_err(|_| HeapError::Allocation {
            len: bytes.len(),
            source: anyhow!("buffer exceeds the wasm32 address space"),
        })?;
        let ptr = guest.allocate(len).map_err(|source| HeapError::Allocation {
            len: bytes.len(),
            source,
        })?;
        if !in_bounds(guest, ptr, bytes.len()) {
            log::warn!("heap: allocation at {ptr} ({len} bytes) is past the end of guest memory and leaks");
            return Err(HeapError::Allocation {
                len: bytes.len(),
                source: anyhow!("allocator returned {ptr}, past the end of guest memory"),
            });
        }
        // Empty allocations hand back a dangling pointer that must not be freed.
        if track && len > 0 {
            if self.tracked.contains_key(&ptr) {
                // Freeing it would also free the tracked allocation at `ptr`.
                log::warn!("heap: allocation at {ptr} ({len} bytes) duplicates a tracked pointer and leaks");
                return Err(HeapError::Allocation {
                    len: bytes.len(),
                    source: anyhow!("allocator returned {ptr}, which is still tracked"),
                });
            }
            self.tracked.insert(ptr, len);
        }
        self.state = HeapState::Active;
        self.copy_in(guest, bytes, ptr)
    }

    /// Copy `bytes` to memory the guest already owns.
    pub fn write_at_ptr<G: Guest + ?Sized>(
        &mut self,
        guest: &mut G,
        bytes: &[u8],
        ptr: u32,
    ) -> Result<u32, HeapError> {
        self.ensure_usable()?;
        self.copy_in(guest, bytes, ptr)
    }

    pub fn read_bytes<G: Guest + ?Sized>(&self, guest: &G, ptr: u32, len: u32) -> Result<Vec<u8>, HeapError> {
        self.ensure_usable()?;
        let size = len as usize;
        if !in_bounds(guest, ptr, size) {
            return Err(out_of_bounds(guest, ptr, size));
        }
        let mut buf = vec![0u8; size];
        guest
            .read_memory(ptr, &mut buf)
            .map_err(|_| out_of_bounds(guest, ptr, size))?;
        Ok(buf)
    }

    pub fn read_string<G: Guest + ?Sized>(&self, guest: &G, ptr: u32, len: u32) -> Result<String, HeapError> {
        let bytes = self.read_bytes(guest, ptr, len)?;
        String::from_utf8(bytes).map_err(|err| HeapError::Decode {
            ptr,
            source: err.utf8_error(),
        })
    }

    /// Free every tracked allocation in ascending pointer order.
    ///
    /// Stops at the first failed deallocation: that allocation and every one
    /// after it stay tracked and the heap is left [`HeapState::Draining`].
    pub fn clear<G: Guest + ?Sized>(&mut self, guest: &mut G) -> Result<(), HeapError> {
        match self.state {
            HeapState::Draining => return Err(HeapError::Poisoned),
            HeapState::Idle if self.tracked.is_empty() => return Ok(()),
            _ => {}
        }
        self.state = HeapState::Draining;
        let pending = std::mem::take(&mut self.tracked);
        let total = pending.len();
        let mut pending = pending.into_iter();
        while let Some((ptr, len)) = pending.next() {
            if let Err(source) = guest.deallocate(ptr, len) {
                self.tracked.insert(ptr, len);
                self.tracked.extend(pending);
                let remaining = self.tracked.len();
                log::warn!(
                    "heap clear failed at {ptr} ({len} bytes); {remaining} of {total} allocation(s) leaked"
                );
                return Err(HeapError::ResourceLeak {
                    ptr,
                    len,
                    remaining,
                    source,
                });
            }
        }
        self.state = HeapState::Idle;
        log::debug!("heap cleared {total} allocation(s)");
        Ok(())
    }

    /// Forget every tracked allocation without freeing it and return to
    /// `Idle`. For tearing down an instance whose clear failed.
    pub fn reset(&mut self) -> Vec<Allocation> {
        let dropped = self.tracked().collect();
        self.tracked.clear();
        self.state = HeapState::Idle;
        dropped
    }

    fn ensure_usable(&self) -> Result<(), HeapError> {
        match self.state {
            HeapState::Draining => Err(HeapError::Poisoned),
            HeapState::Idle | HeapState::Active => Ok(()),
        }
    }

    fn copy_in<G: Guest + ?Sized>(&self, guest: &mut G, bytes: &[u8], ptr: u32) -> Result<u32, HeapError> {
        if !in_bounds(guest, ptr, bytes.len()) {
            return Err(out_of_bounds(guest, ptr, bytes.len()));
        }
        guest
            .write_memory(ptr, bytes)
            .map_err(|_| out_of_bounds(guest, ptr, bytes.len()))?;
        Ok(ptr)
    }
}

fn in_bounds<G: Guest + ?Sized>(guest: &G, ptr: u32, len: usize) -> bool {
    (ptr as usize)
        .checked_add(len)
        .is_some_and(|end| end <= guest.memory_size())
}

fn out_of_bounds<G: Guest + ?Sized>(guest: &G, ptr: u32, len: usize) -> HeapError {
    HeapError::OutOfBounds {
        ptr,
        len,
        memory_size: guest.memory_size(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::VecDeque;

    /// Linear memory with a bump allocator, or scripted pointers when given.
    struct FakeGuest {
        memory: Vec<u8>,
        next: u32,
        scripted: VecDeque<u32>,
        freed: Vec<(u32, u32)>,
        fail_free_at: Option<u32>,
    }

    impl FakeGuest {
        fn new(pages: usize) -> Self {
            Self {
                memory: vec![0; pages * 1024],
                next: 16,
                scripted: VecDeque::new(),
                freed: Vec::new(),
                fail_free_at: None,
            }
        }

        fn scripted(pointers: &[u32]) -> Self {
            let mut guest = Self::new(1);
            guest.scripted = pointers.iter().copied().collect();
            guest
        }
    }

    impl Guest for FakeGuest {
        fn memory_size(&self) -> usize {
            self.memory.len()
        }

        fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> anyhow::Result<()> {
            let start = ptr as usize;
            buf.copy_from_slice(&self.memory[start..start + buf.len()]);
            Ok(())
        }

        fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> anyhow::Result<()> {
            let start = ptr as usize;
            self.memory[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn allocate(&mut self, len: u32) -> anyhow::Result<u32> {
            if let Some(ptr) = self.scripted.pop_front() {
                return Ok(ptr);
            }
            let ptr = self.next;
            if ptr as usize + len as usize > self.memory.len() {
                bail!("out of memory");
            }
            self.next += len.max(1);
            Ok(ptr)
        }

        fn deallocate(&mut self, ptr: u32, len: u32) -> anyhow::Result<()> {
            if self.fail_free_at == Some(ptr) {
                bail!("dealloc trapped");
            }
            self.freed.push((ptr, len));
            Ok(())
        }
    }

    #[test]
    fn write_then_read_string() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        let ptr = heap.write(&mut guest, b"hello").unwrap();
        assert_eq!(heap.read_string(&guest, ptr, 5).unwrap(), "hello");
        assert_eq!(heap.read_bytes(&guest, ptr, 5).unwrap(), b"hello");
        assert_eq!(heap.state(), HeapState::Active);
    }

    #[test]
    fn clear_frees_in_ascending_pointer_order() {
        let mut guest = FakeGuest::scripted(&[200, 100]);
        let mut heap = Heap::new();
        heap.write(&mut guest, b"second").unwrap();
        heap.write(&mut guest, b"first").unwrap();

        heap.clear(&mut guest).unwrap();
        assert_eq!(guest.freed, vec![(100, 5), (200, 6)]);
        assert_eq!(heap.tracked_len(), 0);
        assert_eq!(heap.state(), HeapState::Idle);

        heap.clear(&mut guest).unwrap();
        assert_eq!(guest.freed.len(), 2);
    }

    #[test]
    fn untracked_writes_are_never_freed() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        let owned = heap.write_and_track(&mut guest, b"guest owns this", false).unwrap();
        let tracked = heap.write(&mut guest, b"host owns this").unwrap();
        heap.clear(&mut guest).unwrap();

        let freed: Vec<u32> = guest.freed.iter().map(|(ptr, _)| *ptr).collect();
        assert_eq!(freed, vec![tracked]);
        assert!(!freed.contains(&owned));
    }

    #[test]
    fn empty_writes_allocate_but_are_not_tracked() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        heap.write(&mut guest, b"").unwrap();
        assert_eq!(heap.tracked_len(), 0);
        heap.clear(&mut guest).unwrap();
        assert!(guest.freed.is_empty());
    }

    #[test]
    fn duplicate_pointer_from_allocator_is_refused() {
        let mut guest = FakeGuest::scripted(&[64, 64]);
        let mut heap = Heap::new();
        heap.write(&mut guest, b"a").unwrap();
        let err = heap.write(&mut guest, b"b").unwrap_err();
        assert!(matches!(err, HeapError::Allocation { len: 1, .. }));
        assert_eq!(heap.tracked_len(), 1);
        assert!(guest.freed.is_empty());

        heap.clear(&mut guest).unwrap();
        assert_eq!(guest.freed, [(64, 1)]);
    }

    #[test]
    fn allocator_failures_surface_as_allocation_errors() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        let err = heap.write(&mut guest, &vec![0u8; 4096]).unwrap_err();
        assert!(matches!(err, HeapError::Allocation { len: 4096, .. }));

        let mut guest = FakeGuest::scripted(&[1020]);
        let err = heap.write(&mut guest, b"too long").unwrap_err();
        assert!(matches!(err, HeapError::Allocation { .. }));
        assert_eq!(heap.tracked_len(), 0);
        assert!(guest.freed.is_empty());
        assert_eq!(heap.state(), HeapState::Idle);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        assert!(matches!(
            heap.read_bytes(&guest, 1020, 8),
            Err(HeapError::OutOfBounds { ptr: 1020, len: 8, memory_size: 1024 })
        ));
        assert!(matches!(
            heap.write_at_ptr(&mut guest, b"12345678", u32::MAX),
            Err(HeapError::OutOfBounds { .. })
        ));
        assert_eq!(heap.write_at_ptr(&mut guest, b"ok", 1022).unwrap(), 1022);
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let mut guest = FakeGuest::new(1);
        let mut heap = Heap::new();
        let ptr = heap.write(&mut guest, &[0x66, 0xff, 0x6f]).unwrap();
        assert!(matches!(
            heap.read_string(&guest, ptr, 3),
            Err(HeapError::Decode { .. })
        ));
    }

    #[test]
    fn failed_clear_poisons_until_reset() {
        let mut guest = FakeGuest::scripted(&[100, 200, 300]);
        guest.fail_free_at = Some(200);
        let mut heap = Heap::new();
        for bytes in [&b"a"[..], b"bb", b"ccc"] {
            heap.write(&mut guest, bytes).unwrap();
        }

        let err = heap.clear(&mut guest).unwrap_err();
        assert!(matches!(
            err,
            HeapError::ResourceLeak { ptr: 200, len: 2, remaining: 2, .. }
        ));
        assert_eq!(guest.freed, vec![(100, 1)]);
        assert_eq!(heap.state(), HeapState::Draining);

        assert!(matches!(heap.write(&mut guest, b"x"), Err(HeapError::Poisoned)));
        assert!(matches!(heap.read_bytes(&guest, 100, 1), Err(HeapError::Poisoned)));
        assert!(matches!(heap.clear(&mut guest), Err(HeapError::Poisoned)));

        let leaked = heap.reset();
        assert_eq!(
            leaked,
            vec![Allocation { ptr: 200, len: 2 }, Allocation { ptr: 300, len: 3 }]
        );
        assert_eq!(heap.state(), HeapState::Idle);
        assert_eq!(guest.freed, vec![(100, 1)]);
    }
}
