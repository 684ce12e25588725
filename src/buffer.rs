use std::fmt;
use std::sync::{Arc, Mutex};

/// Source of the byte regions backing [`Buffer`] objects.
///
/// `alloc` must return zeroed memory. `free` is called exactly once per allocation, when the last
/// [`Buffer`] referring to it is dropped.
pub trait Allocator: Send + Sync {
    fn alloc(&self, size: usize) -> Box<[u8]>;

    fn free(&self, bytes: Box<[u8]>) {
        drop(bytes);
    }
}

/// Allocates from the process heap.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Box<[u8]> {
        vec![0; size].into_boxed_slice()
    }
}

/// Recycles allocations of a single size. Requests for other sizes fall through to the heap.
pub struct PoolAllocator {
    size: usize,
    capacity: usize,
    free_list: Mutex<Vec<Box<[u8]>>>,
}

impl PoolAllocator {
    /// Creates a pool of `size`-byte regions retaining at most `capacity` freed regions.
    pub fn new(size: usize, capacity: usize) -> Self {
        Self {
            size,
            capacity,
            free_list: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Returns the number of regions currently available for reuse.
    pub fn available(&self) -> usize {
        self.free_list.lock().map(|list| list.len()).unwrap_or(0)
    }
}

impl Allocator for PoolAllocator {
    fn alloc(&self, size: usize) -> Box<[u8]> {
        if size == self.size {
            if let Ok(mut list) = self.free_list.lock() {
                if let Some(mut bytes) = list.pop() {
                    // Recycled regions still hold their previous contents
                    bytes.fill(0);
                    return bytes;
                }
            }
        }

        vec![0; size].into_boxed_slice()
    }

    fn free(&self, bytes: Box<[u8]>) {
        if bytes.len() == self.size {
            if let Ok(mut list) = self.free_list.lock() {
                if list.len() < self.capacity {
                    list.push(bytes);
                }
            }
        }
    }
}

impl fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

struct Storage {
    // Always Some until dropped
    bytes: Option<Box<[u8]>>,
    // Receives the allocation once the last reference goes away
    allocator: Arc<dyn Allocator>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.allocator.free(bytes);
        }
    }
}

/// A shared, reference-counted byte region.
///
/// Each handle carries its own logical length (`cap`), which may be shrunk but never grown past
/// the allocation size. Clones share the underlying allocation; the region is returned to its
/// allocator when the last handle is dropped.
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    cap: usize,
}

impl Buffer {
    /// Allocates a zeroed buffer of `size` bytes with `cap == size`.
    pub fn alloc(allocator: &Arc<dyn Allocator>, size: usize) -> Self {
        let bytes = allocator.alloc(size);

        debug_assert_eq!(bytes.len(), size);

        let cap = bytes.len();

        Self {
            storage: Arc::new(Storage {
                bytes: Some(bytes),
                allocator: Arc::clone(allocator),
            }),
            cap,
        }
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(allocator: &Arc<dyn Allocator>, data: &[u8]) -> Self {
        let mut buffer = Self::alloc(allocator, data.len());

        if let Some(bytes) = buffer.bytes_mut() {
            bytes.copy_from_slice(data);
        }

        buffer
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> usize {
        self.storage.bytes.as_ref().map_or(0, |bytes| bytes.len())
    }

    /// Logical length in bytes.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Sets the logical length of this handle.
    ///
    /// Panics if `cap` exceeds the allocation size.
    pub fn set_cap(&mut self, cap: usize) {
        assert!(
            cap <= self.size(),
            "buffer cap {} exceeds allocation of {}",
            cap,
            self.size()
        );

        self.cap = cap;
    }

    /// Returns the first `cap` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage.bytes {
            Some(bytes) => &bytes[..self.cap],
            None => &[],
        }
    }

    /// Returns the first `cap` bytes mutably, or `None` if the allocation is shared.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        let cap = self.cap;

        Arc::get_mut(&mut self.storage)
            .and_then(|storage| storage.bytes.as_mut())
            .map(|bytes| &mut bytes[..cap])
    }

    /// Number of live handles sharing this allocation.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("cap", &self.cap)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Buffer) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Buffer {}
