use std::cell::RefCell;
use std::ffi::c_void;
use std::io::{Error, ErrorKind};
use std::mem::ManuallyDrop;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::trace;
use once_cell::sync::Lazy;

use crate::config::{GLOBAL_POOL_CAPACITY, MIN_STACK_SIZE, TLS_POOL_CAPACITY};
use crate::metrics::{metrics, StackEvent};

// start from 1 so that 0 never names a live stack in logs
static STACK_ID: AtomicU64 = AtomicU64::new(1);

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize);

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// An mmap'ed coroutine stack. The lowest page is a `PROT_NONE` guard, the
/// usable area grows down from [`StackRegion::top`] to [`StackRegion::bottom`].
#[derive(Debug)]
pub struct StackRegion {
    // start of the mapping, guard page included; null once released
    mem: *mut c_void,
    len: usize,
    guard: usize,
    id: u64,
}

unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Maps a stack of at least `size` usable bytes, clamped to
    /// [`MIN_STACK_SIZE`] and rounded up to whole pages.
    #[cold]
    pub fn acquire(size: usize) -> Result<Self, Error> {
        let guard = page_size();
        let len = rounded_len(size)?;
        let total = len.checked_add(guard).ok_or_else(overflow)?;

        let mem = unsafe {
            libc::mmap(
                null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        if unsafe { libc::mprotect(mem, guard, libc::PROT_NONE) } < 0 {
            let err = Error::last_os_error();
            unsafe { libc::munmap(mem, total) };
            return Err(err);
        }

        assert!(mem as usize % guard == 0);
        let id = STACK_ID.fetch_add(1, Ordering::Relaxed);
        metrics().stack(StackEvent::Mapped);
        trace!("mapped stack {id} with {len} usable bytes");

        Ok(Self {
            mem,
            len,
            guard,
            id,
        })
    }

    /// Lowest usable address, just above the guard page.
    #[inline]
    pub fn bottom(&self) -> *mut c_void {
        assert!(!self.is_released());
        unsafe { self.mem.byte_add(self.guard) }
    }

    /// One past the highest usable address, where a downward stack starts.
    #[inline]
    pub fn top(&self) -> *mut c_void {
        assert!(!self.is_released());
        unsafe { self.mem.byte_add(self.guard + self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.mem.is_null()
    }

    /// Unmaps the region. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.is_released() {
            return;
        }
        let res = unsafe { libc::munmap(self.mem, self.len + self.guard) };
        assert_eq!(res, 0, "munmap of stack {} failed", self.id);
        self.mem = null_mut();
        metrics().stack(StackEvent::Unmapped);
        trace!("unmapped stack {}", self.id);
    }

    /// Gives up the region without unmapping it, for stacks that still hold
    /// frames which were never unwound.
    pub fn leak(self) {
        metrics().stack(StackEvent::Leaked);
        let _ = ManuallyDrop::new(self);
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        self.release();
    }
}

fn overflow() -> Error {
    Error::new(ErrorKind::OutOfMemory, "stack size overflows the address space")
}

fn rounded_len(size: usize) -> Result<usize, Error> {
    let page = page_size();
    size.max(MIN_STACK_SIZE)
        .checked_add(page - 1)
        .map(|len| len & !(page - 1))
        .ok_or_else(overflow)
}

struct StackPool {
    capacity: usize,
    stacks: Vec<StackRegion>,
}

impl StackPool {
    const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stacks: Vec::new(),
        }
    }

    fn fetch_stack(&mut self, len: usize) -> Option<StackRegion> {
        let idx = self.stacks.iter().rposition(|stack| stack.len == len)?;
        Some(self.stacks.swap_remove(idx))
    }

    fn return_stack(&mut self, stack: StackRegion) -> Result<(), StackRegion> {
        if self.stacks.len() >= self.capacity {
            Err(stack)
        } else {
            self.stacks.push(stack);
            Ok(())
        }
    }
}

impl Drop for StackPool {
    // a thread going away hands its cached stacks to whoever runs next
    fn drop(&mut self) {
        for stack in self.stacks.drain(..) {
            return_stack_to_global(stack);
        }
    }
}

// keyed by usable length
static GLOBAL_STACK_POOL: Lazy<DashMap<usize, Vec<StackRegion>>> = Lazy::new(DashMap::new);

thread_local! {
    static TLS_STACK_POOL: RefCell<StackPool> = const { RefCell::new(StackPool::new(TLS_POOL_CAPACITY)) };
}

/// Takes a cached stack of the same rounded size, or maps a new one.
pub fn fetch_or_acquire(size: usize) -> Result<StackRegion, Error> {
    let len = rounded_len(size)?;
    let cached = TLS_STACK_POOL
        .try_with(|pool| pool.borrow_mut().fetch_stack(len))
        .ok()
        .flatten()
        .or_else(|| {
            GLOBAL_STACK_POOL
                .get_mut(&len)
                .and_then(|mut stacks| stacks.pop())
        });

    match cached {
        Some(stack) => {
            metrics().stack(StackEvent::Reused);
            trace!("reusing stack {}", stack.id);
            Ok(stack)
        }
        None => StackRegion::acquire(len),
    }
}

/// Hands a stack whose frames are all gone back to the pools, unmapping it
/// if both are full.
pub fn recycle(stack: StackRegion) {
    if stack.is_released() {
        return;
    }
    metrics().stack(StackEvent::Recycled);
    let res = TLS_STACK_POOL.try_with(|pool| pool.borrow_mut().return_stack(stack));
    match res {
        Ok(Ok(())) => (),
        Ok(Err(stack)) => return_stack_to_global(stack),
        // tls already destroyed, the region went down with the closure
        Err(_) => (),
    }
}

fn return_stack_to_global(stack: StackRegion) {
    let mut stacks = GLOBAL_STACK_POOL.entry(stack.len).or_default();
    if stacks.len() < GLOBAL_POOL_CAPACITY {
        stacks.push(stack);
    }
    // otherwise dropped here, which unmaps it
}

#[cfg(test)]
pub(crate) fn pooled_in_thread(len: usize) -> usize {
    TLS_STACK_POOL.with_borrow(|pool| pool.stacks.iter().filter(|s| s.len == len).count())
}
