use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global allocator that tracks live bytes, the high-water mark since the
/// last [`BudgetAlloc::reset`], and allocation count.
pub struct BudgetAlloc {
    current: AtomicUsize,
    baseline: AtomicUsize,
    peak: AtomicUsize,
    count: AtomicUsize,
}

/// Heap usage of one measured operation.
#[derive(Clone, Copy, Debug)]
pub struct HeapUsage {
    /// Peak bytes above what was live when measurement started.
    pub peak_bytes: usize,
    pub allocs: usize,
}

impl HeapUsage {
    pub fn peak_kib(&self) -> f64 {
        self.peak_bytes as f64 / 1024.0
    }
}

impl BudgetAlloc {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            baseline: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Start a measurement window at the currently live byte count.
    pub fn reset(&self) {
        let live = self.current.load(Ordering::SeqCst);
        self.baseline.store(live, Ordering::SeqCst);
        self.peak.store(live, Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
    }

    /// Peak bytes above the baseline recorded by the last reset.
    pub fn peak_bytes(&self) -> usize {
        self.peak
            .load(Ordering::SeqCst)
            .saturating_sub(self.baseline.load(Ordering::SeqCst))
    }

    pub fn alloc_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Run `op` inside a fresh measurement window.
    pub fn measure<T>(&self, op: impl FnOnce() -> T) -> (T, HeapUsage) {
        self.reset();
        let value = op();
        let usage = HeapUsage {
            peak_bytes: self.peak_bytes(),
            allocs: self.alloc_count(),
        };
        (value, usage)
    }

    fn grow(&self, bytes: usize) {
        let now = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn shrink(&self, bytes: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                Some(live.saturating_sub(bytes))
            });
    }
}

unsafe impl GlobalAlloc for BudgetAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            self.grow(layout.size());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        self.shrink(layout.size());
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.grow(layout.size());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                self.grow(new_size - layout.size());
            } else {
                self.shrink(layout.size() - new_size);
            }
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        new_ptr
    }
}
