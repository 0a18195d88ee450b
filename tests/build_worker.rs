mod common;

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use common::fixtures::{fb2_book, TempDir, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use folio_stream::{
    BuildWorker, Dialect, EngineOptions, FixedAdvanceMeasurer, ReaderEngine, SectionCache,
    SectionSlot, SectionTarget,
};

/// Document source whose reads block until the gate opens.
struct GatedReader {
    inner: Cursor<Vec<u8>>,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedReader {
    fn new(bytes: Vec<u8>) -> (Self, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let reader = Self {
            inner: Cursor::new(bytes),
            gate: Arc::clone(&gate),
        };
        (reader, gate)
    }
}

fn open_gate(gate: &(Mutex<bool>, Condvar)) {
    let (lock, cvar) = gate;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        drop(open);
        self.inner.read(buf)
    }
}

impl Seek for GatedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn engine(dir: &TempDir) -> ReaderEngine {
    let options = EngineOptions::for_display(DISPLAY_WIDTH, DISPLAY_HEIGHT, Dialect::Fb2);
    ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(9, 18)))
        .with_cache(SectionCache::new(dir.path(), "/library/worker.fb2"))
}

#[test]
fn worker_publishes_ready_section() {
    let dir = TempDir::new("worker-ready");
    let engine = engine(&dir);
    let (reader, gate) = GatedReader::new(fb2_book(2, 30).into_bytes());
    let worker = BuildWorker::spawn(engine.clone(), reader, 1, SectionTarget::Index(1));

    // Nothing can finish while the source is gated.
    assert!(worker.with_slot(|slot| slot.is_building()));
    open_gate(&gate);

    let mut section = match worker.join() {
        SectionSlot::Ready(section) => section,
        other => panic!("expected a ready section, got {:?}", other),
    };
    assert!(section.is_cached());
    assert!(section.page_count() > 1);
    let first = section.read_page(0).unwrap();
    assert_eq!(first.lines[0].line.plain_text(), "Chapter 2");
    assert!(engine.cache().unwrap().section_path(1).exists());
}

#[test]
fn cancelled_worker_reports_cancelled_and_leaves_no_store() {
    let dir = TempDir::new("worker-cancel");
    let engine = engine(&dir);
    let (reader, gate) = GatedReader::new(fb2_book(1, 400).into_bytes());
    let worker = BuildWorker::spawn(engine.clone(), reader, 0, SectionTarget::Index(0));

    worker.cancel();
    open_gate(&gate);

    assert!(matches!(worker.join(), SectionSlot::Cancelled));
    let path = engine.cache().unwrap().section_path(0);
    assert!(!path.exists());
    let sections_dir = path.parent().unwrap();
    let leftovers = std::fs::read_dir(sections_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "temporary store left behind");
}

#[test]
fn slot_is_shared_with_readers() {
    let dir = TempDir::new("worker-shared");
    let (reader, gate) = GatedReader::new(fb2_book(1, 10).into_bytes());
    let worker = BuildWorker::spawn(engine(&dir), reader, 0, SectionTarget::Index(0));
    let shared = worker.slot();
    open_gate(&gate);
    while !worker.is_finished() {
        std::thread::yield_now();
    }
    assert!(matches!(*shared.lock().unwrap(), SectionSlot::Ready(_)));

    // Taking the result leaves the slot empty for the next build.
    let taken = std::mem::take(&mut *shared.lock().unwrap());
    assert!(matches!(taken, SectionSlot::Ready(_)));
    assert!(matches!(worker.join(), SectionSlot::Empty));
}

#[test]
fn dropping_a_worker_cancels_it() {
    let dir = TempDir::new("worker-drop");
    let engine = engine(&dir);
    let (reader, gate) = GatedReader::new(fb2_book(1, 400).into_bytes());
    let worker = BuildWorker::spawn(engine.clone(), reader, 0, SectionTarget::Index(0));
    let shared = worker.slot();

    // Open the gate from another thread once drop has requested cancellation.
    let dropping = Arc::new(AtomicBool::new(false));
    let started = Arc::clone(&dropping);
    let opener = std::thread::spawn(move || {
        while !started.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        open_gate(&gate);
    });
    dropping.store(true, Ordering::Release);
    drop(worker);
    opener.join().unwrap();

    assert!(matches!(*shared.lock().unwrap(), SectionSlot::Cancelled));
    assert!(!engine.cache().unwrap().section_path(0).exists());
}
