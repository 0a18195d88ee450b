mod common;

use std::fs::File;
use std::sync::Arc;

use common::budget_alloc::BudgetAlloc;
use common::fixtures::{fb2_book, TempDir, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use folio_stream::{
    Dialect, EngineOptions, FixedAdvanceMeasurer, NeverCancel, ReaderEngine, SectionCache,
    SectionTarget,
};

// Building streams pages to disk, so peak heap is bounded by one block and
// one page regardless of section length. Current runs peak well under
// 128KiB; the guardrail leaves room for allocator noise.
const BUILD_BUDGET_BYTES: usize = 256 * 1024;

#[global_allocator]
static ALLOC: BudgetAlloc = BudgetAlloc::new();

#[test]
fn section_build_peak_heap_is_independent_of_section_length() {
    let dir = TempDir::new("budget");
    // One very long section: far larger than the budget once laid out.
    let book = fb2_book(1, 8000);
    assert!(book.len() > 4 * BUILD_BUDGET_BYTES);
    let path = dir.write("long.fb2", &book);
    drop(book);

    let options = EngineOptions::for_display(DISPLAY_WIDTH, DISPLAY_HEIGHT, Dialect::Fb2);
    let engine = ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(9, 18)))
        .with_cache(SectionCache::new(dir.path(), &path));
    let mut source = File::open(&path).unwrap();

    let (page_count, usage) = ALLOC.measure(|| {
        engine
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap()
            .page_count()
    });
    assert!(page_count > 200, "page_count = {}", page_count);
    assert!(
        usage.peak_bytes <= BUILD_BUDGET_BYTES,
        "build peak over budget: {} bytes ({:.1}KiB), budget: {}KiB",
        usage.peak_bytes,
        usage.peak_kib(),
        BUILD_BUDGET_BYTES / 1024
    );
    println!(
        "build pages={} peak_kib={:.1} allocs={}",
        page_count,
        usage.peak_kib(),
        usage.allocs
    );

    // A page read touches one record, not the section.
    let mut section = engine
        .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
        .unwrap();
    let (page, usage) = ALLOC.measure(|| section.read_page(page_count / 2).unwrap());
    assert!(!page.is_empty());
    assert!(
        usage.peak_bytes <= 64 * 1024,
        "page read peak {} bytes",
        usage.peak_bytes
    );
}
