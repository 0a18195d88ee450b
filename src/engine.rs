//! Orchestration: cache selection, section builds and background workers.
//!
//! [`ReaderEngine`] owns the stylesheet, the caller's measurement
//! capabilities and the on-disk cache layout. Opening a section reuses a
//! valid store, rebuilds a stale or missing one, and falls back to laying
//! out into memory when the store cannot be written.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::{ParseLimits, RenderParams};
use crate::css::{Stylesheet, StylesheetLimits};
use crate::error::{ErrorPhase, FolioError};
use crate::layout::{PageBuilder, PageSink, VecSink};
use crate::markup::feed_target;
use crate::page::Page;
use crate::section::{SectionFile, SectionWriter};
use crate::section_index::{scan_sections, SectionEntry};
use crate::text_block::{Hyphenator, TextMeasurer};
use crate::tokenizer::{Dialect, SectionParser, SectionTarget};

/// Cooperative cancellation, polled per read chunk and per page.
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

/// Never-cancel token for default call paths.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancel;

impl CancelToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl CancelToken for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: CancelToken + ?Sized> CancelToken for Arc<T> {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// Runtime diagnostics from the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineDiagnostic {
    CacheHit { section: usize, page_count: usize },
    CacheMiss { section: usize },
    /// A store failed validation and was deleted.
    CacheDiscarded { section: usize, code: &'static str },
    SectionBuilt { section: usize, page_count: usize },
    /// The store could not be written; pages were laid out in memory.
    StorageFallback { section: usize, code: &'static str },
    StylesheetFromCache { rules: usize },
    StylesheetParsed { rules: usize, evicted: usize },
}

type DiagnosticCallback = Arc<Mutex<Box<dyn FnMut(EngineDiagnostic) + Send + 'static>>>;

/// Deterministic cache layout for one document:
/// `<root>/<crc32 of document path>/sections/<index>.bin` and `.../css.bin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionCache {
    dir: PathBuf,
}

impl SectionCache {
    pub fn new(root: impl AsRef<Path>, document_path: impl AsRef<Path>) -> Self {
        let key = document_path.as_ref().to_string_lossy();
        Self {
            dir: root.as_ref().join(document_key(key.as_bytes())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn section_path(&self, index: usize) -> PathBuf {
        self.dir.join("sections").join(format!("{}.bin", index))
    }

    pub fn stylesheet_path(&self) -> PathBuf {
        self.dir.join("css.bin")
    }

    /// Remove every store for this document.
    pub fn clear(&self) -> Result<(), FolioError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FolioError::from(err).in_phase(ErrorPhase::Orchestrate)),
        }
    }
}

fn document_key(bytes: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(bytes))
}

/// Pages of one section, backed by a store or held in memory.
#[derive(Debug)]
pub enum OpenSection {
    Cached(SectionFile),
    InMemory(Vec<Page>),
}

impl OpenSection {
    pub fn page_count(&self) -> usize {
        match self {
            Self::Cached(file) => file.page_count(),
            Self::InMemory(pages) => pages.len(),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn read_page(&mut self, index: usize) -> Result<Page, FolioError> {
        match self {
            Self::Cached(file) => file.read_page(index),
            Self::InMemory(pages) => pages.get(index).cloned().ok_or(FolioError::PageOutOfRange {
                index,
                count: pages.len(),
            }),
        }
    }
}

/// Engine configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineOptions {
    pub params: RenderParams,
    pub parse: ParseLimits,
    pub stylesheet: StylesheetLimits,
    pub dialect: Dialect,
}

impl EngineOptions {
    pub fn for_display(width: u16, height: u16, dialect: Dialect) -> Self {
        Self {
            params: RenderParams::for_display(width, height),
            dialect,
            ..Self::default()
        }
    }

    pub fn with_params(mut self, params: RenderParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_parse_limits(mut self, parse: ParseLimits) -> Self {
        self.parse = parse;
        self
    }

    pub fn with_stylesheet_limits(mut self, stylesheet: StylesheetLimits) -> Self {
        self.stylesheet = stylesheet;
        self
    }
}

/// Section orchestrator. Cheap to clone; clones share the stylesheet and
/// capabilities.
#[derive(Clone)]
pub struct ReaderEngine {
    options: EngineOptions,
    measurer: Arc<dyn TextMeasurer>,
    hyphenator: Option<Arc<dyn Hyphenator>>,
    stylesheet: Arc<Stylesheet>,
    cache: Option<SectionCache>,
    diagnostic_sink: Option<DiagnosticCallback>,
}

impl fmt::Debug for ReaderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderEngine")
            .field("options", &self.options)
            .field("rules", &self.stylesheet.len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ReaderEngine {
    pub fn new(options: EngineOptions, measurer: Arc<dyn TextMeasurer>) -> Self {
        Self {
            options,
            measurer,
            hyphenator: None,
            stylesheet: Arc::new(Stylesheet::with_limits(options.stylesheet)),
            cache: None,
            diagnostic_sink: None,
        }
    }

    pub fn with_hyphenator(mut self, hyphenator: Arc<dyn Hyphenator>) -> Self {
        self.hyphenator = Some(hyphenator);
        self
    }

    /// Persist sections under `cache`. Without one every open lays out in memory.
    pub fn with_cache(mut self, cache: SectionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_stylesheet(mut self, stylesheet: Stylesheet) -> Self {
        self.stylesheet = Arc::new(stylesheet);
        self
    }

    /// Register or replace the diagnostics sink.
    pub fn set_diagnostic_sink<F>(&mut self, sink: F)
    where
        F: FnMut(EngineDiagnostic) + Send + 'static,
    {
        self.diagnostic_sink = Some(Arc::new(Mutex::new(Box::new(sink))));
    }

    fn emit(&self, diagnostic: EngineDiagnostic) {
        let Some(sink) = &self.diagnostic_sink else {
            return;
        };
        if let Ok(mut sink) = sink.lock() {
            sink(diagnostic);
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn params(&self) -> &RenderParams {
        &self.options.params
    }

    pub fn stylesheet(&self) -> &Stylesheet {
        &self.stylesheet
    }

    pub fn cache(&self) -> Option<&SectionCache> {
        self.cache.as_ref()
    }

    /// Load the stylesheet, preferring a valid cached rule table.
    ///
    /// A freshly parsed table is written back to the cache; failing to do so
    /// is logged, not returned. Returns the number of rules held.
    pub fn load_stylesheet<R: Read>(
        &mut self,
        source: R,
        declared_size: usize,
    ) -> Result<usize, FolioError> {
        if let Some(path) = self.cache.as_ref().map(SectionCache::stylesheet_path) {
            if let Ok(file) = File::open(&path) {
                let mut sheet = Stylesheet::with_limits(self.options.stylesheet);
                match sheet.load_from_cache(&mut BufReader::new(file)) {
                    Ok(()) => {
                        let rules = sheet.len();
                        log::debug!("stylesheet cache hit: {} rules", rules);
                        self.stylesheet = Arc::new(sheet);
                        self.emit(EngineDiagnostic::StylesheetFromCache { rules });
                        return Ok(rules);
                    }
                    Err(err) => {
                        log::info!("discarding stylesheet cache: {}", err.code());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }

        let mut sheet = Stylesheet::with_limits(self.options.stylesheet);
        sheet.load_streaming(source, declared_size)?;
        if let Some(path) = self.cache.as_ref().map(SectionCache::stylesheet_path) {
            if let Err(err) = save_stylesheet(&sheet, &path) {
                log::warn!("stylesheet cache not written: {}", err);
            }
        }
        let rules = sheet.len();
        let evicted = sheet.stats().rules_evicted;
        self.stylesheet = Arc::new(sheet);
        self.emit(EngineDiagnostic::StylesheetParsed { rules, evicted });
        Ok(rules)
    }

    /// Top-level sections of `document`, each with a byte window to build from.
    pub fn scan<R: Read>(&self, document: R) -> Result<Vec<SectionEntry>, FolioError> {
        scan_sections(BufReader::with_capacity(
            self.options.parse.read_chunk.max(64),
            document,
        ))
    }

    /// Tokenize and lay out `target`, handing each page to `sink`.
    /// Returns the page count.
    pub fn build_pages<R: Read + Seek>(
        &self,
        document: &mut R,
        target: SectionTarget,
        cancel: &dyn CancelToken,
        sink: &mut dyn PageSink,
    ) -> Result<usize, FolioError> {
        let builder = PageBuilder::new(
            self.measurer.as_ref(),
            self.hyphenator.as_deref(),
            self.options.params,
            self.options.parse,
            cancel,
            sink,
        );
        let mut parser = SectionParser::new(self.options.dialect, target, builder)
            .with_stylesheet(&self.stylesheet);
        feed_target(&mut *document, target, self.options.parse, &mut parser, cancel)?;
        parser.finish()
    }

    /// Lay out `target` entirely into memory.
    pub fn build_in_memory<R: Read + Seek>(
        &self,
        document: &mut R,
        target: SectionTarget,
        cancel: &dyn CancelToken,
    ) -> Result<Vec<Page>, FolioError> {
        let mut sink = VecSink::default();
        self.build_pages(document, target, cancel, &mut sink)?;
        Ok(sink.pages)
    }

    /// Build the store for section `index` and open it.
    pub fn build_section<R: Read + Seek>(
        &self,
        document: &mut R,
        index: usize,
        target: SectionTarget,
        cancel: &dyn CancelToken,
    ) -> Result<SectionFile, FolioError> {
        let cache = self.cache.as_ref().ok_or_else(|| FolioError::Storage {
            phase: ErrorPhase::Orchestrate,
            kind: std::io::ErrorKind::NotFound,
            message: "no cache directory configured".into(),
        })?;
        let path = cache.section_path(index);
        let mut writer = SectionWriter::create(&path, self.options.params)?;
        {
            let mut sink = |page: Page| writer.write_page(&page);
            self.build_pages(document, target, cancel, &mut sink)?;
        }
        let page_count = writer.finalize()?;
        log::debug!("built section {} ({} pages)", index, page_count);
        self.emit(EngineDiagnostic::SectionBuilt {
            section: index,
            page_count: usize::from(page_count),
        });
        SectionFile::open(&path, &self.options.params)
    }

    /// Open section `index`: reuse a valid store, rebuild a stale or missing
    /// one, and lay out in memory when the store cannot be written.
    pub fn open_section<R: Read + Seek>(
        &self,
        document: &mut R,
        index: usize,
        target: SectionTarget,
        cancel: &dyn CancelToken,
    ) -> Result<OpenSection, FolioError> {
        let Some(cache) = &self.cache else {
            return self
                .build_in_memory(document, target, cancel)
                .map(OpenSection::InMemory);
        };
        let path = cache.section_path(index);
        match SectionFile::open(&path, &self.options.params) {
            Ok(file) => {
                log::debug!("section {} cache hit ({} pages)", index, file.page_count());
                self.emit(EngineDiagnostic::CacheHit {
                    section: index,
                    page_count: file.page_count(),
                });
                return Ok(OpenSection::Cached(file));
            }
            Err(err) if err.is_not_found() => {
                self.emit(EngineDiagnostic::CacheMiss { section: index });
            }
            Err(err) if err.is_cache_invalid() => {
                log::info!("section {} store discarded: {}", index, err);
                let _ = fs::remove_file(&path);
                self.emit(EngineDiagnostic::CacheDiscarded {
                    section: index,
                    code: err.code(),
                });
            }
            Err(err) => {
                log::warn!("section {} store unreadable: {}", index, err);
            }
        }

        match self.build_section(document, index, target, cancel) {
            Ok(file) => Ok(OpenSection::Cached(file)),
            Err(err @ FolioError::Storage { .. }) if err.phase() != ErrorPhase::Tokenize => {
                log::warn!(
                    "section {} store not writable ({}); laying out in memory",
                    index,
                    err
                );
                self.emit(EngineDiagnostic::StorageFallback {
                    section: index,
                    code: err.code(),
                });
                self.build_in_memory(document, target, cancel)
                    .map(OpenSection::InMemory)
            }
            Err(FolioError::Cancelled) => {
                log::info!("section {} build cancelled", index);
                Err(FolioError::Cancelled)
            }
            Err(err) => Err(err),
        }
    }
}

fn save_stylesheet(sheet: &Stylesheet, path: &Path) -> Result<(), FolioError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let result = File::create(&tmp)
        .map_err(FolioError::from)
        .and_then(|file| {
            let mut out = BufWriter::new(file);
            sheet.save_to_cache(&mut out)?;
            out.flush()?;
            Ok(())
        })
        .and_then(|()| fs::rename(&tmp, path).map_err(FolioError::from));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(|err| err.in_phase(ErrorPhase::Stylesheet))
}

/// State of a section being built in the background.
#[derive(Debug, Default)]
pub enum SectionSlot {
    #[default]
    Empty,
    Building,
    Ready(OpenSection),
    Failed(FolioError),
    Cancelled,
}

impl SectionSlot {
    pub fn is_building(&self) -> bool {
        matches!(self, Self::Building)
    }
}

/// Runs [`ReaderEngine::open_section`] on a dedicated thread.
///
/// The result is installed into a shared slot; readers lock it only to
/// inspect or take the current state. Dropping the worker cancels and
/// joins it.
pub struct BuildWorker {
    slot: Arc<Mutex<SectionSlot>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BuildWorker {
    pub fn spawn<R>(engine: ReaderEngine, mut document: R, index: usize, target: SectionTarget) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(SectionSlot::Building));
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_slot = Arc::clone(&slot);
        let worker_cancel = Arc::clone(&cancel);
        let handle = std::thread::spawn(move || {
            let result = engine.open_section(&mut document, index, target, &worker_cancel);
            let next = match result {
                Ok(section) => SectionSlot::Ready(section),
                Err(FolioError::Cancelled) => SectionSlot::Cancelled,
                Err(err) => SectionSlot::Failed(err),
            };
            let mut guard = match worker_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = next;
        });
        Self {
            slot,
            cancel,
            handle: Some(handle),
        }
    }

    /// Shared slot the build result lands in.
    pub fn slot(&self) -> Arc<Mutex<SectionSlot>> {
        Arc::clone(&self.slot)
    }

    /// Run `f` with the slot locked.
    pub fn with_slot<T>(&self, f: impl FnOnce(&mut SectionSlot) -> T) -> T {
        let mut guard = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the build to stop at its next chunk or page boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the build and take its final state.
    pub fn join(mut self) -> SectionSlot {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("section build thread panicked");
            }
        }
        self.with_slot(std::mem::take)
    }
}

impl Drop for BuildWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_block::FixedAdvanceMeasurer;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    static NONCE: AtomicUsize = AtomicUsize::new(0);

    fn temp_root(label: &str) -> PathBuf {
        let n = NONCE.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("folio-engine-{}-{}-{}", label, std::process::id(), n))
    }

    fn doc(paragraphs: usize) -> Vec<u8> {
        let mut out = String::from("<FictionBook><body><section>");
        for i in 0..paragraphs {
            out.push_str(&format!("<p>Paragraph {} has a handful of words in it.</p>", i));
        }
        out.push_str("</section></body></FictionBook>");
        out.into_bytes()
    }

    fn engine(root: &Path) -> ReaderEngine {
        let options = EngineOptions::for_display(200, 120, Dialect::Fb2);
        ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(10, 20)))
            .with_cache(SectionCache::new(root, "/books/sample.fb2"))
    }

    #[test]
    fn cache_dir_is_keyed_by_document_path_crc() {
        let cache = SectionCache::new("/cache", "/books/a.fb2");
        let expected = format!("{:08x}", crc32fast::hash(b"/books/a.fb2"));
        assert_eq!(cache.dir(), Path::new("/cache").join(&expected));
        assert_eq!(
            cache.section_path(3),
            Path::new("/cache").join(&expected).join("sections").join("3.bin")
        );
        assert_eq!(cache.stylesheet_path(), Path::new("/cache").join(expected).join("css.bin"));
    }

    #[test]
    fn second_open_is_a_cache_hit() {
        let root = temp_root("hit");
        let mut engine = engine(&root);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_diagnostic_sink(move |d| sink.lock().unwrap().push(d));
        let mut source = Cursor::new(doc(12));

        let first = engine
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap();
        assert!(first.is_cached());
        let count = first.page_count();
        assert!(count > 1);
        drop(first);

        let mut second = engine
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap();
        assert_eq!(second.page_count(), count);
        assert!(!second.read_page(0).unwrap().is_empty());

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], EngineDiagnostic::CacheMiss { section: 0 }));
        assert!(matches!(seen.last(), Some(EngineDiagnostic::CacheHit { .. })));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn changed_params_rebuild_the_store() {
        let root = temp_root("rebuild");
        let mut source = Cursor::new(doc(12));
        let narrow = engine(&root);
        let narrow_count = narrow
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap()
            .page_count();

        let wide_options = EngineOptions::for_display(400, 120, Dialect::Fb2);
        let mut wide = ReaderEngine::new(wide_options, Arc::new(FixedAdvanceMeasurer::new(10, 20)))
            .with_cache(SectionCache::new(&root, "/books/sample.fb2"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        wide.set_diagnostic_sink(move |d| sink.lock().unwrap().push(d));
        let reopened = wide
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap();
        assert!(reopened.page_count() < narrow_count);
        assert!(matches!(
            seen.lock().unwrap()[0],
            EngineDiagnostic::CacheDiscarded {
                section: 0,
                code: "CACHE_PARAMETER_MISMATCH"
            }
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unwritable_cache_falls_back_to_memory() {
        let root = temp_root("fallback");
        fs::create_dir_all(&root).unwrap();
        // A regular file where the cache directory should be.
        let blocker = root.join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let options = EngineOptions::for_display(200, 120, Dialect::Fb2);
        let engine = ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(10, 20)))
            .with_cache(SectionCache::new(&blocker, "/books/sample.fb2"));
        let mut source = Cursor::new(doc(3));
        let mut section = engine
            .open_section(&mut source, 0, SectionTarget::Index(0), &NeverCancel)
            .unwrap();
        assert!(!section.is_cached());
        assert!(section.page_count() >= 1);
        assert!(section.read_page(0).is_ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancelled_build_leaves_no_store() {
        let root = temp_root("cancel");
        let engine = engine(&root);
        let cancel = AtomicBool::new(true);
        let mut source = Cursor::new(doc(12));
        let err = engine
            .open_section(&mut source, 0, SectionTarget::Index(0), &cancel)
            .unwrap_err();
        assert!(matches!(err, FolioError::Cancelled));
        let path = engine.cache().unwrap().section_path(0);
        assert!(!path.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stylesheet_round_trips_through_cache() {
        let root = temp_root("css");
        let css = "p { text-align: center } .note { font-style: italic }";
        let mut first = engine(&root);
        assert_eq!(first.load_stylesheet(css.as_bytes(), css.len()).unwrap(), 2);

        let mut second = engine(&root);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        second.set_diagnostic_sink(move |d| sink.lock().unwrap().push(d));
        // Source is ignored when the cached table is valid.
        assert_eq!(second.load_stylesheet(&b""[..], 0).unwrap(), 2);
        assert_eq!(
            seen.lock().unwrap()[0],
            EngineDiagnostic::StylesheetFromCache { rules: 2 }
        );
        assert!(second.stylesheet().get("p").is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn worker_installs_result_into_slot() {
        let root = temp_root("worker");
        let worker = BuildWorker::spawn(
            engine(&root),
            Cursor::new(doc(8)),
            0,
            SectionTarget::Index(0),
        );
        match worker.join() {
            SectionSlot::Ready(section) => assert!(section.page_count() >= 1),
            other => panic!("unexpected slot state {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn in_memory_section_reports_out_of_range() {
        let mut section = OpenSection::InMemory(vec![Page::new()]);
        assert!(section.read_page(0).is_ok());
        assert_eq!(section.read_page(1).unwrap_err().code(), "PAGE_OUT_OF_RANGE");
    }
}
