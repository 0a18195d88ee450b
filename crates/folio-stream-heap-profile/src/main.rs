//! DHAT heap profiler for folio-stream.
//!
//! Profiles allocation patterns across the section pipeline:
//! stylesheet -> scan -> build -> read.
//!
//! Usage:
//!   cargo run -p folio-stream-heap-profile --release -- [OPTIONS] [DOCUMENTS...]
//!
//! Outputs dhat-<phase>.json in the output directory (default: target/memory).
//! Open in https://nnethercote.github.io/dh_view/dh_view.html

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use folio_stream::{
    Dialect, EngineOptions, FixedAdvanceMeasurer, NeverCancel, ReaderEngine, SectionCache,
};

const DISPLAY_WIDTH: u16 = 480;
const DISPLAY_HEIGHT: u16 = 800;

const SYNTHETIC_CSS: &str = "p { text-indent: 1em } h1 { text-align: center } \
.epigraph { text-align: right; font-style: italic } .note { font-size: small }";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stylesheet,
    Scan,
    Build,
    Read,
    Full,
}

impl Phase {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "stylesheet" | "css" => Some(Self::Stylesheet),
            "scan" => Some(Self::Scan),
            "build" => Some(Self::Build),
            "read" => Some(Self::Read),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Stylesheet => "stylesheet",
            Self::Scan => "scan",
            Self::Build => "build",
            Self::Read => "read",
            Self::Full => "full",
        }
    }
}

fn dialect_for(path: &Path) -> Dialect {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("xhtml") || ext.eq_ignore_ascii_case("html") => {
            Dialect::Xhtml
        }
        _ => Dialect::Fb2,
    }
}

fn engine_for(path: &Path, cache_root: &Path) -> ReaderEngine {
    let options = EngineOptions::for_display(DISPLAY_WIDTH, DISPLAY_HEIGHT, dialect_for(path));
    ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(9, 18)))
        .with_cache(SectionCache::new(cache_root, path))
}

/// Deterministic multi-section FB2 document for runs without input files.
fn write_synthetic(out_dir: &Path) -> PathBuf {
    let mut doc = String::from("<?xml version=\"1.0\"?><FictionBook><body>");
    for s in 0..8 {
        doc.push_str(&format!("<section><title><p>Part {}</p></title>", s + 1));
        for p in 0..400 {
            doc.push_str(&format!(
                "<p>Paragraph {} of part {} carries <emphasis>some</emphasis> ordinary prose \
that wraps across a few lines on a small screen.</p>",
                p,
                s + 1
            ));
        }
        doc.push_str("</section>");
    }
    doc.push_str("</body></FictionBook>");
    let path = out_dir.join("synthetic.fb2");
    std::fs::write(&path, doc).unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
    path
}

fn profile_file(path: &Path, phase: Phase, cache_root: &Path) {
    let path_str = path.to_string_lossy();
    let open = || File::open(path).unwrap_or_else(|e| panic!("open {}: {}", path_str, e));
    let mut engine = engine_for(path, cache_root);

    if matches!(phase, Phase::Stylesheet | Phase::Full) {
        for _ in 0..3 {
            engine
                .cache()
                .map(SectionCache::clear)
                .transpose()
                .unwrap_or_else(|e| panic!("clear cache: {}", e));
            engine
                .load_stylesheet(SYNTHETIC_CSS.as_bytes(), SYNTHETIC_CSS.len())
                .unwrap_or_else(|e| panic!("stylesheet: {}", e));
        }
        if phase == Phase::Stylesheet {
            return;
        }
    }

    let sections = engine
        .scan(open())
        .unwrap_or_else(|e| panic!("scan {}: {}", path_str, e));
    if phase == Phase::Scan {
        return;
    }

    let mut document = open();
    if matches!(phase, Phase::Read) {
        // Warm the cache so the loop below only opens stores and reads pages.
        for (index, entry) in sections.iter().enumerate() {
            let _ = engine.open_section(&mut document, index, entry.target(), &NeverCancel);
        }
    }

    let mut pages = 0usize;
    for (index, entry) in sections.iter().enumerate() {
        let mut section = engine
            .open_section(&mut document, index, entry.target(), &NeverCancel)
            .unwrap_or_else(|e| panic!("section {} of {}: {}", index, path_str, e));
        if matches!(phase, Phase::Read | Phase::Full) {
            for page in 0..section.page_count() {
                let _ = section.read_page(page);
                pages = pages.saturating_add(1);
            }
        } else {
            pages = pages.saturating_add(section.page_count());
        }
    }
    if pages == 0 {
        panic!("{} produced zero pages", path_str);
    }
}

fn short_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

fn usage() {
    eprintln!("Usage: heap-profile [OPTIONS] [DOCUMENTS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --phase <stylesheet|scan|build|read|full>  Pipeline phase to profile (default: build)");
    eprintln!("  --out-dir <DIR>                            Output directory for dhat JSON (default: target/memory)");
    eprintln!();
    eprintln!("If no documents are given, profiles a generated FB2 book.");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut phase = Phase::Build;
    let mut out_dir = PathBuf::from("target/memory");
    let mut files: Vec<PathBuf> = Vec::with_capacity(8);
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--phase" => {
                i += 1;
                phase = args
                    .get(i)
                    .and_then(|value| Phase::from_str(value))
                    .unwrap_or_else(|| {
                        usage();
                        std::process::exit(1);
                    });
            }
            "--out-dir" => {
                i += 1;
                out_dir = args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    usage();
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => files.push(PathBuf::from(other)),
        }
        i += 1;
    }

    std::fs::create_dir_all(&out_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create output dir {}: {}", out_dir.display(), e);
        std::process::exit(1);
    });
    if files.is_empty() {
        files.push(write_synthetic(&out_dir));
    }

    let phase_name = phase.name();
    eprintln!(
        "heap-profile: phase={}, files={}, out={}",
        phase_name,
        files.len(),
        out_dir.display()
    );

    let json_path = out_dir.join(format!("dhat-{phase_name}.json"));
    let cache_roots: Vec<PathBuf> = files
        .iter()
        .map(|file| out_dir.join(format!("cache-{}", short_name(file))))
        .collect();
    for root in &cache_roots {
        let _ = std::fs::remove_dir_all(root);
    }

    let profiler = dhat::Profiler::builder()
        .file_name(json_path.clone())
        .build();
    for (file, cache_root) in files.iter().zip(&cache_roots) {
        eprintln!("  profiling: {}", file.display());
        profile_file(file, phase, cache_root);
    }
    // Writes the JSON.
    drop(profiler);

    for root in &cache_roots {
        let _ = std::fs::remove_dir_all(root);
    }
    eprintln!("Done: {}", json_path.display());
    eprintln!();
    eprintln!("Open in https://nnethercote.github.io/dh_view/dh_view.html");
}
