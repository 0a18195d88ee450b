//! Inspect how a document paginates.
//!
//! Usage:
//!   folio-stream [OPTIONS] <DOCUMENT>
//!
//! Lists top-level sections, then builds one section and prints a page as
//! plain text. Uses a monospace measurer, so line breaks approximate what a
//! device with a fixed-advance font would show.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use folio_stream::{
    Dialect, EngineDiagnostic, EngineOptions, FixedAdvanceMeasurer, FolioError, NeverCancel,
    ReaderEngine, SectionCache,
};

struct Args {
    document: PathBuf,
    css: Option<PathBuf>,
    cache: Option<PathBuf>,
    section: usize,
    page: usize,
    width: u16,
    height: u16,
    dialect: Option<Dialect>,
    list: bool,
}

fn usage() {
    eprintln!("Usage: folio-stream [OPTIONS] <DOCUMENT>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --css <FILE>        Stylesheet applied to XHTML content");
    eprintln!("  --cache <DIR>       Persist built sections under DIR");
    eprintln!("  --section <N>       Section to build (default: 0)");
    eprintln!("  --page <N>          Page to print (default: 0)");
    eprintln!("  --width <PX>        Viewport width (default: 480)");
    eprintln!("  --height <PX>       Viewport height (default: 800)");
    eprintln!("  --xhtml | --fb2     Markup dialect (default: by file extension)");
    eprintln!("  --list              Only list sections");
}

fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = args
        .get(i)
        .ok_or_else(|| format!("{} expects a value", flag))?;
    raw.parse()
        .map_err(|_| format!("invalid value for {}: {}", flag, raw))
}

fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let mut parsed = Args {
        document: PathBuf::new(),
        css: None,
        cache: None,
        section: 0,
        page: 0,
        width: 480,
        height: 800,
        dialect: None,
        list: false,
    };
    let mut document = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--css" => {
                i += 1;
                parsed.css = Some(value::<PathBuf>(args, i, "--css")?);
            }
            "--cache" => {
                i += 1;
                parsed.cache = Some(value::<PathBuf>(args, i, "--cache")?);
            }
            "--section" => {
                i += 1;
                parsed.section = value(args, i, "--section")?;
            }
            "--page" => {
                i += 1;
                parsed.page = value(args, i, "--page")?;
            }
            "--width" => {
                i += 1;
                parsed.width = value(args, i, "--width")?;
            }
            "--height" => {
                i += 1;
                parsed.height = value(args, i, "--height")?;
            }
            "--xhtml" => parsed.dialect = Some(Dialect::Xhtml),
            "--fb2" => parsed.dialect = Some(Dialect::Fb2),
            "--list" => parsed.list = true,
            "--help" | "-h" => return Ok(None),
            other if other.starts_with("--") => return Err(format!("unknown option {}", other)),
            other => document = Some(PathBuf::from(other)),
        }
        i += 1;
    }
    parsed.document = document.ok_or_else(|| "missing document path".to_string())?;
    Ok(Some(parsed))
}

fn dialect_for(args: &Args) -> Dialect {
    if let Some(dialect) = args.dialect {
        return dialect;
    }
    match args
        .document
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("xhtml" | "html" | "htm") => Dialect::Xhtml,
        _ => Dialect::Fb2,
    }
}

fn run(args: Args) -> Result<(), FolioError> {
    let options = EngineOptions::for_display(args.width, args.height, dialect_for(&args));
    let mut engine = ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(9, 18)));
    if let Some(root) = &args.cache {
        engine = engine.with_cache(SectionCache::new(root, &args.document));
    }
    engine.set_diagnostic_sink(|diagnostic| match diagnostic {
        EngineDiagnostic::CacheHit {
            section,
            page_count,
        } => eprintln!("cache hit: section {} ({} pages)", section, page_count),
        EngineDiagnostic::StorageFallback { section, code } => {
            eprintln!("section {} laid out in memory ({})", section, code)
        }
        other => eprintln!("{:?}", other),
    });

    if let Some(css_path) = &args.css {
        let file = File::open(css_path)?;
        let size = file.metadata()?.len();
        let declared = usize::try_from(size).unwrap_or(usize::MAX);
        let rules = engine.load_stylesheet(file, declared)?;
        eprintln!("stylesheet: {} rules", rules);
    }

    let sections = engine.scan(File::open(&args.document)?)?;
    for (index, entry) in sections.iter().enumerate() {
        println!(
            "{:>4}  @{:<10} {:>8} bytes  {}",
            index, entry.offset, entry.length, entry.title
        );
    }
    if args.list {
        return Ok(());
    }

    let Some(entry) = sections.get(args.section) else {
        eprintln!(
            "section {} not found ({} sections)",
            args.section,
            sections.len()
        );
        return Ok(());
    };
    let mut document = File::open(&args.document)?;
    let mut section = engine.open_section(&mut document, args.section, entry.target(), &NeverCancel)?;
    let page = section.read_page(args.page)?;
    println!();
    println!(
        "-- section {} page {}/{} --",
        args.section,
        args.page + 1,
        section.page_count()
    );
    for placed in &page.lines {
        let indent = usize::try_from(placed.x.max(0)).unwrap_or(0) / 9;
        println!("{}{}", " ".repeat(indent), placed.line.plain_text());
    }
    for note in &page.footnotes {
        println!("[{}] -> {}", note.number, note.href);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(Some(args)) => args,
        Ok(None) => {
            usage();
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("{}", message);
            usage();
            return ExitCode::FAILURE;
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
