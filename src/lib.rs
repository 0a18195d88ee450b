//! Streaming style-resolving document parser and paginated page cache.
//!
//! `folio-stream` turns section-tagged book markup (FB2 or XHTML) into
//! fixed-size pages of positioned, styled words without ever holding a
//! whole section in memory:
//!
//! - [`Stylesheet`] keeps a bounded table of CSS rules and resolves a
//!   computed style per element.
//! - [`SectionParser`] consumes markup events, tracks inline emphasis and
//!   block boundaries, and feeds words into a [`PageBuilder`].
//! - [`PageBuilder`] lays out blocks into lines and lines into pages,
//!   handing each completed page to a [`PageSink`].
//! - [`SectionWriter`] / [`SectionFile`] persist a section's pages with a
//!   lookup table for random page access.
//! - [`ReaderEngine`] picks between the cache and a rebuild, and
//!   [`BuildWorker`] runs builds on a background thread.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use folio_stream::{
//!     Dialect, EngineOptions, FixedAdvanceMeasurer, NeverCancel, ReaderEngine, SectionCache,
//! };
//!
//! let options = EngineOptions::for_display(480, 800, Dialect::Fb2);
//! let engine = ReaderEngine::new(options, Arc::new(FixedAdvanceMeasurer::new(9, 18)))
//!     .with_cache(SectionCache::new("/tmp/folio", "book.fb2"));
//! let sections = engine.scan(File::open("book.fb2")?)?;
//! let mut book = File::open("book.fb2")?;
//! let mut first = engine.open_section(&mut book, 0, sections[0].target(), &NeverCancel)?;
//! let page = first.read_page(0)?;
//! println!("{} lines", page.lines.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(
    not(test),
    deny(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod config;
pub mod css;
pub mod engine;
pub mod error;
pub mod layout;
pub mod markup;
pub mod page;
pub mod section;
pub mod section_index;
mod serialization;
pub mod style;
pub mod text_block;
pub mod tokenizer;

pub use config::{ParseLimits, RenderParams, WORD_BUFFER_BYTES};
pub use css::{CssParseStats, Stylesheet, StylesheetLimits, CSS_CACHE_VERSION};
pub use engine::{
    BuildWorker, CancelToken, EngineDiagnostic, EngineOptions, NeverCancel, OpenSection,
    ReaderEngine, SectionCache, SectionSlot,
};
pub use error::{ErrorLimitContext, ErrorPhase, FolioError};
pub use layout::{PageBuilder, PageSink, VecSink};
pub use page::{FootnoteRef, Page, PageLine, MAX_FOOTNOTES_PER_PAGE};
pub use section::{SectionFile, SectionHeader, SectionWriter, SECTION_FILE_VERSION};
pub use section_index::{scan_sections, SectionEntry};
pub use style::{
    BlockStyle, CssLength, CssStyle, CssUnit, FontStyle, FontWeight, TextAlign, TextDecoration,
};
pub use text_block::{
    FixedAdvanceMeasurer, Hyphenator, LineWord, TextBlock, TextLine, TextMeasurer, WordStyle,
};
pub use tokenizer::{Attributes, Dialect, SectionParser, SectionTarget, TokenizeStats};
