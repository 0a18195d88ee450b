//! Top-level section scanner.
//!
//! One pass over a section-tagged document records where each top-level
//! `<section>` of the first `<body>` starts and ends, so a later build can
//! seek straight to it.

use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ErrorPhase, FolioError};
use crate::markup::decode_entity;
use crate::tokenizer::{local_name, SectionTarget};

const MAX_TITLE_BYTES: usize = 128;

/// Byte window of one top-level section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionEntry {
    pub offset: u64,
    pub length: u64,
    /// Collapsed text of the section's own `<title>`, possibly empty.
    pub title: String,
}

impl SectionEntry {
    pub fn target(&self) -> SectionTarget {
        SectionTarget::Window {
            offset: self.offset,
            length: self.length,
        }
    }
}

struct OpenSection {
    offset: u64,
    title: String,
    title_depth: Option<usize>,
    title_done: bool,
}

fn push_title_text(title: &mut String, text: &str) {
    for ch in text.chars() {
        // Whitespace runs collapse to one space; no-break spaces are content.
        if ch.is_whitespace() && ch != '\u{00A0}' {
            if !title.is_empty() && !title.ends_with(' ') && title.len() < MAX_TITLE_BYTES {
                title.push(' ');
            }
        } else if title.len() + ch.len_utf8() <= MAX_TITLE_BYTES {
            title.push(ch);
        }
    }
}

/// List the top-level sections of the first `<body>`.
///
/// A document without any yields one entry covering the whole input.
pub fn scan_sections<R: BufRead>(input: R) -> Result<Vec<SectionEntry>, FolioError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::with_capacity(1024);
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut body_depth: Option<usize> = None;
    let mut body_closed = false;
    let mut open: Option<OpenSection> = None;

    loop {
        let offset = reader.buffer_position();
        let event = reader.read_event_into(&mut buf).map_err(|err| match err {
            quick_xml::Error::Io(io) => FolioError::Storage {
                phase: ErrorPhase::Tokenize,
                kind: io.kind(),
                message: io.to_string().into_boxed_str(),
            },
            other => FolioError::malformed(offset, other.to_string()),
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let qname = e.name();
                let raw = reader
                    .decoder()
                    .decode(qname.as_ref())
                    .map_err(|err| FolioError::malformed(offset, format!("{:?}", err)))?;
                let tag = local_name(&raw).to_ascii_lowercase();
                if tag == "body" && body_depth.is_none() {
                    body_depth = Some(depth);
                }
                let top_level =
                    !body_closed && body_depth.is_some_and(|body| depth == body + 1);
                if tag == "section" && top_level && open.is_none() {
                    if is_empty {
                        entries.push(SectionEntry {
                            offset,
                            length: reader.buffer_position() - offset,
                            title: String::new(),
                        });
                    } else {
                        open = Some(OpenSection {
                            offset,
                            title: String::new(),
                            title_depth: None,
                            title_done: false,
                        });
                    }
                } else if tag == "title" && !is_empty {
                    if let Some(section) = open.as_mut() {
                        let own_title = body_depth.is_some_and(|body| depth == body + 2);
                        if own_title && !section.title_done {
                            section.title_depth = Some(depth);
                        }
                    }
                }
                if !is_empty {
                    depth += 1;
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                let qname = e.name();
                let raw = reader
                    .decoder()
                    .decode(qname.as_ref())
                    .map_err(|err| FolioError::malformed(offset, format!("{:?}", err)))?;
                let tag = local_name(&raw).to_ascii_lowercase();
                if let Some(section) = open.as_mut() {
                    // Paragraphs inside a title are separate words.
                    if section.title_depth.is_some_and(|title| depth > title) {
                        push_title_text(&mut section.title, " ");
                    }
                    if section.title_depth == Some(depth) {
                        section.title_depth = None;
                        section.title_done = true;
                    }
                }
                let top_level = body_depth.is_some_and(|body| depth == body + 1);
                if tag == "section" && top_level {
                    if let Some(section) = open.take() {
                        entries.push(SectionEntry {
                            offset: section.offset,
                            length: reader.buffer_position() - section.offset,
                            title: section.title.trim_end().to_string(),
                        });
                    }
                }
                if tag == "body" && body_depth == Some(depth) {
                    body_closed = true;
                }
            }
            Event::Text(ref e) => {
                if let Some(section) = open.as_mut().filter(|s| s.title_depth.is_some()) {
                    if let Ok(text) = e.decode() {
                        push_title_text(&mut section.title, &text);
                    }
                }
            }
            Event::GeneralRef(ref e) => {
                if let Some(section) = open.as_mut().filter(|s| s.title_depth.is_some()) {
                    if let Some(text) = e.decode().ok().and_then(|name| decode_entity(&name)) {
                        push_title_text(&mut section.title, &text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if entries.is_empty() {
        entries.push(SectionEntry {
            offset: 0,
            length: reader.buffer_position(),
            title: String::new(),
        });
    }
    log::debug!("scanned {} top-level sections", entries.len());
    Ok(entries)
}
