//! Streaming `quick-xml` driver for [`SectionParser`].
//!
//! The document is pulled through a bounded `BufReader`; between events the
//! driver checks cancellation and stops as soon as the parser reports that
//! its target section is behind it.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::config::ParseLimits;
use crate::engine::CancelToken;
use crate::error::{ErrorPhase, FolioError};
use crate::tokenizer::{Attributes, SectionParser, SectionTarget};

/// Decode a general entity reference by name (without `&` and `;`).
///
/// Covers the XML predefined entities, numeric character references and a
/// few HTML named entities common in book content.
pub fn decode_entity(name: &str) -> Option<Cow<'static, str>> {
    let html = match name {
        "nbsp" => "\u{00A0}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201C}",
        "rdquo" => "\u{201D}",
        "copy" => "\u{00A9}",
        "shy" => "\u{00AD}",
        _ => "",
    };
    if !html.is_empty() {
        return Some(Cow::Borrowed(html));
    }
    let mut raw = String::with_capacity(name.len() + 2);
    raw.push('&');
    raw.push_str(name);
    raw.push(';');
    quick_xml::escape::unescape(&raw)
        .ok()
        .map(|text| Cow::Owned(text.into_owned()))
}

fn decode_error(offset: u64, what: &str, err: impl std::fmt::Debug) -> FolioError {
    FolioError::malformed(offset, format!("{} decode error: {:?}", what, err))
}

fn read_error(offset: u64, err: quick_xml::Error) -> FolioError {
    match err {
        quick_xml::Error::Io(io) => FolioError::Storage {
            phase: ErrorPhase::Tokenize,
            kind: io.kind(),
            message: io.to_string().into_boxed_str(),
        },
        other => FolioError::malformed(offset, other.to_string()),
    }
}

fn element_name<R>(reader: &Reader<R>, start: &BytesStart<'_>, offset: u64) -> Result<String, FolioError> {
    reader
        .decoder()
        .decode(start.name().as_ref())
        .map(Cow::into_owned)
        .map_err(|err| decode_error(offset, "tag name", err))
}

fn element_attributes<R>(reader: &Reader<R>, start: &BytesStart<'_>) -> Attributes {
    let mut attrs = Attributes::new();
    for attr in start.attributes().flatten() {
        let Ok(key) = reader.decoder().decode(attr.key.as_ref()) else {
            continue;
        };
        let Ok(raw) = reader.decoder().decode(&attr.value) else {
            continue;
        };
        match quick_xml::escape::unescape(&raw) {
            Ok(value) => attrs.push(&key, &value),
            Err(_) => attrs.push(&key, &raw),
        }
    }
    attrs
}

/// Feed every event of `input` into `parser`.
///
/// `base_offset` is the absolute document position of the first byte of
/// `input`; element offsets handed to the parser are absolute. Returns the
/// number of bytes consumed.
pub fn feed<R: BufRead>(
    input: R,
    base_offset: u64,
    parser: &mut SectionParser<'_>,
    cancel: &dyn CancelToken,
) -> Result<u64, FolioError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::with_capacity(1024);
    loop {
        if cancel.is_cancelled() {
            return Err(FolioError::Cancelled);
        }
        if parser.is_past_target() {
            break;
        }
        let offset = base_offset + reader.buffer_position();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = element_name(&reader, &e, offset)?;
                let attrs = element_attributes(&reader, &e);
                parser.start_element(&name, &attrs, offset)?;
            }
            Ok(Event::Empty(e)) => {
                let name = element_name(&reader, &e, offset)?;
                let attrs = element_attributes(&reader, &e);
                parser.start_element(&name, &attrs, offset)?;
                parser.end_element(&name)?;
            }
            Ok(Event::End(e)) => {
                let qname = e.name();
                let name = reader
                    .decoder()
                    .decode(qname.as_ref())
                    .map_err(|err| decode_error(offset, "tag name", err))?;
                parser.end_element(&name)?;
            }
            Ok(Event::Text(e)) => {
                let text = e.decode().map_err(|err| decode_error(offset, "text", err))?;
                parser.characters(&text)?;
            }
            Ok(Event::CData(e)) => {
                let text = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|err| decode_error(offset, "cdata", err))?;
                parser.characters(&text)?;
            }
            Ok(Event::GeneralRef(e)) => {
                let name = e
                    .decode()
                    .map_err(|err| decode_error(offset, "entity", err))?;
                match decode_entity(&name) {
                    Some(text) => parser.characters(&text)?,
                    None => {
                        log::debug!("unknown entity &{}; kept verbatim", name);
                        parser.characters(&format!("&{};", name))?;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                if parser.is_past_target() {
                    break;
                }
                return Err(read_error(offset, err));
            }
        }
        buf.clear();
    }
    Ok(reader.buffer_position())
}

/// Position `source` for `target` and feed it through `parser`.
///
/// A byte window is read in isolation; whole-document and indexed targets
/// read from the start.
pub fn feed_target<R: Read + Seek>(
    mut source: R,
    target: SectionTarget,
    limits: ParseLimits,
    parser: &mut SectionParser<'_>,
    cancel: &dyn CancelToken,
) -> Result<u64, FolioError> {
    let chunk = limits.read_chunk.max(64);
    match target {
        SectionTarget::Window { offset, length } => {
            source
                .seek(SeekFrom::Start(offset))
                .map_err(|err| FolioError::from(err).in_phase(ErrorPhase::Tokenize))?;
            let input = BufReader::with_capacity(chunk, source.take(length));
            feed(input, offset, parser, cancel)
        }
        SectionTarget::Whole | SectionTarget::Index(_) => {
            source
                .seek(SeekFrom::Start(0))
                .map_err(|err| FolioError::from(err).in_phase(ErrorPhase::Tokenize))?;
            feed(BufReader::with_capacity(chunk, source), 0, parser, cancel)
        }
    }
}
