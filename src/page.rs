//! Laid-out pages and their binary record format.
//!
//! Record layout (little-endian):
//!
//! ```text
//! u16 element count
//!   per element: u8 tag (1 = line), i16 x, i16 y, line
//!   line: u32 n, n × (u32 len, bytes)   words
//!         u32 n, n × u16                 word x offsets
//!         u32 n, n × u8                  word style bits
//!         u8                             alignment
//! u8 footnote count
//!   per footnote: u8 len, number bytes, u8 len, href bytes
//! ```

use std::io::{self, Read, Write};

use crate::error::FolioError;
use crate::serialization::{
    read_i16, read_string, read_u16, read_u32, read_u8, write_i16, write_string, write_u16,
    write_u32, write_u8,
};
use crate::style::TextAlign;
use crate::text_block::{LineWord, TextLine, WordStyle};

pub const MAX_FOOTNOTES_PER_PAGE: usize = 16;
pub const FOOTNOTE_NUMBER_BYTES: usize = 24;
pub const FOOTNOTE_HREF_BYTES: usize = 64;

const TAG_LINE: u8 = 1;
const MAX_WORDS_PER_LINE: usize = 4096;

/// A note reference laid out on a page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FootnoteRef {
    pub number: heapless::String<FOOTNOTE_NUMBER_BYTES>,
    pub href: heapless::String<FOOTNOTE_HREF_BYTES>,
}

fn push_truncated<const N: usize>(dst: &mut heapless::String<N>, src: &str) {
    let mut end = src.len().min(N);
    while !src.is_char_boundary(end) {
        end -= 1;
    }
    // Cannot fail: `end` bytes fit the capacity.
    let _ = dst.push_str(&src[..end]);
}

impl FootnoteRef {
    /// Build a reference, truncating both fields at a char boundary to fit.
    pub fn new(number: &str, href: &str) -> Self {
        let mut note = Self::default();
        push_truncated(&mut note.number, number.trim());
        push_truncated(&mut note.href, href.trim());
        note
    }
}

/// A line placed on a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLine {
    pub x: i16,
    pub y: i16,
    pub line: TextLine,
}

/// One screenful of positioned lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    pub lines: Vec<PageLine>,
    pub footnotes: heapless::Vec<FootnoteRef, MAX_FOOTNOTES_PER_PAGE>,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn push_line(&mut self, x: i16, y: i16, line: TextLine) {
        self.lines.push(PageLine { x, y, line });
    }

    /// Returns `false` when the page already holds the maximum.
    pub fn add_footnote(&mut self, note: FootnoteRef) -> bool {
        self.footnotes.push(note).is_ok()
    }

    /// Serialize one page record.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let count = u16::try_from(self.lines.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "too many lines on one page")
        })?;
        write_u16(out, count)?;
        for element in &self.lines {
            write_u8(out, TAG_LINE)?;
            write_i16(out, element.x)?;
            write_i16(out, element.y)?;
            write_line(out, &element.line)?;
        }
        write_u8(out, self.footnotes.len() as u8)?;
        for note in &self.footnotes {
            write_u8(out, note.number.len() as u8)?;
            out.write_all(note.number.as_bytes())?;
            write_u8(out, note.href.len() as u8)?;
            out.write_all(note.href.as_bytes())?;
        }
        Ok(())
    }

    /// Deserialize exactly one page record.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, FolioError> {
        let count = read_u16(input)? as usize;
        let mut page = Page {
            lines: Vec::with_capacity(count.min(256)),
            footnotes: heapless::Vec::new(),
        };
        for _ in 0..count {
            let tag = read_u8(input)?;
            if tag != TAG_LINE {
                return Err(FolioError::corrupt(format!(
                    "unknown page element tag {}",
                    tag
                )));
            }
            let x = read_i16(input)?;
            let y = read_i16(input)?;
            let line = read_line(input)?;
            page.lines.push(PageLine { x, y, line });
        }
        let notes = read_u8(input)? as usize;
        if notes > MAX_FOOTNOTES_PER_PAGE {
            return Err(FolioError::corrupt(format!(
                "page lists {} footnotes, maximum is {}",
                notes, MAX_FOOTNOTES_PER_PAGE
            )));
        }
        for _ in 0..notes {
            let number = read_tiny_string(input, FOOTNOTE_NUMBER_BYTES)?;
            let href = read_tiny_string(input, FOOTNOTE_HREF_BYTES)?;
            let mut note = FootnoteRef::default();
            push_truncated(&mut note.number, &number);
            push_truncated(&mut note.href, &href);
            page.add_footnote(note);
        }
        Ok(page)
    }
}

fn write_line<W: Write>(out: &mut W, line: &TextLine) -> io::Result<()> {
    let count = line.words.len() as u32;
    write_u32(out, count)?;
    for word in &line.words {
        write_string(out, &word.text)?;
    }
    write_u32(out, count)?;
    for word in &line.words {
        write_u16(out, word.x)?;
    }
    write_u32(out, count)?;
    for word in &line.words {
        write_u8(out, word.style.bits())?;
    }
    write_u8(out, line.alignment as u8)
}

fn read_count<R: Read>(input: &mut R) -> Result<usize, FolioError> {
    let count = read_u32(input)? as usize;
    if count > MAX_WORDS_PER_LINE {
        return Err(FolioError::corrupt(format!(
            "line claims {} words, maximum is {}",
            count, MAX_WORDS_PER_LINE
        )));
    }
    Ok(count)
}

fn read_line<R: Read>(input: &mut R) -> Result<TextLine, FolioError> {
    let count = read_count(input)?;
    let mut texts = Vec::with_capacity(count);
    for _ in 0..count {
        texts.push(read_string(input)?);
    }
    if read_count(input)? != count {
        return Err(FolioError::corrupt("word/x-position count mismatch"));
    }
    let mut xs = Vec::with_capacity(count);
    for _ in 0..count {
        xs.push(read_u16(input)?);
    }
    if read_count(input)? != count {
        return Err(FolioError::corrupt("word/style count mismatch"));
    }
    let mut words = Vec::with_capacity(count);
    for (text, x) in texts.into_iter().zip(xs) {
        let style = WordStyle::from_bits(read_u8(input)?);
        words.push(LineWord { text, x, style });
    }
    let alignment = TextAlign::from_u8(read_u8(input)?)
        .ok_or_else(|| FolioError::corrupt("invalid line alignment byte"))?;
    Ok(TextLine { words, alignment })
}

fn read_tiny_string<R: Read>(input: &mut R, max: usize) -> Result<String, FolioError> {
    let len = read_u8(input)? as usize;
    if len > max {
        return Err(FolioError::corrupt(format!(
            "footnote field length {} exceeds {}",
            len, max
        )));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| FolioError::corrupt("footnote field is not UTF-8"))
}
