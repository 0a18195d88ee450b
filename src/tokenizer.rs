//! Push-based markup tokenizer.
//!
//! [`SectionParser`] receives element and character events, tracks nesting
//! depth with a stack of scope markers and hands finished words to a
//! [`PageBuilder`]. The event source lives in [`crate::markup`].

use smallvec::SmallVec;

use crate::config::WORD_BUFFER_BYTES;
use crate::css::{parse_inline_style, Stylesheet};
use crate::error::FolioError;
use crate::layout::PageBuilder;
use crate::page::{FootnoteRef, FOOTNOTE_NUMBER_BYTES};
use crate::style::{BlockStyle, CssStyle, TextAlign};
use crate::text_block::WordStyle;

/// Markup vocabulary the tokenizer interprets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Section/verse tagged XML (`<section>`, `<p>`, `<poem>`, `<emphasis>`, ...).
    #[default]
    Fb2,
    /// CSS-styled HTML-like content.
    Xhtml,
}

/// Which part of the document to materialize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SectionTarget {
    #[default]
    Whole,
    /// Zero-based index of a top-level `<section>` inside the first `<body>`.
    Index(usize),
    /// The first element starting within `offset..offset + length`.
    Window { offset: u64, length: u64 },
}

/// Element attributes in document order, keys lowercased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    items: SmallVec<[(String, String); 4]>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.items
            .push((key.to_ascii_lowercase(), value.to_string()));
    }

    /// Exact key first, then a match on the key's local name
    /// (so `href` finds `l:href` and `xlink:href`).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .or_else(|| self.items.iter().find(|(k, _)| local_name(k) == key))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'k> FromIterator<(&'k str, &'k str)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (&'k str, &'k str)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (key, value) in iter {
            attrs.push(key, value);
        }
        attrs
    }
}

/// Strip a namespace prefix.
pub fn local_name(name: &str) -> &str {
    match name.rfind(':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Skip,
    Bold,
    Italic,
    Underline,
}

#[derive(Clone, Copy, Debug)]
struct ScopeMarker {
    marker: Marker,
    depth: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TargetState {
    Before,
    Inside { depth: usize },
    Past,
}

struct NoteCapture {
    depth: usize,
    href: String,
    number: heapless::String<FOOTNOTE_NUMBER_BYTES>,
}

/// Counters collected while tokenizing one section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenizeStats {
    pub words: usize,
    pub forced_flushes: usize,
    pub placeholders: usize,
    pub skipped_subtrees: usize,
    pub footnotes: usize,
}

fn is_word_space(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r')
}

/// Tokenizer state for one section build.
pub struct SectionParser<'a> {
    dialect: Dialect,
    target: SectionTarget,
    stylesheet: Option<&'a Stylesheet>,
    builder: PageBuilder<'a>,
    depth: usize,
    markers: SmallVec<[ScopeMarker; 16]>,
    /// Open FB2 containers whose paragraphs inherit the container's block style.
    frames: SmallVec<[(usize, BlockStyle); 4]>,
    word: heapless::Vec<u8, WORD_BUFFER_BYTES>,
    next_word_continues: bool,
    state: TargetState,
    body_depth: Option<usize>,
    body_closed: bool,
    sections_seen: usize,
    note: Option<NoteCapture>,
    stats: TokenizeStats,
}

impl<'a> SectionParser<'a> {
    pub fn new(dialect: Dialect, target: SectionTarget, builder: PageBuilder<'a>) -> Self {
        Self {
            dialect,
            target,
            stylesheet: None,
            builder,
            depth: 0,
            markers: SmallVec::new(),
            frames: SmallVec::new(),
            word: heapless::Vec::new(),
            next_word_continues: false,
            state: TargetState::Before,
            body_depth: None,
            body_closed: false,
            sections_seen: 0,
            note: None,
            stats: TokenizeStats::default(),
        }
    }

    /// Resolve XHTML element styles against `stylesheet`.
    pub fn with_stylesheet(mut self, stylesheet: &'a Stylesheet) -> Self {
        self.stylesheet = Some(stylesheet);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn stats(&self) -> TokenizeStats {
        self.stats
    }

    pub fn builder(&self) -> &PageBuilder<'a> {
        &self.builder
    }

    /// Once set, no further content is produced and the driver may stop feeding.
    pub fn is_past_target(&self) -> bool {
        self.state == TargetState::Past
    }

    fn in_scope(&self) -> bool {
        match self.target {
            SectionTarget::Whole => true,
            _ => matches!(self.state, TargetState::Inside { .. }),
        }
    }

    fn has(&self, marker: Marker) -> bool {
        self.markers.iter().any(|m| m.marker == marker)
    }

    fn skipping(&self) -> bool {
        self.has(Marker::Skip)
    }

    fn accepting_text(&self) -> bool {
        !self.is_past_target() && self.in_scope() && !self.skipping()
    }

    fn push_marker(&mut self, marker: Marker) {
        self.markers.push(ScopeMarker {
            marker,
            depth: self.depth,
        });
    }

    pub fn start_element(
        &mut self,
        name: &str,
        attrs: &Attributes,
        offset: u64,
    ) -> Result<(), FolioError> {
        if self.is_past_target() || self.skipping() {
            self.depth += 1;
            return Ok(());
        }
        let tag = local_name(name).to_ascii_lowercase();
        if tag == "body" && self.body_depth.is_none() {
            self.body_depth = Some(self.depth);
        }
        self.track_target(&tag, offset);
        if self.in_scope() {
            match self.dialect {
                Dialect::Fb2 => self.start_fb2(&tag, attrs)?,
                Dialect::Xhtml => self.start_xhtml(&tag, attrs)?,
            }
        }
        self.depth += 1;
        Ok(())
    }

    fn track_target(&mut self, tag: &str, offset: u64) {
        if self.state != TargetState::Before {
            return;
        }
        match self.target {
            SectionTarget::Whole => {}
            SectionTarget::Index(wanted) => {
                let top_level = !self.body_closed
                    && self.body_depth.is_some_and(|body| self.depth == body + 1);
                if tag == "section" && top_level {
                    if self.sections_seen == wanted {
                        self.state = TargetState::Inside { depth: self.depth };
                    }
                    self.sections_seen += 1;
                }
            }
            SectionTarget::Window { offset: start, length } => {
                if offset >= start.saturating_add(length) {
                    self.state = TargetState::Past;
                } else if offset >= start {
                    self.state = TargetState::Inside { depth: self.depth };
                }
            }
        }
    }

    fn start_fb2(&mut self, tag: &str, attrs: &Attributes) -> Result<(), FolioError> {
        let centered = BlockStyle::aligned(TextAlign::Center);
        match tag {
            "description" | "binary" => self.skip_subtree(),
            "p" => {
                let style = match self.frames.last() {
                    Some(_) if self.builder.block().is_empty() => BlockStyle::default(),
                    Some(&(_, frame)) => frame,
                    None => {
                        BlockStyle::aligned(self.builder.params().effective_paragraph_alignment())
                    }
                };
                self.start_block(style)?;
            }
            "title" => {
                self.start_frame(centered)?;
                self.push_marker(Marker::Bold);
            }
            "subtitle" => {
                self.start_frame(centered)?;
                self.push_marker(Marker::Italic);
            }
            "epigraph" => {
                self.start_frame(BlockStyle::aligned(TextAlign::Right).with_margin_left(30))?;
                self.push_marker(Marker::Italic);
            }
            "text-author" => {
                self.start_frame(BlockStyle::aligned(TextAlign::Right))?;
                self.push_marker(Marker::Italic);
            }
            "poem" | "stanza" => self.start_frame(centered)?,
            "v" => self.start_block(centered)?,
            "cite" => self.start_frame(BlockStyle::default().with_margin_left(20))?,
            "empty-line" => {
                self.flush_word();
                self.builder.start_blank_line()?;
            }
            "strong" => self.inline(Marker::Bold),
            "emphasis" => self.inline(Marker::Italic),
            "image" => self.placeholder("[Image]")?,
            "table" => self.placeholder("[Table omitted]")?,
            "a" => {
                if attrs.get("type") == Some("note") {
                    self.begin_note(attrs);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn start_xhtml(&mut self, tag: &str, attrs: &Attributes) -> Result<(), FolioError> {
        if matches!(tag, "head" | "script" | "style") || is_pagebreak(attrs) {
            self.skip_subtree();
            return Ok(());
        }
        let css = self.element_css(tag, attrs);
        let em_px = self.builder.em_px();
        let viewport = f32::from(self.builder.params().viewport_width);
        let paragraph = self.builder.params().effective_paragraph_alignment();
        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let base = BlockStyle::aligned(TextAlign::Center);
                self.start_block(base.combined_with(&BlockStyle::from_css(&css, em_px, viewport)))?;
                self.push_marker(Marker::Bold);
            }
            "p" | "li" | "div" | "blockquote" => {
                let base = BlockStyle::aligned(paragraph);
                self.start_block(base.combined_with(&BlockStyle::from_css(&css, em_px, viewport)))?;
            }
            "br" => {
                self.flush_word();
                if !self.builder.block().is_empty() {
                    let current = self.builder.current_style();
                    self.start_block(current)?;
                }
            }
            "b" | "strong" => self.inline(Marker::Bold),
            "i" | "em" => self.inline(Marker::Italic),
            "u" => self.inline(Marker::Underline),
            "img" => {
                let label = match attrs.get("alt").map(str::trim) {
                    Some(alt) if !alt.is_empty() => format!("[Image: {}]", alt),
                    _ => "[Image]".to_string(),
                };
                self.placeholder(&label)?;
                return Ok(());
            }
            "table" => {
                self.placeholder("[Table omitted]")?;
                return Ok(());
            }
            "a" => {
                if is_noteref(attrs) {
                    self.begin_note(attrs);
                }
            }
            _ => {}
        }
        self.apply_css_markers(&css);
        Ok(())
    }

    fn element_css(&self, tag: &str, attrs: &Attributes) -> CssStyle {
        let mut css = match self.stylesheet {
            Some(sheet) => sheet.resolve_style(tag, attrs.get("class").unwrap_or("")),
            None => CssStyle::default(),
        };
        if let Some(inline) = attrs.get("style") {
            css.apply_over(&parse_inline_style(inline));
        }
        css
    }

    fn apply_css_markers(&mut self, css: &CssStyle) {
        if css.is_bold() && !self.has(Marker::Bold) {
            self.inline(Marker::Bold);
        }
        if css.is_italic() && !self.has(Marker::Italic) {
            self.inline(Marker::Italic);
        }
        if css.is_underline() && !self.has(Marker::Underline) {
            self.inline(Marker::Underline);
        }
    }

    fn skip_subtree(&mut self) {
        self.stats.skipped_subtrees += 1;
        self.push_marker(Marker::Skip);
    }

    fn start_block(&mut self, style: BlockStyle) -> Result<(), FolioError> {
        self.flush_word();
        self.next_word_continues = false;
        self.builder.start_new_text_block(style)
    }

    fn start_frame(&mut self, style: BlockStyle) -> Result<(), FolioError> {
        self.start_block(style)?;
        self.frames.push((self.depth, style));
        Ok(())
    }

    /// Style boundary inside a word: flush the fragment and stitch the next one to it.
    fn inline(&mut self, marker: Marker) {
        if !self.word.is_empty() {
            self.flush_word();
            self.next_word_continues = true;
        }
        self.push_marker(marker);
    }

    /// Replace an opaque subtree with an italic, centered label.
    fn placeholder(&mut self, label: &str) -> Result<(), FolioError> {
        let resume = self.builder.current_style().alignment;
        self.start_block(BlockStyle::aligned(TextAlign::Center))?;
        self.push_marker(Marker::Italic);
        self.push_text(label);
        self.flush_word();
        self.push_marker(Marker::Skip);
        self.stats.placeholders += 1;
        self.builder
            .start_new_text_block(BlockStyle::aligned(resume))
    }

    fn begin_note(&mut self, attrs: &Attributes) {
        let href = attrs.get("href").unwrap_or("").to_string();
        self.note = Some(NoteCapture {
            depth: self.depth,
            href,
            number: heapless::String::new(),
        });
    }

    pub fn end_element(&mut self, name: &str) -> Result<(), FolioError> {
        if self.depth == 0 {
            return Ok(());
        }
        let tag = local_name(name).to_ascii_lowercase();
        if self.accepting_text() && !self.word.is_empty() {
            let block = self.is_block(&tag);
            // Any element may carry a CSS marker; its text must keep that style.
            let closes_marker = self
                .markers
                .last()
                .is_some_and(|marker| marker.depth + 1 >= self.depth);
            let inline = self.is_inline(&tag) || (closes_marker && !block);
            if inline || block || self.depth == 1 {
                self.flush_word();
                if inline {
                    self.next_word_continues = true;
                }
            }
        }
        self.depth -= 1;
        while self
            .markers
            .last()
            .is_some_and(|marker| marker.depth >= self.depth)
        {
            self.markers.pop();
        }
        while self.frames.last().is_some_and(|&(depth, _)| depth >= self.depth) {
            self.frames.pop();
        }
        if self.note.as_ref().is_some_and(|n| n.depth >= self.depth) {
            if let Some(note) = self.note.take() {
                self.builder
                    .add_footnote(FootnoteRef::new(&note.number, &note.href));
                self.stats.footnotes += 1;
            }
        }
        if self.state == (TargetState::Inside { depth: self.depth }) {
            self.flush_word();
            self.state = TargetState::Past;
        }
        if tag == "body" && self.body_depth == Some(self.depth) {
            self.body_closed = true;
        }
        Ok(())
    }

    fn is_block(&self, tag: &str) -> bool {
        match self.dialect {
            Dialect::Fb2 => matches!(
                tag,
                "p" | "title"
                    | "subtitle"
                    | "epigraph"
                    | "text-author"
                    | "v"
                    | "cite"
                    | "poem"
                    | "stanza"
                    | "section"
            ),
            Dialect::Xhtml => matches!(
                tag,
                "p" | "li"
                    | "div"
                    | "blockquote"
                    | "h1"
                    | "h2"
                    | "h3"
                    | "h4"
                    | "h5"
                    | "h6"
                    | "section"
                    | "body"
            ),
        }
    }

    fn is_inline(&self, tag: &str) -> bool {
        match self.dialect {
            Dialect::Fb2 => matches!(tag, "strong" | "emphasis" | "a"),
            Dialect::Xhtml => matches!(tag, "b" | "strong" | "i" | "em" | "u" | "a" | "span"),
        }
    }

    /// Character data. Entity-decoded text may arrive in several pieces
    /// without breaking the word in progress.
    pub fn characters(&mut self, text: &str) -> Result<(), FolioError> {
        if !self.accepting_text() {
            return Ok(());
        }
        self.push_text(text);
        self.builder.relieve_long_block()
    }

    fn push_text(&mut self, text: &str) {
        for ch in text.chars() {
            if is_word_space(ch) {
                self.flush_word();
                self.next_word_continues = false;
                continue;
            }
            // Byte-order marks and soft hyphens never render.
            if ch == '\u{FEFF}' || ch == '\u{AD}' {
                continue;
            }
            if let Some(note) = self.note.as_mut() {
                if note.number.push(ch).is_err() {
                    log::debug!(
                        "note number longer than {} bytes; truncating at {:?}",
                        FOOTNOTE_NUMBER_BYTES,
                        note.number.as_str()
                    );
                }
            }
            let mut utf8 = [0u8; 4];
            let bytes = ch.encode_utf8(&mut utf8).as_bytes();
            if self.word.len() + bytes.len() > WORD_BUFFER_BYTES {
                log::debug!(
                    "word buffer full at {} bytes; force-flushing",
                    self.word.len()
                );
                self.stats.forced_flushes += 1;
                self.flush_word();
            }
            if self.word.extend_from_slice(bytes).is_err() {
                log::debug!("dropping {} bytes that do not fit the word buffer", bytes.len());
            }
        }
    }

    fn word_style(&self) -> WordStyle {
        WordStyle::new(
            self.has(Marker::Bold),
            self.has(Marker::Italic),
            self.has(Marker::Underline),
        )
    }

    fn flush_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let style = self.word_style();
        if let Ok(text) = core::str::from_utf8(&self.word) {
            self.builder
                .add_word(text, style, self.next_word_continues);
            self.stats.words += 1;
        }
        self.word.clear();
        self.next_word_continues = false;
    }

    /// Flush pending content and the last page. Returns the page count.
    pub fn finish(mut self) -> Result<usize, FolioError> {
        self.flush_word();
        log::debug!(
            "tokenized {} words ({} forced flushes, {} placeholders)",
            self.stats.words,
            self.stats.forced_flushes,
            self.stats.placeholders
        );
        self.builder.finish()
    }
}

fn is_pagebreak(attrs: &Attributes) -> bool {
    attrs.get("role") == Some("doc-pagebreak")
        || attrs
            .get("epub:type")
            .is_some_and(|t| t.split_whitespace().any(|t| t == "pagebreak"))
}

fn is_noteref(attrs: &Attributes) -> bool {
    attrs.get("role") == Some("doc-noteref")
        || attrs
            .get("epub:type")
            .is_some_and(|t| t.split_whitespace().any(|t| t == "noteref"))
}
