//! Bounded stylesheet engine.
//!
//! Only the subset of CSS a reflowing reader needs: selectors are kept as
//! normalized strings, lookups are exact (`tag`, `.class`, `tag.class`) and
//! the rule table is capped. When the table is full a new selector is only
//! admitted if its [`selector_priority`] is strictly higher than the current
//! minimum, which is then evicted.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use smallvec::SmallVec;

use crate::error::{ErrorPhase, FolioError};
use crate::serialization::{
    read_f32, read_short_string, read_u16, read_u8, write_f32, write_short_string, write_u16,
    write_u8,
};
use crate::style::{
    CssLength, CssStyle, CssUnit, DefinedProps, FontStyle, FontWeight, TextAlign, TextDecoration,
};

/// Stylesheet cache blob format version.
pub const CSS_CACHE_VERSION: u8 = 2;

/// Hard bounds for stylesheet parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StylesheetLimits {
    /// Maximum rules held in the table.
    pub max_rules: usize,
    /// Maximum stylesheet size in bytes; larger input is rejected.
    pub max_bytes: usize,
    /// Read size for streaming loads.
    pub chunk_size: usize,
    /// Unconsumed buffer size at which a streaming load stops early.
    pub buffer_ceiling: usize,
}

impl Default for StylesheetLimits {
    fn default() -> Self {
        let chunk_size = 2048;
        Self {
            max_rules: 300,
            max_bytes: 200 * 1024,
            chunk_size,
            buffer_ceiling: chunk_size * 4,
        }
    }
}

/// Counters from the most recent load. Anomalies are counted, never raised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CssParseStats {
    /// Rule blocks seen (one per `selector-group { ... }`).
    pub total_rules_processed: usize,
    /// Selectors stored or merged.
    pub rules_added: usize,
    /// Selectors refused because the table was full.
    pub rules_ignored_low_priority: usize,
    /// Rule blocks with no recognized property.
    pub rules_ignored_no_properties: usize,
    /// Rules removed to make room.
    pub rules_evicted: usize,
    /// A streaming load stopped before the end of input.
    pub stopped_early: bool,
}

/// Eviction rank of a selector; higher survives longer.
///
/// Anything with a combinator, pseudo-class or attribute test ranks lowest
/// regardless of its real specificity.
pub fn selector_priority(selector: &str) -> u8 {
    if selector.is_empty() {
        return 0;
    }
    let mut has_space = false;
    let mut has_dot = false;
    for c in selector.bytes() {
        match c {
            b' ' => has_space = true,
            b'.' => has_dot = true,
            b'>' | b'+' | b'~' | b':' | b'[' => return 1,
            _ => {}
        }
    }
    if has_space {
        1
    } else if selector.starts_with('.') {
        7
    } else if has_dot {
        9
    } else {
        5
    }
}

fn is_css_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0c)
}

/// Lowercase and collapse whitespace runs to one space, trimmed.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = true;
    for c in text.chars() {
        if c.is_ascii() && is_css_whitespace(c as u8) {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c.to_ascii_lowercase());
            in_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Parse a declaration block (`a: b; c: d`) into a sparse style.
pub fn parse_declarations(block: &str) -> CssStyle {
    let mut style = CssStyle::default();
    for declaration in block.split(';') {
        let Some((name, value)) = declaration.split_once(':') else {
            continue;
        };
        let name: String = name
            .chars()
            .filter(|c| !(c.is_ascii() && is_css_whitespace(*c as u8)))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let value = normalize(value);
        if name.is_empty() || value.is_empty() {
            continue;
        }
        apply_declaration(&mut style, &name, &value);
    }
    style
}

fn length_or_zero(value: &str) -> CssLength {
    CssLength::parse(value).unwrap_or_default()
}

fn apply_declaration(style: &mut CssStyle, name: &str, value: &str) {
    match name {
        "text-align" => style.set_text_align(TextAlign::parse(value)),
        "font-style" => style.set_font_style(FontStyle::parse(value)),
        "font-weight" => style.set_font_weight(FontWeight::parse(value)),
        "text-decoration" | "text-decoration-line" => {
            style.set_decoration(TextDecoration::parse(value))
        }
        "text-indent" => style.set_text_indent(length_or_zero(value)),
        "margin-top" => style.set_box_side(DefinedProps::MARGIN_TOP, length_or_zero(value)),
        "margin-bottom" => style.set_box_side(DefinedProps::MARGIN_BOTTOM, length_or_zero(value)),
        "margin-left" => style.set_box_side(DefinedProps::MARGIN_LEFT, length_or_zero(value)),
        "margin-right" => style.set_box_side(DefinedProps::MARGIN_RIGHT, length_or_zero(value)),
        "padding-top" => style.set_box_side(DefinedProps::PADDING_TOP, length_or_zero(value)),
        "padding-bottom" => {
            style.set_box_side(DefinedProps::PADDING_BOTTOM, length_or_zero(value))
        }
        "padding-left" => style.set_box_side(DefinedProps::PADDING_LEFT, length_or_zero(value)),
        "padding-right" => style.set_box_side(DefinedProps::PADDING_RIGHT, length_or_zero(value)),
        "margin" => apply_box_shorthand(
            style,
            value,
            [
                DefinedProps::MARGIN_TOP,
                DefinedProps::MARGIN_RIGHT,
                DefinedProps::MARGIN_BOTTOM,
                DefinedProps::MARGIN_LEFT,
            ],
        ),
        "padding" => apply_box_shorthand(
            style,
            value,
            [
                DefinedProps::PADDING_TOP,
                DefinedProps::PADDING_RIGHT,
                DefinedProps::PADDING_BOTTOM,
                DefinedProps::PADDING_LEFT,
            ],
        ),
        _ => {}
    }
}

/// `[top, right, bottom, left]` bits; 1-4 values expand the CSS way.
fn apply_box_shorthand(style: &mut CssStyle, value: &str, sides: [u16; 4]) {
    let values: SmallVec<[CssLength; 4]> = value.split(' ').map(length_or_zero).collect();
    let (top, right, bottom, left) = match values.as_slice() {
        [all] => (*all, *all, *all, *all),
        [v, h] => (*v, *h, *v, *h),
        [t, h, b] => (*t, *h, *b, *h),
        [t, r, b, l, ..] => (*t, *r, *b, *l),
        [] => return,
    };
    let [t_bit, r_bit, b_bit, l_bit] = sides;
    style.set_box_side(t_bit, top);
    style.set_box_side(r_bit, right);
    style.set_box_side(b_bit, bottom);
    style.set_box_side(l_bit, left);
}

/// Outcome of scanning the clean buffer for the next rule.
#[derive(Debug, PartialEq, Eq)]
enum Extract {
    /// `selector` and `body` byte ranges; cursor moves to `next`.
    Rule {
        selector: (usize, usize),
        body: (usize, usize),
        next: usize,
    },
    /// Input ends inside a construct; wait for more bytes without moving.
    NeedMore { consumed: usize },
    /// Nothing more can be extracted.
    End { consumed: usize },
}

/// Scan from `pos` for the next regular rule, skipping whitespace and
/// at-rules. Never moves past an incomplete construct unless `at_eof`.
fn extract_next_rule(buf: &[u8], mut pos: usize, at_eof: bool) -> Extract {
    let incomplete = |consumed: usize| {
        if at_eof {
            Extract::End { consumed }
        } else {
            Extract::NeedMore { consumed }
        }
    };
    loop {
        while pos < buf.len() && is_css_whitespace(buf[pos]) {
            pos += 1;
        }
        if pos >= buf.len() {
            return incomplete(pos);
        }
        if buf[pos] != b'@' {
            break;
        }
        match skip_at_rule(buf, pos) {
            Some(next) => pos = next,
            None if at_eof => return Extract::End { consumed: buf.len() },
            None => return Extract::NeedMore { consumed: pos },
        }
    }

    let Some(brace) = buf[pos..].iter().position(|&c| c == b'{').map(|i| pos + i) else {
        return incomplete(pos);
    };
    let body_start = brace + 1;
    let mut depth = 1usize;
    let mut end = body_start;
    while end < buf.len() {
        match buf[end] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Extract::Rule {
                        selector: (pos, brace),
                        body: (body_start, end),
                        next: end + 1,
                    };
                }
            }
            _ => {}
        }
        end += 1;
    }
    incomplete(pos)
}

/// End of the at-rule starting at `start`, or `None` if it is not terminated.
fn skip_at_rule(buf: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 1;
    while pos < buf.len() && (buf[pos].is_ascii_alphanumeric() || buf[pos] == b'-') {
        pos += 1;
    }
    let mut depth = 0i32;
    while pos < buf.len() {
        match buf[pos] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth <= 0 {
                    return Some(pos + 1);
                }
            }
            b';' if depth == 0 => return Some(pos + 1),
            _ => {}
        }
        pos += 1;
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommentState {
    Normal,
    Slash,
    InComment,
    InCommentStar,
}

/// Incremental comment stripper; bytes inside an open comment never reach
/// the clean buffer, so they cannot be parsed as rules.
#[derive(Debug)]
struct CommentFilter {
    state: CommentState,
}

impl CommentFilter {
    fn new() -> Self {
        Self {
            state: CommentState::Normal,
        }
    }

    fn feed(&mut self, input: &[u8], clean: &mut Vec<u8>) {
        for &c in input {
            self.state = match (self.state, c) {
                (CommentState::Normal, b'/') => CommentState::Slash,
                (CommentState::Normal, _) => {
                    clean.push(c);
                    CommentState::Normal
                }
                (CommentState::Slash, b'*') => CommentState::InComment,
                (CommentState::Slash, b'/') => {
                    clean.push(b'/');
                    CommentState::Slash
                }
                (CommentState::Slash, _) => {
                    clean.push(b'/');
                    clean.push(c);
                    CommentState::Normal
                }
                (CommentState::InComment, b'*') => CommentState::InCommentStar,
                (CommentState::InComment, _) => CommentState::InComment,
                (CommentState::InCommentStar, b'/') => CommentState::Normal,
                (CommentState::InCommentStar, b'*') => CommentState::InCommentStar,
                (CommentState::InCommentStar, _) => CommentState::InComment,
            };
        }
    }

    /// Flush a trailing `/`; an unterminated comment swallows the rest.
    fn finish(&mut self, clean: &mut Vec<u8>) {
        if self.state == CommentState::Slash {
            clean.push(b'/');
        }
        self.state = CommentState::Normal;
    }

    fn in_comment(&self) -> bool {
        matches!(
            self.state,
            CommentState::InComment | CommentState::InCommentStar
        )
    }
}

/// Capacity-bounded rule table with cascade lookups.
#[derive(Clone, Debug, Default)]
pub struct Stylesheet {
    rules: BTreeMap<String, CssStyle>,
    lowest: Option<(u8, String)>,
    limits: StylesheetLimits,
    stats: CssParseStats,
}

impl Stylesheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: StylesheetLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> StylesheetLimits {
        self.limits
    }

    pub fn stats(&self) -> CssParseStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, selector: &str) -> Option<&CssStyle> {
        self.rules.get(selector)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CssStyle)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.lowest = None;
    }

    /// Parse a complete stylesheet held in memory.
    pub fn load(&mut self, css: &[u8], declared_size: usize) -> Result<(), FolioError> {
        let size = declared_size.max(css.len());
        self.check_size(size)?;
        self.begin_load();
        let mut filter = CommentFilter::new();
        let mut clean = Vec::with_capacity(css.len());
        filter.feed(css, &mut clean);
        filter.finish(&mut clean);
        self.drain_rules(&clean, true);
        self.log_stats();
        Ok(())
    }

    /// Parse a stylesheet arriving in bounded chunks.
    ///
    /// Results match [`Stylesheet::load`] on the same bytes unless a single
    /// construct outgrows `buffer_ceiling`, in which case parsing stops
    /// early and keeps what was admitted so far.
    pub fn load_streaming<R: Read>(
        &mut self,
        mut reader: R,
        declared_size: usize,
    ) -> Result<(), FolioError> {
        self.check_size(declared_size)?;
        self.begin_load();
        let chunk_size = self.limits.chunk_size.max(1);
        let mut chunk = vec![0u8; chunk_size];
        let mut clean: Vec<u8> = Vec::with_capacity(chunk_size * 2);
        let mut filter = CommentFilter::new();
        let mut total = 0usize;

        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FolioError::from(err).in_phase(ErrorPhase::Stylesheet)),
            };
            total += read;
            self.check_size(total)?;
            filter.feed(&chunk[..read], &mut clean);

            let consumed = self.drain_rules(&clean, false);
            clean.drain(..consumed);

            if clean.len() > self.limits.buffer_ceiling {
                log::warn!(
                    "stylesheet buffer {} bytes exceeds ceiling {} (in_comment={}); stopping early",
                    clean.len(),
                    self.limits.buffer_ceiling,
                    filter.in_comment()
                );
                self.stats.stopped_early = true;
                self.log_stats();
                return Ok(());
            }
        }

        filter.finish(&mut clean);
        self.drain_rules(&clean, true);
        self.log_stats();
        Ok(())
    }

    fn check_size(&self, size: usize) -> Result<(), FolioError> {
        if size > self.limits.max_bytes {
            log::warn!(
                "stylesheet too large ({} bytes > {} max), skipping",
                size,
                self.limits.max_bytes
            );
            return Err(FolioError::too_large(
                ErrorPhase::Stylesheet,
                "stylesheet_bytes",
                size,
                self.limits.max_bytes,
            ));
        }
        Ok(())
    }

    fn begin_load(&mut self) {
        self.stats = CssParseStats::default();
        self.recompute_lowest();
    }

    fn log_stats(&self) {
        log::debug!(
            "stylesheet stats: total={} added={} ignored_low_priority={} ignored_no_properties={} evicted={}",
            self.stats.total_rules_processed,
            self.stats.rules_added,
            self.stats.rules_ignored_low_priority,
            self.stats.rules_ignored_no_properties,
            self.stats.rules_evicted
        );
    }

    /// Process every complete rule in `buf`; returns bytes fully consumed.
    fn drain_rules(&mut self, buf: &[u8], at_eof: bool) -> usize {
        let mut pos = 0usize;
        loop {
            match extract_next_rule(buf, pos, at_eof) {
                Extract::Rule {
                    selector,
                    body,
                    next,
                } => {
                    let selector = String::from_utf8_lossy(&buf[selector.0..selector.1]);
                    let body = String::from_utf8_lossy(&buf[body.0..body.1]);
                    self.process_rule_block(&selector, &body);
                    pos = next;
                }
                Extract::NeedMore { consumed } | Extract::End { consumed } => return consumed,
            }
        }
    }

    fn process_rule_block(&mut self, selector_group: &str, declarations: &str) {
        self.stats.total_rules_processed += 1;
        let style = parse_declarations(declarations);
        if style.is_empty() {
            self.stats.rules_ignored_no_properties += 1;
            return;
        }
        for selector in selector_group.split(',').map(normalize) {
            if selector.is_empty() {
                continue;
            }
            self.insert_rule(selector, &style);
        }
    }

    fn insert_rule(&mut self, selector: String, style: &CssStyle) {
        if let Some(existing) = self.rules.get_mut(&selector) {
            existing.apply_over(style);
            self.stats.rules_added += 1;
            return;
        }
        let priority = selector_priority(&selector);
        if self.rules.len() >= self.limits.max_rules {
            let admitted = match &self.lowest {
                Some((lowest, _)) => priority > *lowest,
                None => false,
            };
            if !admitted {
                self.stats.rules_ignored_low_priority += 1;
                return;
            }
            self.evict_lowest();
        }
        let becomes_lowest = match &self.lowest {
            Some((lowest, _)) => priority < *lowest,
            None => true,
        };
        if becomes_lowest {
            self.lowest = Some((priority, selector.clone()));
        }
        self.rules.insert(selector, *style);
        self.stats.rules_added += 1;
    }

    fn evict_lowest(&mut self) {
        if let Some((_, selector)) = self.lowest.take() {
            self.rules.remove(&selector);
            self.stats.rules_evicted += 1;
        }
        self.recompute_lowest();
    }

    fn recompute_lowest(&mut self) {
        self.lowest = None;
        for selector in self.rules.keys() {
            let priority = selector_priority(selector);
            let lower = match &self.lowest {
                Some((lowest, _)) => priority < *lowest,
                None => true,
            };
            if lower {
                self.lowest = Some((priority, selector.clone()));
            }
        }
    }

    /// Cascade `tag`, then each `.class`, then each `tag.class`.
    pub fn resolve_style(&self, tag: &str, class_attr: &str) -> CssStyle {
        let mut result = CssStyle::default();
        let tag = normalize(tag);
        if let Some(rule) = self.rules.get(&tag) {
            result.apply_over(rule);
        }
        let classes: SmallVec<[String; 4]> = class_attr
            .split(|c: char| c.is_ascii() && is_css_whitespace(c as u8))
            .filter(|c| !c.is_empty())
            .map(normalize)
            .collect();
        let mut key = String::with_capacity(64);
        for class in &classes {
            key.clear();
            key.push('.');
            key.push_str(class);
            if let Some(rule) = self.rules.get(&key) {
                result.apply_over(rule);
            }
        }
        for class in &classes {
            key.clear();
            key.push_str(&tag);
            key.push('.');
            key.push_str(class);
            if let Some(rule) = self.rules.get(&key) {
                result.apply_over(rule);
            }
        }
        result
    }

    /// Serialize the rule table.
    pub fn save_to_cache<W: Write>(&self, out: &mut W) -> Result<(), FolioError> {
        self.write_cache(out)
            .map_err(|err| FolioError::from(err).in_phase(ErrorPhase::Stylesheet))
    }

    fn write_cache<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        write_u8(out, CSS_CACHE_VERSION)?;
        write_u16(out, self.rules.len().min(u16::MAX as usize) as u16)?;
        for (selector, style) in self.rules.iter().take(u16::MAX as usize) {
            write_short_string(out, selector)?;
            write_u8(out, style.text_align as u8)?;
            write_u8(out, style.font_style as u8)?;
            write_u8(out, style.font_weight as u8)?;
            write_u8(out, style.decoration as u8)?;
            for length in style.lengths() {
                write_f32(out, length.value)?;
                write_u8(out, length.unit as u8)?;
            }
            write_u16(out, style.defined.bits())?;
        }
        out.flush()
    }

    /// Replace the rule table with a previously saved one.
    ///
    /// Any failure leaves the table empty; the caller reparses from source.
    pub fn load_from_cache<R: Read>(&mut self, input: &mut R) -> Result<(), FolioError> {
        self.clear();
        match self.read_cache(input) {
            Ok(()) => {
                self.recompute_lowest();
                log::debug!("loaded {} stylesheet rules from cache", self.rules.len());
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    fn read_cache<R: Read>(&mut self, input: &mut R) -> Result<(), FolioError> {
        let version = read_u8(input)?;
        if version != CSS_CACHE_VERSION {
            return Err(FolioError::CacheVersionMismatch {
                found: version,
                expected: CSS_CACHE_VERSION,
            });
        }
        let count = read_u16(input)? as usize;
        if count > self.limits.max_rules {
            return Err(FolioError::corrupt(format!(
                "stylesheet cache holds {} rules, limit is {}",
                count, self.limits.max_rules
            )));
        }
        for _ in 0..count {
            let selector = read_short_string(input)?;
            let mut style = CssStyle {
                text_align: TextAlign::from_u8(read_u8(input)?)
                    .ok_or_else(|| FolioError::corrupt("invalid text-align byte"))?,
                font_style: FontStyle::from_u8(read_u8(input)?)
                    .ok_or_else(|| FolioError::corrupt("invalid font-style byte"))?,
                font_weight: FontWeight::from_u8(read_u8(input)?)
                    .ok_or_else(|| FolioError::corrupt("invalid font-weight byte"))?,
                decoration: TextDecoration::from_u8(read_u8(input)?)
                    .ok_or_else(|| FolioError::corrupt("invalid decoration byte"))?,
                ..CssStyle::default()
            };
            let mut lengths = [CssLength::ZERO; 9];
            for slot in &mut lengths {
                let value = read_f32(input)?;
                let unit = CssUnit::from_u8(read_u8(input)?)
                    .ok_or_else(|| FolioError::corrupt("invalid length unit byte"))?;
                *slot = CssLength::new(value, unit);
            }
            style.set_lengths(lengths);
            style.defined = DefinedProps::from_bits(read_u16(input)?);
            self.rules.insert(selector, style);
        }
        Ok(())
    }
}

/// Parse an inline `style=""` attribute value.
pub fn parse_inline_style(value: &str) -> CssStyle {
    parse_declarations(value)
}
