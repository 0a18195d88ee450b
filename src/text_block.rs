//! Paragraph text under construction and its line breaking.
//!
//! A [`TextBlock`] collects words with per-word style flags. Words flagged
//! as continuing the previous one were split only by a style boundary and
//! are laid out glued to it, forming one unbreakable cluster.

use crate::error::FolioError;
use crate::style::{BlockStyle, TextAlign};

/// Per-word style flags. Bit values are part of the page cache format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WordStyle(u8);

impl WordStyle {
    pub const REGULAR: Self = Self(0);
    pub const BOLD: Self = Self(1);
    pub const ITALIC: Self = Self(2);
    pub const UNDERLINE: Self = Self(4);

    pub fn new(bold: bool, italic: bool, underline: bool) -> Self {
        let mut bits = 0;
        if bold {
            bits |= Self::BOLD.0;
        }
        if italic {
            bits |= Self::ITALIC.0;
        }
        if underline {
            bits |= Self::UNDERLINE.0;
        }
        Self(bits)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_bold(self) -> bool {
        self.0 & Self::BOLD.0 != 0
    }

    pub fn is_italic(self) -> bool {
        self.0 & Self::ITALIC.0 != 0
    }

    pub fn is_underline(self) -> bool {
        self.0 & Self::UNDERLINE.0 != 0
    }
}

/// Text measurement capability supplied by the rendering subsystem.
pub trait TextMeasurer: Send + Sync {
    /// Rendered width of `text` in pixels.
    fn text_width(&self, font_id: i32, text: &str, style: WordStyle) -> u16;

    /// Width of an inter-word space.
    ///
    /// Default measures a single regular space.
    fn space_width(&self, font_id: i32) -> u16 {
        self.text_width(font_id, " ", WordStyle::REGULAR)
    }

    /// Uncompressed line height in pixels.
    fn line_height(&self, font_id: i32) -> u16;
}

/// Hyphenation capability: byte offsets inside `word` where a hyphen may go.
pub trait Hyphenator: Send + Sync {
    fn break_points(&self, word: &str) -> Vec<usize>;
}

/// Monospace measurer: every char advances the same width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedAdvanceMeasurer {
    pub advance: u16,
    pub line_height: u16,
}

impl FixedAdvanceMeasurer {
    pub fn new(advance: u16, line_height: u16) -> Self {
        Self {
            advance,
            line_height,
        }
    }
}

impl Default for FixedAdvanceMeasurer {
    fn default() -> Self {
        Self::new(10, 20)
    }
}

impl TextMeasurer for FixedAdvanceMeasurer {
    fn text_width(&self, _font_id: i32, text: &str, _style: WordStyle) -> u16 {
        let chars = text.chars().count().min(u16::MAX as usize) as u16;
        chars.saturating_mul(self.advance)
    }

    fn line_height(&self, _font_id: i32) -> u16 {
        self.line_height
    }
}

/// One positioned word in a laid-out line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineWord {
    pub text: String,
    /// Offset from the line's left edge.
    pub x: u16,
    pub style: WordStyle,
}

/// A laid-out line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextLine {
    pub words: Vec<LineWord>,
    pub alignment: TextAlign,
}

impl TextLine {
    /// Words joined with single spaces (continuation parts are not rejoined).
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for (i, word) in self.words.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&word.text);
        }
        out
    }
}

/// Inputs for breaking a block into lines.
#[derive(Clone, Copy)]
pub struct LineContext<'a> {
    pub measurer: &'a dyn TextMeasurer,
    pub hyphenator: Option<&'a dyn Hyphenator>,
    pub font_id: i32,
    /// Available width for the block's lines.
    pub width: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Word {
    text: String,
    style: WordStyle,
    continues: bool,
}

/// Word range `[start, end)` laid out as one unbreakable unit.
#[derive(Clone, Copy, Debug)]
struct Cluster {
    start: usize,
    end: usize,
    width: u32,
}

/// Styled words waiting to be broken into lines.
#[derive(Clone, Debug, Default)]
pub struct TextBlock {
    words: Vec<Word>,
    style: BlockStyle,
    indent_pending: bool,
}

impl TextBlock {
    pub fn new(style: BlockStyle) -> Self {
        Self {
            words: Vec::new(),
            style,
            indent_pending: true,
        }
    }

    pub fn style(&self) -> &BlockStyle {
        &self.style
    }

    pub fn set_style(&mut self, style: BlockStyle) {
        self.style = style;
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Append a word. Empty text is ignored.
    pub fn add_word(&mut self, text: &str, style: WordStyle, continues: bool) {
        if text.is_empty() {
            return;
        }
        self.words.push(Word {
            text: text.to_string(),
            style,
            continues,
        });
    }

    /// Visual words with continuation parts rejoined.
    pub fn logical_words(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for word in &self.words {
            match out.last_mut() {
                Some(last) if word.continues => last.push_str(&word.text),
                _ => out.push(word.text.clone()),
            }
        }
        out
    }

    /// Per-part view `(text, style, continues)` for inspection.
    pub fn parts(&self) -> impl Iterator<Item = (&str, WordStyle, bool)> {
        self.words
            .iter()
            .map(|w| (w.text.as_str(), w.style, w.continues))
    }

    fn first_line_indent(&self) -> u16 {
        let indentable = matches!(
            self.style.alignment,
            TextAlign::None | TextAlign::Left | TextAlign::Justify
        );
        if self.indent_pending && indentable && self.style.text_indent > 0 {
            self.style.text_indent as u16
        } else {
            0
        }
    }

    fn measure(&self, ctx: &LineContext<'_>) -> (Vec<u16>, Vec<Cluster>) {
        let widths: Vec<u16> = self
            .words
            .iter()
            .map(|w| ctx.measurer.text_width(ctx.font_id, &w.text, w.style))
            .collect();
        let mut clusters: Vec<Cluster> = Vec::with_capacity(self.words.len());
        for (i, word) in self.words.iter().enumerate() {
            match clusters.last_mut() {
                Some(cluster) if word.continues => {
                    cluster.end = i + 1;
                    cluster.width += u32::from(widths[i]);
                }
                _ => clusters.push(Cluster {
                    start: i,
                    end: i + 1,
                    width: u32::from(widths[i]),
                }),
            }
        }
        (widths, clusters)
    }

    /// Break into lines and hand each to `emit`.
    ///
    /// With `include_last_line == false` the final line's words stay in the
    /// block so later text can still flow into it.
    pub fn layout_lines<F>(
        &mut self,
        ctx: &LineContext<'_>,
        include_last_line: bool,
        mut emit: F,
    ) -> Result<(), FolioError>
    where
        F: FnMut(TextLine) -> Result<(), FolioError>,
    {
        if self.words.is_empty() {
            return Ok(());
        }
        let space = u32::from(ctx.measurer.space_width(ctx.font_id));
        let indent = self.first_line_indent();
        let (mut widths, mut clusters) = self.measure(ctx);

        let lines = match ctx.hyphenator {
            Some(hyphenator) => self.break_greedy_hyphenated(
                ctx,
                hyphenator,
                space,
                indent,
                &mut widths,
                &mut clusters,
            ),
            None => break_min_raggedness(&clusters, u32::from(ctx.width), indent, space),
        };

        let emit_count = if include_last_line {
            lines.len()
        } else {
            lines.len().saturating_sub(1)
        };
        if emit_count == 0 {
            return Ok(());
        }

        for (line_index, &(first, last)) in lines.iter().take(emit_count).enumerate() {
            let is_first = line_index == 0;
            let is_last = include_last_line && line_index + 1 == lines.len();
            let line = self.position_line(
                &clusters[first..=last],
                &widths,
                u32::from(ctx.width),
                if is_first { indent } else { 0 },
                space,
                is_last,
            );
            emit(line)?;
        }

        let consumed_words = match lines.get(emit_count) {
            Some(&(first, _)) => clusters[first].start,
            None => self.words.len(),
        };
        self.words.drain(..consumed_words);
        self.indent_pending = false;
        Ok(())
    }

    fn position_line(
        &self,
        clusters: &[Cluster],
        widths: &[u16],
        width: u32,
        indent: u16,
        space: u32,
        is_last: bool,
    ) -> TextLine {
        let available = width.saturating_sub(u32::from(indent));
        let total: u32 = clusters.iter().map(|c| c.width).sum();
        let gaps = clusters.len().saturating_sub(1) as u32;
        let spare = available.saturating_sub(total);
        let natural_spare = spare.saturating_sub(gaps * space);

        let mut spacing = space;
        if self.style.alignment == TextAlign::Justify && !is_last && gaps >= 1 {
            spacing = spare / gaps;
        }
        let mut x = u32::from(indent)
            + match self.style.alignment {
                TextAlign::Right => natural_spare,
                TextAlign::Center => natural_spare / 2,
                _ => 0,
            };

        let mut words = Vec::with_capacity(clusters.iter().map(|c| c.end - c.start).sum());
        for cluster in clusters {
            for i in cluster.start..cluster.end {
                let word = &self.words[i];
                words.push(LineWord {
                    text: word.text.clone(),
                    x: x.min(u32::from(u16::MAX)) as u16,
                    style: word.style,
                });
                x += u32::from(widths[i]);
            }
            x += spacing;
        }
        TextLine {
            words,
            alignment: self.style.alignment,
        }
    }

    /// Fill lines greedily, hyphenating the first single-part word that
    /// overflows a line when a break point leaves its head fitting.
    fn break_greedy_hyphenated(
        &mut self,
        ctx: &LineContext<'_>,
        hyphenator: &dyn Hyphenator,
        space: u32,
        indent: u16,
        widths: &mut Vec<u16>,
        clusters: &mut Vec<Cluster>,
    ) -> Vec<(usize, usize)> {
        let mut lines = Vec::new();
        let mut line_start = 0usize;
        let mut used = 0u32;
        let mut i = 0usize;
        while i < clusters.len() {
            let available = if lines.is_empty() {
                u32::from(ctx.width).saturating_sub(u32::from(indent))
            } else {
                u32::from(ctx.width)
            };
            let needed = if i == line_start {
                clusters[i].width
            } else {
                used + space + clusters[i].width
            };
            if needed <= available {
                used = needed;
                i += 1;
                continue;
            }

            let remaining = if i == line_start {
                available
            } else {
                available.saturating_sub(used + space)
            };
            if self.try_hyphenate(ctx, hyphenator, i, remaining, widths, clusters) {
                lines.push((line_start, i));
                i += 1;
                line_start = i;
                used = 0;
            } else if i == line_start {
                // Wider than a full line and unbreakable: give it its own line.
                lines.push((i, i));
                i += 1;
                line_start = i;
                used = 0;
            } else {
                lines.push((line_start, i - 1));
                line_start = i;
                used = 0;
            }
        }
        if line_start < clusters.len() {
            lines.push((line_start, clusters.len() - 1));
        }
        lines
    }

    fn try_hyphenate(
        &mut self,
        ctx: &LineContext<'_>,
        hyphenator: &dyn Hyphenator,
        cluster_index: usize,
        remaining: u32,
        widths: &mut Vec<u16>,
        clusters: &mut Vec<Cluster>,
    ) -> bool {
        let cluster = clusters[cluster_index];
        if cluster.end - cluster.start != 1 {
            return false;
        }
        let word_index = cluster.start;
        let text = self.words[word_index].text.clone();
        let style = self.words[word_index].style;

        let mut points = hyphenator.break_points(&text);
        points.sort_unstable();
        let mut chosen: Option<(String, u16)> = None;
        for &point in points.iter().rev() {
            if point == 0 || point >= text.len() || !text.is_char_boundary(point) {
                continue;
            }
            let mut head = String::with_capacity(point + 1);
            head.push_str(&text[..point]);
            head.push('-');
            let head_width = ctx.measurer.text_width(ctx.font_id, &head, style);
            if u32::from(head_width) <= remaining {
                chosen = Some((head, head_width));
                break;
            }
        }
        let Some((head, head_width)) = chosen else {
            return false;
        };
        let split = head.len() - 1;
        let tail = text[split..].to_string();
        let tail_width = ctx.measurer.text_width(ctx.font_id, &tail, style);

        self.words[word_index].text = head;
        widths[word_index] = head_width;
        clusters[cluster_index].width = u32::from(head_width);

        self.words.insert(
            word_index + 1,
            Word {
                text: tail,
                style,
                continues: false,
            },
        );
        widths.insert(word_index + 1, tail_width);
        for later in clusters.iter_mut().skip(cluster_index + 1) {
            later.start += 1;
            later.end += 1;
        }
        clusters.insert(
            cluster_index + 1,
            Cluster {
                start: word_index + 1,
                end: word_index + 2,
                width: u32::from(tail_width),
            },
        );
        true
    }
}

/// Minimum total squared slack over all lines but the last.
///
/// Returns inclusive cluster index ranges, one per line.
fn break_min_raggedness(
    clusters: &[Cluster],
    width: u32,
    indent: u16,
    space: u32,
) -> Vec<(usize, usize)> {
    let n = clusters.len();
    if n == 0 {
        return Vec::new();
    }
    let mut cost = vec![0u64; n + 1];
    let mut next = vec![0usize; n];
    for i in (0..n).rev() {
        let available = if i == 0 {
            width.saturating_sub(u32::from(indent))
        } else {
            width
        };
        let mut best = u64::MAX;
        let mut best_end = i;
        let mut len = 0u32;
        for j in i..n {
            len = if j == i {
                clusters[j].width
            } else {
                len + space + clusters[j].width
            };
            if len > available && j > i {
                break;
            }
            let line_cost = if j == n - 1 {
                0
            } else {
                let slack = u64::from(available.saturating_sub(len));
                (slack * slack).saturating_add(cost[j + 1])
            };
            if line_cost < best {
                best = line_cost;
                best_end = j;
            }
            if len > available {
                break;
            }
        }
        cost[i] = best;
        next[i] = best_end;
    }

    let mut lines = Vec::new();
    let mut i = 0;
    while i < n {
        let end = next[i];
        lines.push((i, end));
        i = end + 1;
    }
    lines
}
