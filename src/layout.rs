//! Block-to-page layout.
//!
//! [`PageBuilder`] owns the block under construction and the page being
//! filled. Page boundaries come purely from accumulated vertical extent:
//! a line that would cross the viewport bottom starts a new page.

use crate::config::{ParseLimits, RenderParams};
use crate::engine::CancelToken;
use crate::error::{ErrorPhase, FolioError};
use crate::page::{FootnoteRef, Page};
use crate::style::BlockStyle;
use crate::text_block::{Hyphenator, LineContext, TextBlock, TextLine, TextMeasurer, WordStyle};

/// Receives each page as soon as it is complete.
pub trait PageSink {
    fn complete_page(&mut self, page: Page) -> Result<(), FolioError>;
}

impl<F> PageSink for F
where
    F: FnMut(Page) -> Result<(), FolioError>,
{
    fn complete_page(&mut self, page: Page) -> Result<(), FolioError> {
        self(page)
    }
}

/// Collects pages in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub pages: Vec<Page>,
}

impl PageSink for VecSink {
    fn complete_page(&mut self, page: Page) -> Result<(), FolioError> {
        self.pages.push(page);
        Ok(())
    }
}

pub struct PageBuilder<'a> {
    measurer: &'a dyn TextMeasurer,
    hyphenator: Option<&'a dyn Hyphenator>,
    params: RenderParams,
    limits: ParseLimits,
    cancel: &'a dyn CancelToken,
    sink: &'a mut dyn PageSink,
    block: TextBlock,
    page: Page,
    next_y: i32,
    /// Set once the current block's top margin and padding are on the page.
    top_applied: bool,
    line_height: i32,
    pages_emitted: usize,
    pending_notes: Vec<FootnoteRef>,
}

impl<'a> PageBuilder<'a> {
    pub fn new(
        measurer: &'a dyn TextMeasurer,
        hyphenator: Option<&'a dyn Hyphenator>,
        params: RenderParams,
        limits: ParseLimits,
        cancel: &'a dyn CancelToken,
        sink: &'a mut dyn PageSink,
    ) -> Self {
        let raw = f32::from(measurer.line_height(params.font_id));
        let line_height = ((raw * params.line_compression) as i32).max(1);
        let hyphenator = if params.hyphenation_enabled {
            hyphenator
        } else {
            None
        };
        Self {
            measurer,
            hyphenator,
            params,
            limits,
            cancel,
            sink,
            block: TextBlock::new(BlockStyle::default()),
            page: Page::new(),
            next_y: 0,
            top_applied: false,
            line_height,
            pages_emitted: 0,
            pending_notes: Vec::new(),
        }
    }

    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    /// Compression-scaled line height.
    pub fn line_height(&self) -> i32 {
        self.line_height
    }

    /// Pixel size of `1em` for stylesheet lengths.
    pub fn em_px(&self) -> f32 {
        f32::from(self.measurer.line_height(self.params.font_id))
    }

    pub fn pages_emitted(&self) -> usize {
        self.pages_emitted
    }

    pub fn current_style(&self) -> BlockStyle {
        *self.block.style()
    }

    pub fn block(&self) -> &TextBlock {
        &self.block
    }

    pub fn add_word(&mut self, text: &str, style: WordStyle, continues: bool) {
        self.block.add_word(text, style, continues);
    }

    /// Attach a note reference to the page holding the end of the current block.
    pub fn add_footnote(&mut self, note: FootnoteRef) {
        self.pending_notes.push(note);
    }

    /// Begin a block. An empty current block absorbs the style instead.
    pub fn start_new_text_block(&mut self, style: BlockStyle) -> Result<(), FolioError> {
        if self.block.is_empty() {
            let combined = self.block.style().combined_with(&style);
            self.block.set_style(combined);
            return Ok(());
        }
        self.make_pages()?;
        self.block = TextBlock::new(style);
        Ok(())
    }

    /// Zero-content block one line tall.
    pub fn start_blank_line(&mut self) -> Result<(), FolioError> {
        let height = self.line_height.min(i32::from(i16::MAX)) as i16;
        self.start_new_text_block(BlockStyle::default().with_margin_top(height))
    }

    /// Lay out all but the last line once a block grows past the flush threshold.
    pub fn relieve_long_block(&mut self) -> Result<(), FolioError> {
        if self.block.word_count() <= self.limits.block_flush_words {
            return Ok(());
        }
        log::debug!(
            "laying out {} buffered words early",
            self.block.word_count()
        );
        self.apply_top_offset();
        self.layout_block(false)
    }

    fn apply_top_offset(&mut self) {
        if !self.top_applied {
            self.next_y += self.block.style().top_offset().max(0);
            self.top_applied = true;
        }
    }

    fn effective_width(&self, style: &BlockStyle) -> u16 {
        let viewport = i32::from(self.params.viewport_width);
        let inset = style.horizontal_inset().max(0);
        if inset < viewport {
            (viewport - inset) as u16
        } else {
            self.params.viewport_width
        }
    }

    fn layout_block(&mut self, include_last_line: bool) -> Result<(), FolioError> {
        let mut block = std::mem::take(&mut self.block);
        let style = *block.style();
        let ctx = LineContext {
            measurer: self.measurer,
            hyphenator: self.hyphenator,
            font_id: self.params.font_id,
            width: self.effective_width(&style),
        };
        let x = style.left_inset().clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let result =
            block.layout_lines(&ctx, include_last_line, |line| self.add_line_to_page(x, line));
        self.block = block;
        result
    }

    /// Finalize the current block into lines on pages.
    pub fn make_pages(&mut self) -> Result<(), FolioError> {
        let style = *self.block.style();
        self.apply_top_offset();
        self.layout_block(true)?;
        self.top_applied = false;
        self.next_y += style.bottom_offset().max(0);
        if self.params.extra_paragraph_spacing {
            self.next_y += self.line_height / 2;
        }
        self.attach_pending_notes();
        Ok(())
    }

    fn attach_pending_notes(&mut self) {
        for note in self.pending_notes.drain(..) {
            if !self.page.add_footnote(note) {
                log::debug!("page footnote list full; dropping note reference");
            }
        }
    }

    fn add_line_to_page(&mut self, x: i16, line: TextLine) -> Result<(), FolioError> {
        if self.next_y + self.line_height > i32::from(self.params.viewport_height) {
            if self.page.is_empty() {
                self.next_y = 0;
            } else {
                self.emit_page()?;
            }
        }
        let y = self.next_y.min(i32::from(i16::MAX)) as i16;
        self.page.push_line(x, y, line);
        self.next_y += self.line_height;
        Ok(())
    }

    fn emit_page(&mut self) -> Result<(), FolioError> {
        if self.cancel.is_cancelled() {
            return Err(FolioError::Cancelled);
        }
        if self.pages_emitted >= u16::MAX as usize {
            return Err(FolioError::too_large(
                ErrorPhase::Layout,
                "section_pages",
                self.pages_emitted + 1,
                u16::MAX as usize,
            ));
        }
        let page = std::mem::take(&mut self.page);
        self.sink.complete_page(page)?;
        self.pages_emitted += 1;
        self.next_y = 0;
        Ok(())
    }

    /// Flush the last block and hand over the last page.
    ///
    /// An empty section still produces one (empty) page.
    pub fn finish(mut self) -> Result<usize, FolioError> {
        self.make_pages()?;
        if !self.page.is_empty() || self.pages_emitted == 0 || !self.page.footnotes.is_empty() {
            self.emit_page()?;
        }
        Ok(self.pages_emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NeverCancel;
    use crate::style::TextAlign;
    use crate::text_block::FixedAdvanceMeasurer;

    fn params(width: u16, height: u16) -> RenderParams {
        RenderParams::for_display(width, height)
            .with_extra_paragraph_spacing(false)
            .with_paragraph_alignment(TextAlign::Left)
    }

    fn run<F>(params: RenderParams, body: F) -> Vec<Page>
    where
        F: FnOnce(&mut PageBuilder<'_>) -> Result<(), FolioError>,
    {
        let measurer = FixedAdvanceMeasurer::new(10, 20);
        let mut sink = VecSink::default();
        let mut builder = PageBuilder::new(
            &measurer,
            None,
            params,
            ParseLimits::default(),
            &NeverCancel,
            &mut sink,
        );
        body(&mut builder).unwrap();
        builder.finish().unwrap();
        sink.pages
    }

    fn paragraph(builder: &mut PageBuilder<'_>, words: usize) -> Result<(), FolioError> {
        builder.start_new_text_block(BlockStyle::aligned(TextAlign::Left))?;
        for _ in 0..words {
            builder.add_word("word", WordStyle::REGULAR, false);
        }
        Ok(())
    }

    #[test]
    fn pages_never_exceed_viewport_height() {
        for height in [20u16, 45, 60, 99, 200] {
            let pages = run(params(100, height), |b| {
                for _ in 0..7 {
                    paragraph(b, 9)?;
                }
                Ok(())
            });
            for page in &pages {
                assert!(!page.is_empty());
                let bottom = page.lines.iter().map(|l| l.y as i32 + 20).max().unwrap();
                assert!(bottom <= height as i32, "height {} bottom {}", height, bottom);
            }
        }
    }

    #[test]
    fn empty_document_yields_single_empty_page() {
        let pages = run(params(100, 100), |_| Ok(()));
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_empty());
    }

    #[test]
    fn line_taller_than_viewport_is_placed_alone() {
        let pages = run(params(100, 10), |b| paragraph(b, 4));
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.lines.len() == 1 && p.lines[0].y == 0));
    }

    #[test]
    fn empty_block_absorbs_next_style() {
        let pages = run(params(200, 400), |b| {
            b.start_new_text_block(BlockStyle::default().with_margin_left(30))?;
            b.start_new_text_block(BlockStyle::aligned(TextAlign::Right))?;
            b.add_word("x", WordStyle::REGULAR, false);
            Ok(())
        });
        let line = &pages[0].lines[0];
        assert_eq!(line.x, 30);
        assert_eq!(line.line.alignment, TextAlign::Right);
    }

    #[test]
    fn blank_line_offsets_following_block_by_one_line() {
        let pages = run(params(200, 400), |b| {
            paragraph(b, 1)?;
            b.start_blank_line()?;
            paragraph(b, 1)
        });
        let ys: Vec<i16> = pages[0].lines.iter().map(|l| l.y).collect();
        assert_eq!(ys, vec![0, 40]);
    }

    #[test]
    fn extra_paragraph_spacing_adds_half_line() {
        let pages = run(params(200, 400).with_extra_paragraph_spacing(true), |b| {
            paragraph(b, 1)?;
            paragraph(b, 1)
        });
        let ys: Vec<i16> = pages[0].lines.iter().map(|l| l.y).collect();
        assert_eq!(ys, vec![0, 30]);
    }

    #[test]
    fn insets_narrow_the_line_and_shift_x() {
        let pages = run(params(100, 400), |b| {
            let style = BlockStyle {
                margin_left: 20,
                padding_right: 20,
                ..BlockStyle::aligned(TextAlign::Left)
            };
            b.start_new_text_block(style)?;
            for _ in 0..3 {
                b.add_word("abc", WordStyle::REGULAR, false);
            }
            Ok(())
        });
        // 60px available: "abc abc" (70px) no longer fits on one line.
        assert_eq!(pages[0].lines.len(), 3);
        assert!(pages[0].lines.iter().all(|l| l.x == 20));
    }

    #[test]
    fn long_block_is_relieved_without_losing_words() {
        let limits = ParseLimits {
            block_flush_words: 10,
            ..ParseLimits::default()
        };
        let measurer = FixedAdvanceMeasurer::new(10, 20);
        let mut sink = VecSink::default();
        let mut builder = PageBuilder::new(
            &measurer,
            None,
            params(100, 1000),
            limits,
            &NeverCancel,
            &mut sink,
        );
        builder
            .start_new_text_block(BlockStyle::aligned(TextAlign::Left))
            .unwrap();
        for i in 0..25 {
            builder.add_word(&format!("w{}", i % 10), WordStyle::REGULAR, false);
            builder.relieve_long_block().unwrap();
            assert!(builder.block().word_count() <= 11);
        }
        builder.finish().unwrap();
        let total: usize = sink.pages[0]
            .lines
            .iter()
            .map(|l| l.line.words.len())
            .sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn relieved_block_keeps_top_margin_above_its_first_line() {
        let limits = ParseLimits {
            block_flush_words: 4,
            ..ParseLimits::default()
        };
        let measurer = FixedAdvanceMeasurer::new(10, 20);
        let mut sink = VecSink::default();
        let mut builder = PageBuilder::new(
            &measurer,
            None,
            params(40, 1000),
            limits,
            &NeverCancel,
            &mut sink,
        );
        builder
            .start_new_text_block(BlockStyle::aligned(TextAlign::Left).with_margin_top(30))
            .unwrap();
        for _ in 0..12 {
            builder.add_word("ab", WordStyle::REGULAR, false);
            builder.relieve_long_block().unwrap();
        }
        builder.finish().unwrap();
        let ys: Vec<i16> = sink.pages[0].lines.iter().map(|l| l.y).collect();
        // One word per line; the margin sits above the first line only.
        let expected: Vec<i16> = (0..12).map(|i| 30 + i * 20).collect();
        assert_eq!(ys, expected);
    }

    #[test]
    fn footnotes_land_on_page_of_block_end() {
        let pages = run(params(200, 400), |b| {
            paragraph(b, 2)?;
            b.add_footnote(FootnoteRef::new("1", "#n1"));
            paragraph(b, 1)
        });
        assert_eq!(pages[0].footnotes.len(), 1);
        assert_eq!(pages[0].footnotes[0].href.as_str(), "#n1");
    }

    #[test]
    fn cancellation_is_checked_per_page() {
        use std::sync::atomic::AtomicBool;
        let cancel = AtomicBool::new(true);
        let measurer = FixedAdvanceMeasurer::new(10, 20);
        let mut sink = VecSink::default();
        let mut builder = PageBuilder::new(
            &measurer,
            None,
            params(100, 20),
            ParseLimits::default(),
            &cancel,
            &mut sink,
        );
        paragraph(&mut builder, 40).unwrap();
        let err = builder.make_pages().unwrap_err();
        assert!(matches!(err, FolioError::Cancelled));
    }
}
