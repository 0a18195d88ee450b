//! Render configuration and parse bounds.

use crate::style::TextAlign;

/// Word buffer capacity in bytes; longer runs are force-flushed as separate words.
pub const WORD_BUFFER_BYTES: usize = 200;

/// Rendering configuration. Doubles as the page cache validity fingerprint:
/// every field is stored in the section header and compared on open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderParams {
    /// Font identifier handed to the text measurer.
    pub font_id: i32,
    /// Line height multiplier.
    pub line_compression: f32,
    /// Add half a line after each paragraph.
    pub extra_paragraph_spacing: bool,
    /// Alignment for paragraphs that do not specify one.
    pub paragraph_alignment: TextAlign,
    pub viewport_width: u16,
    pub viewport_height: u16,
    pub hyphenation_enabled: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self::for_display(480, 800)
    }
}

impl RenderParams {
    pub fn for_display(viewport_width: u16, viewport_height: u16) -> Self {
        Self {
            font_id: 0,
            line_compression: 1.0,
            extra_paragraph_spacing: true,
            paragraph_alignment: TextAlign::Justify,
            viewport_width,
            viewport_height,
            hyphenation_enabled: false,
        }
    }

    pub fn with_font_id(mut self, font_id: i32) -> Self {
        self.font_id = font_id;
        self
    }

    pub fn with_line_compression(mut self, line_compression: f32) -> Self {
        self.line_compression = line_compression;
        self
    }

    pub fn with_extra_paragraph_spacing(mut self, enabled: bool) -> Self {
        self.extra_paragraph_spacing = enabled;
        self
    }

    pub fn with_paragraph_alignment(mut self, alignment: TextAlign) -> Self {
        self.paragraph_alignment = alignment;
        self
    }

    pub fn with_hyphenation(mut self, enabled: bool) -> Self {
        self.hyphenation_enabled = enabled;
        self
    }

    /// Name of the first field that differs from `other`, if any.
    ///
    /// `line_compression` compares bit-exactly.
    pub fn first_mismatch(&self, other: &RenderParams) -> Option<&'static str> {
        if self.font_id != other.font_id {
            Some("font_id")
        } else if self.line_compression.to_bits() != other.line_compression.to_bits() {
            Some("line_compression")
        } else if self.extra_paragraph_spacing != other.extra_paragraph_spacing {
            Some("extra_paragraph_spacing")
        } else if self.paragraph_alignment != other.paragraph_alignment {
            Some("paragraph_alignment")
        } else if self.viewport_width != other.viewport_width {
            Some("viewport_width")
        } else if self.viewport_height != other.viewport_height {
            Some("viewport_height")
        } else if self.hyphenation_enabled != other.hyphenation_enabled {
            Some("hyphenation_enabled")
        } else {
            None
        }
    }

    /// Paragraph alignment with `None` resolved to justified.
    pub fn effective_paragraph_alignment(&self) -> TextAlign {
        match self.paragraph_alignment {
            TextAlign::None => TextAlign::Justify,
            other => other,
        }
    }
}

/// Bounds applied while tokenizing a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseLimits {
    /// Word count at which a growing block is laid out early (all but its last line).
    pub block_flush_words: usize,
    /// Bytes requested from the document source per read.
    pub read_chunk: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            block_flush_words: 750,
            read_chunk: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_reports_first_differing_field() {
        let base = RenderParams::for_display(480, 800);
        assert_eq!(base.first_mismatch(&base), None);
        assert_eq!(
            base.first_mismatch(&base.with_line_compression(0.95)),
            Some("line_compression")
        );
        assert_eq!(
            base.first_mismatch(&RenderParams::for_display(480, 640)),
            Some("viewport_height")
        );
        assert_eq!(
            base.first_mismatch(&base.with_hyphenation(true)),
            Some("hyphenation_enabled")
        );
    }

    #[test]
    fn unset_paragraph_alignment_means_justify() {
        let params = RenderParams::default().with_paragraph_alignment(TextAlign::None);
        assert_eq!(params.effective_paragraph_alignment(), TextAlign::Justify);
    }
}
