//! Sparse style records and their layout-time resolution.
//!
//! [`CssStyle`] is what the stylesheet engine produces: every field has a
//! matching bit in [`DefinedProps`], and a field's value is meaningless
//! unless its bit is set. [`BlockStyle`] is the pixel-resolved form the
//! layout engine consumes.

/// Horizontal alignment of a block's lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextAlign {
    /// No explicit alignment; layout treats it as left.
    #[default]
    None = 0,
    Left = 1,
    Right = 2,
    Center = 3,
    Justify = 4,
}

impl TextAlign {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Left),
            2 => Some(Self::Right),
            3 => Some(Self::Center),
            4 => Some(Self::Justify),
            _ => None,
        }
    }

    /// Interpret a normalized `text-align` value.
    pub fn parse(value: &str) -> Self {
        match value {
            "left" | "start" => Self::Left,
            "right" | "end" => Self::Right,
            "center" => Self::Center,
            "justify" => Self::Justify,
            _ => Self::Left,
        }
    }
}

/// Unit of a [`CssLength`]; kept unresolved until layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CssUnit {
    #[default]
    Pixels = 0,
    Em = 1,
    Rem = 2,
    Points = 3,
    Percent = 4,
}

impl CssUnit {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pixels),
            1 => Some(Self::Em),
            2 => Some(Self::Rem),
            3 => Some(Self::Points),
            4 => Some(Self::Percent),
            _ => None,
        }
    }
}

/// Numeric value plus unit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CssLength {
    pub value: f32,
    pub unit: CssUnit,
}

const POINTS_TO_PIXELS: f32 = 1.33;

impl CssLength {
    pub const ZERO: Self = Self {
        value: 0.0,
        unit: CssUnit::Pixels,
    };

    pub fn new(value: f32, unit: CssUnit) -> Self {
        Self { value, unit }
    }

    pub fn px(value: f32) -> Self {
        Self::new(value, CssUnit::Pixels)
    }

    /// Parse a normalized length such as `1.5em`, `12pt`, `-3px`, `10%` or `0`.
    ///
    /// Returns `None` when the value has no leading number (`auto`, `inherit`).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let bytes = value.as_bytes();
        let mut end = 0usize;
        if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
            end += 1;
        }
        let digits_start = end;
        let mut seen_dot = false;
        while end < bytes.len() {
            match bytes[end] {
                b'0'..=b'9' => end += 1,
                b'.' if !seen_dot => {
                    seen_dot = true;
                    end += 1;
                }
                _ => break,
            }
        }
        if !bytes[digits_start..end].iter().any(u8::is_ascii_digit) {
            return None;
        }
        let number: f32 = value[..end].parse().ok()?;
        let unit = match value[end..].trim() {
            "em" => CssUnit::Em,
            "rem" => CssUnit::Rem,
            "pt" => CssUnit::Points,
            "%" => CssUnit::Percent,
            _ => CssUnit::Pixels,
        };
        Some(Self::new(number, unit))
    }

    /// Resolve to pixels. `em_px` sizes `em`/`rem`; `container_px` sizes `%`.
    pub fn to_pixels(self, em_px: f32, container_px: f32) -> f32 {
        match self.unit {
            CssUnit::Pixels => self.value,
            CssUnit::Em | CssUnit::Rem => self.value * em_px,
            CssUnit::Points => self.value * POINTS_TO_PIXELS,
            CssUnit::Percent => self.value * container_px / 100.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FontStyle {
    #[default]
    Normal = 0,
    Italic = 1,
}

impl FontStyle {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Italic),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "italic" | "oblique" => Self::Italic,
            _ => Self::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FontWeight {
    #[default]
    Normal = 0,
    Bold = 1,
}

impl FontWeight {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Bold),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "bold" | "bolder" => Self::Bold,
            other => match other.parse::<u16>() {
                Ok(weight) if weight >= 700 => Self::Bold,
                _ => Self::Normal,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextDecoration {
    #[default]
    None = 0,
    Underline = 1,
}

impl TextDecoration {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Underline),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.contains("underline") {
            Self::Underline
        } else {
            Self::None
        }
    }
}

/// Bit set recording which [`CssStyle`] fields were explicitly declared.
///
/// Bit order is part of the stylesheet cache format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DefinedProps(u16);

impl DefinedProps {
    pub const TEXT_ALIGN: u16 = 1 << 0;
    pub const FONT_STYLE: u16 = 1 << 1;
    pub const FONT_WEIGHT: u16 = 1 << 2;
    pub const DECORATION: u16 = 1 << 3;
    pub const TEXT_INDENT: u16 = 1 << 4;
    pub const MARGIN_TOP: u16 = 1 << 5;
    pub const MARGIN_BOTTOM: u16 = 1 << 6;
    pub const MARGIN_LEFT: u16 = 1 << 7;
    pub const MARGIN_RIGHT: u16 = 1 << 8;
    pub const PADDING_TOP: u16 = 1 << 9;
    pub const PADDING_BOTTOM: u16 = 1 << 10;
    pub const PADDING_LEFT: u16 = 1 << 11;
    pub const PADDING_RIGHT: u16 = 1 << 12;

    const ALL: u16 = (1 << 13) - 1;

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }
}

/// Sparse style record produced by stylesheet rules and inline `style=""`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CssStyle {
    pub text_align: TextAlign,
    pub font_style: FontStyle,
    pub font_weight: FontWeight,
    pub decoration: TextDecoration,
    pub text_indent: CssLength,
    pub margin_top: CssLength,
    pub margin_bottom: CssLength,
    pub margin_left: CssLength,
    pub margin_right: CssLength,
    pub padding_top: CssLength,
    pub padding_bottom: CssLength,
    pub padding_left: CssLength,
    pub padding_right: CssLength,
    pub defined: DefinedProps,
}

impl CssStyle {
    pub fn is_empty(&self) -> bool {
        !self.defined.any()
    }

    pub fn set_text_align(&mut self, value: TextAlign) {
        self.text_align = value;
        self.defined.set(DefinedProps::TEXT_ALIGN);
    }

    pub fn set_font_style(&mut self, value: FontStyle) {
        self.font_style = value;
        self.defined.set(DefinedProps::FONT_STYLE);
    }

    pub fn set_font_weight(&mut self, value: FontWeight) {
        self.font_weight = value;
        self.defined.set(DefinedProps::FONT_WEIGHT);
    }

    pub fn set_decoration(&mut self, value: TextDecoration) {
        self.decoration = value;
        self.defined.set(DefinedProps::DECORATION);
    }

    pub fn set_text_indent(&mut self, value: CssLength) {
        self.text_indent = value;
        self.defined.set(DefinedProps::TEXT_INDENT);
    }

    /// Set a margin or padding side addressed by its defined bit.
    pub fn set_box_side(&mut self, bit: u16, value: CssLength) {
        let slot = match bit {
            DefinedProps::MARGIN_TOP => &mut self.margin_top,
            DefinedProps::MARGIN_BOTTOM => &mut self.margin_bottom,
            DefinedProps::MARGIN_LEFT => &mut self.margin_left,
            DefinedProps::MARGIN_RIGHT => &mut self.margin_right,
            DefinedProps::PADDING_TOP => &mut self.padding_top,
            DefinedProps::PADDING_BOTTOM => &mut self.padding_bottom,
            DefinedProps::PADDING_LEFT => &mut self.padding_left,
            DefinedProps::PADDING_RIGHT => &mut self.padding_right,
            _ => return,
        };
        *slot = value;
        self.defined.set(bit);
    }

    /// Lengths in defined-bit order, starting at `TEXT_INDENT`.
    pub(crate) fn lengths(&self) -> [CssLength; 9] {
        [
            self.text_indent,
            self.margin_top,
            self.margin_bottom,
            self.margin_left,
            self.margin_right,
            self.padding_top,
            self.padding_bottom,
            self.padding_left,
            self.padding_right,
        ]
    }

    pub(crate) fn set_lengths(&mut self, lengths: [CssLength; 9]) {
        let [indent, mt, mb, ml, mr, pt, pb, pl, pr] = lengths;
        self.text_indent = indent;
        self.margin_top = mt;
        self.margin_bottom = mb;
        self.margin_left = ml;
        self.margin_right = mr;
        self.padding_top = pt;
        self.padding_bottom = pb;
        self.padding_left = pl;
        self.padding_right = pr;
    }

    /// Copy every field `other` defines onto `self`; undefined fields are untouched.
    pub fn apply_over(&mut self, other: &CssStyle) {
        let d = other.defined;
        if d.has(DefinedProps::TEXT_ALIGN) {
            self.set_text_align(other.text_align);
        }
        if d.has(DefinedProps::FONT_STYLE) {
            self.set_font_style(other.font_style);
        }
        if d.has(DefinedProps::FONT_WEIGHT) {
            self.set_font_weight(other.font_weight);
        }
        if d.has(DefinedProps::DECORATION) {
            self.set_decoration(other.decoration);
        }
        if d.has(DefinedProps::TEXT_INDENT) {
            self.set_text_indent(other.text_indent);
        }
        for (bit, value) in [
            (DefinedProps::MARGIN_TOP, other.margin_top),
            (DefinedProps::MARGIN_BOTTOM, other.margin_bottom),
            (DefinedProps::MARGIN_LEFT, other.margin_left),
            (DefinedProps::MARGIN_RIGHT, other.margin_right),
            (DefinedProps::PADDING_TOP, other.padding_top),
            (DefinedProps::PADDING_BOTTOM, other.padding_bottom),
            (DefinedProps::PADDING_LEFT, other.padding_left),
            (DefinedProps::PADDING_RIGHT, other.padding_right),
        ] {
            if d.has(bit) {
                self.set_box_side(bit, value);
            }
        }
    }

    pub fn is_bold(&self) -> bool {
        self.defined.has(DefinedProps::FONT_WEIGHT) && self.font_weight == FontWeight::Bold
    }

    pub fn is_italic(&self) -> bool {
        self.defined.has(DefinedProps::FONT_STYLE) && self.font_style == FontStyle::Italic
    }

    pub fn is_underline(&self) -> bool {
        self.defined.has(DefinedProps::DECORATION) && self.decoration == TextDecoration::Underline
    }
}

/// Block-level style resolved to pixels for layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStyle {
    pub alignment: TextAlign,
    pub alignment_defined: bool,
    pub text_indent: i16,
    pub text_indent_defined: bool,
    pub margin_top: i16,
    pub margin_bottom: i16,
    pub margin_left: i16,
    pub margin_right: i16,
    pub padding_top: i16,
    pub padding_bottom: i16,
    pub padding_left: i16,
    pub padding_right: i16,
}

fn clamp_px(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

impl BlockStyle {
    pub fn aligned(alignment: TextAlign) -> Self {
        Self {
            alignment,
            alignment_defined: true,
            ..Self::default()
        }
    }

    pub fn with_margin_left(mut self, px: i16) -> Self {
        self.margin_left = px;
        self
    }

    pub fn with_margin_top(mut self, px: i16) -> Self {
        self.margin_top = px;
        self
    }

    /// Resolve the block-level fields of `css`.
    pub fn from_css(css: &CssStyle, em_px: f32, viewport_width: f32) -> Self {
        let d = css.defined;
        let px = |bit: u16, len: CssLength| {
            if d.has(bit) {
                clamp_px(len.to_pixels(em_px, viewport_width))
            } else {
                0
            }
        };
        Self {
            alignment: css.text_align,
            alignment_defined: d.has(DefinedProps::TEXT_ALIGN),
            text_indent: px(DefinedProps::TEXT_INDENT, css.text_indent),
            text_indent_defined: d.has(DefinedProps::TEXT_INDENT),
            margin_top: px(DefinedProps::MARGIN_TOP, css.margin_top),
            margin_bottom: px(DefinedProps::MARGIN_BOTTOM, css.margin_bottom),
            margin_left: px(DefinedProps::MARGIN_LEFT, css.margin_left),
            margin_right: px(DefinedProps::MARGIN_RIGHT, css.margin_right),
            padding_top: px(DefinedProps::PADDING_TOP, css.padding_top),
            padding_bottom: px(DefinedProps::PADDING_BOTTOM, css.padding_bottom),
            padding_left: px(DefinedProps::PADDING_LEFT, css.padding_left),
            padding_right: px(DefinedProps::PADDING_RIGHT, css.padding_right),
        }
    }

    /// Nest `child` inside `self`: box insets accumulate, alignment and
    /// indent come from the child when it defines them.
    pub fn combined_with(&self, child: &BlockStyle) -> BlockStyle {
        let mut out = *self;
        if child.alignment_defined {
            out.alignment = child.alignment;
            out.alignment_defined = true;
        }
        if child.text_indent_defined {
            out.text_indent = child.text_indent;
            out.text_indent_defined = true;
        }
        out.margin_top = out.margin_top.saturating_add(child.margin_top);
        out.margin_bottom = out.margin_bottom.saturating_add(child.margin_bottom);
        out.margin_left = out.margin_left.saturating_add(child.margin_left);
        out.margin_right = out.margin_right.saturating_add(child.margin_right);
        out.padding_top = out.padding_top.saturating_add(child.padding_top);
        out.padding_bottom = out.padding_bottom.saturating_add(child.padding_bottom);
        out.padding_left = out.padding_left.saturating_add(child.padding_left);
        out.padding_right = out.padding_right.saturating_add(child.padding_right);
        out
    }

    pub fn left_inset(&self) -> i32 {
        i32::from(self.margin_left) + i32::from(self.padding_left)
    }

    pub fn horizontal_inset(&self) -> i32 {
        self.left_inset() + i32::from(self.margin_right) + i32::from(self.padding_right)
    }

    pub fn top_offset(&self) -> i32 {
        i32::from(self.margin_top) + i32::from(self.padding_top)
    }

    pub fn bottom_offset(&self) -> i32 {
        i32::from(self.margin_bottom) + i32::from(self.padding_bottom)
    }
}
