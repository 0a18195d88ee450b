mod common;

use std::io::{self, Read};

use common::fixtures::SAMPLE_CSS;
use folio_stream::{CssStyle, Stylesheet, StylesheetLimits};

/// Yields at most `step` bytes per read, so every split point gets exercised.
struct Trickle<'a> {
    data: &'a [u8],
    step: usize,
}

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.step.min(buf.len()).min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

fn table(sheet: &Stylesheet) -> Vec<(String, CssStyle)> {
    let mut rules: Vec<(String, CssStyle)> = sheet
        .iter()
        .map(|(selector, style)| (selector.to_string(), *style))
        .collect();
    rules.sort_by(|a, b| a.0.cmp(&b.0));
    rules
}

fn book_css() -> String {
    let mut css = String::from(SAMPLE_CSS);
    css.push_str("@media screen { p { margin: 0 } }\n");
    css.push_str("@import url(\"other.css\");\n");
    css.push_str("/* a comment { with braces } and ; semicolons */\n");
    for i in 0..40 {
        css.push_str(&format!(
            "p.c{i}, .c{i} {{ text-indent: {i}px; padding: 1px 2px /* inline */ 3px }}\n"
        ));
    }
    css.push_str("div > p.deep { font-weight: bold }\n");
    css
}

#[test]
fn streaming_matches_one_shot_for_every_split() {
    let css = book_css();
    let mut oneshot = Stylesheet::new();
    oneshot.load(css.as_bytes(), css.len()).unwrap();
    let expected = table(&oneshot);
    assert!(expected.len() > 80);

    for step in [1, 2, 3, 5, 7, 16, 61, 257, css.len()] {
        let mut streamed = Stylesheet::new();
        streamed
            .load_streaming(
                Trickle {
                    data: css.as_bytes(),
                    step,
                },
                css.len(),
            )
            .unwrap();
        assert!(!streamed.stats().stopped_early, "step {}", step);
        assert_eq!(table(&streamed), expected, "step {}", step);
    }
}

#[test]
fn small_chunk_limits_still_match() {
    let css = book_css();
    let mut oneshot = Stylesheet::new();
    oneshot.load(css.as_bytes(), css.len()).unwrap();

    for chunk_size in [32, 100, 512] {
        let limits = StylesheetLimits {
            chunk_size,
            buffer_ceiling: chunk_size * 4,
            ..StylesheetLimits::default()
        };
        let mut streamed = Stylesheet::with_limits(limits);
        streamed.load_streaming(css.as_bytes(), css.len()).unwrap();
        assert_eq!(table(&streamed), table(&oneshot), "chunk {}", chunk_size);
    }
}

#[test]
fn cached_table_resolves_like_the_parsed_one() {
    let css = book_css();
    let mut parsed = Stylesheet::new();
    parsed.load(css.as_bytes(), css.len()).unwrap();

    let mut blob = Vec::new();
    parsed.save_to_cache(&mut blob).unwrap();
    let mut restored = Stylesheet::new();
    restored.load_from_cache(&mut blob.as_slice()).unwrap();

    assert_eq!(table(&restored), table(&parsed));
    for (tag, class) in [("p", "c3 epigraph"), ("h1", ""), ("blockquote", "note"), ("span", "aside")] {
        assert_eq!(
            restored.resolve_style(tag, class),
            parsed.resolve_style(tag, class),
            "{} .{}",
            tag,
            class
        );
    }
}
