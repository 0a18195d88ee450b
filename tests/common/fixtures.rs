use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DISPLAY_WIDTH: u16 = 480;
pub const DISPLAY_HEIGHT: u16 = 800;

pub const SAMPLE_CSS: &str = "\
/* book styles */
p { text-indent: 1.5em; margin-bottom: 0.3em }
h1, h2 { text-align: center; font-weight: bold }
.epigraph { text-align: right; font-style: italic; margin-left: 2em }
.note, .aside em { font-size: small; text-decoration: underline }
blockquote { margin-left: 10%; margin-right: 10% }
";

const WORDS: &[&str] = &[
    "the", "river", "ran", "quietly", "beneath", "a", "grey", "November", "sky", "while",
    "lanterns", "flickered", "along", "the", "harbour", "wall", "and", "somewhere", "a",
    "bell", "answered", "itself", "twice", "before", "falling", "silent",
];

/// Deterministic sentence of `len` words starting at `seed`.
pub fn sentence(seed: usize, len: usize) -> String {
    let mut out = String::with_capacity(len * 8);
    for i in 0..len {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(WORDS[(seed + i * 7) % WORDS.len()]);
    }
    out.push('.');
    out
}

/// FB2 book with `sections` top-level sections of `paragraphs` paragraphs each.
///
/// Every section has a title, emphasis, an image placeholder and a note
/// reference; a notes body follows the main body.
pub fn fb2_book(sections: usize, paragraphs: usize) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<FictionBook xmlns=\"http://www.gribuser.ru/xml/fictionbook/2.0\" xmlns:l=\"http://www.w3.org/1999/xlink\">\n\
<description><title-info><book-title>Harbour Lights</book-title></title-info></description>\n<body>\n",
    );
    for s in 0..sections {
        out.push_str(&format!(
            "<section id=\"s{s}\">\n<title><p>Chapter {n}</p></title>\n",
            n = s + 1
        ));
        out.push_str("<epigraph><p>Ships pass in the night.</p><text-author>Anon</text-author></epigraph>\n");
        for p in 0..paragraphs {
            let text = sentence(s * 31 + p, 18 + (p % 5) * 6);
            if p == 1 {
                out.push_str(&format!(
                    "<p><emphasis>Slowly</emphasis> {} <a l:href=\"#n{s}\" type=\"note\">{n}</a></p>\n",
                    text,
                    n = s + 1
                ));
            } else if p == 2 {
                out.push_str("<image l:href=\"#map.png\"/>\n");
                out.push_str(&format!("<p>{}</p>\n", text));
            } else {
                out.push_str(&format!("<p>{}</p>\n", text));
            }
        }
        out.push_str("<empty-line/>\n</section>\n");
    }
    out.push_str("</body>\n<body name=\"notes\">\n");
    for s in 0..sections {
        out.push_str(&format!(
            "<section id=\"n{s}\"><p>Note for chapter {}.</p></section>\n",
            s + 1
        ));
    }
    out.push_str("</body>\n<binary id=\"map.png\" content-type=\"image/png\">AAAA</binary>\n</FictionBook>\n");
    out
}

/// XHTML chapter exercising class selectors, inline styles and skipped subtrees.
pub fn xhtml_chapter(paragraphs: usize) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\">\n\
<head><title>Ignored</title><style>p { color: red }</style></head>\n<body>\n<h1>Harbour Lights</h1>\n\
<p class=\"epigraph\">Ships pass in the night.</p>\n",
    );
    for p in 0..paragraphs {
        let text = sentence(p * 13, 20 + (p % 4) * 5);
        match p % 4 {
            0 => out.push_str(&format!("<p>{}</p>\n", text)),
            1 => out.push_str(&format!(
                "<p style=\"text-align: center\"><b>Bold</b> {}</p>\n",
                text
            )),
            2 => out.push_str(&format!(
                "<blockquote><p>{}<a epub:type=\"noteref\" href=\"#fn{p}\">{p}</a></p></blockquote>\n",
                text
            )),
            _ => out.push_str(&format!(
                "<p>{}<span epub:type=\"pagebreak\" title=\"{p}\">{p}</span><br/>{}</p>\n",
                text, text
            )),
        }
    }
    out.push_str("</body>\n</html>\n");
    out
}

static NONCE: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(label: &str) -> Self {
        let n = NONCE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "folio-stream-{}-{}-{}",
            label,
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap_or_else(|e| panic!("create {:?}: {}", path, e));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, contents).unwrap_or_else(|e| panic!("write {:?}: {}", path, e));
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
