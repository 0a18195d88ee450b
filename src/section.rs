//! Page cache store: one binary file per section.
//!
//! ```text
//! offset  field
//!  0      u8   format version
//!  1      i32  font id
//!  5      f32  line compression
//!  9      u8   extra paragraph spacing
//! 10      u8   paragraph alignment
//! 11      u16  viewport width
//! 13      u16  viewport height
//! 15      u8   hyphenation enabled
//! 16      u16  page count          (zero until finalized)
//! 18      u32  LUT offset          (zero until finalized)
//! 22      page records, back to back
//! LUT     u32 × page count: start offset of each page record
//! ```
//!
//! All fields are little-endian. A store is written under `<path>.tmp` and
//! renamed into place only after the LUT and header are complete, so a
//! readable store is always a finished one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::RenderParams;
use crate::error::{ErrorPhase, FolioError};
use crate::page::Page;
use crate::serialization::{
    read_bool, read_f32, read_i32, read_u16, read_u32, read_u8, write_bool, write_f32,
    write_i32, write_u16, write_u32, write_u8,
};
use crate::style::TextAlign;

/// Bump whenever the header or page record layout changes.
pub const SECTION_FILE_VERSION: u8 = 1;
pub const HEADER_SIZE: u64 = 22;
const PAGE_COUNT_OFFSET: u64 = 16;
const LUT_OFFSET_FIELD: u64 = 18;
const LUT_ENTRY_SIZE: u64 = 4;

/// Decoded section header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SectionHeader {
    pub version: u8,
    pub params: RenderParams,
    pub page_count: u16,
    pub lut_offset: u32,
}

impl SectionHeader {
    fn write_to<W: Write>(&self, out: &mut W) -> Result<(), FolioError> {
        write_u8(out, self.version)?;
        write_i32(out, self.params.font_id)?;
        write_f32(out, self.params.line_compression)?;
        write_bool(out, self.params.extra_paragraph_spacing)?;
        write_u8(out, self.params.paragraph_alignment as u8)?;
        write_u16(out, self.params.viewport_width)?;
        write_u16(out, self.params.viewport_height)?;
        write_bool(out, self.params.hyphenation_enabled)?;
        write_u16(out, self.page_count)?;
        write_u32(out, self.lut_offset)?;
        Ok(())
    }

    /// Read a header. Fails closed on a version mismatch before touching
    /// any other field.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, FolioError> {
        let version = read_u8(input)?;
        if version != SECTION_FILE_VERSION {
            return Err(FolioError::CacheVersionMismatch {
                found: version,
                expected: SECTION_FILE_VERSION,
            });
        }
        let font_id = read_i32(input)?;
        let line_compression = read_f32(input)?;
        let extra_paragraph_spacing = read_bool(input)?;
        let paragraph_alignment = TextAlign::from_u8(read_u8(input)?)
            .ok_or_else(|| FolioError::corrupt("invalid alignment byte in section header"))?;
        let viewport_width = read_u16(input)?;
        let viewport_height = read_u16(input)?;
        let hyphenation_enabled = read_bool(input)?;
        let page_count = read_u16(input)?;
        let lut_offset = read_u32(input)?;
        Ok(Self {
            version,
            params: RenderParams {
                font_id,
                line_compression,
                extra_paragraph_spacing,
                paragraph_alignment,
                viewport_width,
                viewport_height,
                hyphenation_enabled,
            },
            page_count,
            lut_offset,
        })
    }

    /// Read just the header of the store at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FolioError> {
        let mut file = File::open(path.as_ref())?;
        Self::read_from(&mut file)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes one section store. Dropping it before [`SectionWriter::finalize`]
/// removes the partial file.
pub struct SectionWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: Option<BufWriter<File>>,
    offsets: Vec<u32>,
    position: u64,
    scratch: Vec<u8>,
    published: bool,
}

impl SectionWriter {
    /// Create the temporary file and write a header with placeholder
    /// page count and LUT offset.
    pub fn create(path: impl AsRef<Path>, params: RenderParams) -> Result<Self, FolioError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&path);
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        let header = SectionHeader {
            version: SECTION_FILE_VERSION,
            params,
            page_count: 0,
            lut_offset: 0,
        };
        let mut writer = Self {
            path,
            tmp_path,
            out: None,
            offsets: Vec::new(),
            position: HEADER_SIZE,
            scratch: Vec::with_capacity(4096),
            published: false,
        };
        header.write_to(&mut out)?;
        writer.out = Some(out);
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pages_written(&self) -> usize {
        self.offsets.len()
    }

    fn out(&mut self) -> Result<&mut BufWriter<File>, FolioError> {
        self.out.as_mut().ok_or_else(|| FolioError::Storage {
            phase: ErrorPhase::Cache,
            kind: std::io::ErrorKind::BrokenPipe,
            message: "section writer already closed".into(),
        })
    }

    /// Serialize one page and record its start offset.
    pub fn write_page(&mut self, page: &Page) -> Result<(), FolioError> {
        let offset = u32::try_from(self.position).map_err(|_| {
            FolioError::too_large(
                ErrorPhase::Cache,
                "section_bytes",
                usize::try_from(self.position).unwrap_or(usize::MAX),
                u32::MAX as usize,
            )
        })?;
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let written = page
            .write_to(&mut scratch)
            .map_err(FolioError::from)
            .and_then(|_| self.out()?.write_all(&scratch).map_err(FolioError::from));
        let len = scratch.len() as u64;
        self.scratch = scratch;
        written?;
        self.offsets.push(offset);
        self.position += len;
        Ok(())
    }

    /// Append the LUT, backpatch the header and publish the store.
    pub fn finalize(mut self) -> Result<u16, FolioError> {
        let count = u16::try_from(self.offsets.len()).map_err(|_| {
            FolioError::too_large(
                ErrorPhase::Cache,
                "section_pages",
                self.offsets.len(),
                u16::MAX as usize,
            )
        })?;
        let lut_offset = u32::try_from(self.position).map_err(|_| {
            FolioError::too_large(
                ErrorPhase::Cache,
                "section_bytes",
                usize::try_from(self.position).unwrap_or(usize::MAX),
                u32::MAX as usize,
            )
        })?;
        let mut out = match self.out.take() {
            Some(out) => out,
            None => return Err(FolioError::corrupt("section writer has no open file")),
        };
        for offset in &self.offsets {
            write_u32(&mut out, *offset)?;
        }
        let mut file = out.into_inner().map_err(|err| err.into_error())?;
        file.seek(SeekFrom::Start(PAGE_COUNT_OFFSET))?;
        write_u16(&mut file, count)?;
        write_u32(&mut file, lut_offset)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        self.published = true;
        log::debug!(
            "published section store {} ({} pages, LUT at {})",
            self.path.display(),
            count,
            lut_offset
        );
        Ok(count)
    }
}

impl Drop for SectionWriter {
    fn drop(&mut self) {
        if !self.published {
            self.out.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// A finished, validated section store opened for random page access.
#[derive(Debug)]
pub struct SectionFile {
    path: PathBuf,
    input: BufReader<File>,
    header: SectionHeader,
}

impl SectionFile {
    /// Open and validate against `params`. Any header field mismatch
    /// invalidates the whole store.
    pub fn open(path: impl AsRef<Path>, params: &RenderParams) -> Result<Self, FolioError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mut input = BufReader::new(file);
        let header = SectionHeader::read_from(&mut input)?;
        if let Some(field) = params.first_mismatch(&header.params) {
            return Err(FolioError::CacheParameterMismatch { field });
        }
        if header.page_count == 0 {
            return Err(FolioError::corrupt("section store has no pages"));
        }
        let lut = u64::from(header.lut_offset);
        let lut_end = lut + u64::from(header.page_count) * LUT_ENTRY_SIZE;
        if lut < HEADER_SIZE || lut_end > len {
            return Err(FolioError::corrupt(format!(
                "LUT [{}, {}) outside file of {} bytes",
                lut, lut_end, len
            )));
        }
        Ok(Self {
            path,
            input,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SectionHeader {
        &self.header
    }

    pub fn page_count(&self) -> usize {
        usize::from(self.header.page_count)
    }

    /// Seek to one page through the LUT and decode it. No other page is read.
    pub fn read_page(&mut self, index: usize) -> Result<Page, FolioError> {
        let count = self.page_count();
        if index >= count {
            return Err(FolioError::PageOutOfRange { index, count });
        }
        self.input.seek(SeekFrom::Start(LUT_OFFSET_FIELD))?;
        let lut = u64::from(read_u32(&mut self.input)?);
        self.input
            .seek(SeekFrom::Start(lut + index as u64 * LUT_ENTRY_SIZE))?;
        let offset = u64::from(read_u32(&mut self.input)?);
        if offset < HEADER_SIZE || offset >= lut {
            return Err(FolioError::corrupt(format!(
                "page {} offset {} outside page area [{}, {})",
                index, offset, HEADER_SIZE, lut
            )));
        }
        self.input.seek(SeekFrom::Start(offset))?;
        Page::read_from(&mut self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_block::{LineWord, TextLine, WordStyle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NONCE: AtomicUsize = AtomicUsize::new(0);

    fn temp_path(label: &str) -> PathBuf {
        let n = NONCE.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("folio-section-{}-{}-{}", label, std::process::id(), n))
            .join("0.bin")
    }

    fn page_with(text: &str) -> Page {
        let mut page = Page::new();
        page.push_line(
            0,
            0,
            TextLine {
                words: vec![LineWord {
                    text: text.to_string(),
                    x: 0,
                    style: WordStyle::REGULAR,
                }],
                alignment: TextAlign::Left,
            },
        );
        page
    }

    fn write_store(path: &Path, params: RenderParams, pages: usize) {
        let mut writer = SectionWriter::create(path, params).unwrap();
        for i in 0..pages {
            writer.write_page(&page_with(&format!("page-{}", i))).unwrap();
        }
        assert_eq!(writer.finalize().unwrap() as usize, pages);
    }

    #[test]
    fn header_fields_sit_at_fixed_offsets() {
        let params = RenderParams::for_display(480, 800).with_font_id(-7);
        let mut bytes = Vec::new();
        SectionHeader {
            version: SECTION_FILE_VERSION,
            params,
            page_count: 0x0102,
            lut_offset: 0x0A0B0C0D,
        }
        .write_to(&mut bytes)
        .unwrap();
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        assert_eq!(bytes[0], SECTION_FILE_VERSION);
        assert_eq!(&bytes[1..5], &(-7i32).to_le_bytes());
        assert_eq!(&bytes[11..13], &480u16.to_le_bytes());
        assert_eq!(&bytes[16..18], &[0x02, 0x01]);
        assert_eq!(&bytes[18..22], &[0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn pages_read_back_in_any_order() {
        let path = temp_path("order");
        let params = RenderParams::default();
        write_store(&path, params, 5);
        let mut file = SectionFile::open(&path, &params).unwrap();
        assert_eq!(file.page_count(), 5);
        for index in [4, 0, 2, 3, 1, 4] {
            let page = file.read_page(index).unwrap();
            assert_eq!(page, page_with(&format!("page-{}", index)));
        }
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn lut_entries_are_increasing_page_starts() {
        let path = temp_path("lut");
        let params = RenderParams::default();
        write_store(&path, params, 3);
        let bytes = fs::read(&path).unwrap();
        let lut = u32::from_le_bytes(bytes[18..22].try_into().unwrap()) as usize;
        let entries: Vec<u32> = (0..3)
            .map(|i| u32::from_le_bytes(bytes[lut + i * 4..lut + i * 4 + 4].try_into().unwrap()))
            .collect();
        assert_eq!(entries[0] as u64, HEADER_SIZE);
        assert!(entries.windows(2).all(|w| w[0] < w[1]));
        assert!((entries[2] as usize) < lut);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn parameter_change_invalidates_store() {
        let path = temp_path("params");
        let params = RenderParams::default();
        write_store(&path, params, 1);
        let err = SectionFile::open(&path, &params.with_line_compression(1.1)).unwrap_err();
        assert!(err.is_cache_invalid());
        assert!(matches!(
            err,
            FolioError::CacheParameterMismatch {
                field: "line_compression"
            }
        ));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn version_byte_mismatch_fails_closed() {
        let path = temp_path("version");
        let params = RenderParams::default();
        write_store(&path, params, 1);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = SECTION_FILE_VERSION + 1;
        fs::write(&path, bytes).unwrap();
        let err = SectionFile::open(&path, &params).unwrap_err();
        assert_eq!(err.code(), "CACHE_VERSION_MISMATCH");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn truncated_store_is_corrupt() {
        let path = temp_path("truncated");
        let params = RenderParams::default();
        write_store(&path, params, 2);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let err = SectionFile::open(&path, &params).unwrap_err();
        assert_eq!(err.code(), "CACHE_CORRUPT");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn dropped_writer_leaves_nothing_on_disk() {
        let path = temp_path("dropped");
        {
            let mut writer = SectionWriter::create(&path, RenderParams::default()).unwrap();
            writer.write_page(&page_with("partial")).unwrap();
        }
        assert!(!path.exists());
        assert!(!tmp_path_for(&path).exists());
        let err = SectionFile::open(&path, &RenderParams::default()).unwrap_err();
        assert!(err.is_not_found());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn out_of_range_page_is_reported() {
        let path = temp_path("range");
        let params = RenderParams::default();
        write_store(&path, params, 1);
        let mut file = SectionFile::open(&path, &params).unwrap();
        let err = file.read_page(1).unwrap_err();
        assert_eq!(err.code(), "PAGE_OUT_OF_RANGE");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
