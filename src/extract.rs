//! Plain-text extraction keyed by format tag.
//!
//! The supported formats are a data table ([`EXTRACTORS`]) mapping a
//! lowercase extension to an extractor function. Plain-text formats decode as
//! UTF-8 (lossily); PDF goes through `pdf-extract`; the Office Open XML
//! formats are unzipped and their text runs collected with `quick-xml`.
//!
//! A tag missing from the table is `UnsupportedFormat`. A file that cannot be
//! parsed, or parses to nothing but whitespace, is `EmptyDocument`.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::RagError;

type Extractor = fn(&[u8]) -> Result<String, String>;

/// Format tag → extractor.
pub const EXTRACTORS: &[(&str, Extractor)] = &[
    ("txt", extract_utf8),
    ("md", extract_utf8),
    ("markdown", extract_utf8),
    ("csv", extract_utf8),
    ("json", extract_utf8),
    ("pdf", extract_pdf),
    ("docx", extract_docx),
    ("pptx", extract_pptx),
    ("xlsx", extract_xlsx),
];

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single archive member.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Format tags accepted by [`extract_text`].
pub fn supported_formats() -> Vec<&'static str> {
    EXTRACTORS.iter().map(|(tag, _)| *tag).collect()
}

pub fn is_supported(format: &str) -> bool {
    EXTRACTORS.iter().any(|(tag, _)| *tag == format)
}

/// Produce plain text from `bytes` tagged as `format`.
///
/// `source_id` only labels errors.
pub fn extract_text(source_id: &str, format: &str, bytes: &[u8]) -> Result<String, RagError> {
    let extractor = EXTRACTORS
        .iter()
        .find(|(tag, _)| *tag == format)
        .map(|(_, f)| *f)
        .ok_or_else(|| RagError::UnsupportedFormat(format!("'{}' ({})", format, source_id)))?;

    let text = extractor(bytes)
        .map_err(|e| RagError::EmptyDocument(format!("{}: cannot extract text: {}", source_id, e)))?;
    if text.trim().is_empty() {
        return Err(RagError::EmptyDocument(format!("{}: no text found", source_id)));
    }
    Ok(text)
}

fn extract_utf8(bytes: &[u8]) -> Result<String, String> {
    let text = String::from_utf8_lossy(bytes);
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

fn extract_pdf(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| format!("PDF: {}", e))
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, String> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("not an OOXML archive: {}", e))
}

fn read_member(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{}: {}", name, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!("{} exceeds {} bytes", name, MAX_XML_ENTRY_BYTES));
    }
    Ok(out)
}

/// Archive members named `{prefix}{n}.xml`, ordered by `n`.
fn numbered_members(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<*:t>` element. A closing `<*:p>` becomes a newline.
fn collect_text_runs(xml: &[u8]) -> Result<String, String> {
    let mut out = String::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_member(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_members(&archive, "ppt/slides/slide") {
        let xml = read_member(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if !text.trim().is_empty() {
            slides.push(text.trim_end().to_string());
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        shared_strings(&read_member(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_members(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_member(&mut archive, &name)?;
        let rows = sheet_rows(&xml, &shared)?;
        if !rows.is_empty() {
            sheets.push(rows.join("\n"));
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, String> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One tab-separated line per `<row>`. Shared-string cells are resolved,
/// numeric and inline cells are kept as written.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<String>, String> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_is_shared = false;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| e.to_string())?;
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if cell_is_shared {
                        value.parse::<usize>().ok().and_then(|i| shared.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(v) = resolved {
                        row.push(v);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows)
}
