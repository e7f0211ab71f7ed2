//! Multi-format text extraction for uploaded documents.
//!
//! Turns spreadsheet, PDF, Word and CSV bytes into one labelled UTF-8 text
//! rendering for prompt injection. The format is chosen from the filename
//! extension only. Extraction never fails the caller: unsupported formats,
//! parsers compiled out via crate features, and corrupt files all produce a
//! bracketed placeholder string instead.
//!
//! | Format | Block header | Row/line shape | Cap |
//! |--------|--------------|----------------|-----|
//! | `.xlsx`, `.xls` | `--- Sheet: <name> ---` | tab-joined cells | 500 rows per sheet |
//! | `.pdf` | `--- Page N ---` | page text | 60 pages |
//! | `.docx` | none | paragraph per line, then `a \| b` table rows | none |
//! | `.csv` | none | tab-joined fields | 1000 rows, then a truncation marker |

use tracing::warn;

use crate::models::{extension_of, SourceType};

/// Extensions accepted for upload, with the leading dot.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".xlsx", ".xls", ".pdf", ".docx", ".csv"];

/// Maximum rows rendered per spreadsheet sheet.
pub const SHEET_MAX_ROWS: usize = 500;
/// Maximum PDF pages rendered.
pub const PDF_MAX_PAGES: usize = 60;
/// Maximum CSV data rows rendered before the truncation marker.
pub const CSV_MAX_ROWS: usize = 1000;
/// Line appended when a CSV exceeds [`CSV_MAX_ROWS`].
pub const CSV_TRUNCATION_MARKER: &str = "... (truncated at 1000 rows)";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
#[cfg(feature = "docx")]
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Format-specific parse failure. Converted into a placeholder by
/// [`parse_labelled`]; exposed for the typed `parse_*` helpers.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("spreadsheet extraction failed: {0}")]
    Spreadsheet(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
}

/// Parse `content` using the default label `<Type>: <filename>`.
pub fn parse_document(filename: &str, content: &[u8]) -> String {
    let label = match SourceType::from_filename(filename) {
        Some(t) => format!("{}: {}", t.label(), filename),
        None => filename.to_string(),
    };
    parse_labelled(filename, content, &label)
}

/// Parse `content` into text headed by `=== <label> ===`.
///
/// Never fails: see the module docs for the placeholder rules.
pub fn parse_labelled(filename: &str, content: &[u8], label: &str) -> String {
    let source_type = SourceType::detect(filename);
    let result = match source_type {
        SourceType::Spreadsheet => parse_spreadsheet(content, label),
        SourceType::Pdf => parse_pdf(content, label),
        SourceType::WordDoc => parse_docx(content, label),
        SourceType::Csv => parse_csv(content, label),
        SourceType::Unknown => {
            let ext = extension_of(filename)
                .map(|e| format!(".{}", e))
                .unwrap_or_default();
            return format!("[Unsupported: {}]", ext);
        }
    };

    match result {
        Ok(text) => text,
        Err(e) => {
            warn!(filename, error = %e, "document extraction failed");
            format!("[Could not parse {}: {}]", source_type.label(), e)
        }
    }
}

// ============ Spreadsheet ============

#[cfg(feature = "xlsx")]
pub fn parse_spreadsheet(content: &[u8], label: &str) -> Result<String, ExtractError> {
    use calamine::Reader;

    let mut workbook = calamine::open_workbook_auto_from_rs(std::io::Cursor::new(content))
        .map_err(|e| ExtractError::Spreadsheet(e.to_string()))?;

    let mut parts = vec![format!("=== {} ===", label)];
    for name in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&name) {
            Ok(r) => r,
            Err(e) => {
                warn!(sheet = %name, error = %e, "skipping unreadable sheet");
                continue;
            }
        };
        let rows: Vec<String> = range
            .rows()
            .filter(|row| row.iter().any(|cell| !matches!(cell, calamine::Data::Empty)))
            .take(SHEET_MAX_ROWS)
            .map(|row| row.iter().map(cell_text).collect::<Vec<_>>().join("\t"))
            .collect();
        if !rows.is_empty() {
            parts.push(format!("--- Sheet: {} ---\n{}", name, rows.join("\n")));
        }
    }
    Ok(parts.join("\n\n"))
}

#[cfg(feature = "xlsx")]
fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.clone(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
        calamine::Data::Error(e) => format!("#{:?}", e),
        #[allow(unreachable_patterns)]
        _ => String::new(),
    }
}

#[cfg(not(feature = "xlsx"))]
pub fn parse_spreadsheet(_content: &[u8], _label: &str) -> Result<String, ExtractError> {
    Ok("[Excel parser not available — rebuild with --features xlsx]".to_string())
}

// ============ PDF ============

#[cfg(feature = "pdf")]
pub fn parse_pdf(content: &[u8], label: &str) -> Result<String, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(content)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let mut parts = vec![format!("=== {} ===", label)];
    for (i, page) in pages.iter().take(PDF_MAX_PAGES).enumerate() {
        let text = page.trim();
        if !text.is_empty() {
            parts.push(format!("--- Page {} ---\n{}", i + 1, text));
        }
    }
    Ok(parts.join("\n\n"))
}

#[cfg(not(feature = "pdf"))]
pub fn parse_pdf(_content: &[u8], _label: &str) -> Result<String, ExtractError> {
    Ok("[PDF parser not available — rebuild with --features pdf]".to_string())
}

// ============ Word ============

#[cfg(feature = "docx")]
pub fn parse_docx(content: &[u8], label: &str) -> Result<String, ExtractError> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(content))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    let body = read_docx_body(&xml)?;
    let mut lines = vec![format!("=== {} ===", label)];
    lines.extend(
        body.paragraphs
            .into_iter()
            .filter(|p| !p.trim().is_empty()),
    );
    for row in body.table_rows {
        let cells: Vec<&str> = row
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        if !cells.is_empty() {
            lines.push(cells.join(" | "));
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(not(feature = "docx"))]
pub fn parse_docx(_content: &[u8], _label: &str) -> Result<String, ExtractError> {
    Ok("[Word parser not available — rebuild with --features docx]".to_string())
}

/// Body paragraphs (outside tables) and table rows of a `document.xml`.
#[cfg(feature = "docx")]
#[derive(Debug, Default)]
struct DocxBody {
    paragraphs: Vec<String>,
    table_rows: Vec<Vec<String>>,
}

#[cfg(feature = "docx")]
fn read_docx_body(xml: &[u8]) -> Result<DocxBody, ExtractError> {
    use quick_xml::events::Event;

    let mut body = DocxBody::default();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut table_depth = 0usize;
    let mut in_text = false;
    let mut paragraph = String::new();
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"tbl" => table_depth += 1,
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                b"p" if table_depth == 0 => paragraph.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"tab" {
                    if table_depth == 0 {
                        paragraph.push('\t');
                    } else {
                        cell.push(' ');
                    }
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                if table_depth == 0 {
                    paragraph.push_str(&text);
                } else {
                    cell.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if table_depth == 0 => body.paragraphs.push(std::mem::take(&mut paragraph)),
                // Paragraph breaks inside a cell become spaces.
                b"p" if !cell.is_empty() && !cell.ends_with(' ') => cell.push(' '),
                b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if table_depth == 1 => body.table_rows.push(std::mem::take(&mut row)),
                b"tbl" => table_depth = table_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(body)
}

// ============ CSV ============

pub fn parse_csv(content: &[u8], label: &str) -> Result<String, ExtractError> {
    let decoded = String::from_utf8_lossy(content);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(decoded.as_bytes());

    let mut lines = vec![format!("=== {} ===", label)];
    for (i, record) in reader.records().enumerate() {
        if i >= CSV_MAX_ROWS {
            lines.push(CSV_TRUNCATION_MARKER.to_string());
            break;
        }
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        lines.push(record.iter().collect::<Vec<_>>().join("\t"));
    }
    Ok(lines.join("\n"))
}
