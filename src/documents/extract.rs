//! Plain-text extraction from uploaded files.

use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use zip::ZipArchive;

use super::dotted_extension;
use crate::constants::FILE_EXTRACTION_PREFIX;

static XML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static DOCX_PARAGRAPH_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</w:p>").expect("valid paragraph regex"));
static PPTX_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<a:t>([^<]*)</a:t>").expect("valid run regex"));
static PPTX_SLIDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").expect("valid slide regex"));
static XLSX_SHEET_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^xl/worksheets/sheet(\d+)\.xml$").expect("valid worksheet regex")
});
static XLSX_SHEET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<sheet\b[^>]*\bname="([^"]*)""#).expect("valid sheet regex"));
static XLSX_SHARED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<si>(.*?)</si>").expect("valid shared string regex"));
static XLSX_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<row\b[^>]*>(.*?)</row>").expect("valid row regex"));
static XLSX_CELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)"#).expect("valid cell regex")
});
static XLSX_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<(?:v|t)[^>]*>(.*?)</(?:v|t)>").expect("valid value regex"));

const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".html", ".htm", ".tex", ".json", ".xml", ".yaml", ".yml", ".rtf", ".odt",
    ".epub", ".csv", ".log", ".conf", ".ini", ".properties", ".sql", ".bat", ".sh", ".c",
    ".cpp", ".py", ".java", ".js", ".ts", ".swift", ".go", ".rb", ".php", ".css", ".scss",
    ".less",
];

/// Why a file produced no text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    pub description: String,
    pub original_error: String,
}

impl ExtractionFailure {
    pub fn new(description: &str, original_error: impl Into<String>) -> Self {
        Self {
            description: format!("{FILE_EXTRACTION_PREFIX}{description}"),
            original_error: original_error.into(),
        }
    }
}

impl std::fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.description, self.original_error)
    }
}

/// Decode `bytes` according to the extension of `name`.
pub fn extract_text(name: &str, bytes: &[u8]) -> Result<String, ExtractionFailure> {
    let ext = dotted_extension(Path::new(name));
    match ext.as_str() {
        ".pdf" => pdf_text(bytes),
        ".docx" => office(bytes, "DOCX processing error", docx_text),
        ".pptx" => office(bytes, "PPTX processing error", pptx_text),
        ".xlsx" => office(bytes, "XLSX processing error", xlsx_text),
        e if TEXT_EXTENSIONS.contains(&e) => plain_text(bytes),
        other => Err(ExtractionFailure::new(
            &format!("Unsupported file type: {other}"),
            format!("No extractor for {name}"),
        )),
    }
}

fn plain_text(bytes: &[u8]) -> Result<String, ExtractionFailure> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        ExtractionFailure::new(
            "UTF-8 encoding error, please convert it to UTF-8 before processing",
            e.to_string(),
        )
    })?;
    if text.trim().is_empty() {
        return Err(ExtractionFailure::new(
            "Empty file content",
            "File contains no content or only whitespace",
        ));
    }
    if text.starts_with("b'") || text.starts_with("b\"") {
        return Err(ExtractionFailure::new(
            "Binary data in text file",
            "File appears to contain binary data representation instead of text",
        ));
    }
    Ok(text.to_string())
}

/// Page text in reading order; a PDF without a text layer counts as empty.
fn pdf_text(bytes: &[u8]) -> Result<String, ExtractionFailure> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractionFailure::new("PDF processing error", e.to_string()))?;
    if text.trim().is_empty() {
        return Err(ExtractionFailure::new(
            "Empty file content",
            "PDF contains no extractable text",
        ));
    }
    Ok(text)
}

type Archive<'a> = ZipArchive<std::io::Cursor<&'a [u8]>>;

fn office(
    bytes: &[u8],
    description: &str,
    read: fn(&mut Archive<'_>) -> Result<String, String>,
) -> Result<String, ExtractionFailure> {
    let mut archive = ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractionFailure::new(description, e.to_string()))?;
    let text = read(&mut archive).map_err(|e| ExtractionFailure::new(description, e))?;
    if text.trim().is_empty() {
        return Err(ExtractionFailure::new(
            "Empty file content",
            "Document contains no text",
        ));
    }
    Ok(text)
}

fn entry(archive: &mut Archive<'_>, name: &str) -> Result<String, String> {
    let mut file = archive.by_name(name).map_err(|e| format!("{name}: {e}"))?;
    let mut xml = String::new();
    file.read_to_string(&mut xml).map_err(|e| format!("{name}: {e}"))?;
    Ok(xml)
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn strip_tags(xml: &str) -> String {
    unescape_xml(&XML_TAG.replace_all(xml, ""))
}

/// Entries matching `pattern`, ordered by their numeric capture.
fn numbered_entries(archive: &Archive<'_>, pattern: &Regex) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = pattern.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

fn docx_text(archive: &mut Archive<'_>) -> Result<String, String> {
    let xml = entry(archive, "word/document.xml")?;
    let with_breaks = DOCX_PARAGRAPH_END.replace_all(&xml, "\n");
    let text = strip_tags(&with_breaks);
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn pptx_text(archive: &mut Archive<'_>) -> Result<String, String> {
    let mut out = String::new();
    for name in numbered_entries(archive, &PPTX_SLIDE) {
        let xml = entry(archive, &name)?;
        for run in PPTX_RUN.captures_iter(&xml) {
            out.push_str(&unescape_xml(&run[1]));
            out.push('\n');
        }
    }
    Ok(out)
}

fn xlsx_text(archive: &mut Archive<'_>) -> Result<String, String> {
    let shared: Vec<String> = match entry(archive, "xl/sharedStrings.xml") {
        Ok(xml) => XLSX_SHARED
            .captures_iter(&xml)
            .map(|c| strip_tags(&c[1]))
            .collect(),
        Err(_) => Vec::new(),
    };
    let sheet_names: Vec<String> = entry(archive, "xl/workbook.xml")
        .map(|xml| {
            XLSX_SHEET_NAME
                .captures_iter(&xml)
                .map(|c| unescape_xml(&c[1]))
                .collect()
        })
        .unwrap_or_default();

    let mut out = String::new();
    for (i, name) in numbered_entries(archive, &XLSX_SHEET_FILE).into_iter().enumerate() {
        let xml = entry(archive, &name)?;
        let title = sheet_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", i + 1));
        out.push_str(&format!("Sheet: {title}\n"));
        for row in XLSX_ROW.captures_iter(&xml) {
            let cells: Vec<String> = XLSX_CELL
                .captures_iter(&row[1])
                .map(|cell| {
                    let attrs = cell.get(1).map(|m| m.as_str()).unwrap_or("");
                    let body = cell.get(2).map(|m| m.as_str()).unwrap_or("");
                    let raw = XLSX_VALUE
                        .captures(body)
                        .map(|v| v[1].to_string())
                        .unwrap_or_default();
                    if attrs.contains(r#"t="s""#) {
                        raw.trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|idx| shared.get(idx).cloned())
                            .unwrap_or_default()
                    } else {
                        strip_tags(&raw)
                    }
                })
                .collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn text_files_are_decoded() {
        assert_eq!(extract_text("a.md", b"# Title\nbody").unwrap(), "# Title\nbody");
        assert_eq!(extract_text("A.TXT", b"upper").unwrap(), "upper");
    }

    #[test]
    fn text_failures_are_described() {
        let empty = extract_text("a.txt", b"  \n").unwrap_err();
        assert_eq!(empty.description, "[File Extraction]Empty file content");
        let binary = extract_text("a.txt", b"b'\\x00\\x01'").unwrap_err();
        assert_eq!(binary.description, "[File Extraction]Binary data in text file");
        let utf8 = extract_text("a.txt", &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(utf8.description.contains("UTF-8 encoding error"));
    }

    fn fixture(name: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name);
        std::fs::read(path).unwrap()
    }

    #[test]
    fn pdf_page_text_is_extracted() {
        let text = extract_text("report.pdf", &fixture("report.pdf")).unwrap();
        assert!(text.contains("Alice"), "{text:?}");
        assert!(text.contains("Berlin"), "{text:?}");
    }

    #[test]
    fn docx_fixture_is_extracted() {
        let text = extract_text("report.docx", &fixture("report.docx")).unwrap();
        assert_eq!(
            text,
            "Alice works at Acme Corporation in Berlin.\nBob manages Acme Corporation."
        );
    }

    #[test]
    fn broken_pdf_and_unknown_are_rejected() {
        let pdf = extract_text("paper.pdf", b"this is not a pdf document").unwrap_err();
        assert_eq!(pdf.description, "[File Extraction]PDF processing error");
        let other = extract_text("image.png", b"...").unwrap_err();
        assert_eq!(other.description, "[File Extraction]Unsupported file type: .png");
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = zip_of(&[(
            "word/document.xml",
            "<w:document><w:body><w:p><w:r><w:t>Hello &amp; welcome</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Second</w:t></w:r></w:p></w:body></w:document>",
        )]);
        assert_eq!(extract_text("a.docx", &bytes).unwrap(), "Hello & welcome\nSecond");
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let bytes = zip_of(&[
            ("ppt/slides/slide10.xml", "<p:sld><a:t>Ten</a:t></p:sld>"),
            ("ppt/slides/slide2.xml", "<p:sld><a:t>Two</a:t><a:t>More</a:t></p:sld>"),
        ]);
        assert_eq!(extract_text("deck.pptx", &bytes).unwrap(), "Two\nMore\nTen\n");
    }

    #[test]
    fn xlsx_rows_use_shared_strings() {
        let bytes = zip_of(&[
            (
                "xl/workbook.xml",
                r#"<workbook><sheets><sheet name="Budget" sheetId="1"/></sheets></workbook>"#,
            ),
            ("xl/sharedStrings.xml", "<sst><si><t>Item</t></si><si><t>Cost</t></si></sst>"),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Rent</t></is></c><c r="B2"><v>900</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        let text = extract_text("b.xlsx", &bytes).unwrap();
        assert_eq!(text, "Sheet: Budget\nItem\tCost\nRent\t900\n\n");
    }

    #[test]
    fn broken_office_file_fails() {
        let err = extract_text("x.docx", b"not a zip").unwrap_err();
        assert_eq!(err.description, "[File Extraction]DOCX processing error");
    }
}
