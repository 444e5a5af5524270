//! Document text extraction for the `extracting` ingestion stage
//! (spec.md §4.11, teacher's document-processing dependency stack:
//! `pdf-extract`, `docx-rs`, `html-escape`, `csv`, `image`).

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Html,
    Pdf,
    Docx,
    Csv,
    Image,
}

impl DocumentFormat {
    pub fn from_extension(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".pdf") {
            Self::Pdf
        } else if lower.ends_with(".docx") {
            Self::Docx
        } else if lower.ends_with(".html") || lower.ends_with(".htm") {
            Self::Html
        } else if lower.ends_with(".csv") {
            Self::Csv
        } else if lower.ends_with(".md") || lower.ends_with(".markdown") {
            Self::Markdown
        } else if lower.ends_with(".png")
            || lower.ends_with(".jpg")
            || lower.ends_with(".jpeg")
            || lower.ends_with(".gif")
            || lower.ends_with(".webp")
        {
            Self::Image
        } else {
            Self::Text
        }
    }
}

/// Extracts plain text from a document's raw bytes. Images produce a
/// metadata-derived placeholder rather than a true vision-model caption:
/// generating an actual description is the host's job once the chunk is
/// embedded there (spec.md §1 non-goal: the model runtime is external).
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::Text | DocumentFormat::Markdown => {
            String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::Internal {
                message: format!("document is not valid UTF-8: {e}"),
            })
        }
        DocumentFormat::Html => {
            let raw = String::from_utf8_lossy(bytes);
            Ok(html_escape::decode_html_entities(&strip_tags(&raw)).into_owned())
        }
        DocumentFormat::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| CoreError::Internal {
            message: format!("pdf extraction failed: {e}"),
        }),
        DocumentFormat::Docx => extract_docx_text(bytes),
        DocumentFormat::Csv => extract_csv_text(bytes),
        DocumentFormat::Image => {
            let image = image::load_from_memory(bytes).map_err(|e| CoreError::Internal {
                message: format!("image decoding failed: {e}"),
            })?;
            Ok(format!(
                "[image: {}x{} pixels]",
                image.width(),
                image.height()
            ))
        }
    }
}

/// Minimal tag stripper: good enough to turn rendered HTML into readable
/// chunk text without pulling in a full HTML parser for this one stage.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    use docx_rs::read_docx;

    let docx = read_docx(bytes).map_err(|e| CoreError::Internal {
        message: format!("docx extraction failed: {e}"),
    })?;

    let mut out = String::new();
    for child in docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            for run_child in paragraph.children {
                if let docx_rs::ParagraphChild::Run(run) = run_child {
                    for run_content in run.children {
                        if let docx_rs::RunChild::Text(text) = run_content {
                            out.push_str(&text.text);
                        }
                    }
                }
            }
            out.push('\n');
        }
    }
    Ok(out)
}

fn extract_csv_text(bytes: &[u8]) -> Result<String> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut out = String::new();
    for record in reader.records() {
        let record = record.map_err(|e| CoreError::Internal {
            message: format!("csv parsing failed: {e}"),
        })?;
        out.push_str(&record.iter().collect::<Vec<_>>().join(", "));
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_inferred_from_extension() {
        assert_eq!(DocumentFormat::from_extension("report.pdf"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_extension("notes.md"), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_extension("plain.txt"), DocumentFormat::Text);
    }

    #[test]
    fn html_extraction_strips_tags_and_decodes_entities() {
        let html = b"<p>Hello &amp; welcome</p>";
        let text = extract_text(html, DocumentFormat::Html).unwrap();
        assert_eq!(text.trim(), "Hello & welcome");
    }

    #[test]
    fn csv_extraction_joins_fields() {
        let csv = b"name,age\nAlice,30\nBob,40\n";
        let text = extract_text(csv, DocumentFormat::Csv).unwrap();
        assert!(text.contains("Alice, 30"));
        assert!(text.contains("Bob, 40"));
    }

    #[test]
    fn plain_text_passes_through() {
        let text = extract_text(b"hello world", DocumentFormat::Text).unwrap();
        assert_eq!(text, "hello world");
    }
}
