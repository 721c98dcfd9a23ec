//! Context blocks, document identity, and reference descriptors
//!
//! Payload keys vary with the ingestion version that wrote a point, so every
//! field is read from an ordered list of candidate keys.

use crate::store::RetrievalHit;
use scoperag_common::scope::SourceType;
use serde::Serialize;
use std::collections::HashMap;

const SUBJECT_KEYS: &[&str] = &["mail_subject", "subject"];
const MAIL_DATE_KEYS: &[&str] = &["sent_date", "date"];
const TEXT_KEYS: &[&str] = &["text", "body"];
const MAIL_ID_KEYS: &[&str] = &["entry_id", "mail_id", "link"];
const PATH_KEYS: &[&str] = &["file_path", "document_path", "path", "link"];
const DOC_TITLE_KEYS: &[&str] = &["title", "document_name", "filename", "name"];
const DOC_DATE_KEYS: &[&str] = &["created_date", "modified_date", "date"];

/// Separator between context blocks
pub const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

const UNKNOWN: &str = "N/A";

/// Truncate to `max` characters, marking the cut with `...`
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Compare paths regardless of slash direction and case
pub fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

/// Stable identity of the document a hit was chunked from
pub fn document_identity(hit: &RetrievalHit, source: SourceType) -> String {
    let found = match source {
        SourceType::Mail => hit.payload_str(MAIL_ID_KEYS).map(str::to_string),
        SourceType::Doc => hit.payload_str(PATH_KEYS).map(normalize_path),
    };
    found.unwrap_or_else(|| format!("point:{}", hit.id))
}

/// Keep the best-scoring hit per document, best first
pub fn dedupe(hits: Vec<RetrievalHit>, source: SourceType) -> Vec<RetrievalHit> {
    let mut best: HashMap<String, RetrievalHit> = HashMap::with_capacity(hits.len());
    for hit in hits {
        let identity = document_identity(&hit, source);
        match best.get(&identity) {
            Some(kept) if kept.score >= hit.score => {}
            _ => {
                best.insert(identity, hit);
            }
        }
    }

    let mut unique: Vec<RetrievalHit> = best.into_values().collect();
    unique.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    unique
}

/// Render one hit as a context block
pub fn format_block(hit: &RetrievalHit, snippet_chars: usize) -> String {
    let text = truncate_chars(hit.payload_str(TEXT_KEYS).unwrap_or_default(), snippet_chars);

    match hit.payload_str(&["source_type"]) {
        Some(kind @ ("email_body" | "email_attachment")) => {
            let is_attachment = kind == "email_attachment";
            let mut block = format!(
                "[Reference: email {}]\n- Subject: {}\n- Sender: {}\n- Date: {}\n",
                if is_attachment { "attachment" } else { "body" },
                hit.payload_str(SUBJECT_KEYS).unwrap_or(UNKNOWN),
                hit.payload_str(&["sender"]).unwrap_or(UNKNOWN),
                hit.payload_str(MAIL_DATE_KEYS).unwrap_or(UNKNOWN),
            );
            if is_attachment {
                block.push_str(&format!(
                    "- Attachment: {}\n",
                    hit.payload_str(&["file_name"]).unwrap_or(UNKNOWN)
                ));
            }
            block.push_str("- Content:\n");
            block.push_str(&text);
            block
        }
        _ => format!("[Reference: document]\n{}", text),
    }
}

/// Join blocks in order, stopping before `max_chars` is exceeded
///
/// A first block longer than the budget is truncated rather than dropped.
pub fn assemble_context(blocks: &[String], max_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0;

    for block in blocks {
        let separator = if context.is_empty() { 0 } else { BLOCK_SEPARATOR.chars().count() };
        let len = block.chars().count();

        if used + separator + len > max_chars {
            if context.is_empty() {
                context = if max_chars > 3 {
                    truncate_chars(block, max_chars - 3)
                } else {
                    // No room for the ellipsis
                    block.chars().take(max_chars).collect()
                };
            }
            break;
        }

        if separator > 0 {
            context.push_str(BLOCK_SEPARATOR);
        }
        context.push_str(block);
        used += separator + len;
    }
    context
}

/// Kind of reference shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Mail,
    Document,
}

/// Human-readable source descriptor rendered by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub title: String,

    pub date: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(rename = "type")]
    pub kind: ReferenceKind,
}

/// Reference for a hit; `None` when the hit has nothing to link to
pub fn build_reference(hit: &RetrievalHit, source: SourceType) -> Option<Reference> {
    let owned = |keys: &[&str]| hit.payload_str(keys).map(str::to_string);

    match source {
        SourceType::Mail => {
            let link = owned(&["link"])?;
            Some(Reference {
                title: owned(SUBJECT_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
                date: owned(MAIL_DATE_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
                sender: Some(owned(&["sender"]).unwrap_or_else(|| UNKNOWN.to_string())),
                link: Some(link),
                entry_id: owned(&["entry_id", "mail_id"]),
                display_url: owned(&["display_url"]),
                path: None,
                kind: ReferenceKind::Mail,
            })
        }
        SourceType::Doc => {
            let path = owned(PATH_KEYS)?;
            Some(Reference {
                title: owned(DOC_TITLE_KEYS).unwrap_or_else(|| "Document".to_string()),
                date: owned(DOC_DATE_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
                sender: None,
                link: None,
                entry_id: None,
                display_url: None,
                path: Some(path),
                kind: ReferenceKind::Document,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ScoredPoint;
    use scoperag_common::scope::ScopeSelector;
    use serde_json::{json, Value};

    fn hit(id: &str, score: f32, payload: Value) -> RetrievalHit {
        RetrievalHit::from_point(ScoredPoint::new(id, score, payload), "c", ScopeSelector::Personal)
    }

    #[test]
    fn test_truncate_chars_counts_characters() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("납기일정확인", 2), "납기...");
    }

    #[test]
    fn test_doc_identity_normalizes_paths() {
        let a = hit("1", 0.7, json!({ "file_path": "C:\\Shared\\Plan.xlsx" }));
        let b = hit("2", 0.9, json!({ "path": " c:/shared/plan.XLSX " }));
        assert_eq!(document_identity(&a, SourceType::Doc), document_identity(&b, SourceType::Doc));

        let anonymous = hit("3", 0.5, json!({}));
        assert_eq!(document_identity(&anonymous, SourceType::Mail), "point:3");
    }

    #[test]
    fn test_dedupe_keeps_highest_score() {
        let hits = vec![
            hit("1", 0.70, json!({ "entry_id": "A" })),
            hit("2", 0.90, json!({ "entry_id": "A" })),
            hit("3", 0.80, json!({ "mail_id": "B" })),
        ];
        let unique = dedupe(hits, SourceType::Mail);
        let ids: Vec<&str> = unique.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn test_mail_block_header() {
        let h = hit("1", 0.9, json!({
            "source_type": "email_attachment",
            "subject": "Q3 quote",
            "sender": "kim@example.com",
            "date": "2024-05-02",
            "file_name": "quote.pdf",
            "text": "Discount is 12 percent."
        }));
        let block = format_block(&h, 500);
        assert!(block.starts_with("[Reference: email attachment]"));
        assert!(block.contains("- Subject: Q3 quote"));
        assert!(block.contains("- Attachment: quote.pdf"));
        assert!(block.ends_with("Discount is 12 percent."));

        let plain = format_block(&hit("2", 0.9, json!({ "body": "x".repeat(20) })), 5);
        assert_eq!(plain, "[Reference: document]\nxxxxx...");
    }

    #[test]
    fn test_assemble_context_bounds_length() {
        let blocks = vec!["a".repeat(10), "b".repeat(10), "c".repeat(10)];
        let context = assemble_context(&blocks, 30);
        assert_eq!(context, format!("{}{}{}", "a".repeat(10), BLOCK_SEPARATOR, "b".repeat(10)));
        assert!(context.chars().count() <= 30);

        let single = assemble_context(&["z".repeat(50)], 20);
        assert_eq!(single.chars().count(), 20);
    }

    #[test]
    fn test_assemble_context_tiny_budget() {
        let blocks = vec!["abcdef".to_string()];
        assert_eq!(assemble_context(&blocks, 0), "");
        assert_eq!(assemble_context(&blocks, 2), "ab");
        assert_eq!(assemble_context(&blocks, 3), "abc");
        assert_eq!(assemble_context(&blocks, 4), "a...");
    }

    #[test]
    fn test_references() {
        let mail = hit("1", 0.9, json!({ "mail_subject": "Kickoff", "link": "outlook:ABC", "entry_id": "ABC" }));
        let reference = build_reference(&mail, SourceType::Mail).unwrap();
        assert_eq!(reference.title, "Kickoff");
        assert_eq!(reference.sender.as_deref(), Some("N/A"));
        assert_eq!(reference.kind, ReferenceKind::Mail);

        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["type"], "mail");
        assert!(json.get("path").is_none());

        let doc = hit("2", 0.9, json!({ "document_path": "/share/plan.docx", "modified_date": "2024-01-01" }));
        let reference = build_reference(&doc, SourceType::Doc).unwrap();
        assert_eq!(reference.title, "Document");
        assert_eq!(reference.path.as_deref(), Some("/share/plan.docx"));
        assert_eq!(reference.date, "2024-01-01");

        assert!(build_reference(&hit("3", 0.9, json!({ "text": "orphan" })), SourceType::Mail).is_none());
    }
}
