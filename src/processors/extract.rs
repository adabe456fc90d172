//! Leaf-block text extraction from chapter markup.
//!
//! Decomposition and reassembly both walk the same leaf blocks in the same
//! order, which is what keeps sequence orders aligned between import and
//! export.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::errors::{PipelineError, Result};

/// Block-level tags whose leaf occurrences become content units
pub const BLOCK_TAGS: &[&str] = &[
    "p",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "li",
    "blockquote",
    "caption",
    "figcaption",
];

/// One innermost block element carrying translatable text
#[derive(Debug, Clone)]
pub struct LeafBlock {
    /// Byte range of the element's inner markup
    pub inner_start: usize,
    pub inner_end: usize,
    /// Inner text with tags stripped, entities decoded, and whitespace trimmed
    pub text: String,
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(/?)(p|h[1-6]|li|blockquote|caption|figcaption)(\s[^>]*?)?(/?)>")
            .unwrap()
    })
}

fn strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap())
}

/// Find every leaf block element in document order.
///
/// A block element containing another block element is a container, not a
/// leaf; only the innermost blocks are returned. Blocks whose stripped text
/// is empty (image wrappers, spacer paragraphs) are skipped.
pub fn leaf_blocks(html: &str) -> Vec<LeafBlock> {
    struct Open {
        name: String,
        inner_start: usize,
        has_block_child: bool,
    }

    let mut stack: Vec<Open> = Vec::new();
    let mut leaves: Vec<LeafBlock> = Vec::new();

    for caps in tag_re().captures_iter(html) {
        let whole = caps.get(0).unwrap();
        let closing = !caps.get(1).map(|m| m.as_str().is_empty()).unwrap_or(true);
        let name = caps.get(2).unwrap().as_str().to_ascii_lowercase();
        let self_closing = caps.get(4).map(|m| m.as_str() == "/").unwrap_or(false);

        if self_closing {
            // An empty element never yields text but still makes its parent
            // a container
            if let Some(top) = stack.last_mut() {
                top.has_block_child = true;
            }
            continue;
        }

        if !closing {
            stack.push(Open {
                name,
                inner_start: whole.end(),
                has_block_child: false,
            });
            continue;
        }

        // Closing tag: unwind to the matching open, tolerating stray closes
        let Some(pos) = stack.iter().rposition(|o| o.name == name) else {
            continue;
        };
        stack.truncate(pos + 1);
        let open = stack.pop().unwrap();

        if !open.has_block_child {
            let inner = &html[open.inner_start..whole.start()];
            let text = plain_text(inner);
            if !text.is_empty() {
                leaves.push(LeafBlock {
                    inner_start: open.inner_start,
                    inner_end: whole.start(),
                    text,
                });
            }
        }
        if let Some(parent) = stack.last_mut() {
            parent.has_block_child = true;
        }
    }

    leaves.sort_by_key(|l| l.inner_start);
    leaves
}

/// Replace each leaf block's inner markup with the matching translation.
///
/// `translations` is aligned with the leaf blocks in document order; `None`
/// leaves that block's original content in place (partial export).
pub fn substitute_blocks(html: &str, translations: &[Option<String>]) -> Result<String> {
    let leaves = leaf_blocks(html);
    if leaves.len() != translations.len() {
        return Err(PipelineError::CorruptionError {
            message: format!(
                "document has {} text blocks but {} translation slot(s)",
                leaves.len(),
                translations.len()
            ),
        });
    }

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    for (leaf, translation) in leaves.iter().zip(translations) {
        if let Some(text) = translation {
            out.push_str(&html[cursor..leaf.inner_start]);
            out.push_str(&escape_text(text));
            cursor = leaf.inner_end;
        }
    }
    out.push_str(&html[cursor..]);
    Ok(out)
}

/// Strip tags and decode entities, collapsing surrounding whitespace
pub fn plain_text(inner: &str) -> String {
    let stripped = strip_re().replace_all(inner, "");
    decode_entities(stripped.trim())
}

/// Decode the entity forms that appear in EPUB body text
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let semi = match rest.find(';') {
            // Entities are short; a distant semicolon means a bare ampersand
            Some(s) if s <= 10 => s,
            _ => {
                out.push('&');
                rest = &rest[1..];
                continue;
            }
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse::<u32>().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape text for insertion into markup
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER: &str = r#"<?xml version="1.0"?>
<html><body>
<h1>Chapter 1: The Beginning</h1>
<p>First <em>paragraph</em> with markup.</p>
<blockquote><p>Nested quote text.</p></blockquote>
<p><img src="images/cover.png"/></p>
<ul><li>Item one</li><li>Item &amp; two</li></ul>
<p>   </p>
</body></html>"#;

    #[test]
    fn test_leaf_blocks_in_document_order() {
        let leaves = leaf_blocks(CHAPTER);
        let texts: Vec<&str> = leaves.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Chapter 1: The Beginning",
                "First paragraph with markup.",
                "Nested quote text.",
                "Item one",
                "Item & two",
            ]
        );
    }

    #[test]
    fn test_containers_and_empty_blocks_skipped() {
        let leaves = leaf_blocks(CHAPTER);
        // The blockquote wrapper, the image-only paragraph, and the blank
        // paragraph yield no units
        assert_eq!(leaves.len(), 5);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let first = leaf_blocks(CHAPTER);
        let second = leaf_blocks(CHAPTER);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.inner_start, b.inner_start);
        }
    }

    #[test]
    fn test_substitute_preserves_skeleton() {
        let html = "<body><h1>Title</h1><p>Hello <b>world</b></p></body>";
        let out = substitute_blocks(
            html,
            &[Some("标题".to_string()), Some("你好".to_string())],
        )
        .unwrap();
        assert_eq!(out, "<body><h1>标题</h1><p>你好</p></body>");
    }

    #[test]
    fn test_substitute_partial_keeps_original() {
        let html = "<p>One</p><p>Two</p>";
        let out = substitute_blocks(html, &[Some("一".to_string()), None]).unwrap();
        assert_eq!(out, "<p>一</p><p>Two</p>");
    }

    #[test]
    fn test_substitute_escapes_translation() {
        let html = "<p>AT&amp;T</p>";
        let out = substitute_blocks(html, &[Some("A < B & C".to_string())]).unwrap();
        assert_eq!(out, "<p>A &lt; B &amp; C</p>");
    }

    #[test]
    fn test_substitute_count_mismatch_is_error() {
        let html = "<p>One</p>";
        assert!(substitute_blocks(html, &[]).is_err());
    }

    #[test]
    fn test_decode_numeric_entities() {
        assert_eq!(plain_text("caf&#233; &#x4e2d;"), "café 中");
        assert_eq!(plain_text("a &b; c"), "a &b; c");
    }
}
