// src/transform/mod.rs
//! HTML bodies → Markdown-flavoured text, plus optional AI summaries.
//!
//! `normalize` is total: malformed markup degrades to best-effort plain text,
//! so a notification is never dropped because it failed to render.

pub mod summarize;

use once_cell::sync::OnceCell;
use regex::{Captures, Regex};

use crate::error::TransformError;

pub use summarize::{summarize, OpenAiSummarizer, Summarizer};

macro_rules! re {
    ($pat:expr) => {{
        static RE: OnceCell<Regex> = OnceCell::new();
        RE.get_or_init(|| Regex::new($pat).unwrap())
    }};
}

/// Convert `raw_body` to Markdown; fall back to plain text on malformed input.
pub fn normalize(raw_body: &str) -> String {
    match to_markdown(raw_body) {
        Ok(md) => md,
        Err(e) => {
            tracing::debug!(error = %e, "markup conversion failed; using plain text");
            let plain = plain_text(raw_body);
            if plain.is_empty() {
                raw_body.trim().to_string()
            } else {
                plain
            }
        }
    }
}

/// Strict conversion. Errors on unterminated tags or markup that renders to nothing.
pub fn to_markdown(html: &str) -> Result<String, TransformError> {
    check_tags_terminated(html)?;

    let mut out = html.replace("\r\n", "\n");
    out = re!(r"(?is)<!--.*?-->").replace_all(&out, "").into_owned();
    out = re!(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>")
        .replace_all(&out, "")
        .into_owned();

    out = re!(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#)
        .replace_all(&out, |c: &Captures| {
            let href = c[1].trim();
            let text = collapse_inline(&strip_tags(&c[2]));
            if text.is_empty() || text == href {
                format!("<{href}>")
            } else {
                format!("[{text}]({href})")
            }
        })
        .into_owned();
    out = re!(r#"(?is)<img\s[^>]*?src\s*=\s*["']([^"']*)["'][^>]*>"#)
        .replace_all(&out, "![image]($1)")
        .into_owned();

    out = re!(r"(?is)<h([1-6])(?:\s[^>]*)?>(.*?)</h[1-6]\s*>")
        .replace_all(&out, |c: &Captures| {
            let level: usize = c[1].parse().unwrap_or(1);
            format!(
                "\n\n{} {}\n\n",
                "#".repeat(level),
                collapse_inline(&strip_tags(&c[2]))
            )
        })
        .into_owned();
    out = re!(r"(?is)<(?:strong|b)(?:\s[^>]*)?>(.*?)</(?:strong|b)\s*>")
        .replace_all(&out, "**$1**")
        .into_owned();
    out = re!(r"(?is)<(?:em|i)(?:\s[^>]*)?>(.*?)</(?:em|i)\s*>")
        .replace_all(&out, "*$1*")
        .into_owned();
    out = re!(r"(?is)<code(?:\s[^>]*)?>(.*?)</code\s*>")
        .replace_all(&out, "`$1`")
        .into_owned();

    out = re!(r"(?i)<li(?:\s[^>]*)?>").replace_all(&out, "\n- ").into_owned();
    out = re!(r"(?i)<br\s*/?>").replace_all(&out, "\n").into_owned();
    out = re!(r"(?i)<hr\s*/?>").replace_all(&out, "\n\n---\n\n").into_owned();
    out = re!(r"(?i)</?(?:p|div|ul|ol|table|tr|blockquote|section|article)(?:\s[^>]*)?>")
        .replace_all(&out, "\n\n")
        .into_owned();
    out = re!(r"(?i)</?(?:td|th)(?:\s[^>]*)?>")
        .replace_all(&out, " ")
        .into_owned();

    let text = tidy_whitespace(&decode(&strip_tags(&out)));
    if text.is_empty() && !plain_text(html).is_empty() {
        return Err(TransformError::EmptyRender);
    }
    Ok(text)
}

/// Tag-stripped, entity-decoded, whitespace-collapsed text.
pub fn plain_text(html: &str) -> String {
    tidy_whitespace(&decode(&strip_tags(html)))
}

/// Cut `text` to at most `max_bytes`, on a char boundary. Returns whether it was cut.
pub fn trim_to_limit(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

fn check_tags_terminated(html: &str) -> Result<(), TransformError> {
    let bytes = html.as_bytes();
    for (i, _) in html.match_indices('<') {
        let opens_tag = bytes
            .get(i + 1)
            .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'/' || *b == b'!');
        if opens_tag && !html[i..].contains('>') {
            return Err(TransformError::UnterminatedTag(i));
        }
    }
    Ok(())
}

fn strip_tags(s: &str) -> String {
    re!(r"(?s)</?[A-Za-z!][^>]*>").replace_all(s, "").into_owned()
}

fn decode(s: &str) -> String {
    html_escape::decode_html_entities(s).replace('\u{00A0}', " ")
}

fn collapse_inline(s: &str) -> String {
    re!(r"\s+").replace_all(s, " ").trim().to_string()
}

fn tidy_whitespace(s: &str) -> String {
    let lines: Vec<String> = s
        .lines()
        .map(|l| re!(r"[ \t]+").replace_all(l, " ").trim().to_string())
        .collect();
    let joined = lines.join("\n");
    re!(r"\n{3,}").replace_all(&joined, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_links_and_emphasis() {
        let html = r#"<p>Hello <strong>class</strong>,</p><p>see <a href="https://m.example/x">the forum</a> &amp; reply.</p>"#;
        assert_eq!(
            normalize(html),
            "Hello **class**,\n\nsee [the forum](https://m.example/x) & reply."
        );
    }

    #[test]
    fn lists_headings_and_breaks() {
        let html = "<h2>Due soon</h2><ul><li>Essay</li><li>Quiz</li></ul>Line1<br/>Line2";
        assert_eq!(
            normalize(html),
            "## Due soon\n\n- Essay\n- Quiz\n\nLine1\nLine2"
        );
    }

    #[test]
    fn scripts_and_comments_are_dropped() {
        let html = "<p>Hi</p><script>alert(1)</script><!-- hidden --><style>p{}</style>";
        assert_eq!(normalize(html), "Hi");
    }

    #[test]
    fn unterminated_tag_degrades_to_text() {
        let html = "<p>Grade posted <b";
        assert_eq!(
            to_markdown(html),
            Err(TransformError::UnterminatedTag(16))
        );
        assert_eq!(normalize(html), "Grade posted <b");
    }

    #[test]
    fn plain_text_input_passes_through() {
        assert_eq!(normalize("  just text  "), "just text");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("a < b and c > d"), "a < b and c > d");
    }

    #[test]
    fn escaped_markup_stays_literal() {
        assert_eq!(normalize("<p>&lt;b&gt;not bold&lt;/b&gt;</p>"), "<b>not bold</b>");
    }

    #[test]
    fn trim_respects_char_boundaries() {
        let (t, cut) = trim_to_limit("héllo", 2);
        assert_eq!(t, "h");
        assert!(cut);
        let (t, cut) = trim_to_limit("abc", 10);
        assert_eq!(t, "abc");
        assert!(!cut);
    }
}
