//! Document parsing: sections, paragraphs, sentences, tokens.

use regex_lite::Regex;
use std::sync::OnceLock;

/// Longest summary kept on a node, in characters.
pub const SUMMARY_MAX_CHARS: usize = 160;
/// Headings longer than this many words are treated as prose.
const HEADING_MAX_WORDS: usize = 12;

fn blank_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n(?:[ \t]*\r?\n)+").expect("static regex"))
}

/// A parsed section: heading plus paragraphs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSection {
    pub title: String,
    pub paragraphs: Vec<ParsedParagraph>,
}

/// A parsed paragraph and its sentences.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedParagraph {
    pub text: String,
    pub sentences: Vec<String>,
}

/// Split on blank lines; empty paragraphs are dropped.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    blank_line_re()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split after `.`, `!` or `?` when whitespace follows and the next
/// sentence starts with an uppercase letter or a digit.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && (chars[j].is_uppercase() || chars[j].is_ascii_digit()) {
                push_trimmed(&mut sentences, &chars[start..=i]);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < chars.len() {
        push_trimmed(&mut sentences, &chars[start..]);
    }
    sentences
}

fn push_trimmed(out: &mut Vec<String>, chars: &[char]) {
    let s: String = chars.iter().collect();
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if !s.is_empty() {
        out.push(s);
    }
}

/// Word runs (alphanumeric or `_`) and single non-space symbols.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
        if !ch.is_whitespace() {
            tokens.push(ch.to_string());
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// Approximate token count used by the budget stage.
pub fn count_tokens(text: &str) -> usize {
    tokenize(text).len()
}

/// Lowercased word tokens, symbols dropped.
pub fn word_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| t.to_lowercase())
        .collect()
}

/// Heading heuristic for the first line of a paragraph.
pub fn is_heading(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    if line.starts_with('#') {
        return true;
    }
    let words = line.split_whitespace().count();
    if words > HEADING_MAX_WORDS {
        return false;
    }
    if line.ends_with(':') {
        return true;
    }
    let has_alpha = line.chars().any(char::is_alphabetic);
    has_alpha && !line.chars().any(char::is_lowercase)
}

fn heading_title(line: &str) -> String {
    line.trim()
        .trim_start_matches('#')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_string()
}

/// Parse a document into sections of paragraphs of sentences.
///
/// A paragraph whose first line looks like a heading opens a new section;
/// any lines after the heading stay in that section as a paragraph. Text
/// with no heading at all forms a single "Section 1".
pub fn parse_document(text: &str) -> Vec<ParsedSection> {
    let mut sections: Vec<ParsedSection> = Vec::new();
    for block in split_paragraphs(text) {
        let mut lines = block.lines();
        let first = lines.next().unwrap_or_default();
        let body = if is_heading(first) {
            let mut title = heading_title(first);
            if title.is_empty() {
                title = format!("Section {}", sections.len() + 1);
            }
            sections.push(ParsedSection {
                title,
                paragraphs: Vec::new(),
            });
            lines.collect::<Vec<_>>().join("\n").trim().to_string()
        } else {
            block.clone()
        };
        if body.is_empty() {
            continue;
        }
        if sections.is_empty() {
            sections.push(ParsedSection {
                title: "Section 1".to_string(),
                paragraphs: Vec::new(),
            });
        }
        let sentences = split_sentences(&body);
        if let Some(section) = sections.last_mut() {
            section.paragraphs.push(ParsedParagraph {
                text: body,
                sentences,
            });
        }
    }
    sections
}

/// First sentence, cut to [`SUMMARY_MAX_CHARS`].
pub fn summarize(text: &str) -> String {
    let first = split_sentences(text)
        .into_iter()
        .next()
        .unwrap_or_else(|| text.trim().to_string());
    truncate_chars(&first, SUMMARY_MAX_CHARS)
}

/// Cut to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_paragraphs_on_blank_lines() {
        let text = "First para\nstill first.\n\nSecond.\r\n\r\n  \n\nThird.";
        let paras = split_paragraphs(text);
        assert_eq!(paras, vec!["First para\nstill first.", "Second.", "Third."]);
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("Hello world. This is it! Is 3 ok? yes. e.g. lower");
        assert_eq!(s, vec!["Hello world.", "This is it!", "Is 3 ok? yes. e.g. lower"]);
    }

    #[test]
    fn test_tokenize_words_and_symbols() {
        assert_eq!(
            tokenize("IMPORTANT: the data_set, v2!"),
            vec!["IMPORTANT", ":", "the", "data_set", ",", "v2", "!"]
        );
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_heading_heuristic() {
        assert!(is_heading("# Overview"));
        assert!(is_heading("Installation:"));
        assert!(is_heading("RELEASE NOTES"));
        assert!(!is_heading("IMPORTANT: the critical information is buried here."));
        assert!(!is_heading("plain prose line"));
    }

    #[test]
    fn test_parse_document_sections() {
        let doc = "Intro text here.\n\n# Setup\nInstall it. Then run it.\n\nMore setup.";
        let sections = parse_document(doc);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Section 1");
        assert_eq!(sections[1].title, "Setup");
        assert_eq!(sections[1].paragraphs.len(), 2);
        assert_eq!(sections[1].paragraphs[0].sentences, vec!["Install it.", "Then run it."]);
    }

    #[test]
    fn test_summary_truncation() {
        let long = "a".repeat(400);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize("Short one. Second."), "Short one.");
    }
}
