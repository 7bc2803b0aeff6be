//! Minimal markdown editing for knowledge base documents
//!
//! Edits are splices: the text around an insertion point is copied through
//! byte for byte, so content the engine did not write is never reformatted.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").unwrap());

/// Filesystem-safe key: lowercase, punctuation dropped, whitespace and hyphen runs become `-`
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let cleaned = NON_WORD_RE.replace_all(&lower, "");
    SEPARATOR_RE
        .replace_all(&cleaned, "-")
        .trim_matches(|c| c == '-' || c == '_')
        .to_string()
}

/// Skeleton of a freshly created document
pub fn new_document(title: &str) -> String {
    format!("# {}\n", title.trim())
}

/// ATX heading level of a line, if it is a heading
pub fn heading_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if rest.is_empty() || rest.starts_with(' ') {
            return Some(hashes);
        }
    }
    None
}

/// Insert `entry` at the end of the section introduced by `heading`.
///
/// The section runs until the next heading of the same or a higher level.
/// A missing section is appended at the end of the document.
pub fn insert_under_heading(doc: &str, heading: &str, entry: &str) -> String {
    let level = heading_level(heading).unwrap_or(2);
    let entry = entry.trim_end_matches('\n');

    // (start offset, line without terminator) for every line
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for raw in doc.split_inclusive('\n') {
        lines.push((offset, raw.trim_end_matches(['\n', '\r'])));
        offset += raw.len();
    }

    let Some(start) = lines.iter().position(|(_, line)| line.trim() == heading.trim()) else {
        let mut out = String::with_capacity(doc.len() + heading.len() + entry.len() + 4);
        out.push_str(doc);
        if !doc.is_empty() {
            if !doc.ends_with('\n') {
                out.push('\n');
            }
            if !doc.ends_with("\n\n") {
                out.push('\n');
            }
        }
        out.push_str(heading.trim());
        out.push('\n');
        out.push_str(entry);
        out.push('\n');
        return out;
    };

    let end = lines[start + 1..]
        .iter()
        .position(|(_, line)| heading_level(line).is_some_and(|l| l <= level))
        .map_or(lines.len(), |p| start + 1 + p);

    let mut last = end;
    while last > start + 1 && lines[last - 1].1.trim().is_empty() {
        last -= 1;
    }

    // Insert right after line `last - 1`
    let insert_at = lines.get(last).map_or(doc.len(), |(off, _)| *off);
    let mut out = String::with_capacity(doc.len() + entry.len() + 2);
    out.push_str(&doc[..insert_at]);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(entry);
    out.push('\n');
    out.push_str(&doc[insert_at..]);
    out
}

/// Append a self-contained block, separated by a blank line
pub fn append_block(doc: &str, block: &str) -> String {
    let mut out = String::with_capacity(doc.len() + block.len() + 2);
    out.push_str(doc);
    if !doc.is_empty() {
        if !doc.ends_with('\n') {
            out.push('\n');
        }
        if !doc.ends_with("\n\n") {
            out.push('\n');
        }
    }
    out.push_str(block.trim_matches('\n'));
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Jane Roe"), "jane-roe");
        assert_eq!(slugify("  O'Brien,  Pat -- Jr. "), "obrien-pat-jr");
        assert_eq!(slugify("Rust async: a guide!"), "rust-async-a-guide");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn test_heading_level() {
        assert_eq!(heading_level("# Title"), Some(1));
        assert_eq!(heading_level("## TODO"), Some(2));
        assert_eq!(heading_level("#hashtag"), None);
        assert_eq!(heading_level("- [ ] item"), None);
    }

    #[test]
    fn test_insert_into_existing_section_end() {
        let doc = "# Work\n\n## TODO\n- [P1] first\n\n## Done\n- old\n";
        let out = insert_under_heading(doc, "## TODO", "- [P2] second");
        assert_eq!(
            out,
            "# Work\n\n## TODO\n- [P1] first\n- [P2] second\n\n## Done\n- old\n"
        );
    }

    #[test]
    fn test_insert_into_empty_section() {
        let doc = "# Work\n\n## TODO\n\n## Done\n";
        let out = insert_under_heading(doc, "## TODO", "- [P3] task");
        assert_eq!(out, "# Work\n\n## TODO\n- [P3] task\n\n## Done\n");
    }

    #[test]
    fn test_insert_creates_missing_section() {
        let out = insert_under_heading("# Jane Roe\n", "## Interactions", "- 2024-03-01: hi");
        assert_eq!(out, "# Jane Roe\n\n## Interactions\n- 2024-03-01: hi\n");

        let out = insert_under_heading("", "## TODO", "- [P3] x");
        assert_eq!(out, "## TODO\n- [P3] x\n");
    }

    #[test]
    fn test_insert_keeps_subsections_and_crlf() {
        let doc = "## TODO\r\n- a\r\n### Later\r\n- b\r\n# Next";
        let out = insert_under_heading(doc, "## TODO", "- c");
        // ### is nested inside the TODO section
        assert_eq!(out, "## TODO\r\n- a\r\n### Later\r\n- b\r\n- c\n# Next");
    }

    #[test]
    fn test_insert_at_end_without_trailing_newline() {
        let out = insert_under_heading("## Email Activity\n- one", "## Email Activity", "- two");
        assert_eq!(out, "## Email Activity\n- one\n- two\n");
    }

    #[test]
    fn test_append_block() {
        let out = append_block("# Topic\n", "## Title\nbody\n\n---\n");
        assert_eq!(out, "# Topic\n\n## Title\nbody\n\n---\n");

        let out = append_block(&out, "\n## Second\n---");
        assert!(out.ends_with("---\n\n## Second\n---\n"));
    }
}
