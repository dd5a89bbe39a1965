//! Import neutralization applied to submitted source before anything else.
//!
//! Every physical line, and every `"; "`-separated segment of it, that starts
//! with an `import` or `from` statement is commented out. Lines are never
//! removed or added, so line numbers reported later still match what the
//! caller sent.
//!
//! The first segment of a line is matched on its literal start: an indented
//! import (inside an `if`, a function body, ...) passes through untouched and
//! is left for the restricted compiler to reject.
//!
//! Segments are split only outside string literals and before any `#`
//! comment, so `s = 'a; import b'` keeps its data. Quotes are tracked per
//! physical line: a line inside a multi-line triple-quoted string is still
//! matched on its own.

/// Keywords that open an import statement.
const IMPORT_KEYWORDS: &[&str] = &["import", "from"];

/// Separator between statements that share a physical line.
const SEGMENT_SEPARATOR: &str = "; ";

/// Returns `source` with import statements commented out.
///
/// - A line made only of imports becomes `#<line>`.
/// - A line mixing imports with other statements keeps the other statements
///   and moves the imports into a trailing comment.
pub fn clean_code(source: &str) -> String {
    source
        .split('\n')
        .map(clean_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_line(line: &str) -> String {
    let segments = split_segments(line);

    let (imports, kept): (Vec<(usize, &str)>, Vec<(usize, &str)>) = segments
        .iter()
        .copied()
        .enumerate()
        .partition(|(index, segment)| {
            let candidate = if *index == 0 { *segment } else { segment.trim() };
            starts_with_import(candidate)
        });

    if imports.is_empty() {
        return line.to_string();
    }
    if kept.is_empty() {
        return format!("#{line}");
    }

    let code = kept
        .iter()
        .map(|(_, segment)| *segment)
        .collect::<Vec<_>>()
        .join(SEGMENT_SEPARATOR);
    let neutralized = imports
        .iter()
        .map(|(_, segment)| segment.trim())
        .collect::<Vec<_>>()
        .join(SEGMENT_SEPARATOR);
    format!("{code}  #{neutralized}")
}

/// Splits `line` on [`SEGMENT_SEPARATOR`] outside string literals and comments.
fn split_segments(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let separator = SEGMENT_SEPARATOR.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quote: Option<&[u8]> = None;
    let mut i = 0;
    while i < bytes.len() {
        let rest = &bytes[i..];
        match quote {
            Some(_) if rest[0] == b'\\' => {
                i += 2;
                continue;
            }
            Some(delimiter) if rest.starts_with(delimiter) => {
                i += delimiter.len();
                quote = None;
                continue;
            }
            Some(_) => {}
            None if rest[0] == b'\'' || rest[0] == b'"' => {
                let len = if rest.starts_with(&[rest[0]; 3]) { 3 } else { 1 };
                quote = Some(&rest[..len]);
                i += len;
                continue;
            }
            None if rest[0] == b'#' => break,
            None if rest.starts_with(separator) => {
                segments.push(&line[start..i]);
                i += separator.len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    segments.push(&line[start..]);
    segments
}

/// `true` when `segment` opens with an import keyword followed by whitespace
/// (or nothing). `important = 1` is an assignment, not an import.
fn starts_with_import(segment: &str) -> bool {
    IMPORT_KEYWORDS.iter().any(|keyword| {
        segment.strip_prefix(keyword).map_or(false, |rest| {
            rest.chars().next().map_or(true, char::is_whitespace)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_is_unchanged() {
        let source = "a = 2 + 2\nprint(a)";
        assert_eq!(clean_code(source), source);
    }

    #[test]
    fn test_import_line_is_commented() {
        assert_eq!(clean_code("import os\nos.system('ls')"), "#import os\nos.system('ls')");
    }

    #[test]
    fn test_from_import_is_commented() {
        assert_eq!(clean_code("from os import path"), "#from os import path");
    }

    #[test]
    fn test_line_count_is_preserved() {
        let source = "import os\nx = 1\nfrom a import b\n\ny = 2\n";
        let cleaned = clean_code(source);
        assert_eq!(cleaned.lines().count(), source.lines().count());
        assert_eq!(cleaned.split('\n').count(), source.split('\n').count());
    }

    #[test]
    fn test_semicolon_segment_import_is_neutralized() {
        assert_eq!(clean_code("x = 1; import os"), "x = 1  #import os");
    }

    #[test]
    fn test_all_segments_imports_comments_whole_line() {
        assert_eq!(clean_code("import os; import sys"), "#import os; import sys");
    }

    #[test]
    fn test_segment_with_extra_spaces_is_trimmed() {
        assert_eq!(clean_code("x = 1;   import os"), "x = 1  #import os");
    }

    #[test]
    fn test_indented_import_is_not_caught() {
        let source = "if True:\n    import os";
        assert_eq!(clean_code(source), source);
    }

    #[test]
    fn test_identifier_starting_with_keyword_is_kept() {
        let source = "important = 1\nfromage = 2";
        assert_eq!(clean_code(source), source);
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(clean_code(""), "");
    }

    #[test]
    fn test_commented_line_is_left_alone() {
        let source = "# import os";
        assert_eq!(clean_code(source), source);
    }

    #[test]
    fn test_separator_inside_string_is_kept() {
        let source = "s = 'a; import b'\nt = \"x; from y import z\"";
        assert_eq!(clean_code(source), source);
    }

    #[test]
    fn test_separator_after_string_still_splits() {
        assert_eq!(
            clean_code("s = \"a; b\"; import os"),
            "s = \"a; b\"  #import os"
        );
        assert_eq!(
            clean_code("s = 'it\\'s; ok'; import os"),
            "s = 'it\\'s; ok'  #import os"
        );
        assert_eq!(
            clean_code("s = '''a; b'''; from os import path"),
            "s = '''a; b'''  #from os import path"
        );
    }

    #[test]
    fn test_separator_inside_comment_is_kept() {
        let source = "x = 1  # note; import os";
        assert_eq!(clean_code(source), source);
    }
}
