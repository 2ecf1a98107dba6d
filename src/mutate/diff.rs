//! Diff generation for the modification audit trail.
//!
//! A lightweight line-by-line unified-style diff -- no external crate
//! required. Good enough for audit logs; not a minimal edit script.

/// Maximum diff string length stored in the audit log.
pub const MAX_DIFF_SIZE: usize = 10_000;

/// Produce a unified-style diff between `old` and `new` for `path`.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut body = String::new();
    let max = old_lines.len().max(new_lines.len());

    for i in 0..max {
        let old_line = old_lines.get(i).copied();
        let new_line = new_lines.get(i).copied();

        match (old_line, new_line) {
            (Some(o), Some(n)) if o != n => {
                body.push_str(&format!("-{}\n", o));
                body.push_str(&format!("+{}\n", n));
            }
            (Some(o), None) => {
                body.push_str(&format!("-{}\n", o));
            }
            (None, Some(n)) => {
                body.push_str(&format!("+{}\n", n));
            }
            _ => {
                // Equal lines carry no context, for brevity.
            }
        }
    }

    if body.is_empty() {
        return String::new();
    }

    format!("--- a/{}\n+++ b/{}\n{}", path, path, body)
}

/// Truncate a diff for storage, marking the cut.
pub fn truncate_diff(diff: &str) -> String {
    if diff.len() > MAX_DIFF_SIZE {
        let mut cut = MAX_DIFF_SIZE;
        while !diff.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...[truncated]", &diff[..cut])
    } else {
        diff.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_yields_empty_diff() {
        let text = "hello\nworld\n";
        assert_eq!(unified_diff("a.py", text, text), "");
    }

    #[test]
    fn test_additions_and_removals() {
        let diff = unified_diff("a.py", "a\nb\n", "a\nc\nd\n");
        assert!(diff.starts_with("--- a/a.py\n+++ b/a.py\n"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
        assert!(diff.contains("+d"));
    }

    #[test]
    fn test_new_file_diff_is_all_additions() {
        let diff = unified_diff("a.py", "", "x = 1\n");
        assert!(diff.contains("+x = 1"));
        assert!(!diff.contains("\n-"));
    }

    #[test]
    fn test_truncation() {
        let long = "x".repeat(MAX_DIFF_SIZE + 100);
        let truncated = truncate_diff(&long);
        assert!(truncated.ends_with("...[truncated]"));
        assert!(truncated.len() < long.len());
    }
}
