//! Suggestion intake
//!
//! Parses a generator's free-text review output into structured
//! suggestions. The format is header-driven: `FILE:` starts a record,
//! scalar headers take the rest of their line, and the two code headers
//! capture every following line until the next recognized header. Fences
//! around code blocks are stripped. Records missing a file path or
//! improved code are skipped with a warning rather than failing the batch.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::types::{Priority, Suggestion, SuggestionStatus};

#[derive(Default)]
struct Draft {
    file: Option<String>,
    priority: Option<Priority>,
    description: String,
    current_code: Vec<String>,
    improved_code: Vec<String>,
    confidence: Option<f64>,
}

enum Capture {
    None,
    CurrentCode,
    ImprovedCode,
}

/// Parse zero or more suggestions out of free text.
pub fn parse_suggestions(text: &str) -> Vec<Suggestion> {
    let mut out = Vec::new();
    let mut draft: Option<Draft> = None;
    let mut capture = Capture::None;

    for line in text.lines() {
        let trimmed = line.trim_start();

        if let Some(rest) = trimmed.strip_prefix("FILE:") {
            if let Some(done) = draft.take() {
                push_draft(done, &mut out);
            }
            draft = Some(Draft {
                file: Some(rest.trim().to_string()),
                ..Draft::default()
            });
            capture = Capture::None;
            continue;
        }

        let Some(d) = draft.as_mut() else {
            continue;
        };

        if let Some(rest) = trimmed.strip_prefix("PRIORITY:") {
            d.priority = Priority::parse(rest);
            capture = Capture::None;
        } else if let Some(rest) = trimmed.strip_prefix("DESCRIPTION:") {
            d.description = rest.trim().to_string();
            capture = Capture::None;
        } else if let Some(rest) = trimmed.strip_prefix("CONFIDENCE:") {
            d.confidence = rest.trim().parse::<f64>().ok();
            capture = Capture::None;
        } else if let Some(rest) = trimmed.strip_prefix("CURRENT_CODE:") {
            capture = Capture::CurrentCode;
            let rest = rest.trim();
            if !rest.is_empty() {
                d.current_code.push(rest.to_string());
            }
        } else if let Some(rest) = trimmed.strip_prefix("IMPROVED_CODE:") {
            capture = Capture::ImprovedCode;
            let rest = rest.trim();
            if !rest.is_empty() {
                d.improved_code.push(rest.to_string());
            }
        } else {
            match capture {
                Capture::CurrentCode => d.current_code.push(line.to_string()),
                Capture::ImprovedCode => d.improved_code.push(line.to_string()),
                Capture::None => {}
            }
        }
    }

    if let Some(done) = draft.take() {
        push_draft(done, &mut out);
    }
    out
}

fn push_draft(draft: Draft, out: &mut Vec<Suggestion>) {
    let Some(file) = draft.file.filter(|f| !f.is_empty()) else {
        warn!("Skipping suggestion with no file path");
        return;
    };

    let improved = strip_fences(&draft.improved_code.join("\n"));
    if improved.trim().is_empty() {
        warn!("Skipping suggestion for {}: no improved code", file);
        return;
    }

    let current = strip_fences(&draft.current_code.join("\n"));
    let current_code = if current.trim().is_empty() {
        None
    } else {
        Some(current)
    };

    out.push(Suggestion {
        id: Uuid::new_v4().to_string(),
        file_path: file,
        description: draft.description,
        priority: draft.priority.unwrap_or(Priority::Medium),
        confidence: draft.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        current_code,
        improved_code: improved,
        status: SuggestionStatus::Pending,
        created_at: Utc::now().to_rfc3339(),
        applied_at: None,
        error: None,
        attempt_id: None,
        branch: None,
    });
}

/// Drop leading/trailing triple-backtick fence lines, including language
/// tags like ```` ```python ````.
pub fn strip_fences(code: &str) -> String {
    let mut lines: Vec<&str> = code.lines().collect();
    while lines
        .first()
        .map(|l| l.trim().is_empty())
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.pop();
    }

    if lines
        .first()
        .map(|l| l.trim_start().starts_with("```"))
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    if lines
        .last()
        .map(|l| l.trim() == "```")
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_suggestion() {
        let text = "\
FILE: src/utils.py
PRIORITY: high
DESCRIPTION: Use a set for membership tests
CURRENT_CODE:
if x in [1, 2, 3]:
IMPROVED_CODE:
if x in {1, 2, 3}:
CONFIDENCE: 0.9
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed.len(), 1);
        let s = &parsed[0];
        assert_eq!(s.file_path, "src/utils.py");
        assert_eq!(s.priority, Priority::High);
        assert_eq!(s.description, "Use a set for membership tests");
        assert_eq!(s.current_code.as_deref(), Some("if x in [1, 2, 3]:"));
        assert_eq!(s.improved_code, "if x in {1, 2, 3}:");
        assert!((s.confidence - 0.9).abs() < 1e-9);
        assert_eq!(s.status, SuggestionStatus::Pending);
    }

    #[test]
    fn test_multiline_code_runs_until_next_header() {
        let text = "\
FILE: a.py
IMPROVED_CODE:
def f():
    return 1

def g():
    return 2
CONFIDENCE: 0.7
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].improved_code.contains("def f():"));
        assert!(parsed[0].improved_code.contains("def g():"));
        assert!(!parsed[0].improved_code.contains("CONFIDENCE"));
    }

    #[test]
    fn test_multiple_suggestions_split_on_file() {
        let text = "\
FILE: a.py
IMPROVED_CODE:
x = 1
FILE: b.py
IMPROVED_CODE:
y = 2
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].file_path, "a.py");
        assert_eq!(parsed[1].file_path, "b.py");
    }

    #[test]
    fn test_fences_stripped() {
        let text = "\
FILE: a.py
IMPROVED_CODE:
```python
x = 1
```
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed[0].improved_code, "x = 1");
    }

    #[test]
    fn test_record_without_improved_code_skipped() {
        let text = "\
FILE: a.py
DESCRIPTION: nothing useful
FILE: b.py
IMPROVED_CODE:
ok = True
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].file_path, "b.py");
    }

    #[test]
    fn test_preamble_text_ignored() {
        let text = "\
Here are my findings after reviewing the codebase:

FILE: a.py
PRIORITY: low
IMPROVED_CODE:
x = 1
";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].priority, Priority::Low);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let text = "FILE: a.py\nIMPROVED_CODE:\nx = 1\n";
        let parsed = parse_suggestions(text);
        assert_eq!(parsed[0].priority, Priority::Medium);
        assert!((parsed[0].confidence - 0.5).abs() < 1e-9);
        assert!(parsed[0].current_code.is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let text = "FILE: a.py\nIMPROVED_CODE:\nx = 1\nCONFIDENCE: 3.5\n";
        let parsed = parse_suggestions(text);
        assert!((parsed[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_strip_fences_no_fence_is_identity() {
        assert_eq!(strip_fences("x = 1\ny = 2"), "x = 1\ny = 2");
    }
}
