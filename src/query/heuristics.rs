use regex::Regex;
use std::sync::OnceLock;

/// Advisory pattern set layered on top of strict parameterization. These
/// checks flag suspicious input; parameter binding is what actually keeps
/// values out of the SQL text.
struct Pattern {
    regex: Regex,
    label: &'static str,
}

fn patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                regex: Regex::new(r"'\s*;").expect("invalid pattern"),
                label: "quote-then-statement-terminator",
            },
            Pattern {
                regex: Regex::new(r"(?i)\b(drop|delete|update|insert|alter|create)\b")
                    .expect("invalid pattern"),
                label: "data-definition keyword",
            },
            Pattern {
                regex: Regex::new(r"--").expect("invalid pattern"),
                label: "line comment marker",
            },
            Pattern {
                regex: Regex::new(r"/\*").expect("invalid pattern"),
                label: "block comment open",
            },
            Pattern {
                regex: Regex::new(r"\*/").expect("invalid pattern"),
                label: "block comment close",
            },
        ]
    })
}

/// True when the text trips any advisory pattern.
pub fn contains_dangerous_pattern(text: &str) -> bool {
    patterns().iter().any(|p| p.regex.is_match(text))
}

/// Returns one warning per tripped pattern.
pub fn scan(text: &str) -> Vec<String> {
    patterns()
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| format!("input matches {}", p.label))
        .collect()
}
