//! Lexical dependency extraction.
//!
//! This is a regex heuristic, not a parse. It may report names an
//! expression never actually reads, but must not miss one it does.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Comment delimiters of one binding language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    line_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_comment: Option<(String, String)>,
}

impl CommentStyle {
    #[must_use]
    pub fn new(line: Option<&str>, block: Option<(&str, &str)>) -> Self {
        Self {
            line_comment: line.map(str::to_string),
            block_comment: block.map(|(open, close)| (open.to_string(), close.to_string())),
        }
    }

    /// `-- …` and `/* … */`.
    #[must_use]
    pub fn query() -> Self {
        Self::new(Some("--"), Some(("/*", "*/")))
    }

    /// `// …` and `/* … */`.
    #[must_use]
    pub fn script() -> Self {
        Self::new(Some("//"), Some(("/*", "*/")))
    }

    /// `# …`.
    #[must_use]
    pub fn kernel() -> Self {
        Self::new(Some("#"), None)
    }

    /// Body of the comment the text opens with, if it opens with one.
    fn leading_comment<'t>(&self, text: &'t str) -> Option<&'t str> {
        let text = text.trim_start();
        if let Some((open, close)) = &self.block_comment {
            if let Some(rest) = text.strip_prefix(open.as_str()) {
                return Some(rest.find(close.as_str()).map_or(rest, |end| &rest[..end]));
            }
        }
        let line = self.line_comment.as_deref()?;
        let rest = text.strip_prefix(line)?;
        Some(rest.lines().next().unwrap_or(""))
    }
}

struct Patterns {
    at_name: Regex,
    globals_member: Regex,
    query_set: Regex,
    query_def: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        at_name: Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)").expect("valid @name regex"),
        globals_member: Regex::new(r"\bglobals\.([A-Za-z_$][A-Za-z0-9_$]*)")
            .expect("valid globals member regex"),
        query_set: Regex::new(r"(?i)\bset\s+@([A-Za-z_][A-Za-z0-9_]*)\s*=")
            .expect("valid query set regex"),
        query_def: Regex::new(r"(?i)\bdef\s+@([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .expect("valid query def regex"),
    })
}

fn captures(re: &Regex, text: &str) -> BTreeSet<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// How the full text is scanned when there is no magic comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// `@name` references; `set @x =` and `def @x(` are local definitions.
    Query,
    /// `globals.name` member accesses.
    Script,
    /// Plain `@name` references.
    AtNames,
}

/// Extracts referenced global names from binding text.
#[derive(Debug, Clone)]
pub struct DependencyScanner {
    style: CommentStyle,
    mode: ScanMode,
}

impl DependencyScanner {
    #[must_use]
    pub fn new(style: CommentStyle, mode: ScanMode) -> Self {
        Self { style, mode }
    }

    #[must_use]
    pub fn scan(&self, text: &str) -> BTreeSet<String> {
        let p = patterns();

        // An author-written leading comment listing @names replaces the scan.
        if let Some(comment) = self.style.leading_comment(text) {
            let named = captures(&p.at_name, comment);
            if !named.is_empty() {
                return named;
            }
        }

        match self.mode {
            ScanMode::AtNames => captures(&p.at_name, text),
            ScanMode::Script => captures(&p.globals_member, text),
            ScanMode::Query => {
                let mut names = captures(&p.at_name, text);
                for local in captures(&p.query_set, text)
                    .into_iter()
                    .chain(captures(&p.query_def, text))
                {
                    names.remove(&local);
                }
                names
            }
        }
    }
}
