//! Command denylist — rejects destructive shell constructs before spawning.

use regex_lite::Regex;
use tracing::warn;

/// Patterns always refused, regardless of configuration.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"\bsudo\b",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bmkfs\b",
    r"\bdd\s+if=",
    r"rm\s+-rf\s+/",
    r":\(\)\s*\{\s*:\|:\s*&\s*\};:",
];

/// A compiled set of command patterns.
#[derive(Debug, Clone)]
pub struct CommandDenylist {
    patterns: Vec<(String, Regex)>,
}

impl CommandDenylist {
    /// The built-in denylist plus any extra patterns.
    ///
    /// Extra patterns that fail to compile are skipped with a warning.
    pub fn with_extra(extra: &[String]) -> Self {
        let mut patterns = Vec::new();
        for source in DEFAULT_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned())
        {
            match Regex::new(&source) {
                Ok(re) => patterns.push((source, re)),
                Err(e) => warn!(pattern = %source, error = %e, "Skipping invalid denylist pattern"),
            }
        }
        Self { patterns }
    }

    /// The first pattern matching `command`, if any.
    pub fn matched(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(source, _)| source.as_str())
    }

    pub fn is_denied(&self, command: &str) -> bool {
        self.matched(command).is_some()
    }
}

impl Default for CommandDenylist {
    fn default() -> Self {
        Self::with_extra(&[])
    }
}
