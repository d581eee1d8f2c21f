//! Exclusion patterns
//!
//! Patterns follow the rsync conventions the transfer engine itself applies:
//! a leading `/` anchors the pattern at the tree root, an unanchored pattern
//! matches the trailing path components (as many as the pattern has), and a
//! trailing `/` is dropped. An excluded directory excludes everything below
//! it.

use crate::error::{Error, Result};
use crate::overlay::MARKER_FILE;
use crate::session::CONTROL_DIR;
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

/// Directory rsync keeps partially transferred files in
pub const PARTIAL_DIR: &str = ".rsync-partial";

/// Patterns excluded from every scan and transfer
pub fn builtin_patterns() -> Vec<String> {
    vec![
        format!("/{}", CONTROL_DIR),
        format!("/{}", MARKER_FILE),
        PARTIAL_DIR.to_string(),
    ]
}

/// Normalize user patterns: drop empty ones and strip a trailing `/`
pub fn normalise_patterns<I, S>(patterns: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .filter_map(|p| {
            let p = p.as_ref().trim();
            if p.is_empty() {
                return None;
            }
            if p.len() > 1 && p.ends_with('/') {
                Some(p[..p.len() - 1].to_string())
            } else {
                Some(p.to_string())
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    direct: Vec<GlobMatcher>,
    descendant: Vec<GlobMatcher>,
}

/// Compiled set of exclusion patterns
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    rules: Vec<Rule>,
}

impl ExcludeSet {
    /// Compile the given (already normalized) patterns
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            rules.push(compile_rule(pattern)?);
        }
        Ok(ExcludeSet { rules })
    }

    /// Builtin patterns followed by the user's
    pub fn with_builtin(user: &[String]) -> Result<Self> {
        let mut patterns = builtin_patterns();
        patterns.extend(normalise_patterns(user));
        Self::new(&patterns)
    }

    /// Patterns in the order they were given
    pub fn patterns(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.pattern.as_str()).collect()
    }

    /// Whether a path relative to the tree root is excluded
    pub fn is_excluded(&self, rel: &Path) -> bool {
        self.rules.iter().any(|rule| {
            rule.direct.iter().any(|m| m.is_match(rel))
                || rule.descendant.iter().any(|m| m.is_match(rel))
        })
    }
}

fn compile_rule(pattern: &str) -> Result<Rule> {
    let anchored = pattern.starts_with('/');
    let core = pattern.trim_start_matches('/');
    if core.is_empty() {
        return Err(Error::InvalidSessionConfig(format!(
            "exclude pattern '{}' matches the whole tree",
            pattern
        )));
    }

    let mut direct = vec![core.to_string()];
    let mut descendant = vec![format!("{}/**", core)];
    if !anchored {
        direct.push(format!("**/{}", core));
        descendant.push(format!("**/{}/**", core));
    }

    Ok(Rule {
        pattern: pattern.to_string(),
        direct: compile_globs(&direct, pattern)?,
        descendant: compile_globs(&descendant, pattern)?,
    })
}

fn compile_globs(globs: &[String], original: &str) -> Result<Vec<GlobMatcher>> {
    globs
        .iter()
        .map(|glob| {
            GlobBuilder::new(glob)
                .literal_separator(true)
                .backslash_escape(true)
                .build()
                .map(|g| g.compile_matcher())
                .map_err(|e| {
                    Error::InvalidSessionConfig(format!(
                        "invalid exclude pattern '{}': {}",
                        original, e
                    ))
                })
        })
        .collect()
}
