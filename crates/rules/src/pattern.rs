use anyhow::{Context, Result};

/// Executable match pattern. All comparisons run against a pre-lowercased
/// exe path and base name.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Bare name, compared against the base name.
    Literal(String),
    /// Path fragment containing a separator, compared as a path suffix.
    Suffix(String),
    /// Trailing-separator pattern, compared as a directory prefix.
    Directory(String),
    /// `regex:<expr>`, matched against the full exe path.
    Regex(regex::Regex),
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix("regex:") {
            let re = regex::Regex::new(expr)
                .with_context(|| format!("invalid rule regex: {expr}"))?;
            return Ok(Pattern::Regex(re));
        }
        let lowered = raw.to_lowercase();
        if lowered.ends_with('/') || lowered.ends_with('\\') {
            Ok(Pattern::Directory(lowered))
        } else if lowered.contains('/') || lowered.contains('\\') {
            Ok(Pattern::Suffix(lowered))
        } else {
            Ok(Pattern::Literal(lowered))
        }
    }

    pub fn matches(&self, exe: &str, base: &str) -> bool {
        match self {
            Pattern::Literal(name) => base == name,
            Pattern::Suffix(suffix) => exe.ends_with(suffix.as_str()),
            Pattern::Directory(dir) => exe.starts_with(dir.as_str()),
            Pattern::Regex(re) => re.is_match(exe),
        }
    }
}
