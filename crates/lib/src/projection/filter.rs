//! Glob filters selecting which host files enter a projection.
//!
//! Patterns are matched against paths relative to the source root, using
//! `/` as the separator. A pattern that matches a directory applies to
//! everything beneath it, so `node_modules` excludes the whole tree and
//! `vendor` includes every vendored package.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

/// Which files a projection carries.
///
/// Include and exclude are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
  /// Only paths matching at least one pattern.
  IncludeOnly(Vec<String>),
  /// Every path except those matching any pattern.
  ExcludeOnly(Vec<String>),
}

impl Filter {
  pub fn patterns(&self) -> &[String] {
    match self {
      Filter::IncludeOnly(patterns) | Filter::ExcludeOnly(patterns) => patterns,
    }
  }

  pub fn mode(&self) -> &'static str {
    match self {
      Filter::IncludeOnly(_) => "include",
      Filter::ExcludeOnly(_) => "exclude",
    }
  }

  pub fn compile(&self) -> Result<CompiledFilter, FilterError> {
    let patterns = self
      .patterns()
      .iter()
      .map(|raw| CompiledPattern::new(raw))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledFilter {
      include: matches!(self, Filter::IncludeOnly(_)),
      patterns,
    })
  }
}

#[derive(Debug, Error)]
pub enum FilterError {
  #[error("invalid pattern `{pattern}`: {message}")]
  InvalidPattern { pattern: String, message: String },
}

#[derive(Debug)]
struct CompiledPattern {
  whole: Pattern,
  /// One pattern per `/`-separated component, for directory pruning.
  components: Vec<Pattern>,
  /// Component index of the first `**`, if any.
  recursive_at: Option<usize>,
}

impl CompiledPattern {
  fn new(raw: &str) -> Result<Self, FilterError> {
    let invalid = |message: &str| FilterError::InvalidPattern {
      pattern: raw.to_string(),
      message: message.to_string(),
    };

    let trimmed = raw.trim().trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
      return Err(invalid("pattern is empty"));
    }
    if trimmed.starts_with('/') {
      return Err(invalid("pattern must be relative to the source root"));
    }
    if trimmed.split('/').any(|c| c == "..") {
      return Err(invalid("pattern must not leave the source root"));
    }

    let whole = Pattern::new(trimmed).map_err(|e| invalid(e.msg))?;
    let parts: Vec<&str> = trimmed.split('/').collect();
    let recursive_at = parts.iter().position(|c| *c == "**");
    let components = parts
      .iter()
      .map(|c| Pattern::new(c).map_err(|e| invalid(e.msg)))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      whole,
      components,
      recursive_at,
    })
  }

  /// Whether this pattern matches `rel` or one of its ancestors.
  fn covers(&self, rel: &str) -> bool {
    if self.whole.matches_with(rel, MATCH_OPTIONS) {
      return true;
    }
    rel
      .match_indices('/')
      .any(|(idx, _)| self.whole.matches_with(&rel[..idx], MATCH_OPTIONS))
  }

  /// Whether something strictly below directory `dir` could match.
  fn may_match_below(&self, dir: &[&str]) -> bool {
    for (i, name) in dir.iter().enumerate() {
      if self.recursive_at.is_some_and(|at| at <= i) {
        return true;
      }
      match self.components.get(i) {
        Some(component) if component.matches_with(name, MATCH_OPTIONS) => {}
        _ => return false,
      }
    }
    self.components.len() > dir.len()
  }
}

/// A filter ready for matching.
#[derive(Debug)]
pub struct CompiledFilter {
  include: bool,
  patterns: Vec<CompiledPattern>,
}

impl CompiledFilter {
  /// Whether the file at `rel` belongs in the projection.
  pub fn selects(&self, rel: &str) -> bool {
    let hit = self.patterns.iter().any(|p| p.covers(rel));
    if self.include { hit } else { !hit }
  }

  /// Whether the walk should descend into directory `rel`.
  pub fn descend(&self, rel: &str) -> bool {
    if self.include {
      if self.patterns.iter().any(|p| p.covers(rel)) {
        return true;
      }
      let parts: Vec<&str> = rel.split('/').collect();
      self.patterns.iter().any(|p| p.may_match_below(&parts))
    } else {
      !self.patterns.iter().any(|p| p.covers(rel))
    }
  }
}
