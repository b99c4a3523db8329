//! Change-set filters.
//!
//! Sweeps combine the replicator's user-supplied CQL with structural clauses (origin exclusion,
//! modified-after watermark, tombstones, failure list). Adapters render the tree with
//! [`Filter::to_cql`]; in-process stores can evaluate it with [`Filter::matches`], where user CQL
//! is treated as matching everything.

use crate::adapter::Metadata;
use crate::error::{ReplError, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Item identifier.
pub const ID: &str = "id";
/// Sites an item was replicated through.
pub const ORIGINS: &str = "replication.origins";
/// Catalog tags.
pub const TAGS: &str = "metacard-tags";
/// Metadata modified time.
pub const MODIFIED: &str = "metacard.modified";
/// Time a version record was written.
pub const VERSIONED_ON: &str = "metacard.version.versioned-on";
/// Action recorded by a version record.
pub const VERSION_ACTION: &str = "metacard.version.action";

/// A selection predicate over catalog items.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every clause must match. An empty list matches everything.
    All(Vec<Filter>),
    /// At least one clause must match. An empty list matches nothing.
    Any(Vec<Filter>),
    /// Negation.
    Not(Box<Filter>),
    /// Text attribute equality.
    Equals {
        /// Attribute name.
        attribute: &'static str,
        /// Expected value.
        value: String,
    },
    /// Text attribute glob (`*` wildcard).
    Like {
        /// Attribute name.
        attribute: &'static str,
        /// Pattern.
        pattern: String,
    },
    /// Date attribute strictly after a time.
    After {
        /// Attribute name.
        attribute: &'static str,
        /// Exclusive lower bound.
        time: DateTime<Utc>,
    },
    /// Validated user CQL, passed through to the adapter.
    Cql(String),
}

impl Filter {
    /// Parse-check user CQL and wrap it.
    pub fn cql(text: &str) -> Result<Filter> {
        validate_cql(text)?;
        Ok(Filter::Cql(text.trim().to_string()))
    }

    /// Equality clause.
    pub fn equals(attribute: &'static str, value: impl Into<String>) -> Filter {
        Filter::Equals {
            attribute,
            value: value.into(),
        }
    }

    /// Glob clause.
    pub fn like(attribute: &'static str, pattern: impl Into<String>) -> Filter {
        Filter::Like {
            attribute,
            pattern: pattern.into(),
        }
    }

    /// Date clause.
    pub fn after(attribute: &'static str, time: DateTime<Utc>) -> Filter {
        Filter::After { attribute, time }
    }

    /// Negate a clause.
    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Filter) -> Filter {
        Filter::Not(Box::new(inner))
    }

    /// Render as CQL text.
    pub fn to_cql(&self) -> String {
        match self {
            Filter::All(clauses) if clauses.is_empty() => "INCLUDE".to_string(),
            Filter::Any(clauses) if clauses.is_empty() => "EXCLUDE".to_string(),
            Filter::All(clauses) => join(clauses, " AND "),
            Filter::Any(clauses) => join(clauses, " OR "),
            Filter::Not(inner) => format!("NOT ({})", inner.to_cql()),
            Filter::Equals { attribute, value } => {
                format!("\"{}\" = '{}'", attribute, escape(value))
            }
            Filter::Like { attribute, pattern } => {
                format!("\"{}\" LIKE '{}'", attribute, escape(pattern))
            }
            Filter::After { attribute, time } => format!(
                "\"{}\" AFTER {}",
                attribute,
                time.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            Filter::Cql(text) => text.clone(),
        }
    }

    /// Evaluate against an item held in process.
    pub fn matches(&self, item: &Metadata) -> bool {
        match self {
            Filter::All(clauses) => clauses.iter().all(|c| c.matches(item)),
            Filter::Any(clauses) => clauses.iter().any(|c| c.matches(item)),
            Filter::Not(inner) => !inner.matches(item),
            Filter::Equals { attribute, value } => match *attribute {
                ID => item.id == *value,
                TAGS => item.tags.iter().any(|t| t == value),
                ORIGINS => item.origins.iter().any(|o| o == value),
                _ => false,
            },
            Filter::Like { attribute, pattern } => match *attribute {
                VERSION_ACTION => item.deleted && glob_matches(pattern, "Deleted"),
                ID => glob_matches(pattern, &item.id),
                _ => false,
            },
            Filter::After { attribute, time } => match *attribute {
                MODIFIED => item.metadata_modified > *time,
                VERSIONED_ON => item.deleted && item.metadata_modified > *time,
                _ => false,
            },
            Filter::Cql(_) => true,
        }
    }
}

fn join(clauses: &[Filter], op: &str) -> String {
    clauses
        .iter()
        .map(|c| format!("({})", c.to_cql()))
        .collect::<Vec<_>>()
        .join(op)
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Reject CQL that is empty or structurally broken (unbalanced parentheses or quotes).
pub fn validate_cql(text: &str) -> Result<()> {
    let invalid = |msg: &str| ReplError::InvalidFilter {
        filter: text.to_string(),
        msg: msg.to_string(),
    };

    if text.trim().is_empty() {
        return Err(invalid("filter is empty"));
    }

    let mut depth: i32 = 0;
    let mut in_quote = false;
    for c in text.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err(invalid("unexpected ')'"));
                }
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(invalid("unterminated string literal"));
    }
    if depth != 0 {
        return Err(invalid("unbalanced parentheses"));
    }
    Ok(())
}
