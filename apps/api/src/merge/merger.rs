//! Content merger: splices generated fragments into a CV document.
//!
//! Merging is pure: `apply` never mutates the base document and always returns
//! a document containing the fragment. Any strategy that cannot be carried out
//! (missing or ambiguous target, unsupported selector, malformed markup) falls
//! back to `append`, which cannot fail.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::merge::selector::{find_all, MarkupError, Selector, SelectorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsertionStrategy {
    ReplaceSection,
    InsertAfter,
    InsertBefore,
    Append,
}

/// A named piece of generated markup. Consumed once per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFragment {
    pub id: String,
    pub name: String,
    pub content: String,
    pub strategy: InsertionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,
}

/// The evolving CV document and the fragment ids already merged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub html: String,
    #[serde(default)]
    pub applied_fragments: BTreeSet<String>,
}

impl Document {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            applied_fragments: BTreeSet::new(),
        }
    }

    pub fn has_applied(&self, fragment_id: &str) -> bool {
        self.applied_fragments.contains(fragment_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub document: Document,
    /// Strategy actually used; `None` when the fragment had already been applied.
    pub applied: Option<InsertionStrategy>,
    pub fell_back: bool,
}

impl MergeOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.applied.is_none()
    }
}

#[derive(Debug, Error)]
enum SpliceError {
    #[error("strategy requires a target selector")]
    MissingSelector,
    #[error("target '{0}' not found")]
    TargetMissing(String),
    #[error("target '{selector}' matched {count} elements, expected exactly one")]
    AmbiguousTarget { selector: String, count: usize },
    #[error("target '{0}' is a void element and has no content to replace")]
    VoidTarget(String),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Markup(#[from] MarkupError),
}

/// Merges `fragment` into `base`, returning the new document.
pub fn merge(base: &Document, fragment: &ContentFragment) -> Document {
    apply(base, fragment).document
}

/// Like [`merge`], reporting which strategy was used and whether it fell back.
pub fn apply(base: &Document, fragment: &ContentFragment) -> MergeOutcome {
    if base.has_applied(&fragment.id) {
        debug!("Fragment {} already applied, skipping", fragment.id);
        return MergeOutcome {
            document: base.clone(),
            applied: None,
            fell_back: false,
        };
    }

    let spliced = match fragment.strategy {
        InsertionStrategy::Append => Ok(append_html(&base.html, &fragment.content)),
        strategy => splice(&base.html, fragment, strategy),
    };

    let (html, applied, fell_back) = match spliced {
        Ok(html) => (html, fragment.strategy, false),
        Err(e @ (SpliceError::TargetMissing(_) | SpliceError::MissingSelector)) => {
            warn!(
                "Fragment {} ({:?}): {e}; appending instead",
                fragment.id, fragment.strategy
            );
            (
                append_html(&base.html, &fragment.content),
                InsertionStrategy::Append,
                true,
            )
        }
        Err(e) => {
            error!(
                "Fragment {} ({:?}) could not be spliced: {e}; appending instead",
                fragment.id, fragment.strategy
            );
            (
                append_html(&base.html, &fragment.content),
                InsertionStrategy::Append,
                true,
            )
        }
    };

    let mut applied_fragments = base.applied_fragments.clone();
    applied_fragments.insert(fragment.id.clone());

    MergeOutcome {
        document: Document {
            html,
            applied_fragments,
        },
        applied: Some(applied),
        fell_back,
    }
}

fn splice(
    html: &str,
    fragment: &ContentFragment,
    strategy: InsertionStrategy,
) -> Result<String, SpliceError> {
    let raw_selector = fragment
        .target_selector
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(SpliceError::MissingSelector)?;
    let selector = Selector::parse(raw_selector)?;
    let spans = find_all(html, &selector)?;

    let Some(first) = spans.first().copied() else {
        return Err(SpliceError::TargetMissing(raw_selector.to_string()));
    };

    let content = fragment.content.as_str();
    let (at, until) = match strategy {
        InsertionStrategy::ReplaceSection => {
            if spans.len() > 1 {
                return Err(SpliceError::AmbiguousTarget {
                    selector: raw_selector.to_string(),
                    count: spans.len(),
                });
            }
            if first.is_void() {
                return Err(SpliceError::VoidTarget(raw_selector.to_string()));
            }
            (first.open_end, first.close_start)
        }
        InsertionStrategy::InsertAfter => (first.end, first.end),
        InsertionStrategy::InsertBefore => (first.start, first.start),
        InsertionStrategy::Append => return Ok(append_html(html, content)),
    };

    let mut out = String::with_capacity(html.len() + content.len());
    out.push_str(&html[..at]);
    out.push_str(content);
    out.push_str(&html[until..]);
    Ok(out)
}

/// Inserts `content` before the last `</body>`, or at the end when there is none.
fn append_html(html: &str, content: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let at = lower.rfind("</body").unwrap_or(html.len());

    let mut out = String::with_capacity(html.len() + content.len());
    out.push_str(&html[..at]);
    out.push_str(content);
    out.push_str(&html[at..]);
    out
}
