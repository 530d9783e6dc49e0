use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::models::Job;

type Predicate = dyn Fn(Option<&Job>, &Job) -> bool + Send + Sync;

/// Relevance filter applied per subscription before debouncing.
///
/// Built-in filters compare the new snapshot with the previous cached one; the
/// first snapshot of a resource always passes.
#[derive(Clone, Default)]
pub enum ChangeFilter {
    #[default]
    All,
    /// Status changes only.
    Status,
    /// Status, progress or error message changes.
    Progress,
    /// Changes to the merged document.
    Document,
    Custom(Arc<Predicate>),
}

impl ChangeFilter {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(Option<&Job>, &Job) -> bool + Send + Sync + 'static,
    {
        ChangeFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, previous: Option<&Job>, next: &Job) -> bool {
        let Some(prev) = previous else {
            return match self {
                ChangeFilter::Custom(predicate) => predicate(None, next),
                _ => true,
            };
        };

        match self {
            ChangeFilter::All => true,
            ChangeFilter::Status => prev.status != next.status,
            ChangeFilter::Progress => {
                prev.status != next.status
                    || prev.progress != next.progress
                    || prev.error_message != next.error_message
            }
            ChangeFilter::Document => prev.document != next.document,
            ChangeFilter::Custom(predicate) => predicate(Some(prev), next),
        }
    }
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeFilter::All => f.write_str("All"),
            ChangeFilter::Status => f.write_str("Status"),
            ChangeFilter::Progress => f.write_str("Progress"),
            ChangeFilter::Document => f.write_str("Document"),
            ChangeFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for ChangeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(ChangeFilter::All),
            "status" => Ok(ChangeFilter::Status),
            "progress" => Ok(ChangeFilter::Progress),
            "document" => Ok(ChangeFilter::Document),
            other => Err(format!(
                "unknown filter '{other}' (expected all, status, progress or document)"
            )),
        }
    }
}
