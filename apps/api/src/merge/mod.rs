// Progressive enhancement: generated fragments are merged into the job's CV document.

pub mod merger;
pub mod selector;

pub use merger::{apply, merge, ContentFragment, Document, InsertionStrategy, MergeOutcome};
