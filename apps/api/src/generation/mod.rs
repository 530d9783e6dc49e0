// Generation workflow: provider selection, failover and fragment merging.
// Provider calls go through the `providers` module; nothing here talks HTTP
// to a vendor directly.

pub mod handlers;
pub mod service;

pub use service::{
    GenerateBody, GenerationConfig, GenerationError, GenerationEvent, GenerationService,
};
