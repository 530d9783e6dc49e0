pub mod delivery;
pub mod filter;
#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod source;

pub use delivery::{Notification, SubscriptionFailure};
pub use filter::ChangeFilter;
pub use postgres::PgChangeSource;
pub use registry::{
    ObserveOptions, RegistryError, RegistryStats, Subscription, SubscriptionConfig,
    SubscriptionRegistry, UpstreamStatus,
};
pub use source::{ChangeSource, ChangeStream, SourceError};
