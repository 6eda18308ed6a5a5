pub mod auth;
pub mod client;
pub mod db;
pub mod error;
pub mod message;
pub mod pending;
pub mod reconciler;
pub mod status;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use client::{
    ClientConfig, RetrySweepReport, SubmitHandle, SubmitOutcome, Subscription, SyncController,
    TimelineItem, DEFAULT_MODEL,
};
pub use error::SyncError;
pub use reconciler::{Reconciler, SyncReport};
pub use status::ClientStatus;
