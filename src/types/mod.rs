//! Core domain types shared across the bot.

pub mod checks;
pub mod ids;
pub mod item;
pub mod pr;

pub use checks::{CheckConclusion, CheckStatus, CheckSuite, CombinedState, CombinedStatus};
pub use ids::{DedupKey, InstallationId, LeaseToken, PrNumber, RepoId, RepoKey, Sha};
pub use item::WorkItem;
pub use pr::{MergeableState, PrSnapshot, PrState};
