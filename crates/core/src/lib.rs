//! Client-side state for the noticeboard dashboard.
//!
//! The [`EntityCache`] holds query results; the [`Synchronizer`] keeps it
//! consistent with REST mutations and server-pushed events.

pub mod cache;
pub mod edit;
pub mod fetcher;
pub mod query;
pub mod search;
pub mod sync;

pub use cache::{EntityCache, QueryState, QuerySubscription};
pub use edit::{EditDraft, EditSession, EditState};
pub use fetcher::{ApiFetcher, QueryFetcher};
pub use query::{CacheValue, KeyPart, Query, QueryKey};
pub use search::{SearchState, UserSearch};
pub use sync::{LiveSync, PendingVotes, SyncScope, Synchronizer};
