//! Resolves queries against the dashboard API.

use std::sync::Arc;

use async_trait::async_trait;
use noticeboard_client::CampusApi;
use noticeboard_common::AppResult;
use noticeboard_common::config::CacheConfig;

use crate::query::{CacheValue, Query};

/// Loads the authoritative value of a query.
#[async_trait]
pub trait QueryFetcher: Send + Sync + 'static {
    async fn fetch(&self, query: &Query) -> AppResult<CacheValue>;
}

/// [`QueryFetcher`] backed by a [`CampusApi`].
///
/// Lists are fetched as their first page, sized from [`CacheConfig`].
pub struct ApiFetcher {
    api: Arc<dyn CampusApi>,
    config: CacheConfig,
}

impl ApiFetcher {
    #[must_use]
    pub fn new(api: Arc<dyn CampusApi>, config: CacheConfig) -> Self {
        Self { api, config }
    }
}

#[async_trait]
impl QueryFetcher for ApiFetcher {
    async fn fetch(&self, query: &Query) -> AppResult<CacheValue> {
        let value = match query {
            Query::Announcements => CacheValue::Announcements(
                self.api
                    .list_announcements(1, self.config.announcements_page_size)
                    .await?,
            ),
            Query::Announcement(id) => {
                CacheValue::Announcement(Box::new(self.api.get_announcement(*id).await?))
            }
            Query::Comments(target) => CacheValue::Comments(
                self.api
                    .list_comments(*target, 1, self.config.comments_page_size)
                    .await?,
            ),
            Query::PollResponses(poll_id) => {
                CacheValue::PollResponses(self.api.poll_responses(*poll_id).await?)
            }
            Query::Users { kind, page, limit } => {
                CacheValue::Users(self.api.list_users(*kind, *page, *limit).await?)
            }
            Query::UserSearch { kind, query } => {
                CacheValue::Users(self.api.search_users(*kind, query).await?)
            }
        };
        Ok(value)
    }
}
