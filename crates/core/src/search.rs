//! Debounced user search for the management screens.

use std::time::Duration;

use noticeboard_common::AppError;
use noticeboard_model::{ManagedUser, UserKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{EntityCache, QuerySubscription, QueryState};
use crate::query::{CacheValue, Query};

/// Results for the last settled query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchState {
    /// Trimmed query the results belong to; empty when idle.
    pub query: String,
    pub users: Vec<ManagedUser>,
    pub is_loading: bool,
    pub error: Option<AppError>,
}

impl SearchState {
    fn from_query(query: &str, state: &QueryState) -> Self {
        Self {
            query: query.to_string(),
            users: state
                .data
                .as_ref()
                .and_then(CacheValue::users)
                .map(<[_]>::to_vec)
                .unwrap_or_default(),
            is_loading: state.is_loading,
            error: state.error.clone(),
        }
    }
}

/// Search box bound to one user collection.
///
/// Keystrokes within the debounce window collapse into one query; blank
/// input clears the results without a request. Results live in the cache
/// under `[kind, "search", query]`, so user mutations refresh them.
pub struct UserSearch {
    input: watch::Sender<String>,
    results: watch::Receiver<SearchState>,
    task: JoinHandle<()>,
}

impl UserSearch {
    pub(crate) fn spawn(cache: EntityCache, kind: UserKind, debounce: Duration) -> Self {
        let (input, input_rx) = watch::channel(String::new());
        let (results_tx, results) = watch::channel(SearchState::default());
        let task = tokio::spawn(run(cache, kind, debounce, input_rx, results_tx));
        Self {
            input,
            results,
            task,
        }
    }

    /// Replace the text in the search box.
    pub fn input(&self, text: &str) {
        self.input.send_replace(text.to_string());
    }

    #[must_use]
    pub fn current(&self) -> SearchState {
        self.results.borrow().clone()
    }

    #[must_use]
    pub fn results(&self) -> watch::Receiver<SearchState> {
        self.results.clone()
    }
}

impl Drop for UserSearch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Step {
    Input(bool),
    Results(Option<QueryState>),
}

async fn next_state(subscription: &mut Option<QuerySubscription>) -> Option<QueryState> {
    match subscription {
        Some(sub) => sub.changed().await,
        None => std::future::pending().await,
    }
}

async fn run(
    cache: EntityCache,
    kind: UserKind,
    debounce: Duration,
    mut input: watch::Receiver<String>,
    results: watch::Sender<SearchState>,
) {
    let mut subscription: Option<QuerySubscription> = None;
    let mut query = String::new();

    loop {
        let step = tokio::select! {
            changed = input.changed() => Step::Input(changed.is_ok()),
            state = next_state(&mut subscription) => Step::Results(state),
        };

        match step {
            Step::Input(false) => return,
            Step::Input(true) => {
                // Quiet period: every further keystroke restarts it.
                loop {
                    match tokio::time::timeout(debounce, input.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }

                let text = input.borrow_and_update().trim().to_string();
                if text == query {
                    continue;
                }
                query = text;
                // Results for the old text are not kept around once unobserved.
                if let Some(previous) = subscription.take() {
                    let key = previous.query().clone();
                    drop(previous);
                    cache.evict(&key);
                }
                if query.is_empty() {
                    results.send_replace(SearchState::default());
                    continue;
                }

                debug!(kind = %kind, query = %query, "Searching users");
                let sub = cache.subscribe(Query::UserSearch {
                    kind,
                    query: query.clone(),
                });
                results.send_replace(SearchState::from_query(&query, &sub.current()));
                subscription = Some(sub);
            }
            Step::Results(Some(state)) => {
                results.send_replace(SearchState::from_query(&query, &state));
            }
            Step::Results(None) => subscription = None,
        }
    }
}
