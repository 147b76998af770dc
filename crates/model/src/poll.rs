//! Polls, options and toggle-vote responses.

use chrono::{DateTime, Utc};
use noticeboard_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};

use crate::UserId;
use crate::announcement::AnnouncementId;

/// Poll identity.
pub type PollId = i64;

/// Poll option identity.
pub type OptionId = i64;

/// Response identity.
pub type ResponseId = i64;

/// Minimum number of non-blank options.
pub const MIN_OPTIONS: usize = 2;

/// Maximum number of options.
pub const MAX_OPTIONS: usize = 10;

/// Maximum option length in characters.
pub const MAX_OPTION_LEN: usize = 100;

/// Scope a poll belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    #[default]
    General,
    Course,
}

/// Poll attached to a poll-type announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    #[serde(rename = "poll_id")]
    pub id: PollId,
    #[serde(rename = "general_announcement_id")]
    pub announcement_id: AnnouncementId,
    #[serde(rename = "type", default)]
    pub kind: PollKind,
    #[serde(default)]
    pub allow_multiple_answers: bool,
    #[serde(default)]
    pub options: Vec<PollOption>,
}

impl Poll {
    /// Look up an option by id.
    #[must_use]
    pub fn option(&self, option_id: OptionId) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// One selectable answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    #[serde(rename = "option_id")]
    pub id: OptionId,
    #[serde(default)]
    pub poll_id: PollId,
    #[serde(alias = "option_text")]
    pub text: String,
}

/// A user's live vote for one option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(rename = "response_id")]
    pub id: ResponseId,
    pub poll_id: PollId,
    #[serde(rename = "poll_option_id")]
    pub option_id: OptionId,
    pub user_id: UserId,
    #[serde(alias = "responded_at")]
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /polls/toggle-vote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleVote {
    pub poll_id: PollId,
    pub option_id: OptionId,
}

/// Body of `POST /polls`, also embedded in poll announcement creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePollPayload {
    #[serde(rename = "announcementId", skip_serializing_if = "Option::is_none")]
    pub announcement_id: Option<AnnouncementId>,
    #[serde(rename = "type")]
    pub kind: PollKind,
    pub allow_multiple_answers: bool,
    pub options: Vec<String>,
}

impl CreatePollPayload {
    /// Build a validated poll payload.
    ///
    /// Blank options are dropped; what remains must be 2-10 distinct
    /// options of at most 100 characters.
    pub fn new(
        announcement_id: Option<AnnouncementId>,
        options: Vec<String>,
        allow_multiple: bool,
    ) -> AppResult<Self> {
        let options: Vec<String> = options
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        if options.len() < MIN_OPTIONS {
            return Err(AppError::Validation(format!(
                "poll must have at least {MIN_OPTIONS} options"
            )));
        }
        if options.len() > MAX_OPTIONS {
            return Err(AppError::Validation(format!(
                "poll cannot have more than {MAX_OPTIONS} options"
            )));
        }
        if let Some(long) = options.iter().find(|o| o.chars().count() > MAX_OPTION_LEN) {
            return Err(AppError::Validation(format!(
                "poll option is too long (max {MAX_OPTION_LEN} chars): {long}"
            )));
        }
        for (i, option) in options.iter().enumerate() {
            if options[..i].iter().any(|o| o.eq_ignore_ascii_case(option)) {
                return Err(AppError::Validation(format!(
                    "duplicate poll option: {option}"
                )));
            }
        }

        Ok(Self {
            announcement_id,
            kind: PollKind::General,
            allow_multiple_answers: allow_multiple,
            options,
        })
    }
}

/// Whether `user_id` currently has a live response for `option_id`.
///
/// Always computed from the cached response list; never stored.
#[must_use]
pub fn has_voted(responses: &[PollResponse], user_id: UserId, option_id: OptionId) -> bool {
    responses
        .iter()
        .any(|r| r.user_id == user_id && r.option_id == option_id)
}

/// Apply one toggle to a poll's response list.
///
/// Voting an option the user already holds removes it. Otherwise the vote is
/// added, and on a single-answer poll every other response of that user on
/// the poll is removed first.
pub fn toggle_response(
    poll: &Poll,
    responses: &[PollResponse],
    user_id: UserId,
    option_id: OptionId,
    next_id: ResponseId,
    at: DateTime<Utc>,
) -> AppResult<Vec<PollResponse>> {
    if poll.option(option_id).is_none() {
        return Err(AppError::BadRequest(format!(
            "option {option_id} does not belong to poll {}",
            poll.id
        )));
    }

    let mine = |r: &PollResponse| r.poll_id == poll.id && r.user_id == user_id;

    if responses
        .iter()
        .any(|r| mine(r) && r.option_id == option_id)
    {
        return Ok(responses
            .iter()
            .filter(|r| !(mine(r) && r.option_id == option_id))
            .cloned()
            .collect());
    }

    let mut next: Vec<PollResponse> = responses
        .iter()
        .filter(|r| poll.allow_multiple_answers || !mine(r))
        .cloned()
        .collect();
    next.push(PollResponse {
        id: next_id,
        poll_id: poll.id,
        option_id,
        user_id,
        created_at: at,
    });
    Ok(next)
}

/// Per-option aggregate for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTally {
    pub option_id: OptionId,
    pub text: String,
    pub votes: usize,
    pub voted_by_user: bool,
    /// A toggle for this option is in flight and not yet reflected.
    pub pending: bool,
}

/// Aggregated view of a poll for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTally {
    pub poll_id: PollId,
    pub allow_multiple_answers: bool,
    pub options: Vec<OptionTally>,
    pub total_votes: usize,
    pub voters: usize,
}

impl PollTally {
    /// Compute counts and the user's vote presence from a response list.
    pub fn compute(
        poll: &Poll,
        responses: &[PollResponse],
        user_id: UserId,
        is_pending: impl Fn(OptionId) -> bool,
    ) -> Self {
        let relevant: Vec<&PollResponse> =
            responses.iter().filter(|r| r.poll_id == poll.id).collect();

        let options: Vec<OptionTally> = poll
            .options
            .iter()
            .map(|option| OptionTally {
                option_id: option.id,
                text: option.text.clone(),
                votes: relevant.iter().filter(|r| r.option_id == option.id).count(),
                voted_by_user: relevant
                    .iter()
                    .any(|r| r.user_id == user_id && r.option_id == option.id),
                pending: is_pending(option.id),
            })
            .collect();

        let total_votes = options.iter().map(|o| o.votes).sum();
        let mut voters: Vec<UserId> = relevant.iter().map(|r| r.user_id).collect();
        voters.sort_unstable();
        voters.dedup();

        Self {
            poll_id: poll.id,
            allow_multiple_answers: poll.allow_multiple_answers,
            options,
            total_votes,
            voters: voters.len(),
        }
    }

    /// Aggregate for one option.
    #[must_use]
    pub fn option(&self, option_id: OptionId) -> Option<&OptionTally> {
        self.options.iter().find(|o| o.option_id == option_id)
    }
}
