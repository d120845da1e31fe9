//! Live polls: at most one open poll per session, votes counted in memory.
use crate::error::AppError;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ActivePoll {
    pub id: u64,
    pub question: String,
    pub options: Vec<String>,
    pub ends_at: Option<DateTime<Utc>>,
    by_client: HashMap<String, usize>,
    anonymous: Vec<u32>,
}

impl ActivePoll {
    pub fn new(
        id: u64,
        question: String,
        options: Vec<String>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Self {
        let anonymous = vec![0; options.len()];
        Self {
            id,
            question,
            options,
            ends_at,
            by_client: HashMap::new(),
            anonymous,
        }
    }

    pub fn votes(&self) -> Vec<u32> {
        let mut votes = self.anonymous.clone();
        for index in self.by_client.values() {
            votes[*index] += 1;
        }
        votes
    }
}

/// Final result of a closed poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub poll_id: u64,
    pub votes: Vec<u32>,
}

impl PollResult {
    pub fn total(&self) -> u32 {
        self.votes.iter().sum()
    }
}

#[derive(Debug, Default)]
pub struct PollBoard {
    polls: DashMap<String, ActivePoll>,
}

impl PollBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, session_id: &str, poll: ActivePoll) -> Result<(), AppError> {
        match self.polls.entry(session_id.to_string()) {
            Entry::Occupied(existing) => Err(AppError::InvalidInput(format!(
                "poll {} is still open",
                existing.get().id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(poll);
                Ok(())
            },
        }
    }

    /// Count a vote; returns the updated tallies
    pub fn vote(
        &self,
        session_id: &str,
        poll_id: u64,
        client_id: Option<&str>,
        option_index: usize,
    ) -> Result<Vec<u32>, AppError> {
        let mut poll = self
            .polls
            .get_mut(session_id)
            .filter(|poll| poll.id == poll_id)
            .ok_or_else(|| AppError::InvalidInput(format!("poll {poll_id} is not open")))?;

        if option_index >= poll.options.len() {
            return Err(AppError::InvalidInput(format!(
                "option {option_index} out of range"
            )));
        }

        match client_id {
            Some(id) => {
                poll.by_client.insert(id.to_string(), option_index);
            },
            None => poll.anonymous[option_index] += 1,
        }
        Ok(poll.votes())
    }

    /// Close the session's poll; `poll_id` must match when given
    pub fn close(&self, session_id: &str, poll_id: Option<u64>) -> Option<PollResult> {
        self.polls
            .remove_if(session_id, |_, poll| poll_id.is_none_or(|id| id == poll.id))
            .map(|(_, poll)| PollResult {
                poll_id: poll.id,
                votes: poll.votes(),
            })
    }

    pub fn active_poll_id(&self, session_id: &str) -> Option<u64> {
        self.polls.get(session_id).map(|poll| poll.id)
    }
}
