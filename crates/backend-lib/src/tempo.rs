//! Tempo vote aggregation.
//!
//! Votes only touch memory. The tally for a session covers its current
//! track; [`TempoBoard::take`] hands the final counts to a flush and starts
//! a fresh tally at each track change or session end.
use dashmap::DashMap;
use pika_common::TempoDirection;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempoCounts {
    pub slower: u32,
    pub perfect: u32,
    pub faster: u32,
}

impl TempoCounts {
    pub fn total(&self) -> u32 {
        self.slower + self.perfect + self.faster
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn bump(&mut self, direction: TempoDirection) {
        match direction {
            TempoDirection::Slower => self.slower += 1,
            TempoDirection::Perfect => self.perfect += 1,
            TempoDirection::Faster => self.faster += 1,
        }
    }
}

/// Votes for one session's current track.
///
/// Identified listeners hold one vote each and may change it; anonymous
/// votes simply add up.
#[derive(Debug, Default, Clone)]
pub struct TempoTally {
    by_client: HashMap<String, TempoDirection>,
    anonymous: TempoCounts,
}

impl TempoTally {
    pub fn record(&mut self, client_id: Option<&str>, direction: TempoDirection) {
        match client_id {
            Some(id) => {
                self.by_client.insert(id.to_string(), direction);
            },
            None => self.anonymous.bump(direction),
        }
    }

    pub fn counts(&self) -> TempoCounts {
        let mut counts = self.anonymous;
        for direction in self.by_client.values() {
            counts.bump(*direction);
        }
        counts
    }
}

#[derive(Debug, Default)]
pub struct TempoBoard {
    tallies: DashMap<String, TempoTally>,
}

impl TempoBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a vote and return the session's updated counts
    pub fn record_vote(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        direction: TempoDirection,
    ) -> TempoCounts {
        let mut tally = self.tallies.entry(session_id.to_string()).or_default();
        tally.record(client_id, direction);
        tally.counts()
    }

    pub fn counts(&self, session_id: &str) -> TempoCounts {
        self.tallies
            .get(session_id)
            .map(|tally| tally.counts())
            .unwrap_or_default()
    }

    /// Final counts for the current track; the session starts from zero
    pub fn take(&self, session_id: &str) -> TempoCounts {
        self.tallies
            .remove(session_id)
            .map(|(_, tally)| tally.counts())
            .unwrap_or_default()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.tallies.contains_key(session_id)
    }
}
