// Poll state machine: Idle -> Active -> Ended, one poll at a time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::{
    Answers, CreatePollPayload, EndReason, OptionCount, PollEndedPayload, PollStartedPayload,
    SubmitAnswerPayload, TallyPayload,
};

/// Poll duration used when a create request omits one or sends a
/// non-positive value.
pub const DEFAULT_DURATION_MS: u64 = 60_000;

/// Minimum number of distinct non-empty options a poll needs.
pub const MIN_OPTIONS: usize = 2;

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why the state machine refused a request. A rejected request leaves the
/// state untouched and produces no broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("a poll is already active")]
    PollAlreadyActive,

    #[error("no poll is active")]
    NoActivePoll,

    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("at least {min} distinct non-empty options are required, got {found}", min = MIN_OPTIONS)]
    TooFewOptions { found: usize },

    #[error("display name must not be empty")]
    EmptyName,

    #[error("`{option}` is not one of the poll's options")]
    UnknownOption { option: String },

    #[error("answer is for poll #{submitted} but poll #{current} is running")]
    StalePoll { submitted: u64, current: u64 },
}

// ---------------------------------------------------------------------------
// PollRecord
// ---------------------------------------------------------------------------

/// The current (or most recently ended) poll.
#[derive(Debug, Clone)]
pub struct PollRecord {
    pub sequence_number: u64,
    pub question: String,
    /// Display and tally order.
    pub options: Vec<String>,
    pub answers: Answers,
    pub active: bool,
    pub started_at: Instant,
    pub started_at_wall: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PollRecord {
    /// Authoritative expiry deadline, tracked in milliseconds.
    pub fn deadline(&self) -> Instant {
        self.started_at + Duration::from_millis(self.duration_ms)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Votes per option in option order. Answers naming an option the poll
    /// does not have are never recorded, so every answer is counted.
    pub fn counts(&self) -> Vec<OptionCount> {
        self.options
            .iter()
            .map(|option| OptionCount {
                option: option.clone(),
                votes: self.answers.values().filter(|a| *a == option).count(),
            })
            .collect()
    }

    /// The `pollStarted` payload as seen at `now`. Identical to the creation
    /// broadcast except for the display countdown.
    pub fn started_payload(&self, now: Instant) -> PollStartedPayload {
        PollStartedPayload {
            sequence_number: self.sequence_number,
            question: self.question.clone(),
            options: self.options.clone(),
            duration_ms: self.duration_ms,
            remaining_secs: display_secs(self.remaining(now)),
            started_at: self.started_at_wall,
        }
    }

    pub fn tally_payload(&self) -> TallyPayload {
        TallyPayload {
            sequence_number: self.sequence_number,
            answers: self.answers.clone(),
            counts: self.counts(),
        }
    }

    fn ended_payload(&self, reason: EndReason) -> PollEndedPayload {
        PollEndedPayload {
            sequence_number: self.sequence_number,
            final_answers: self.answers.clone(),
            counts: self.counts(),
            reason,
        }
    }
}

/// Whole seconds for a countdown display, rounded up so a poll with time
/// left never shows zero.
fn display_secs(remaining: Duration) -> u64 {
    (remaining.as_millis() as u64).div_ceil(1000)
}

// ---------------------------------------------------------------------------
// PollMachine
// ---------------------------------------------------------------------------

/// Result of an accepted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub tally: TallyPayload,
    /// Set when this answer completed the poll. The poll is already inactive
    /// by the time the caller sees it.
    pub ended: Option<PollEndedPayload>,
}

/// Owns the single poll record and every transition on it.
#[derive(Debug)]
pub struct PollMachine {
    current: Option<PollRecord>,
    last_sequence: u64,
    default_duration_ms: u64,
}

impl Default for PollMachine {
    fn default() -> Self {
        Self::new(DEFAULT_DURATION_MS)
    }
}

impl PollMachine {
    pub fn new(default_duration_ms: u64) -> Self {
        PollMachine {
            current: None,
            last_sequence: 0,
            default_duration_ms,
        }
    }

    /// The current poll, active or ended.
    pub fn current(&self) -> Option<&PollRecord> {
        self.current.as_ref()
    }

    pub fn active_poll(&self) -> Option<&PollRecord> {
        self.current.as_ref().filter(|p| p.active)
    }

    pub fn is_active(&self) -> bool {
        self.active_poll().is_some()
    }

    /// Start a new poll. Only valid while no poll is active.
    ///
    /// The question and options are trimmed; empty options are dropped and
    /// duplicates collapse onto their first occurrence.
    pub fn create_poll(
        &mut self,
        request: CreatePollPayload,
        now: Instant,
    ) -> Result<PollStartedPayload, Rejection> {
        if self.is_active() {
            return Err(Rejection::PollAlreadyActive);
        }

        let question = request.question.trim();
        if question.is_empty() {
            return Err(Rejection::EmptyQuestion);
        }

        let mut options: Vec<String> = Vec::with_capacity(request.options.len());
        for raw in &request.options {
            let option = raw.trim();
            if !option.is_empty() && !options.iter().any(|o| o == option) {
                options.push(option.to_string());
            }
        }
        if options.len() < MIN_OPTIONS {
            return Err(Rejection::TooFewOptions {
                found: options.len(),
            });
        }

        let duration_ms = match request.duration_ms {
            Some(ms) if ms > 0 => ms as u64,
            _ => self.default_duration_ms,
        };

        self.last_sequence += 1;
        let record = PollRecord {
            sequence_number: self.last_sequence,
            question: question.to_string(),
            options,
            answers: Answers::new(),
            active: true,
            started_at: now,
            started_at_wall: Utc::now(),
            duration_ms,
        };
        info!(
            "Poll #{} started: {:?} with {} options for {} ms",
            record.sequence_number,
            record.question,
            record.options.len(),
            duration_ms
        );

        let started = record.started_payload(now);
        self.current = Some(record);
        Ok(started)
    }

    /// Record an answer, overwriting any earlier one from the same name.
    /// Ends the poll in the same call once at least `student_count` names
    /// have answered (`student_count` of zero never completes).
    ///
    /// An answer tagged with another poll's sequence number is refused, so a
    /// click on an ended poll cannot land in its successor.
    pub fn submit_answer(
        &mut self,
        answer: &SubmitAnswerPayload,
        student_count: usize,
    ) -> Result<SubmitOutcome, Rejection> {
        let poll = match self.current.as_mut() {
            Some(p) if p.active => p,
            _ => return Err(Rejection::NoActivePoll),
        };

        if let Some(submitted) = answer.sequence_number {
            if submitted != poll.sequence_number {
                return Err(Rejection::StalePoll {
                    submitted,
                    current: poll.sequence_number,
                });
            }
        }

        let name = answer.display_name.trim();
        if name.is_empty() {
            return Err(Rejection::EmptyName);
        }
        let option = answer.chosen_option.trim();
        if !poll.options.iter().any(|o| o == option) {
            return Err(Rejection::UnknownOption {
                option: option.to_string(),
            });
        }

        if let Some(previous) = poll.answers.insert(name.to_string(), option.to_string()) {
            debug!("{} changed answer {:?} -> {:?}", name, previous, option);
        }
        let tally = poll.tally_payload();

        let ended = if student_count > 0 && poll.answers.len() >= student_count {
            poll.active = false;
            info!(
                "Poll #{} complete: all {} students answered",
                poll.sequence_number, student_count
            );
            Some(poll.ended_payload(EndReason::AllAnswered))
        } else {
            None
        };

        Ok(SubmitOutcome { tally, ended })
    }

    /// Timer entry point. Ends the poll only if it is still active and is the
    /// poll the timer was scheduled for; a stale timer is a no-op.
    pub fn expire(&mut self, sequence_number: u64) -> Option<PollEndedPayload> {
        let poll = self.current.as_mut()?;
        if !poll.active || poll.sequence_number != sequence_number {
            debug!(
                "Ignoring stale expiry for poll #{} (current #{}, active={})",
                sequence_number, poll.sequence_number, poll.active
            );
            return None;
        }

        poll.active = false;
        info!(
            "Poll #{} timed out with {} answers",
            poll.sequence_number,
            poll.answers.len()
        );
        Some(poll.ended_payload(EndReason::TimedOut))
    }

    /// Everything a participant joining now needs to catch up, or `None` when
    /// no poll is active.
    pub fn snapshot(&self, now: Instant) -> Option<(PollStartedPayload, TallyPayload)> {
        self.active_poll()
            .map(|p| (p.started_payload(now), p.tally_payload()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
