//! Conversation State Manager: owns the ordered turn history of one session.
//!
//! The state is exclusively owned by its session and never shared across sessions.
//! `append` is the only way turns enter the history; the trim policy runs right after
//! every insertion, so the budget invariant holds between any two calls.
//!
//! Concurrent requests of one session reserve a `Sequence` before dispatch. Their
//! turns are committed in sequence order: a commit that arrives early is queued
//! until every predecessor has been committed or released.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::interpreter::StructuredResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    Structured(StructuredResult),
}

/// One turn of the conversation. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: TurnContent) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::Text(text.into()))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, TurnContent::Text(text.into()))
    }

    pub fn assistant(result: StructuredResult) -> Self {
        match result {
            StructuredResult::FreeText { text } => Self::new(Role::Assistant, TurnContent::Text(text)),
            structured => Self::new(Role::Assistant, TurnContent::Structured(structured)),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// The text this turn contributes to a prompt.
    pub fn prompt_text(&self) -> String {
        match &self.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Structured(result) => result.render_text(),
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.prompt_text())
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Turn and token ceilings for stored history or for a prompt's history suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnBudget {
    pub max_turns: usize,
    pub max_tokens: usize,
}

impl TurnBudget {
    pub fn admits(&self, turns: usize, tokens: usize) -> bool {
        turns <= self.max_turns && tokens <= self.max_tokens
    }
}

/// Ordering ticket handed out per request of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Sequence(pub u64);

#[derive(Debug, Error, PartialEq)]
pub enum ConversationError {
    #[error("system turns alone would exceed the conversation budget")]
    SystemBudgetExceeded,

    #[error("sequence {0} was already committed or released")]
    StaleSequence(u64),

    #[error("sequence {0} was never issued")]
    UnknownSequence(u64),
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: Vec<ConversationTurn>,
    budget: TurnBudget,
    token_total: usize,
    next_issued: u64,
    next_expected: u64,
    /// Committed (`Some`) or released (`None`) sequences waiting on a predecessor.
    pending: BTreeMap<u64, Option<Vec<ConversationTurn>>>,
}

impl ConversationState {
    pub fn new(budget: TurnBudget) -> Self {
        Self {
            turns: Vec::new(),
            budget,
            token_total: 0,
            next_issued: 0,
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn budget(&self) -> TurnBudget {
        self.budget
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[cfg(test)]
    pub fn token_total(&self) -> usize {
        self.token_total
    }

    /// Number of committed or released sequences still waiting on a predecessor.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Appends one turn and trims the history back under budget.
    ///
    /// Trimming drops the oldest non-system turns first, and may drop the new turn
    /// itself when it alone exceeds the token budget. System turns are never evicted,
    /// so a system turn that would not fit next to the existing system turns is rejected.
    pub fn append(&mut self, turn: ConversationTurn) -> Result<(), ConversationError> {
        let tokens = turn.estimated_tokens();

        if turn.is_system() {
            let (system_turns, system_tokens) = self
                .turns
                .iter()
                .filter(|t| t.is_system())
                .fold((0, 0), |(n, tk), t| (n + 1, tk + t.estimated_tokens()));
            if !self.budget.admits(system_turns + 1, system_tokens + tokens) {
                return Err(ConversationError::SystemBudgetExceeded);
            }
        }

        self.turns.push(turn);
        self.token_total += tokens;
        self.trim();
        Ok(())
    }

    fn trim(&mut self) {
        let mut evicted = 0;
        while !self.budget.admits(self.turns.len(), self.token_total) {
            let Some(index) = self.turns.iter().position(|t| !t.is_system()) else {
                break;
            };
            let removed = self.turns.remove(index);
            self.token_total -= removed.estimated_tokens();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                "Trimmed {evicted} turn(s); history now {} turns / {} tokens",
                self.turns.len(),
                self.token_total
            );
        }
    }

    /// Hands out the next ordering ticket.
    pub fn reserve(&mut self) -> Sequence {
        let sequence = Sequence(self.next_issued);
        self.next_issued += 1;
        sequence
    }

    /// Commits the turns produced by the request holding `sequence`.
    ///
    /// Returns how many sequences were applied to the history by this call; `0` means
    /// the commit is queued behind an earlier sequence.
    pub fn commit(
        &mut self,
        sequence: Sequence,
        turns: Vec<ConversationTurn>,
    ) -> Result<usize, ConversationError> {
        self.settle(sequence, Some(turns))
    }

    /// Gives up `sequence` without adding turns (failed or cancelled request).
    pub fn release(&mut self, sequence: Sequence) -> Result<usize, ConversationError> {
        self.settle(sequence, None)
    }

    fn settle(
        &mut self,
        sequence: Sequence,
        turns: Option<Vec<ConversationTurn>>,
    ) -> Result<usize, ConversationError> {
        let Sequence(n) = sequence;
        if n >= self.next_issued {
            return Err(ConversationError::UnknownSequence(n));
        }
        if n < self.next_expected || self.pending.contains_key(&n) {
            return Err(ConversationError::StaleSequence(n));
        }

        self.pending.insert(n, turns);

        let mut applied = 0;
        while let Some(entry) = self.pending.remove(&self.next_expected) {
            for turn in entry.into_iter().flatten() {
                if let Err(e) = self.append(turn) {
                    warn!("Dropping turn of sequence {}: {e}", self.next_expected);
                }
            }
            self.next_expected += 1;
            applied += 1;
        }
        Ok(applied)
    }

    /// The history a prompt may carry under `budget`.
    ///
    /// Walks back from the newest turn while the non-system turns fit. System turns are
    /// exempt from the budget: those older than the cut point are kept in front of the
    /// contiguous tail. Without system turns the result is exactly a suffix.
    pub fn current_suffix(&self, budget: TurnBudget) -> Vec<ConversationTurn> {
        let mut cut = self.turns.len();
        let (mut turns, mut tokens) = (0, 0);

        for (index, turn) in self.turns.iter().enumerate().rev() {
            if turn.is_system() {
                continue;
            }
            let cost = turn.estimated_tokens();
            if !budget.admits(turns + 1, tokens + cost) {
                break;
            }
            turns += 1;
            tokens += cost;
            cut = index;
        }

        let mut suffix: Vec<ConversationTurn> = self.turns[..cut]
            .iter()
            .filter(|t| t.is_system())
            .cloned()
            .collect();
        suffix.extend(self.turns[cut..].iter().cloned());
        suffix
    }

    /// Clears the history at session end. Outstanding sequences become stale.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.pending.clear();
        self.token_total = 0;
        self.next_expected = self.next_issued;
    }
}
