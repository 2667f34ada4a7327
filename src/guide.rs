//! Per-sequence cursor over an [`Index`], with bounded rollback.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::prelude::*;
use crate::{Error, Result};

/// Default number of past states a guide remembers for rollback.
pub const DEFAULT_MAX_ROLLBACK: usize = 32;

/// What the decoding host should do next for one sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Emit exactly these tokens verbatim, without sampling. A single-id
    /// write is the terminal case that forces EOS.
    Write(Vec<TokenId>),
    /// Sample among these tokens.
    Generate(Vec<TokenId>),
}

#[derive(Clone, Debug, PartialEq)]
enum Position {
    /// Mid-walk at a state of the index.
    Active(StateId),
    /// EOS was consumed at a final state; the walk is over.
    Completed(StateId),
}

/// A mutable cursor over a shared [`Index`].
///
/// One guide is owned by exactly one decoding sequence. Its only mutable
/// pieces are the current state and a ring buffer of up to `max_rollback`
/// prior states, so cloning is a cheap value-level copy and the index stays
/// shared read-only.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use tokenrail::prelude::*;
///
/// # fn main() -> Result<(), tokenrail::Error> {
/// let mut vocabulary = Vocabulary::new(3);
/// for (token, id) in [("yes", 0), ("no", 1)] {
///     vocabulary.try_insert(token, id)?;
/// }
/// let index = Arc::new(Index::new("(yes|no)", &vocabulary)?);
///
/// let mut guide = Guide::new(index);
/// guide.advance(0)?;
/// assert!(guide.is_finished());
/// assert_eq!(guide.next_instruction()?, Instruction::Write(vec![3]));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Guide {
    index: Arc<Index>,
    position: Position,
    state_cache: VecDeque<StateId>,
    max_rollback: usize,
}

impl Guide {
    /// Creates a guide at the index's initial state.
    pub fn new(index: Arc<Index>) -> Self {
        Self::with_max_rollback(index, DEFAULT_MAX_ROLLBACK)
    }

    /// Creates a guide remembering up to `max_rollback` prior states.
    pub fn with_max_rollback(index: Arc<Index>, max_rollback: usize) -> Self {
        let initial = index.initial_state();
        Self {
            index,
            position: Position::Active(initial),
            state_cache: VecDeque::with_capacity(max_rollback),
            max_rollback,
        }
    }

    /// The current state id.
    pub fn state(&self) -> StateId {
        match self.position {
            Position::Active(state) | Position::Completed(state) => state,
        }
    }

    /// The index this guide walks.
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// Token ids allowed at the current state. Empty once completed.
    pub fn tokens(&self) -> Vec<TokenId> {
        match self.position {
            Position::Active(state) => self.index.allowed_tokens(&state).unwrap_or_default(),
            Position::Completed(_) => Vec::new(),
        }
    }

    /// Consumes one token id, moving to the next state.
    ///
    /// EOS is legal exactly at final states and completes the walk. Any
    /// other id without a transition fails with `InvalidTransition` and
    /// leaves the cursor untouched.
    pub fn advance(&mut self, token_id: TokenId) -> Result<()> {
        let state = match self.position {
            Position::Active(state) => state,
            Position::Completed(state) => {
                return Err(Error::InvalidTransition { state, token_id });
            }
        };

        if token_id == self.index.eos_token_id() {
            if self.index.is_final_state(&state) {
                self.remember(state);
                self.position = Position::Completed(state);
                return Ok(());
            }
            return Err(Error::InvalidTransition { state, token_id });
        }

        match self.index.next_state(&state, &token_id) {
            Some(next) => {
                self.remember(state);
                self.position = Position::Active(next);
                Ok(())
            }
            None => Err(Error::InvalidTransition { state, token_id }),
        }
    }

    /// Restores the state reached `k` steps earlier.
    ///
    /// Fails with `InvalidRollback` when `k` exceeds the recorded history;
    /// the history holds at most `max_rollback` entries.
    pub fn rollback(&mut self, k: usize) -> Result<()> {
        if k == 0 {
            return Ok(());
        }
        if k > self.state_cache.len() {
            return Err(Error::InvalidRollback {
                requested: k,
                available: self.state_cache.len(),
            });
        }
        let target = self.state_cache[self.state_cache.len() - k];
        self.state_cache.truncate(self.state_cache.len() - k);
        self.position = Position::Active(target);
        Ok(())
    }

    /// Whether the whole sequence of ids could be consumed from the current
    /// state. Simulates on a copy; the cursor does not move.
    pub fn accepts_tokens(&self, sequence: &[TokenId]) -> bool {
        let mut probe = self.clone();
        sequence.iter().all(|&token_id| probe.advance(token_id).is_ok())
    }

    /// What the host should do next at the current state.
    ///
    /// A state with a single legal id forces a write; a final state whose
    /// only legal id is EOS forces termination. A non-final state with no
    /// legal id means the guide has escaped the language, which construction
    /// of the index rules out for reachable states.
    pub fn next_instruction(&self) -> Result<Instruction> {
        let state = match self.position {
            Position::Active(state) => state,
            Position::Completed(_) => {
                return Ok(Instruction::Write(vec![self.index.eos_token_id()]))
            }
        };
        let allowed = self.index.allowed_tokens(&state).unwrap_or_default();
        match allowed.len() {
            0 if self.index.is_final_state(&state) => {
                Ok(Instruction::Write(vec![self.index.eos_token_id()]))
            }
            0 => Err(Error::GuideStuck(state)),
            1 => Ok(Instruction::Write(allowed)),
            _ => Ok(Instruction::Generate(allowed)),
        }
    }

    /// Whether generation may stop here: the walk completed, or the current
    /// state accepts the sequence consumed so far.
    pub fn is_finished(&self) -> bool {
        match self.position {
            Position::Active(state) => self.index.is_final_state(&state),
            Position::Completed(_) => true,
        }
    }

    /// Returns to the initial state with an empty history.
    pub fn reset(&mut self) {
        self.position = Position::Active(self.index.initial_state());
        self.state_cache.clear();
    }

    fn remember(&mut self, state: StateId) {
        if self.max_rollback == 0 {
            return;
        }
        if self.state_cache.len() == self.max_rollback {
            self.state_cache.pop_front();
        }
        self.state_cache.push_back(state);
    }
}

impl std::fmt::Display for Guide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Position::Active(state) => write!(f, "Guide at state {}", state),
            Position::Completed(state) => write!(f, "Guide completed at state {}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_guide() -> (Guide, TokenId) {
        let eos_token_id = 5;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        for (token, token_id) in [
            ("erenyusuf170", 0),
            ("@", 1),
            ("gmail", 2),
            (".", 3),
            ("com", 4),
        ] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }
        let index = Index::new(r"[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,10}", &vocabulary)
            .expect("Index failed");
        (Guide::new(Arc::new(index)), eos_token_id)
    }

    #[test]
    fn walks_an_email_address() {
        let (mut guide, eos_token_id) = email_guide();

        // "@" cannot open an address.
        assert!(!guide.tokens().contains(&1));
        assert!(guide.tokens().contains(&0));

        for token_id in [0, 1, 2, 3, 4] {
            guide.advance(token_id).expect("Advance failed");
        }
        assert!(guide.is_finished());
        assert!(guide.tokens().contains(&eos_token_id));

        guide.advance(eos_token_id).expect("Advance failed");
        assert!(guide.is_finished());
        assert_eq!(guide.tokens(), Vec::<TokenId>::new());
        assert_eq!(
            guide.next_instruction().expect("No instruction"),
            Instruction::Write(vec![eos_token_id])
        );

        // Nothing is consumable past completion.
        match guide.advance(4) {
            Err(Error::InvalidTransition { token_id: 4, .. }) => {}
            other => unreachable!("expected invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn eos_is_rejected_before_a_final_state() {
        let (mut guide, eos_token_id) = email_guide();
        match guide.advance(eos_token_id) {
            Err(Error::InvalidTransition { .. }) => {}
            other => unreachable!("expected invalid transition, got {other:?}"),
        }
        // The cursor did not move.
        assert_eq!(guide.state(), guide.index().initial_state());
    }

    #[test]
    fn exhausted_language_forces_eos_write() {
        let eos_token_id = 2;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        vocabulary.try_insert("yes", 0).expect("Insert failed");
        vocabulary.try_insert("no", 1).expect("Insert failed");
        let index = Index::new("(yes|no)", &vocabulary).expect("Index failed");

        let mut guide = Guide::new(Arc::new(index));
        match guide.next_instruction().expect("No instruction") {
            Instruction::Generate(mut ids) => {
                ids.sort_unstable();
                assert_eq!(ids, vec![0, 1]);
            }
            other => unreachable!("expected generate, got {other:?}"),
        }

        guide.advance(1).expect("Advance failed");
        assert_eq!(
            guide.next_instruction().expect("No instruction"),
            Instruction::Write(vec![eos_token_id])
        );
    }

    #[test]
    fn rollback_restores_earlier_states() {
        let (mut guide, _) = email_guide();

        guide.advance(0).expect("Advance failed");
        let after_first = guide.state();
        guide.advance(1).expect("Advance failed");
        guide.advance(2).expect("Advance failed");

        guide.rollback(2).expect("Rollback failed");
        assert_eq!(guide.state(), after_first);

        // Advancing again replays the same path.
        let mut replay = guide.clone();
        replay.advance(1).expect("Advance failed");
        guide.advance(1).expect("Advance failed");
        assert_eq!(guide.state(), replay.state());
    }

    #[test]
    fn rollback_equals_fresh_walk() {
        let (mut rolled, _) = email_guide();
        rolled.advance(0).expect("Advance failed");
        rolled.advance(1).expect("Advance failed");
        rolled.advance(2).expect("Advance failed");
        rolled.rollback(2).expect("Rollback failed");
        rolled.advance(1).expect("Advance failed");

        let (mut fresh, _) = email_guide();
        fresh.advance(0).expect("Advance failed");
        fresh.advance(1).expect("Advance failed");

        assert_eq!(rolled.state(), fresh.state());
    }

    #[test]
    fn rollback_beyond_history_fails() {
        let (mut guide, _) = email_guide();
        guide.advance(0).expect("Advance failed");

        match guide.rollback(2) {
            Err(Error::InvalidRollback {
                requested: 2,
                available: 1,
            }) => {}
            other => unreachable!("expected invalid rollback, got {other:?}"),
        }
        // Zero-step rollback is a no-op.
        let state = guide.state();
        guide.rollback(0).expect("Rollback failed");
        assert_eq!(guide.state(), state);
    }

    #[test]
    fn history_is_bounded() {
        let eos_token_id = 9;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        vocabulary.try_insert("a", 0).expect("Insert failed");
        let index = Index::new("a{1,20}", &vocabulary).expect("Index failed");

        let mut guide = Guide::with_max_rollback(Arc::new(index), 2);
        for _ in 0..5 {
            guide.advance(0).expect("Advance failed");
        }
        // Only the two most recent states are recoverable.
        assert!(guide.rollback(3).is_err());
        guide.rollback(2).expect("Rollback failed");
    }

    #[test]
    fn accepts_tokens_does_not_move_the_cursor() {
        let (guide, eos_token_id) = email_guide();

        assert!(guide.accepts_tokens(&[0, 1, 2, 3, 4]));
        assert!(guide.accepts_tokens(&[0, 1, 2, 3, 4, eos_token_id]));
        assert!(!guide.accepts_tokens(&[1]));
        assert!(!guide.accepts_tokens(&[0, eos_token_id]));

        assert_eq!(guide.state(), guide.index().initial_state());
        assert!(guide.state_cache.is_empty());
    }

    #[test]
    fn reset_returns_to_the_initial_state() {
        let (mut guide, _) = email_guide();
        guide.advance(0).expect("Advance failed");
        guide.advance(1).expect("Advance failed");

        guide.reset();
        assert_eq!(guide.state(), guide.index().initial_state());
        assert!(guide.state_cache.is_empty());
        assert!(guide.tokens().contains(&0));
    }
}
