//! Token-level automaton: maps a regex and a vocabulary to state transitions.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use bincode::{Decode, Encode};
use regex_automata::dfa::dense::DFA;
use regex_automata::dfa::Automaton;
use regex_automata::util::primitives::StateID as AutomataStateId;
use regex_automata::Anchored;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet, FxHasher};

use crate::prelude::*;
use crate::vocabulary::Vocabulary;
use crate::{Error, Result};

/// A DFA whose alphabet is token ids.
///
/// Built once per `(regex, vocabulary)` pair: the regex is compiled into a
/// byte-level DFA, then every vocabulary token is walked from every live
/// state. A token earns a transition out of a state when its bytes neither
/// dead-end nor overshoot a match, so each state's transition row is exactly
/// the set of locally-allowed token ids. Trap states are never stored.
///
/// The EOS id is a legal transition out of every final state and only
/// there; a final state loops to itself on EOS.
///
/// ## Example
///
/// ```rust
/// use tokenrail::prelude::*;
///
/// # fn main() -> Result<(), tokenrail::Error> {
/// let mut vocabulary = Vocabulary::new(4);
/// for (token, id) in [("0", 0), ("1", 1), ("12", 2)] {
///     vocabulary.try_insert(token, id)?;
/// }
/// let index = Index::new("0|[1-9][0-9]*", &vocabulary)?;
///
/// let state = index.initial_state();
/// assert!(!index.is_final_state(&state));
/// let allowed = index.allowed_tokens(&state).expect("Some allowed tokens");
/// assert!(allowed.contains(&0));
/// # Ok(())
/// # }
/// ```
///
/// ## Performance
///
/// Construction is `O(|DFA| · |vocabulary|)` in the worst case and can take
/// seconds for large vocabularies; consider [`Index::cached`]. Step-time
/// queries are constant-time table lookups.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Index {
    /// Processing starts here.
    initial_state: StateId,
    /// States accepting the sequence consumed so far.
    final_states: HashSet<StateId>,
    /// state → (token id → next state)
    transitions: HashMap<StateId, HashMap<TokenId, StateId>>,
    /// The id reserved for end-of-sequence.
    eos_token_id: TokenId,
    /// Size of the vocabulary the index was built from.
    vocab_size: usize,
}

impl Index {
    /// Builds an `Index` from a regular expression and a vocabulary.
    pub fn new(regex: &str, vocabulary: &Vocabulary) -> Result<Self> {
        let vocab_size = vocabulary.len();
        let eos_token_id = vocabulary.eos_token_id();
        let dfa = DFA::new(regex).map_err(Box::new)?;
        let start_state = match dfa.universal_start_state(Anchored::Yes) {
            Some(s) => s,
            None => return Err(Error::DfaHasNoStartState),
        };

        let mut transitions: HashMap<StateId, HashMap<TokenId, StateId>> = HashMap::default();
        let mut final_states: HashSet<StateId> = HashSet::default();

        let mut seen: HashSet<AutomataStateId> = HashSet::from_iter([start_state]);
        let mut next_states: Vec<AutomataStateId> = vec![start_state];

        while let Some(current_state) = next_states.pop() {
            if dfa.is_match_state(dfa.next_eoi_state(current_state)) {
                final_states.insert(current_state.as_u32());
            }

            'token_loop: for (token, ids) in vocabulary.tokens().iter() {
                if ids.contains(&eos_token_id) {
                    continue;
                }

                let mut next_state = current_state;
                for transition_byte in token {
                    next_state = dfa.next_state(next_state, *transition_byte);
                    if dfa.is_dead_state(next_state) || dfa.is_quit_state(next_state) {
                        continue 'token_loop;
                    }
                }

                let is_intermediate_state = !dfa.is_match_state(next_state);
                let is_full_match_state = dfa.is_match_state(dfa.next_eoi_state(next_state));
                if is_intermediate_state || is_full_match_state {
                    for token_id in ids {
                        transitions
                            .entry(current_state.as_u32())
                            .or_default()
                            .insert(*token_id, next_state.as_u32());
                    }
                }
                if !seen.contains(&next_state) {
                    seen.insert(next_state);
                    next_states.push(next_state);
                }
            }
        }

        if final_states.is_empty() {
            return Err(Error::EmptyLanguage);
        }

        // Final states accept EOS, looping in place.
        for &final_state in &final_states {
            transitions
                .entry(final_state)
                .or_default()
                .insert(eos_token_id, final_state);
        }

        tracing::debug!(
            states = transitions.len(),
            finals = final_states.len(),
            "built token-level index"
        );

        Ok(Self {
            initial_state: start_state.as_u32(),
            final_states,
            transitions,
            eos_token_id,
            vocab_size,
        })
    }

    /// Restores an `Index` from a previously serialised transition table.
    ///
    /// The table must have been produced by [`Index::transitions`] together
    /// with the matching initial and final states; no reachability check is
    /// re-run.
    pub fn from_transitions(
        initial_state: StateId,
        final_states: HashSet<StateId>,
        transitions: HashMap<StateId, HashMap<TokenId, StateId>>,
        eos_token_id: TokenId,
        vocab_size: usize,
    ) -> Self {
        Self {
            initial_state,
            final_states,
            transitions,
            eos_token_id,
            vocab_size,
        }
    }

    /// Builds an `Index`, memoised process-wide.
    ///
    /// The cache key is the regex, the EOS id, and a content digest of the
    /// vocabulary, so equal inputs share one immutable `Index` regardless of
    /// how the vocabulary was assembled.
    pub fn cached(regex: &str, vocabulary: &Vocabulary) -> Result<Arc<Self>> {
        static CACHE: OnceLock<Mutex<HashMap<u64, Arc<Index>>>> = OnceLock::new();
        let cache = CACHE.get_or_init(|| Mutex::new(HashMap::default()));

        let key = cache_key(regex, vocabulary);
        {
            let guard = match cache.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(index) = guard.get(&key) {
                return Ok(index.clone());
            }
        }

        // Built outside the lock: construction can take seconds and the
        // entries are immutable, so a racing duplicate build is harmless.
        let index = Arc::new(Self::new(regex, vocabulary)?);
        let mut guard = match cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(guard.entry(key).or_insert(index).clone())
    }

    /// The state processing begins from.
    pub fn initial_state(&self) -> StateId {
        self.initial_state
    }

    /// Set of final states.
    pub fn final_states(&self) -> &HashSet<StateId> {
        &self.final_states
    }

    /// The full transition table, suitable for serialisation.
    pub fn transitions(&self) -> &HashMap<StateId, HashMap<TokenId, StateId>> {
        &self.transitions
    }

    /// Whether a state accepts the sequence consumed so far.
    pub fn is_final_state(&self, state: &StateId) -> bool {
        self.final_states.contains(state)
    }

    /// Allowed token ids at a state, or `None` if the state has no row.
    pub fn allowed_tokens(&self, state: &StateId) -> Option<Vec<TokenId>> {
        self.transitions
            .get(state)
            .map(|row| row.keys().copied().collect())
    }

    /// Iterator form of [`Index::allowed_tokens`], no allocation.
    pub fn allowed_tokens_iter(&self, state: &StateId) -> Option<impl Iterator<Item = &TokenId>> {
        self.transitions.get(state).map(|row| row.keys())
    }

    /// The state reached from `state` on `token_id`, if the transition is
    /// legal. EOS never yields a next state.
    pub fn next_state(&self, state: &StateId, token_id: &TokenId) -> Option<StateId> {
        if token_id == &self.eos_token_id {
            return None;
        }
        Some(*self.transitions.get(state)?.get(token_id)?)
    }

    /// The id reserved for end-of-sequence.
    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Size of the vocabulary the index was built from.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl std::fmt::Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Index object with transitions:")?;
        for (state_id, token_ids) in self.transitions.iter() {
            writeln!(f, "{:?} -> {:#?}", state_id, token_ids)?;
        }
        Ok(())
    }
}

/// Content-addressed cache key: regex, EOS id, and the vocabulary's token
/// bytes with their ids in a canonical order.
fn cache_key(regex: &str, vocabulary: &Vocabulary) -> u64 {
    let mut entries: Vec<(&Token, &Vec<TokenId>)> = vocabulary.tokens().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = FxHasher::default();
    regex.hash(&mut hasher);
    vocabulary.eos_token_id().hash(&mut hasher);
    for (token, ids) in entries {
        token.hash(&mut hasher);
        ids.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decimal_vocabulary() -> (Vocabulary, TokenId) {
        let eos_token_id = 4;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        for (token, token_id) in [("blah", 0), ("1a", 1), ("2", 2), ("0", 3)] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }
        (vocabulary, eos_token_id)
    }

    #[test]
    fn index_from_regex() {
        let (vocabulary, eos_token_id) = decimal_vocabulary();
        let index = Index::new("0|[1-9][0-9]*", &vocabulary).expect("Index failed");

        let initial = index.initial_state();
        assert!(!index.is_final_state(&initial));

        // Tokens that cannot start a match never appear at the initial state.
        let allowed = index.allowed_tokens(&initial).expect("No allowed tokens");
        let mut sorted = allowed.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![2, 3]);

        // "0" is a complete match with no continuation except EOS.
        let zero_state = index.next_state(&initial, &3).expect("No transition");
        assert!(index.is_final_state(&zero_state));
        let at_zero = index.allowed_tokens(&zero_state).expect("No allowed tokens");
        assert_eq!(at_zero, vec![eos_token_id]);

        // "2" matches and may keep growing with digits.
        let two_state = index.next_state(&initial, &2).expect("No transition");
        assert!(index.is_final_state(&two_state));
        let mut at_two = index.allowed_tokens(&two_state).expect("No allowed tokens");
        at_two.sort_unstable();
        assert_eq!(at_two, vec![2, 3, eos_token_id]);

        // EOS never advances; unknown transitions are None.
        assert_eq!(index.next_state(&two_state, &eos_token_id), None);
        assert_eq!(index.next_state(&zero_state, &3), None);
        assert_eq!(index.next_state(&initial, &0), None);
        assert_eq!(index.next_state(&initial, &1), None);
    }

    #[test]
    fn every_allowed_token_lands_in_a_known_state() {
        let (vocabulary, eos_token_id) = decimal_vocabulary();
        let index = Index::new("0|[1-9][0-9]*", &vocabulary).expect("Index failed");

        for (state, row) in index.transitions() {
            for (token_id, next) in row {
                if token_id == &eos_token_id {
                    continue;
                }
                assert_eq!(index.next_state(state, token_id), Some(*next));
                // The landing state has a row or is final.
                assert!(
                    index.transitions().contains_key(next) || index.is_final_state(next),
                    "transition out of {state} lands in unknown state {next}"
                );
            }
        }
    }

    #[test]
    fn index_with_multibyte_tokens() {
        let mut vocabulary = Vocabulary::new(8);
        for (token, token_id) in [(" 😍", 5), ("blah", 0), ("😇", 2), ("😈a", 1), ("😍", 3)] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }
        // Token split across an incomplete UTF-8 prefix.
        for (token, token_id) in [
            (vec![32, 240, 159, 152], 7),
            (vec![32, 240, 159, 152, 141], 6),
            (vec![240, 159, 152, 141], 4),
        ] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }

        let index = Index::new("😇| [😈-😍][😇-😎]*", &vocabulary).expect("Index failed");
        let initial = index.initial_state();

        let mut at_initial = index.allowed_tokens(&initial).expect("No allowed tokens");
        at_initial.sort_unstable();
        // "😇", " 😍", the partial-prefix forms of " 😍", but not a bare "😍".
        assert_eq!(at_initial, vec![2, 5, 6, 7]);

        // No token in the vocabulary supplies the missing continuation byte,
        // so the partial-prefix state is a dead end in token space.
        let partial = index.next_state(&initial, &7).expect("No transition");
        assert!(index.allowed_tokens(&partial).is_none());

        // The full " 😍" token lands in a final state that can keep going.
        let direct = index.next_state(&initial, &6).expect("No transition");
        assert!(index.is_final_state(&direct));
        let mut at_direct = index.allowed_tokens(&direct).expect("No allowed tokens");
        at_direct.sort_unstable();
        assert_eq!(at_direct, vec![2, 3, 4, 8]);
    }

    #[test]
    fn empty_language_is_rejected() {
        let mut vocabulary = Vocabulary::new(2);
        vocabulary.try_insert("a", 0).expect("Insert failed");
        match Index::new("b", &vocabulary) {
            Err(Error::EmptyLanguage) => {}
            other => unreachable!("expected empty language, got {other:?}"),
        }
    }

    #[test]
    fn restored_index_behaves_identically(){
        let (vocabulary, _) = decimal_vocabulary();
        let index = Index::new("0|[1-9][0-9]*", &vocabulary).expect("Index failed");

        let restored = Index::from_transitions(
            index.initial_state(),
            index.final_states().clone(),
            index.transitions().clone(),
            index.eos_token_id(),
            index.vocab_size(),
        );
        assert_eq!(index, restored);
    }

    #[test]
    fn cached_indexes_are_shared() {
        let (vocabulary, _) = decimal_vocabulary();
        let first = Index::cached("0|[1-9][0-9]*", &vocabulary).expect("Index failed");
        let second = Index::cached("0|[1-9][0-9]*", &vocabulary).expect("Index failed");
        assert!(Arc::ptr_eq(&first, &second));

        let other = Index::cached("[QZ]+", &vocabulary);
        // Different regex, different entry (and here, an empty language).
        assert!(other.is_err());
    }
}
