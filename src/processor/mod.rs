//! Masks logits every decoding step so a batch of sequences stays inside
//! the language of an [`Index`].

use std::sync::Arc;

use rustc_hash::FxHashMap as HashMap;

use crate::dsl::Cfg;
use crate::guide::Guide;
use crate::json_schema;
use crate::prelude::{Index, StateId, TokenId};
use crate::vocabulary::Vocabulary;
use crate::{Error, Result};

mod tensor;

pub use tensor::{BackendKind, CpuBackend, CpuIds, CpuLogits, TensorBackend};

#[cfg(feature = "candle")]
pub use tensor::CandleBackend;

/// Where one batch row stands in its walk of the index.
#[derive(Clone, Copy, Debug, PartialEq)]
enum RowState {
    Active(StateId),
    /// EOS was consumed at a final state; only further EOS is legal.
    Done,
}

/// Batch-aware logits processor over a shared [`Index`].
///
/// The host's decoding loop calls [`process`](Self::process) once per step
/// with the generated ids (`[B, T]`, prompt included) and the logits
/// (`[B, V]`). Every token that cannot appear next in a valid completion of
/// its row is masked to negative infinity; all other positions pass through
/// bit-identical. The tensor itself is touched only through the
/// [`TensorBackend`] capability set.
///
/// The prompt length is recorded on the first call, so only post-prompt ids
/// drive the walk. Rows are tracked by their post-prompt fingerprint, which
/// keeps divergent beams independent and lets state for dropped rows fall
/// away on the next step.
pub struct GuideLogitsProcessor<B: TensorBackend> {
    backend: B,
    index: Arc<Index>,
    states: HashMap<Vec<TokenId>, RowState>,
    seq_start: Option<usize>,
}

impl<B: TensorBackend> GuideLogitsProcessor<B> {
    /// A processor walking an already-built index.
    pub fn new(index: Arc<Index>, backend: B) -> Self {
        Self {
            backend,
            index,
            states: HashMap::default(),
            seq_start: None,
        }
    }

    /// Builds the index for a regular expression, then wraps it.
    pub fn from_regex(pattern: &str, vocabulary: &Vocabulary, backend: B) -> Result<Self> {
        let index = Index::new(pattern, vocabulary)?;
        Ok(Self::new(Arc::new(index), backend))
    }

    /// Compiles a JSON schema to a regex, builds its index, then wraps it.
    pub fn from_schema(
        schema: &str,
        vocabulary: &Vocabulary,
        backend: B,
        whitespace_pattern: Option<&str>,
    ) -> Result<Self> {
        let regex = json_schema::regex_from_str(schema, whitespace_pattern, None)?;
        Self::from_regex(&regex, vocabulary, backend)
    }

    /// Shares the index of an existing guide.
    pub fn from_guide(guide: &Guide, backend: B) -> Self {
        Self::new(guide.index().clone(), backend)
    }

    /// The index this processor walks.
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// Masks one decoding step in place.
    ///
    /// `generated_ids` and `logits` must agree on the batch dimension; a
    /// 1-D pair is treated as a batch of one.
    pub fn process(&mut self, generated_ids: &B::Ids, logits: &mut B::Logits) -> Result<()> {
        let (id_rows, id_cols) = self.backend.ids_shape(generated_ids)?;
        let (logit_rows, vocab_size) = self.backend.logits_shape(logits)?;
        if id_rows != logit_rows {
            return Err(Error::ShapeMismatch {
                ids: id_rows,
                logits: logit_rows,
            });
        }

        // Everything before the first call's length is prompt.
        let seq_start = *self.seq_start.get_or_insert(id_cols);

        let mut next_states: HashMap<Vec<TokenId>, RowState> = HashMap::default();
        let mut keep = vec![false; vocab_size];

        for row in 0..id_rows {
            let fingerprint = self.backend.row_tail(generated_ids, row, seq_start)?;
            let row_state = self.resolve(&fingerprint)?;
            next_states.insert(fingerprint, row_state);

            keep.iter_mut().for_each(|flag| *flag = false);
            match row_state {
                RowState::Active(state) => {
                    let Some(allowed) = self.index.allowed_tokens_iter(&state) else {
                        return Err(Error::GuideStuck(state));
                    };
                    for &token_id in allowed {
                        if (token_id as usize) < vocab_size {
                            keep[token_id as usize] = true;
                        }
                    }
                }
                RowState::Done => {
                    let eos = self.index.eos_token_id();
                    if (eos as usize) < vocab_size {
                        keep[eos as usize] = true;
                    }
                }
            }
            self.backend.mask_row(logits, row, &keep)?;
        }

        // Dropped rows leave no fingerprint behind.
        self.states = next_states;
        Ok(())
    }

    /// State for a fingerprint: memoised, extended from its parent by one
    /// step, or replayed from the initial state after a rollback.
    fn resolve(&self, fingerprint: &[TokenId]) -> Result<RowState> {
        if let Some(&state) = self.states.get(fingerprint) {
            return Ok(state);
        }
        if let Some((&last, parent)) = fingerprint.split_last() {
            if let Some(&parent_state) = self.states.get(parent) {
                return self.step(parent_state, last);
            }
        }
        let mut state = RowState::Active(self.index.initial_state());
        for &token_id in fingerprint {
            state = self.step(state, token_id)?;
        }
        Ok(state)
    }

    fn step(&self, row_state: RowState, token_id: TokenId) -> Result<RowState> {
        let eos = self.index.eos_token_id();
        match row_state {
            RowState::Done if token_id == eos => Ok(RowState::Done),
            RowState::Done => Err(Error::InvalidTransition {
                state: self.index.initial_state(),
                token_id,
            }),
            RowState::Active(state) if token_id == eos => {
                if self.index.is_final_state(&state) {
                    Ok(RowState::Done)
                } else {
                    Err(Error::InvalidTransition { state, token_id })
                }
            }
            RowState::Active(state) => match self.index.next_state(&state, &token_id) {
                Some(next) => Ok(RowState::Active(next)),
                None => Err(Error::InvalidTransition { state, token_id }),
            },
        }
    }

    #[cfg(test)]
    fn tracked_rows(&self) -> usize {
        self.states.len()
    }
}

/// What a grammar parser must answer for the rejection walk of
/// [`CfgLogitsProcessor`]. Implementations live outside this crate; regex
/// languages never need one.
pub trait ParserState: Send {
    /// Whether the token may come next.
    fn accepts(&self, token_id: TokenId) -> bool;
    /// Commits a token the host emitted.
    fn advance(&mut self, token_id: TokenId);
    /// Whether the parse may stop here.
    fn is_finished(&self) -> bool;
}

/// Best-effort grammar-constrained processor.
///
/// Instead of a precomputed allowed set, each step walks the logits in
/// descending order and keeps the first token the parser accepts; every
/// other position is masked. Tracks a single sequence.
pub struct CfgLogitsProcessor<B: TensorBackend> {
    backend: B,
    grammar: Cfg,
    parser: Box<dyn ParserState>,
    eos_token_id: TokenId,
    seq_start: Option<usize>,
    committed: usize,
}

impl<B: TensorBackend> CfgLogitsProcessor<B> {
    pub fn new(
        grammar: Cfg,
        parser: Box<dyn ParserState>,
        eos_token_id: TokenId,
        backend: B,
    ) -> Self {
        Self {
            backend,
            grammar,
            parser,
            eos_token_id,
            seq_start: None,
            committed: 0,
        }
    }

    pub fn grammar(&self) -> &Cfg {
        &self.grammar
    }

    /// Masks one decoding step of a single sequence in place.
    pub fn process(&mut self, generated_ids: &B::Ids, logits: &mut B::Logits) -> Result<()> {
        let (id_rows, id_cols) = self.backend.ids_shape(generated_ids)?;
        let (logit_rows, vocab_size) = self.backend.logits_shape(logits)?;
        if id_rows != logit_rows {
            return Err(Error::ShapeMismatch {
                ids: id_rows,
                logits: logit_rows,
            });
        }
        if id_rows != 1 {
            return Err(Error::Backend(
                "grammar-constrained processing tracks a single sequence".to_string(),
            ));
        }

        let seq_start = *self.seq_start.get_or_insert(id_cols);

        // Feed the parser whatever the host committed since last step.
        let generated = self.backend.row_tail(generated_ids, 0, seq_start)?;
        for &token_id in &generated[self.committed.min(generated.len())..] {
            self.parser.advance(token_id);
        }
        self.committed = generated.len();

        let mut keep = vec![false; vocab_size];
        let mut accepted = false;
        for token_id in self.backend.argsort_descending(logits, 0)? {
            if self.parser.accepts(token_id) {
                keep[token_id as usize] = true;
                accepted = true;
                break;
            }
        }
        if self.parser.is_finished() && (self.eos_token_id as usize) < vocab_size {
            keep[self.eos_token_id as usize] = true;
            accepted = true;
        }
        if !accepted {
            return Err(Error::GuideStuck(0));
        }

        self.backend.mask_row(logits, 0, &keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vocabulary: "a"=0, "b"=1, ":"=2, ","=3, "}"=4, eos=5.
    /// Language: after "a" comes ":" or ","; after "b" comes "}".
    fn branch_processor() -> GuideLogitsProcessor<CpuBackend> {
        let eos_token_id = 5;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        for (token, token_id) in [("a", 0), ("b", 1), (":", 2), (",", 3), ("}", 4)] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }
        GuideLogitsProcessor::from_regex(r"a(:|,)|b\}", &vocabulary, CpuBackend)
            .expect("Processor failed")
    }

    fn uniform_logits(rows: usize, vocab: usize) -> CpuLogits {
        CpuLogits::matrix(vec![1.0; rows * vocab], rows, vocab).expect("Logits failed")
    }

    #[test]
    fn masks_each_row_by_its_own_state() {
        let mut processor = branch_processor();

        // First call records the prompt boundary; prompt ids are opaque.
        let prompt = CpuIds::from_rows(vec![vec![9], vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(2, 6);
        processor.process(&prompt, &mut logits).expect("Process failed");
        // Both rows are at the initial state: "a" or "b".
        for row in 0..2 {
            assert_eq!(
                logits.row(row),
                &[1.0, 1.0, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY]
            );
        }

        // Row 0 took "a", row 1 took "b": their allowed sets diverge.
        let step = CpuIds::from_rows(vec![vec![9, 0], vec![9, 1]]).expect("Ids failed");
        let mut logits = uniform_logits(2, 6);
        processor.process(&step, &mut logits).expect("Process failed");
        assert_eq!(
            logits.row(0),
            &[f32::NEG_INFINITY, f32::NEG_INFINITY, 1.0, 1.0, f32::NEG_INFINITY, f32::NEG_INFINITY]
        );
        assert_eq!(
            logits.row(1),
            &[f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY]
        );
        assert_eq!(processor.tracked_rows(), 2);
    }

    #[test]
    fn kept_positions_pass_through_bit_for_bit() {
        let mut processor = branch_processor();

        let prompt = CpuIds::from_rows(vec![vec![7]]).expect("Ids failed");
        let original = vec![0.1_f32, -2.75, 3.5, 4.25, -0.0, 9.125];
        let mut logits = CpuLogits::matrix(original.clone(), 1, 6).expect("Logits failed");
        processor.process(&prompt, &mut logits).expect("Process failed");

        for (position, (&masked, &input)) in
            logits.row(0).iter().zip(original.iter()).enumerate()
        {
            if position <= 1 {
                assert_eq!(masked.to_bits(), input.to_bits());
            } else {
                assert_eq!(masked, f32::NEG_INFINITY);
            }
        }
    }

    #[test]
    fn one_dimensional_logits_are_a_batch_of_one() {
        let mut processor = branch_processor();

        let prompt = CpuIds::vector(vec![9, 9]);
        let mut logits = CpuLogits::vector(vec![1.0; 6]);
        processor.process(&prompt, &mut logits).expect("Process failed");
        assert_eq!(
            logits.data(),
            &[1.0, 1.0, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY]
        );
    }

    #[test]
    fn batch_mismatch_is_rejected() {
        let mut processor = branch_processor();
        let ids = CpuIds::from_rows(vec![vec![9], vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(3, 6);
        match processor.process(&ids, &mut logits) {
            Err(Error::ShapeMismatch { ids: 2, logits: 3 }) => {}
            other => unreachable!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn finished_rows_allow_only_eos() {
        let mut processor = branch_processor();

        let prompt = CpuIds::from_rows(vec![vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 6);
        processor.process(&prompt, &mut logits).expect("Process failed");

        // "b", "}", then EOS: the row is done and stays pinned to EOS.
        let step = CpuIds::from_rows(vec![vec![9, 1, 4, 5]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 6);
        processor.process(&step, &mut logits).expect("Process failed");
        assert_eq!(
            logits.row(0),
            &[
                f32::NEG_INFINITY,
                f32::NEG_INFINITY,
                f32::NEG_INFINITY,
                f32::NEG_INFINITY,
                f32::NEG_INFINITY,
                1.0
            ]
        );
    }

    #[test]
    fn forbidden_commit_surfaces_invalid_transition() {
        let mut processor = branch_processor();

        let prompt = CpuIds::from_rows(vec![vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 6);
        processor.process(&prompt, &mut logits).expect("Process failed");

        // "}" cannot follow "a".
        let step = CpuIds::from_rows(vec![vec![9, 0, 4]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 6);
        match processor.process(&step, &mut logits) {
            Err(Error::InvalidTransition { token_id: 4, .. }) => {}
            other => unreachable!("expected invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn dropped_rows_are_purged() {
        let mut processor = branch_processor();

        let prompt = CpuIds::from_rows(vec![vec![9], vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(2, 6);
        processor.process(&prompt, &mut logits).expect("Process failed");
        assert_eq!(processor.tracked_rows(), 1); // both rows share the empty fingerprint

        // The batch narrows to one row; the other row's lineage disappears.
        let step = CpuIds::from_rows(vec![vec![9, 0]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 6);
        processor.process(&step, &mut logits).expect("Process failed");
        assert_eq!(processor.tracked_rows(), 1);
    }

    #[test]
    fn schema_processor_constrains_first_token() {
        let eos_token_id = 4;
        let mut vocabulary = Vocabulary::new(eos_token_id);
        for (token, token_id) in [("{", 0), ("}", 1), ("x", 2), (r#"{"n":1}"#, 3)] {
            vocabulary
                .try_insert(token, token_id as u32)
                .expect("Insert failed");
        }
        let schema = r#"{
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": ["n"]
        }"#;
        let mut processor =
            GuideLogitsProcessor::from_schema(schema, &vocabulary, CpuBackend, None)
                .expect("Processor failed");

        let prompt = CpuIds::from_rows(vec![vec![9]]).expect("Ids failed");
        let mut logits = uniform_logits(1, 5);
        processor.process(&prompt, &mut logits).expect("Process failed");

        // "{" and the full object open a match; "}" and "x" never can.
        assert_eq!(logits.row(0)[0], 1.0);
        assert_eq!(logits.row(0)[3], 1.0);
        assert_eq!(logits.row(0)[1], f32::NEG_INFINITY);
        assert_eq!(logits.row(0)[2], f32::NEG_INFINITY);
        assert_eq!(logits.row(0)[4], f32::NEG_INFINITY);
    }

    /// Toy parser accepting "a"* then "b", for the rejection walk.
    struct AThenB {
        saw_b: bool,
    }

    impl ParserState for AThenB {
        fn accepts(&self, token_id: TokenId) -> bool {
            !self.saw_b && (token_id == 0 || token_id == 1)
        }
        fn advance(&mut self, token_id: TokenId) {
            if token_id == 1 {
                self.saw_b = true;
            }
        }
        fn is_finished(&self) -> bool {
            self.saw_b
        }
    }

    #[test]
    fn cfg_processor_keeps_the_best_accepted_token() {
        let grammar = crate::dsl::cfg("start: A* B");
        let mut processor = CfgLogitsProcessor::new(
            grammar,
            Box::new(AThenB { saw_b: false }),
            3,
            CpuBackend,
        );

        let prompt = CpuIds::from_rows(vec![vec![9]]).expect("Ids failed");
        // Token 2 scores highest but the parser rejects it; token 1 is next.
        let mut logits = CpuLogits::matrix(vec![0.5, 2.0, 9.0, 1.0], 1, 4).expect("Logits failed");
        processor.process(&prompt, &mut logits).expect("Process failed");
        assert_eq!(
            logits.row(0),
            &[f32::NEG_INFINITY, 2.0, f32::NEG_INFINITY, f32::NEG_INFINITY]
        );

        // After "b" is committed the parse is finished: EOS opens up.
        let step = CpuIds::from_rows(vec![vec![9, 1]]).expect("Ids failed");
        let mut logits = CpuLogits::matrix(vec![0.5, 2.0, 9.0, 1.0], 1, 4).expect("Logits failed");
        processor.process(&step, &mut logits).expect("Process failed");
        assert_eq!(logits.row(0)[3], 1.0);
    }
}
