//! Session wrapper around the decoding core: owns the acoustic scorer,
//! drives decoding as frames become ready, and exposes the read-out
//! surface (best path, compact lattice, endpointing).

use log::debug;

use crate::config::DecCoreConfig;
use crate::decoder::DecCore;
use crate::error::DecodeError;
use crate::lattice::{self, CompactLattice, Lattice};
use crate::wfst::{AcousticScorer, LmDiffFst, Wfst};

/// Silence/VAD-based utterance termination. Implementations live outside
/// the core (they need the frame front-end and a silence phone set); the
/// session consults them through this trait.
pub trait EndPointer {
    fn detected(&self, num_frames_decoded: u32, final_relative_cost: f32) -> bool;
}

/// One recognition session: a decoding core bound to a scorer.
///
/// Multiple utterances can be decoded back-to-back; `stop_session`
/// returns all pooled memory to the free-lists without releasing it to
/// the OS.
pub struct Decoder<'g, S: AcousticScorer> {
    core: DecCore<'g>,
    scorer: S,
    end_pointer: Option<Box<dyn EndPointer>>,
}

impl<'g, S: AcousticScorer> Decoder<'g, S> {
    pub fn new(fst: &'g Wfst, scorer: S, config: DecCoreConfig) -> Result<Self, DecodeError> {
        Ok(Decoder {
            core: DecCore::new(fst, config)?,
            scorer,
            end_pointer: None,
        })
    }

    pub fn with_lm(
        fst: &'g Wfst,
        lm: &'g dyn LmDiffFst,
        scorer: S,
        config: DecCoreConfig,
    ) -> Result<Self, DecodeError> {
        Ok(Decoder {
            core: DecCore::with_lm(fst, lm, config)?,
            scorer,
            end_pointer: None,
        })
    }

    pub fn enable_end_pointer(&mut self, end_pointer: Box<dyn EndPointer>) {
        self.end_pointer = Some(end_pointer);
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    pub fn scorer_mut(&mut self) -> &mut S {
        &mut self.scorer
    }

    pub fn core(&self) -> &DecCore<'g> {
        &self.core
    }

    /// Start a new utterance. The session key is only carried into the
    /// logs; pass `None` for anonymous sessions.
    pub fn start_session(&mut self, session_key: Option<&str>) -> Result<(), DecodeError> {
        debug!("starting decode session {}", session_key.unwrap_or("<anon>"));
        self.core.init_decoding()
    }

    /// Decode the frames the scorer has ready, at most `max_num_frames`
    /// of them if non-negative.
    pub fn advance(&mut self, max_num_frames: i32) -> Result<(), DecodeError> {
        self.core.advance_decoding(&self.scorer, max_num_frames)
    }

    pub fn num_frames_decoded(&self) -> u32 {
        self.core.num_frames_decoded()
    }

    /// Delegates to the configured endpointer; false when none is set.
    pub fn endpoint_detected(&self) -> bool {
        match &self.end_pointer {
            Some(ep) => ep.detected(
                self.core.num_frames_decoded(),
                self.core.final_relative_cost(),
            ),
            None => false,
        }
    }

    /// Terminal pruning pass; call before the final `get_lattice` when
    /// final-state weights should shape the output.
    pub fn finalize(&mut self) {
        self.core.finalize_decoding();
    }

    /// Reset all per-utterance state, keeping pooled memory for reuse.
    pub fn stop_session(&mut self) {
        debug!("stopping decode session");
        self.core.reset();
    }

    pub fn reached_final(&self) -> bool {
        self.core.reached_final()
    }

    pub fn final_relative_cost(&self) -> f32 {
        self.core.final_relative_cost()
    }

    /// The acoustic-scaled word lattice decoded so far. Determinization
    /// is left to the caller (see `DecCoreConfig::determinize_lattice`).
    pub fn get_lattice(&self, use_final_prob: bool) -> Result<CompactLattice, DecodeError> {
        let raw = self.core.get_raw_lattice(use_final_prob)?;
        Ok(lattice::convert_to_compact(&raw))
    }

    /// The single best path through the current lattice. With
    /// `use_final_prob` and a reached final state, final weights are
    /// included; otherwise all last-frame hypotheses count as final.
    pub fn get_best_path(&self, use_final_prob: bool) -> Result<Lattice, DecodeError> {
        self.core.get_best_path(use_final_prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::shortest_path;
    use crate::wfst::Label;

    struct VecScorer {
        loglikes: Vec<Vec<f32>>,
    }

    impl AcousticScorer for VecScorer {
        fn num_frames_ready(&self) -> u32 {
            self.loglikes.len() as u32
        }
        fn is_last_frame(&self, frame: i32) -> bool {
            frame as i64 >= self.loglikes.len() as i64 - 1
        }
        fn log_likelihood(&self, frame: u32, ilabel: Label) -> f32 {
            self.loglikes[frame as usize][ilabel as usize]
        }
    }

    fn two_word_graph() -> Wfst {
        Wfst::new(
            3,
            0,
            &[(2, 0.0)],
            &[0, 1],
            &[1, 2],
            &[100, 200],
            &[0.0, 0.0],
            &[1, 2],
        )
    }

    #[test]
    fn test_full_session() {
        let fst = two_word_graph();
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -0.5, 0.0], vec![0.0, 0.0, -0.25]],
        };
        let mut dec = Decoder::new(&fst, scorer, DecCoreConfig::default()).unwrap();

        dec.start_session(None).unwrap();
        dec.advance(-1).unwrap();
        assert_eq!(dec.num_frames_decoded(), 2);
        dec.finalize();
        assert!(dec.reached_final());

        let best = dec.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.olabels(), vec![100, 200]);
        assert!((path.weight.acoustic_cost - 0.75).abs() < 1e-6);

        let clat = dec.get_lattice(true).unwrap();
        assert!(!clat.is_empty());
        let words: Vec<Label> = clat
            .arcs
            .iter()
            .flatten()
            .filter(|a| a.word != 0)
            .map(|a| a.word)
            .collect();
        assert!(words.contains(&100));
        assert!(words.contains(&200));

        // the session is reusable after a stop
        dec.stop_session();
        dec.start_session(None).unwrap();
        dec.advance(-1).unwrap();
        assert_eq!(dec.num_frames_decoded(), 2);
    }

    struct FrameCountEndPointer {
        min_frames: u32,
    }

    impl EndPointer for FrameCountEndPointer {
        fn detected(&self, num_frames_decoded: u32, final_relative_cost: f32) -> bool {
            num_frames_decoded >= self.min_frames && final_relative_cost.is_finite()
        }
    }

    #[test]
    fn test_endpointer_delegation() {
        let fst = two_word_graph();
        let scorer = VecScorer {
            loglikes: vec![vec![0.0; 3], vec![0.0; 3]],
        };
        let mut dec = Decoder::new(&fst, scorer, DecCoreConfig::default()).unwrap();
        dec.start_session(None).unwrap();

        // no endpointer configured: never detected
        assert!(!dec.endpoint_detected());

        dec.enable_end_pointer(Box::new(FrameCountEndPointer { min_frames: 2 }));
        assert!(!dec.endpoint_detected());
        dec.advance(-1).unwrap();
        assert!(dec.endpoint_detected());
    }

    #[test]
    fn test_bounded_advance() {
        let fst = two_word_graph();
        let scorer = VecScorer {
            loglikes: vec![vec![0.0; 3], vec![0.0; 3]],
        };
        let mut dec = Decoder::new(&fst, scorer, DecCoreConfig::default()).unwrap();
        dec.start_session(None).unwrap();
        dec.advance(1).unwrap();
        assert_eq!(dec.num_frames_decoded(), 1);
        dec.advance(-1).unwrap();
        assert_eq!(dec.num_frames_decoded(), 2);
    }
}
