pub type Label = u32;
pub type StateId = u32;

/// The null label on non-consuming arcs.
pub const EPSILON: Label = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WfstArc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: f32,
    pub dst: StateId,
}

/// Recognition graph stored in CSR format (arcs sorted by source state).
///
/// Input labels are acoustic units (transition-ids), output labels are
/// words; graph costs live in the log semiring. A state with final cost
/// `f32::INFINITY` is non-final.
pub struct Wfst {
    pub num_states: u32,
    pub start: StateId,

    // CSR arc storage
    pub offsets: Vec<u32>, // length num_states + 1
    pub arcs: Vec<WfstArc>,

    pub final_costs: Vec<f32>,
}

impl Wfst {
    /// Build a graph from parallel arc arrays.
    pub fn new(
        num_states: u32,
        start: StateId,
        finals: &[(StateId, f32)],
        arc_src: &[StateId],
        arc_ilabel: &[Label],
        arc_olabel: &[Label],
        arc_weight: &[f32],
        arc_dst: &[StateId],
    ) -> Self {
        let n = num_states as usize;
        let num_arcs = arc_src.len();
        assert_eq!(arc_ilabel.len(), num_arcs);
        assert_eq!(arc_olabel.len(), num_arcs);
        assert_eq!(arc_weight.len(), num_arcs);
        assert_eq!(arc_dst.len(), num_arcs);

        let mut final_costs = vec![f32::INFINITY; n];
        for &(s, cost) in finals {
            final_costs[s as usize] = cost;
        }

        // Sort arcs by source state for CSR
        let mut indices: Vec<usize> = (0..num_arcs).collect();
        indices.sort_unstable_by_key(|&i| arc_src[i]);

        let mut offsets = vec![0u32; n + 1];
        let mut arcs = Vec::with_capacity(num_arcs);

        for &idx in &indices {
            let src = arc_src[idx] as usize;
            offsets[src + 1] += 1;
            arcs.push(WfstArc {
                ilabel: arc_ilabel[idx],
                olabel: arc_olabel[idx],
                weight: arc_weight[idx],
                dst: arc_dst[idx],
            });
        }

        // Prefix sum
        for i in 1..=n {
            offsets[i] += offsets[i - 1];
        }

        Wfst {
            num_states,
            start,
            offsets,
            arcs,
            final_costs,
        }
    }

    /// Iterate arcs from a given source state.
    #[inline]
    pub fn arcs_from(&self, state: StateId) -> &[WfstArc] {
        let lo = self.offsets[state as usize] as usize;
        let hi = self.offsets[state as usize + 1] as usize;
        &self.arcs[lo..hi]
    }

    /// Final cost of a state; `f32::INFINITY` if the state is non-final.
    #[inline]
    pub fn final_cost(&self, state: StateId) -> f32 {
        self.final_costs[state as usize]
    }
}

/// Frame-synchronous source of acoustic log-likelihoods.
///
/// Frame indices are zero-based. `log_likelihood` may be called repeatedly
/// for the same (frame, ilabel) pair.
pub trait AcousticScorer {
    fn num_frames_ready(&self) -> u32;
    /// True if `frame` is the last frame of the utterance. Called with -1
    /// before any frame has been decoded.
    fn is_last_frame(&self, frame: i32) -> bool;
    fn log_likelihood(&self, frame: u32, ilabel: Label) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmArc {
    pub nextstate: StateId,
    pub olabel: Label,
    pub weight: f32,
}

/// Deterministic language-model difference FST, looked up on demand by
/// output label to expand the recognition graph lazily.
pub trait LmDiffFst {
    fn start(&self) -> StateId;
    fn final_cost(&self, state: StateId) -> f32;
    /// The unique arc leaving `state` with the given non-ε output label,
    /// or `None` if the LM has no such transition.
    fn get_arc(&self, state: StateId, olabel: Label) -> Option<LmArc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_layout() {
        // 0 -(1:10/0.5)-> 1, 0 -(2:20/1.0)-> 2, 1 -(0:0/0.0)-> 2
        let fst = Wfst::new(
            3,
            0,
            &[(2, 0.0)],
            &[1, 0, 0],
            &[0, 1, 2],
            &[0, 10, 20],
            &[0.0, 0.5, 1.0],
            &[2, 1, 2],
        );

        assert_eq!(fst.arcs_from(0).len(), 2);
        assert_eq!(fst.arcs_from(1).len(), 1);
        assert_eq!(fst.arcs_from(2).len(), 0);
        assert_eq!(fst.arcs_from(1)[0].ilabel, EPSILON);
        assert_eq!(fst.final_cost(2), 0.0);
        assert!(fst.final_cost(0).is_infinite());
    }
}
