//! Output containers for the decoded word graph.
//!
//! `Lattice` is the state-level form produced by the decoder (one arc per
//! token-graph link, graph and acoustic costs tracked separately).
//! `CompactLattice` is the word-level form: the acoustic-unit label moves
//! into a per-arc string, keyed by the word label.

use crate::wfst::{Label, EPSILON};

/// A (graph, acoustic) cost pair. Lower total is better; a component of
/// `f32::INFINITY` marks an unreachable weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeWeight {
    pub graph_cost: f32,
    pub acoustic_cost: f32,
}

impl LatticeWeight {
    #[inline]
    pub fn new(graph_cost: f32, acoustic_cost: f32) -> Self {
        LatticeWeight {
            graph_cost,
            acoustic_cost,
        }
    }

    /// The semiring identity: zero cost.
    #[inline]
    pub fn one() -> Self {
        LatticeWeight::new(0.0, 0.0)
    }

    #[inline]
    pub fn total(&self) -> f32 {
        self.graph_cost + self.acoustic_cost
    }

    /// Componentwise accumulation along a path.
    #[inline]
    pub fn plus(&self, other: &LatticeWeight) -> LatticeWeight {
        LatticeWeight::new(
            self.graph_cost + other.graph_cost,
            self.acoustic_cost + other.acoustic_cost,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeArc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: LatticeWeight,
    pub nextstate: u32,
}

/// State-level lattice: per-state arc lists plus final weights.
#[derive(Debug, Default)]
pub struct Lattice {
    start: u32,
    arcs: Vec<Vec<LatticeArc>>,
    finals: Vec<Option<LatticeWeight>>,
}

impl Lattice {
    pub fn new() -> Self {
        Lattice::default()
    }

    pub fn add_state(&mut self) -> u32 {
        let id = self.arcs.len() as u32;
        self.arcs.push(Vec::new());
        self.finals.push(None);
        id
    }

    pub fn set_start(&mut self, state: u32) {
        self.start = state;
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn set_final(&mut self, state: u32, weight: LatticeWeight) {
        self.finals[state as usize] = Some(weight);
    }

    #[inline]
    pub fn final_weight(&self, state: u32) -> Option<LatticeWeight> {
        self.finals[state as usize]
    }

    pub fn add_arc(&mut self, state: u32, arc: LatticeArc) {
        self.arcs[state as usize].push(arc);
    }

    #[inline]
    pub fn arcs_from(&self, state: u32) -> &[LatticeArc] {
        &self.arcs[state as usize]
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.arcs.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.arcs.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }
}

/// A single path through a lattice with its accumulated weight
/// (final weight included).
#[derive(Debug, Clone, PartialEq)]
pub struct LatticePath {
    pub arcs: Vec<LatticeArc>,
    pub weight: LatticeWeight,
}

impl LatticePath {
    /// Output labels along the path, ε skipped.
    pub fn olabels(&self) -> Vec<Label> {
        self.arcs
            .iter()
            .filter(|a| a.olabel != EPSILON)
            .map(|a| a.olabel)
            .collect()
    }

    /// Input labels along the path, ε skipped.
    pub fn ilabels(&self) -> Vec<Label> {
        self.arcs
            .iter()
            .filter(|a| a.ilabel != EPSILON)
            .map(|a| a.ilabel)
            .collect()
    }
}

/// Single best path from the start state to any final state of an acyclic
/// lattice. Returns `None` if no final state is reachable.
pub fn shortest_path(lat: &Lattice) -> Option<LatticePath> {
    if lat.is_empty() {
        return None;
    }
    let n = lat.num_states();
    let start = lat.start() as usize;

    // best[s] = lowest total cost from s to a final state, resolved in
    // post-order over the acyclic graph
    let mut best: Vec<Option<f32>> = vec![None; n];
    let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
    while let Some((s, i)) = stack.pop() {
        let arcs = lat.arcs_from(s as u32);
        if i < arcs.len() {
            stack.push((s, i + 1));
            let d = arcs[i].nextstate as usize;
            if best[d].is_none() {
                stack.push((d, 0));
            }
            continue;
        }
        let mut b = lat
            .final_weight(s as u32)
            .map_or(f32::INFINITY, |w| w.total());
        for arc in arcs {
            if let Some(db) = best[arc.nextstate as usize] {
                b = b.min(arc.weight.total() + db);
            }
        }
        best[s] = Some(b);
    }

    if !best[start].is_some_and(f32::is_finite) {
        return None;
    }

    // Greedy reconstruction: any arc achieving best[cur] continues the
    // optimal path; otherwise stop at the final weight.
    let mut arcs_out = Vec::new();
    let mut weight = LatticeWeight::one();
    let mut cur = start;
    loop {
        let mut chosen: Option<LatticeArc> = None;
        let mut chosen_cost = lat
            .final_weight(cur as u32)
            .map_or(f32::INFINITY, |w| w.total());
        for arc in lat.arcs_from(cur as u32) {
            if let Some(db) = best[arc.nextstate as usize] {
                let c = arc.weight.total() + db;
                if c < chosen_cost {
                    chosen_cost = c;
                    chosen = Some(*arc);
                }
            }
        }
        match chosen {
            Some(arc) => {
                weight = weight.plus(&arc.weight);
                cur = arc.nextstate as usize;
                arcs_out.push(arc);
            }
            None => {
                let f = lat.final_weight(cur as u32)?;
                weight = weight.plus(&f);
                break;
            }
        }
    }

    Some(LatticePath {
        arcs: arcs_out,
        weight,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactLatticeArc {
    pub word: Label,
    pub weight: LatticeWeight,
    /// Acoustic-unit labels consumed along this arc.
    pub ilabels: Vec<Label>,
    pub nextstate: u32,
}

/// Word-level lattice: arcs keyed by word, acoustic units carried as
/// per-arc strings.
#[derive(Debug, Default)]
pub struct CompactLattice {
    pub start: u32,
    pub arcs: Vec<Vec<CompactLatticeArc>>,
    pub finals: Vec<Option<LatticeWeight>>,
}

impl CompactLattice {
    pub fn num_states(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }
}

/// Arc-by-arc conversion of a state-level lattice: the word label keys the
/// arc and the acoustic-unit label (if any) moves into the arc's string.
pub fn convert_to_compact(lat: &Lattice) -> CompactLattice {
    let n = lat.num_states();
    let mut out = CompactLattice {
        start: lat.start(),
        arcs: Vec::with_capacity(n),
        finals: Vec::with_capacity(n),
    };
    for s in 0..n as u32 {
        let arcs = lat
            .arcs_from(s)
            .iter()
            .map(|a| CompactLatticeArc {
                word: a.olabel,
                weight: a.weight,
                ilabels: if a.ilabel == EPSILON {
                    Vec::new()
                } else {
                    vec![a.ilabel]
                },
                nextstate: a.nextstate,
            })
            .collect();
        out.arcs.push(arcs);
        out.finals.push(lat.final_weight(s));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(ilabel: Label, olabel: Label, g: f32, a: f32, nextstate: u32) -> LatticeArc {
        LatticeArc {
            ilabel,
            olabel,
            weight: LatticeWeight::new(g, a),
            nextstate,
        }
    }

    #[test]
    fn test_shortest_path_picks_cheaper_branch() {
        // 0 -(1:10)-> 1(final), 0 -(2:20)-> 2 -(3:30)-> 1
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.set_final(s1, LatticeWeight::one());
        lat.add_arc(s0, arc(1, 10, 1.0, 2.0, s1));
        lat.add_arc(s0, arc(2, 20, 0.5, 0.5, s2));
        lat.add_arc(s2, arc(3, 30, 0.5, 0.5, s1));

        let path = shortest_path(&lat).unwrap();
        assert_eq!(path.olabels(), vec![20, 30]);
        assert_eq!(path.weight, LatticeWeight::new(1.0, 1.0));
    }

    #[test]
    fn test_shortest_path_prefers_final_over_detour() {
        // 0 is final with cost 0.2; 0 -> 1(final) costs 1.0
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        lat.set_start(s0);
        lat.set_final(s0, LatticeWeight::new(0.2, 0.0));
        lat.set_final(s1, LatticeWeight::one());
        lat.add_arc(s0, arc(1, 10, 1.0, 0.0, s1));

        let path = shortest_path(&lat).unwrap();
        assert!(path.arcs.is_empty());
        assert_eq!(path.weight, LatticeWeight::new(0.2, 0.0));
    }

    #[test]
    fn test_shortest_path_no_final() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        lat.set_start(s0);
        assert!(shortest_path(&lat).is_none());
        assert!(shortest_path(&Lattice::new()).is_none());
    }

    #[test]
    fn test_convert_to_compact() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        lat.set_start(s0);
        lat.set_final(s1, LatticeWeight::new(0.5, 0.0));
        lat.add_arc(s0, arc(3, 42, 1.0, 2.0, s1));
        lat.add_arc(s0, arc(EPSILON, EPSILON, 0.1, 0.0, s1));

        let clat = convert_to_compact(&lat);
        assert_eq!(clat.num_states(), 2);
        assert_eq!(clat.arcs[0][0].word, 42);
        assert_eq!(clat.arcs[0][0].ilabels, vec![3]);
        assert!(clat.arcs[0][1].ilabels.is_empty());
        assert_eq!(clat.finals[1], Some(LatticeWeight::new(0.5, 0.0)));
    }
}
