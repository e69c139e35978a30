//! Lattice-producing token-passing search over a recognition WFST.
//!
//! `DecCore` runs one utterance: the acoustic scorer is consumed
//! frame-by-frame, each frame expanding emitting arcs into a new token
//! layer and then closing ε-arcs within it. Tokens and their forward
//! links form a time-indexed DAG that is pruned backwards against the
//! lattice beam as decoding proceeds, and read out as a best path or a
//! raw lattice at any point.
//!
//! Tokens and links live in slab pools and reference each other by slot
//! id; the per-frame token lists and per-token link lists are intrusive
//! chains over those ids. A chained hash keyed by composed graph state is
//! maintained for the frontier frame only: `process_emitting` detaches
//! its whole contents in one operation and refills it with the next
//! frame's tokens while the detached chain is expanded.

use std::collections::VecDeque;

use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::DecCoreConfig;
use crate::error::DecodeError;
use crate::hash_list::{StateKey, TokenHash, NO_ELEM};
use crate::lattice::{Lattice, LatticeArc, LatticeWeight};
use crate::pool::Pool;
use crate::wfst::{AcousticScorer, Label, LmDiffFst, WfstArc, Wfst, EPSILON};

pub const NO_TOKEN: u32 = u32::MAX;
pub const NO_LINK: u32 = u32::MAX;

const INFINITY: f32 = f32::INFINITY;

/// One search hypothesis at a (frame, graph-state) pair.
#[derive(Debug, Clone, Copy)]
struct Token {
    /// Forward Viterbi cost to this point, cost-offsets applied.
    total_cost: f32,
    /// Backward slack: (best cost through this token) - (best cost
    /// overall). 0 on the frontier, +inf once pruned-unreachable.
    extra_cost: f32,
    /// Head of the outgoing forward-link chain.
    links: u32,
    /// Next token in this frame's list.
    next: u32,
    /// Token on the previous emitting frame this one was first reached
    /// from; used by the best-path traceback.
    backpointer: u32,
}

/// One edge of the token DAG, corresponding to one WFST arc traversal.
#[derive(Debug, Clone, Copy)]
struct ForwardLink {
    dst_tok: u32,
    ilabel: Label,
    olabel: Label,
    graph_cost: f32,
    /// Frame cost-offset already folded in; readers subtract it again.
    acoustic_cost: f32,
    next: u32,
}

struct FrameSlot {
    head: u32,
    must_prune_forward_links: bool,
    must_prune_tokens: bool,
}

impl FrameSlot {
    fn new() -> Self {
        FrameSlot {
            head: NO_TOKEN,
            must_prune_forward_links: true,
            must_prune_tokens: true,
        }
    }
}

/// Position in a best-path traceback.
///
/// `frame` is the frame whose transition-id the next
/// [`DecCore::trace_back_best_path`] step will emit (when that step is
/// emitting); it is -1 for the nonemitting steps before the first frame.
#[derive(Debug, Clone, Copy)]
pub struct BestPathIterator {
    pub tok: u32,
    pub frame: i32,
}

impl BestPathIterator {
    #[inline]
    pub fn done(&self) -> bool {
        self.tok == NO_TOKEN
    }
}

/// The decoding search engine for one utterance.
///
/// The graph (and optional LM-diff FST) are externally owned; everything
/// else, including all tokens and links, is owned here and recycled
/// through the pools across utterances.
pub struct DecCore<'g> {
    fst: &'g Wfst,
    lm: Option<&'g dyn LmDiffFst>,
    config: DecCoreConfig,

    tokens: Pool<Token>,
    links: Pool<ForwardLink>,
    /// Frontier hash; only valid for the most recent frame.
    tok_set: TokenHash,
    /// Token lists indexed by frame-plus-one: slot 0 holds the ε-closure
    /// of the start state, slot t+1 the tokens after consuming frame t.
    token_net: Vec<FrameSlot>,
    /// Additive constant folded into emitting acoustic costs per frame.
    cost_offsets: Vec<f32>,

    queue: Vec<StateKey>,
    tmp_array: Vec<f32>,

    num_toks: u32,
    warned: bool,
    decoding_finalized: bool,
    final_costs: FxHashMap<u32, f32>,
    final_relative_cost: f32,
    final_best_cost: f32,
}

impl<'g> DecCore<'g> {
    pub fn new(fst: &'g Wfst, config: DecCoreConfig) -> Result<Self, DecodeError> {
        config.check()?;
        let token_pool_realloc = config.token_pool_realloc;
        let link_pool_realloc = config.link_pool_realloc;
        Ok(DecCore {
            fst,
            lm: None,
            config,
            tokens: Pool::new(token_pool_realloc),
            links: Pool::new(link_pool_realloc),
            tok_set: TokenHash::new(1000),
            token_net: Vec::new(),
            cost_offsets: Vec::new(),
            queue: Vec::new(),
            tmp_array: Vec::new(),
            num_toks: 0,
            warned: false,
            decoding_finalized: false,
            final_costs: FxHashMap::default(),
            final_relative_cost: INFINITY,
            final_best_cost: INFINITY,
        })
    }

    /// Decode against a graph composed on the fly with an LM-diff FST;
    /// hypotheses are keyed by the composed (graph state, LM state) pair.
    pub fn with_lm(
        fst: &'g Wfst,
        lm: &'g dyn LmDiffFst,
        config: DecCoreConfig,
    ) -> Result<Self, DecodeError> {
        let mut core = DecCore::new(fst, config)?;
        core.lm = Some(lm);
        Ok(core)
    }

    pub fn config(&self) -> &DecCoreConfig {
        &self.config
    }

    /// Frames consumed so far; slot 0 is the pre-frame ε-closure.
    #[inline]
    pub fn num_frames_decoded(&self) -> u32 {
        (self.token_net.len() - 1) as u32
    }

    /// Live tokens across all frames.
    pub fn token_count(&self) -> u32 {
        self.num_toks
    }

    /// Reset all per-utterance state, returning tokens, links and hash
    /// entries to their free-lists.
    pub fn reset(&mut self) {
        let head = self.tok_set.clear();
        self.release_elems(head);
        self.clear_token_net();
        self.cost_offsets.clear();
        self.queue.clear();
        self.num_toks = 0;
        self.warned = false;
        self.decoding_finalized = false;
        self.final_costs.clear();
        self.final_relative_cost = INFINITY;
        self.final_best_cost = INFINITY;
    }

    /// Start a new utterance: frame slot 0 gets the start token and its
    /// ε-closure.
    pub fn init_decoding(&mut self) -> Result<(), DecodeError> {
        self.reset();

        let start_state = self.fst.start;
        if self.fst.num_states == 0 || start_state >= self.fst.num_states {
            return Err(DecodeError::Graph(format!(
                "missing start state {} in a graph of {} states",
                start_state, self.fst.num_states
            )));
        }

        self.token_net.push(FrameSlot::new());
        let start_tok = self.tokens.alloc(Token {
            total_cost: 0.0,
            extra_cost: 0.0,
            links: NO_LINK,
            next: NO_TOKEN,
            backpointer: NO_TOKEN,
        });
        self.token_net[0].head = start_tok;
        let lm_state = self.lm.map_or(0, |lm| lm.start());
        self.tok_set.insert(
            StateKey {
                state: start_state,
                lm_state,
            },
            start_tok,
        );
        self.num_toks += 1;
        self.process_nonemitting(self.config.beam)
    }

    /// One-shot decode: init, advance to the scorer's last frame with
    /// periodic partial pruning, finalize. Returns whether any traceback
    /// is available (not necessarily from a final state; an `Ok(false)`
    /// indicates an unusual search error).
    pub fn decode(&mut self, scorer: &dyn AcousticScorer) -> Result<bool, DecodeError> {
        self.init_decoding()?;
        while !scorer.is_last_frame(self.num_frames_decoded() as i32 - 1) {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_token_net(self.config.lattice_beam * self.config.prune_scale);
            }
            let cost_cutoff = self.process_emitting(scorer)?;
            self.process_nonemitting(cost_cutoff)?;
        }
        self.finalize_decoding();
        Ok(!self.token_net.is_empty()
            && self.token_net[self.token_net.len() - 1].head != NO_TOKEN)
    }

    /// Advance through the frames the scorer has ready, at most
    /// `max_num_frames` of them if non-negative.
    pub fn advance_decoding(
        &mut self,
        scorer: &dyn AcousticScorer,
        max_num_frames: i32,
    ) -> Result<(), DecodeError> {
        if self.token_net.is_empty() || self.decoding_finalized {
            return Err(DecodeError::ContractViolation(
                "init_decoding must be called before advance_decoding",
            ));
        }
        let num_frames_ready = scorer.num_frames_ready();
        // the scorer may not lose frames between calls
        assert!(num_frames_ready >= self.num_frames_decoded());
        let mut target_frames_decoded = num_frames_ready;
        if max_num_frames >= 0 {
            target_frames_decoded =
                target_frames_decoded.min(self.num_frames_decoded() + max_num_frames as u32);
        }
        while self.num_frames_decoded() < target_frames_decoded {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_token_net(self.config.lattice_beam * self.config.prune_scale);
            }
            let cost_cutoff = self.process_emitting(scorer)?;
            self.process_nonemitting(cost_cutoff)?;
        }
        Ok(())
    }

    /// Terminal pruning pass: fold final-state costs into the last frame's
    /// extra costs, then prune every frame back to the start at full
    /// accuracy. Further decoding on this utterance is forbidden.
    pub fn finalize_decoding(&mut self) {
        let end_time = self.num_frames_decoded() as usize;
        let num_toks_begin = self.num_toks;
        self.prune_forward_links_final();
        for t in (0..end_time).rev() {
            self.prune_forward_links(t, 0.0);
            self.prune_token_list(t + 1);
        }
        self.prune_token_list(0);
        debug!(
            "finalize: pruned tokens from {} to {}",
            num_toks_begin, self.num_toks
        );
    }

    /// Difference between the best final-including cost and the best cost
    /// on the last frame; +inf if no token reaches a final state.
    pub fn final_relative_cost(&self) -> f32 {
        if self.decoding_finalized {
            self.final_relative_cost
        } else {
            self.compute_final_costs().1
        }
    }

    pub fn reached_final(&self) -> bool {
        self.final_relative_cost() != INFINITY
    }

    // -----------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------

    /// Follow one graph arc from a composed state: with an LM-diff FST
    /// attached, a non-ε output label also traverses the unique LM arc it
    /// keys, adding the LM weight to the graph cost and substituting the
    /// LM output label. Returns (destination key, olabel, graph_cost).
    #[inline]
    fn compose_arc(
        &self,
        src: StateKey,
        arc: &WfstArc,
    ) -> Result<(StateKey, Label, f32), DecodeError> {
        let lm = match self.lm {
            None => {
                return Ok((StateKey::bare(arc.dst), arc.olabel, arc.weight));
            }
            Some(lm) => lm,
        };
        if arc.olabel == EPSILON {
            return Ok((
                StateKey {
                    state: arc.dst,
                    lm_state: src.lm_state,
                },
                EPSILON,
                arc.weight,
            ));
        }
        match lm.get_arc(src.lm_state, arc.olabel) {
            Some(lm_arc) => Ok((
                StateKey {
                    state: arc.dst,
                    lm_state: lm_arc.nextstate,
                },
                lm_arc.olabel,
                arc.weight + lm_arc.weight,
            )),
            None => Err(DecodeError::Graph(format!(
                "no LM-diff arc from LM state {} with output label {}",
                src.lm_state, arc.olabel
            ))),
        }
    }

    /// Final cost of a composed state; +inf if non-final.
    #[inline]
    fn final_cost_of(&self, key: StateKey) -> f32 {
        let cost = self.fst.final_cost(key.state);
        match self.lm {
            Some(lm) if cost != INFINITY => cost + lm.final_cost(key.lm_state),
            _ => cost,
        }
    }

    /// Locate the token for `key` on frame slot `t`, or insert a fresh one
    /// with no links. A better `total_cost` overwrites the existing token
    /// in place (identity and links preserved; stale links are re-pruned
    /// later). The bool reports whether anything changed.
    fn find_or_add_token(
        &mut self,
        key: StateKey,
        t: usize,
        total_cost: f32,
        backpointer: u32,
    ) -> (u32, bool) {
        debug_assert!(t < self.token_net.len());
        if let Some(tok) = self.tok_set.find(key) {
            if self.tokens[tok].total_cost > total_cost {
                self.tokens[tok].total_cost = total_cost;
                self.tokens[tok].backpointer = backpointer;
                (tok, true)
            } else {
                (tok, false)
            }
        } else {
            // frontier tokens get zero extra_cost: any of them could still
            // end up on the winning path
            let tok = self.tokens.alloc(Token {
                total_cost,
                extra_cost: 0.0,
                links: NO_LINK,
                next: self.token_net[t].head,
                backpointer,
            });
            self.token_net[t].head = tok;
            self.num_toks += 1;
            self.tok_set.insert(key, tok);
            (tok, true)
        }
    }

    fn possibly_resize_hash(&mut self, num_toks: usize) {
        let new_size = (num_toks as f32 * self.config.hash_ratio) as usize;
        if new_size > self.tok_set.size() {
            self.tok_set.set_size(new_size);
        }
    }

    /// Pruning cutoff for the detached frontier chain, with the adaptive
    /// beam and the best entry. Also counts the tokens.
    fn get_cutoff(&mut self, list_head: u32) -> (f32, f32, u32, usize) {
        let mut best_cost = INFINITY;
        let mut best_elem = NO_ELEM;
        let mut count = 0usize;

        if self.config.max_active == u32::MAX && self.config.min_active == 0 {
            let mut e = list_head;
            while e != NO_ELEM {
                let elem = self.tok_set.elem(e);
                let w = self.tokens[elem.tok].total_cost;
                if w < best_cost {
                    best_cost = w;
                    best_elem = e;
                }
                count += 1;
                e = elem.tail;
            }
            return (best_cost + self.config.beam, self.config.beam, best_elem, count);
        }

        self.tmp_array.clear();
        let mut e = list_head;
        while e != NO_ELEM {
            let elem = self.tok_set.elem(e);
            let w = self.tokens[elem.tok].total_cost;
            self.tmp_array.push(w);
            if w < best_cost {
                best_cost = w;
                best_elem = e;
            }
            count += 1;
            e = elem.tail;
        }

        let beam_cutoff = best_cost + self.config.beam;
        let max_active = self.config.max_active as usize;
        let min_active = self.config.min_active as usize;
        let mut min_active_cutoff = INFINITY;
        let mut max_active_cutoff = INFINITY;

        if count > max_active {
            pdqselect::select_by(&mut self.tmp_array, max_active - 1, |a, b| {
                a.partial_cmp(b).unwrap()
            });
            max_active_cutoff = self.tmp_array[max_active - 1];
        }
        if max_active_cutoff < beam_cutoff {
            // max_active is tighter than the beam
            let adaptive_beam = max_active_cutoff - best_cost + self.config.beam_delta;
            return (max_active_cutoff, adaptive_beam, best_elem, count);
        }
        if count > min_active {
            min_active_cutoff = if min_active == 0 {
                best_cost
            } else {
                // the earlier partition left the max_active smallest costs
                // in the prefix, so the search range can be bounded by it
                let bound = if count > max_active && min_active <= max_active {
                    max_active
                } else {
                    count
                };
                pdqselect::select_by(&mut self.tmp_array[..bound], min_active - 1, |a, b| {
                    a.partial_cmp(b).unwrap()
                });
                self.tmp_array[min_active - 1]
            };
        }
        if min_active_cutoff > beam_cutoff {
            // min_active is looser than the beam
            let adaptive_beam = min_active_cutoff - best_cost + self.config.beam_delta;
            (min_active_cutoff, adaptive_beam, best_elem, count)
        } else {
            (beam_cutoff, self.config.beam, best_elem, count)
        }
    }

    /// Consume one acoustic frame: detach the frontier, expand emitting
    /// arcs from every token within the cutoff into a new frame slot, and
    /// return the cutoff for the subsequent ε-expansion.
    pub fn process_emitting(
        &mut self,
        scorer: &dyn AcousticScorer,
    ) -> Result<f32, DecodeError> {
        assert!(!self.token_net.is_empty());
        if self.decoding_finalized {
            return Err(DecodeError::ContractViolation(
                "process_emitting called after finalize_decoding",
            ));
        }
        // zero-based acoustic frame index for the scorer
        let frame = (self.token_net.len() - 1) as u32;
        self.token_net.push(FrameSlot::new());
        let next_slot = self.token_net.len() - 1;

        let final_toks = self.tok_set.clear();
        let (cur_cutoff, adaptive_beam, best_elem, tok_cnt) = self.get_cutoff(final_toks);
        debug!("frame {}: {} active tokens", frame, tok_cnt);
        self.possibly_resize_hash(tok_cnt);

        let mut next_cutoff = INFINITY;
        // keeps total_cost in a good dynamic range across long utterances
        let mut cost_offset = 0.0;

        let fst = self.fst;

        // Pre-scan: expanding only the best token gives a reasonably tight
        // initial bound on next_cutoff.
        if best_elem != NO_ELEM {
            let elem = self.tok_set.elem(best_elem);
            let tok_cost = self.tokens[elem.tok].total_cost;
            cost_offset = -tok_cost;
            for arc in fst.arcs_from(elem.key.state) {
                if arc.ilabel == EPSILON {
                    continue;
                }
                let (_, _, graph_cost) = self.compose_arc(elem.key, arc)?;
                let new_weight = tok_cost
                    + graph_cost
                    + cost_offset
                    + (-scorer.log_likelihood(frame, arc.ilabel));
                if new_weight + adaptive_beam < next_cutoff {
                    next_cutoff = new_weight + adaptive_beam;
                }
            }
        }

        self.cost_offsets.push(cost_offset);
        debug_assert_eq!(self.cost_offsets.len() as u32, frame + 1);

        // The detached chain owns the old frontier; each entry is released
        // back to the hash once its arcs have been expanded.
        let mut e = final_toks;
        while e != NO_ELEM {
            let elem = self.tok_set.elem(e);
            let e_tail = elem.tail;
            let tok = elem.tok;
            if self.tokens[tok].total_cost <= cur_cutoff {
                let cur_cost = self.tokens[tok].total_cost;
                for arc in fst.arcs_from(elem.key.state) {
                    if arc.ilabel == EPSILON {
                        continue;
                    }
                    let (dst_key, olabel, graph_cost) = self.compose_arc(elem.key, arc)?;
                    let ac_cost = cost_offset + (-scorer.log_likelihood(frame, arc.ilabel));
                    let total_cost = cur_cost + ac_cost + graph_cost;
                    if total_cost > next_cutoff {
                        continue;
                    } else if total_cost + adaptive_beam < next_cutoff {
                        // prune by the best token seen so far
                        next_cutoff = total_cost + adaptive_beam;
                    }
                    let (dst_tok, _) =
                        self.find_or_add_token(dst_key, next_slot, total_cost, tok);
                    let link = self.links.alloc(ForwardLink {
                        dst_tok,
                        ilabel: arc.ilabel,
                        olabel,
                        graph_cost,
                        acoustic_cost: ac_cost,
                        next: self.tokens[tok].links,
                    });
                    self.tokens[tok].links = link;
                }
            }
            self.tok_set.release(e);
            e = e_tail;
        }
        Ok(next_cutoff)
    }

    /// Close ε-arcs within the frontier frame until no cost improves.
    /// A re-visited token's ε out-links are deleted and regenerated, so
    /// the surviving link set is exactly the final ε-arc set.
    pub fn process_nonemitting(&mut self, cutoff: f32) -> Result<(), DecodeError> {
        assert!(!self.token_net.is_empty());
        let slot = self.token_net.len() - 1;

        debug_assert!(self.queue.is_empty());
        for elem in self.tok_set.iter() {
            self.queue.push(elem.key);
        }
        if self.queue.is_empty() && !self.warned {
            warn!(
                "no surviving tokens in ε-expansion: frame is {}",
                self.token_net.len() as i64 - 2
            );
            self.warned = true;
        }

        let fst = self.fst;
        while let Some(key) = self.queue.pop() {
            let tok = self
                .tok_set
                .find(key)
                .expect("queued state is always in the frontier hash");
            let cur_cost = self.tokens[tok].total_cost;
            if cur_cost > cutoff {
                continue;
            }
            // regenerate this token's ε out-links from scratch
            self.delete_links(tok);
            for arc in fst.arcs_from(key.state) {
                if arc.ilabel != EPSILON {
                    continue;
                }
                let (dst_key, olabel, graph_cost) = self.compose_arc(key, arc)?;
                let total_cost = cur_cost + graph_cost;
                if total_cost < cutoff {
                    let (dst_tok, changed) =
                        self.find_or_add_token(dst_key, slot, total_cost, tok);
                    let link = self.links.alloc(ForwardLink {
                        dst_tok,
                        ilabel: EPSILON,
                        olabel,
                        graph_cost,
                        acoustic_cost: 0.0,
                        next: self.tokens[tok].links,
                    });
                    self.tokens[tok].links = link;
                    if changed {
                        self.queue.push(dst_key);
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Backward pruning
    // -----------------------------------------------------------------

    /// Recompute extra costs on frame `t` and excise links whose slack
    /// exceeds the lattice beam. Iterates to a fixed point because ε-links
    /// within a frame are not topologically ordered. Returns
    /// (extra_costs_changed, links_pruned); `delta` is the change below
    /// which an extra-cost update does not count as a change.
    fn prune_forward_links(&mut self, t: usize, delta: f32) -> (bool, bool) {
        let mut extra_costs_changed = false;
        let mut links_pruned = false;
        debug_assert!(t < self.token_net.len());

        if self.token_net[t].head == NO_TOKEN && !self.warned {
            warn!("no tokens alive while pruning frame {}; warning only once per utterance", t);
            self.warned = true;
        }

        let lattice_beam = self.config.lattice_beam;
        let mut changed = true;
        while changed {
            changed = false;
            let mut tok = self.token_net[t].head;
            while tok != NO_TOKEN {
                // tok_extra_cost is the min slack over surviving out-links
                let mut tok_extra_cost = INFINITY;
                let mut prev_link = NO_LINK;
                let mut link = self.tokens[tok].links;
                while link != NO_LINK {
                    let l = self.links[link];
                    let link_extra_cost = self.tokens[l.dst_tok].extra_cost
                        + ((self.tokens[tok].total_cost + l.acoustic_cost + l.graph_cost)
                            - self.tokens[l.dst_tok].total_cost);
                    debug_assert!(!link_extra_cost.is_nan());
                    if link_extra_cost > lattice_beam {
                        // excise the link, leaving prev_link in place
                        if prev_link != NO_LINK {
                            self.links[prev_link].next = l.next;
                        } else {
                            self.tokens[tok].links = l.next;
                        }
                        self.links.release(link);
                        links_pruned = true;
                    } else {
                        let clamped = self.clamp_extra_cost(link_extra_cost);
                        if clamped < tok_extra_cost {
                            tok_extra_cost = clamped;
                        }
                        prev_link = link;
                    }
                    link = l.next;
                }
                if (tok_extra_cost - self.tokens[tok].extra_cost).abs() > delta {
                    changed = true;
                }
                // +inf means no forward link survived
                self.tokens[tok].extra_cost = tok_extra_cost;
                tok = self.tokens[tok].next;
            }
            if changed {
                extra_costs_changed = true;
            }
        }
        (extra_costs_changed, links_pruned)
    }

    #[inline]
    fn clamp_extra_cost(&mut self, link_extra_cost: f32) -> f32 {
        if link_extra_cost < 0.0 {
            if link_extra_cost < -0.01 && !self.warned {
                warn!("negative extra cost: {}", link_extra_cost);
                self.warned = true;
            }
            0.0
        } else {
            link_extra_cost
        }
    }

    /// Variant of `prune_forward_links` for the last frame: a token's
    /// extra cost is seeded from its final-state viability, so being
    /// final-viable directly counts toward survival; tokens beyond the
    /// lattice beam are flagged with +inf extra cost for collection.
    /// Caches the final costs and freezes the utterance.
    fn prune_forward_links_final(&mut self) {
        assert!(!self.token_net.is_empty());
        let end_time = self.num_frames_decoded() as usize;

        if self.token_net[end_time].head == NO_TOKEN {
            warn!("no tokens alive at end of utterance");
        }

        let (final_costs, final_relative_cost, final_best_cost) = self.compute_final_costs();
        self.final_costs = final_costs;
        self.final_relative_cost = final_relative_cost;
        self.final_best_cost = final_best_cost;
        self.decoding_finalized = true;
        // tokens on the last frame may be freed below; the hash must not
        // keep entries pointing at them
        let head = self.tok_set.clear();
        self.release_elems(head);

        let lattice_beam = self.config.lattice_beam;
        let delta = 1.0e-05_f32;
        let mut changed = true;
        while changed {
            changed = false;
            let mut tok = self.token_net[end_time].head;
            while tok != NO_TOKEN {
                let final_cost = if self.final_costs.is_empty() {
                    0.0
                } else {
                    self.final_costs.get(&tok).copied().unwrap_or(INFINITY)
                };
                let mut tok_extra_cost =
                    self.tokens[tok].total_cost + final_cost - self.final_best_cost;
                let mut prev_link = NO_LINK;
                let mut link = self.tokens[tok].links;
                while link != NO_LINK {
                    let l = self.links[link];
                    let link_extra_cost = self.tokens[l.dst_tok].extra_cost
                        + ((self.tokens[tok].total_cost + l.acoustic_cost + l.graph_cost)
                            - self.tokens[l.dst_tok].total_cost);
                    if link_extra_cost > lattice_beam {
                        if prev_link != NO_LINK {
                            self.links[prev_link].next = l.next;
                        } else {
                            self.tokens[tok].links = l.next;
                        }
                        self.links.release(link);
                    } else {
                        let clamped = self.clamp_extra_cost(link_extra_cost);
                        if clamped < tok_extra_cost {
                            tok_extra_cost = clamped;
                        }
                        prev_link = link;
                    }
                    link = l.next;
                }
                if tok_extra_cost > lattice_beam {
                    // to be collected by prune_token_list
                    tok_extra_cost = INFINITY;
                }
                if !approx_equal(self.tokens[tok].extra_cost, tok_extra_cost, delta) {
                    changed = true;
                }
                self.tokens[tok].extra_cost = tok_extra_cost;
                tok = self.tokens[tok].next;
            }
        }
    }

    /// Unlink and free every token on frame `t` whose extra cost is +inf.
    fn prune_token_list(&mut self, t: usize) {
        debug_assert!(t < self.token_net.len());
        if self.token_net[t].head == NO_TOKEN && !self.warned {
            warn!("no tokens alive while compacting frame {}", t);
            self.warned = true;
        }
        let mut prev = NO_TOKEN;
        let mut tok = self.token_net[t].head;
        while tok != NO_TOKEN {
            let next = self.tokens[tok].next;
            if self.tokens[tok].extra_cost == INFINITY {
                // unreachable from the end of the graph
                debug_assert_eq!(self.tokens[tok].links, NO_LINK);
                if prev != NO_TOKEN {
                    self.tokens[prev].next = next;
                } else {
                    self.token_net[t].head = next;
                }
                self.tokens.release(tok);
                self.num_toks -= 1;
            } else {
                prev = tok;
            }
            tok = next;
        }
    }

    /// Walk frames from the frontier back to 0, pruning where the dirty
    /// flags say costs may still move: a changed frame marks its
    /// predecessor (whose links point into it), an excision marks the
    /// frame itself for token compaction on the next sweep.
    pub fn prune_token_net(&mut self, delta: f32) {
        let cur_time = self.num_frames_decoded() as usize;
        let num_toks_begin = self.num_toks;

        for t in (0..cur_time).rev() {
            if self.token_net[t].must_prune_forward_links {
                let (extra_costs_changed, links_pruned) = self.prune_forward_links(t, delta);
                if extra_costs_changed && t > 0 {
                    self.token_net[t - 1].must_prune_forward_links = true;
                }
                if links_pruned {
                    self.token_net[t].must_prune_tokens = true;
                }
                self.token_net[t].must_prune_forward_links = false;
            }
            if t != cur_time - 1 && self.token_net[t + 1].must_prune_tokens {
                self.prune_token_list(t + 1);
                self.token_net[t + 1].must_prune_tokens = false;
            }
        }
        debug!(
            "partial prune: tokens from {} to {}",
            num_toks_begin, self.num_toks
        );
    }

    // -----------------------------------------------------------------
    // Final costs
    // -----------------------------------------------------------------

    /// Final costs for the tokens on the frontier: a map from token to
    /// final cost (omitting non-final states), the relative cost of
    /// finality, and the best cost with finals folded in (without, when
    /// no final state is active). Forbidden after finalization, which
    /// caches these values instead.
    fn compute_final_costs(&self) -> (FxHashMap<u32, f32>, f32, f32) {
        assert!(!self.decoding_finalized);
        let mut final_costs = FxHashMap::default();
        let mut best_cost = INFINITY;
        let mut best_cost_with_final = INFINITY;
        for elem in self.tok_set.iter() {
            let final_cost = self.final_cost_of(elem.key);
            let cost = self.tokens[elem.tok].total_cost;
            let cost_with_final = cost + final_cost;
            best_cost = best_cost.min(cost);
            best_cost_with_final = best_cost_with_final.min(cost_with_final);
            if final_cost != INFINITY {
                final_costs.insert(elem.tok, final_cost);
            }
        }
        let final_relative_cost = if best_cost == INFINITY && best_cost_with_final == INFINITY {
            // no tokens survive; the least bad answer
            INFINITY
        } else {
            best_cost_with_final - best_cost
        };
        let final_best_cost = if best_cost_with_final != INFINITY {
            best_cost_with_final
        } else {
            best_cost
        };
        (final_costs, final_relative_cost, final_best_cost)
    }

    // -----------------------------------------------------------------
    // Traceback and lattice extraction
    // -----------------------------------------------------------------

    /// The best token on the last frame, as a traceback start point,
    /// along with its final cost (0 when finals are not in use). With
    /// `use_final_probs`, tokens in non-final states cost +inf unless no
    /// final token is active at all.
    pub fn best_path_end(
        &self,
        use_final_probs: bool,
    ) -> Result<(BestPathIterator, f32), DecodeError> {
        if self.decoding_finalized && !use_final_probs {
            return Err(DecodeError::ContractViolation(
                "best_path_end with use_final_probs == false is unavailable after finalize_decoding",
            ));
        }
        assert!(
            self.num_frames_decoded() > 0,
            "best_path_end requires at least one decoded frame"
        );

        let final_costs_local;
        let final_costs: &FxHashMap<u32, f32> = if self.decoding_finalized {
            &self.final_costs
        } else if use_final_probs {
            final_costs_local = self.compute_final_costs().0;
            &final_costs_local
        } else {
            final_costs_local = FxHashMap::default();
            &final_costs_local
        };

        let mut best_cost = INFINITY;
        let mut best_final_cost = 0.0;
        let mut best_tok = NO_TOKEN;
        let mut tok = self.token_net[self.token_net.len() - 1].head;
        while tok != NO_TOKEN {
            let mut cost = self.tokens[tok].total_cost;
            let mut final_cost = 0.0;
            if use_final_probs && !final_costs.is_empty() {
                // the final-prob participates in token selection
                match final_costs.get(&tok) {
                    Some(&fc) => {
                        final_cost = fc;
                        cost += fc;
                    }
                    None => cost = INFINITY,
                }
            }
            if cost < best_cost {
                best_cost = cost;
                best_tok = tok;
                best_final_cost = final_cost;
            }
            tok = self.tokens[tok].next;
        }
        if best_tok == NO_TOKEN {
            // likely a search error or infinities in the likelihoods
            warn!("no final token found");
        }
        Ok((
            BestPathIterator {
                tok: best_tok,
                frame: self.num_frames_decoded() as i32 - 1,
            },
            best_final_cost,
        ))
    }

    /// Step one link backward from `iter`, emitting the lattice arc that
    /// was traversed; the frame decrements on an emitting step and the
    /// frame's cost offset is removed from the acoustic cost.
    pub fn trace_back_best_path(&self, iter: BestPathIterator) -> (BestPathIterator, LatticeArc) {
        assert!(!iter.done());
        let tok = iter.tok;
        let cur_t = iter.frame;
        let mut ret_t = cur_t;
        let mut arc = LatticeArc {
            ilabel: EPSILON,
            olabel: EPSILON,
            weight: LatticeWeight::one(),
            nextstate: 0,
        };
        let bp = self.tokens[tok].backpointer;
        if bp != NO_TOKEN {
            let mut link = self.tokens[bp].links;
            while link != NO_LINK {
                let l = self.links[link];
                if l.dst_tok == tok {
                    arc.ilabel = l.ilabel;
                    arc.olabel = l.olabel;
                    let mut acoustic_cost = l.acoustic_cost;
                    if l.ilabel != EPSILON {
                        assert!((cur_t as usize) < self.cost_offsets.len());
                        acoustic_cost -= self.cost_offsets[cur_t as usize];
                        ret_t -= 1;
                    }
                    arc.weight = LatticeWeight::new(l.graph_cost, acoustic_cost);
                    break;
                }
                link = l.next;
            }
            assert!(
                link != NO_LINK,
                "traceback found no link to the current token (token pruning is inconsistent)"
            );
        }
        (
            BestPathIterator {
                tok: bp,
                frame: ret_t,
            },
            arc,
        )
    }

    /// The single best path through the current token graph, as a linear
    /// lattice. Empty when no traceback is available.
    pub fn get_best_path(&self, use_final_probs: bool) -> Result<Lattice, DecodeError> {
        let mut lat = Lattice::new();
        let (mut iter, final_graph_cost) = self.best_path_end(use_final_probs)?;
        if iter.done() {
            return Ok(lat);
        }
        let mut state = lat.add_state();
        lat.set_final(state, LatticeWeight::new(final_graph_cost, 0.0));
        while !iter.done() {
            let (next_iter, mut arc) = self.trace_back_best_path(iter);
            iter = next_iter;
            arc.nextstate = state;
            let new_state = lat.add_state();
            lat.add_arc(new_state, arc);
            state = new_state;
        }
        lat.set_start(state);
        Ok(lat)
    }

    /// The full token DAG as a lattice: one state per token (frames in
    /// order, each frame's tokens topologically sorted over its ε-links,
    /// so the start token is state 0), one arc per forward link with the
    /// frame's cost offset removed from emitting acoustic costs. Empty if
    /// any frame has no live tokens.
    pub fn get_raw_lattice(&self, use_final_probs: bool) -> Result<Lattice, DecodeError> {
        if self.decoding_finalized && !use_final_probs {
            return Err(DecodeError::ContractViolation(
                "get_raw_lattice with use_final_probs == false is unavailable after finalize_decoding",
            ));
        }

        let final_costs_local;
        let final_costs: &FxHashMap<u32, f32> = if self.decoding_finalized {
            &self.final_costs
        } else if use_final_probs {
            final_costs_local = self.compute_final_costs().0;
            &final_costs_local
        } else {
            final_costs_local = FxHashMap::default();
            &final_costs_local
        };

        let num_frames = self.token_net.len() - 1;
        assert!(num_frames > 0);
        let mut lat = Lattice::new();
        let mut tok_map: FxHashMap<u32, u32> = FxHashMap::with_capacity_and_hasher(
            self.num_toks as usize / 2 + 3,
            Default::default(),
        );

        let mut token_list: Vec<u32> = Vec::new();
        for f in 0..=num_frames {
            if self.token_net[f].head == NO_TOKEN {
                warn!(
                    "get_raw_lattice: no tokens active on frame {}: not producing lattice",
                    f
                );
                return Ok(Lattice::new());
            }
            self.top_sort_tokens(self.token_net[f].head, &mut token_list);
            for &tok in &token_list {
                if tok != NO_TOKEN {
                    tok_map.insert(tok, lat.add_state());
                }
            }
        }
        // state 0 must be the start token, thanks to the topological sort
        lat.set_start(0);

        for f in 0..=num_frames {
            let mut tok = self.token_net[f].head;
            while tok != NO_TOKEN {
                let cur_state = tok_map[&tok];
                let mut link = self.tokens[tok].links;
                while link != NO_LINK {
                    let l = self.links[link];
                    let nextstate = tok_map[&l.dst_tok];
                    let cost_offset = if l.ilabel != EPSILON {
                        debug_assert!(f < self.cost_offsets.len());
                        self.cost_offsets[f]
                    } else {
                        0.0
                    };
                    lat.add_arc(
                        cur_state,
                        LatticeArc {
                            ilabel: l.ilabel,
                            olabel: l.olabel,
                            weight: LatticeWeight::new(
                                l.graph_cost,
                                l.acoustic_cost - cost_offset,
                            ),
                            nextstate,
                        },
                    );
                    link = l.next;
                }
                if f == num_frames {
                    if use_final_probs && !final_costs.is_empty() {
                        if let Some(&fc) = final_costs.get(&tok) {
                            lat.set_final(cur_state, LatticeWeight::new(fc, 0.0));
                        }
                    } else {
                        lat.set_final(cur_state, LatticeWeight::one());
                    }
                }
                tok = self.tokens[tok].next;
            }
        }
        Ok(lat)
    }

    /// Like `get_raw_lattice`, but breadth-first from the start token,
    /// creating states only for tokens whose extra cost is within `beam`.
    pub fn get_raw_lattice_pruned(
        &self,
        use_final_probs: bool,
        beam: f32,
    ) -> Result<Lattice, DecodeError> {
        if self.decoding_finalized && !use_final_probs {
            return Err(DecodeError::ContractViolation(
                "get_raw_lattice_pruned with use_final_probs == false is unavailable after finalize_decoding",
            ));
        }

        let final_costs_local;
        let final_costs: &FxHashMap<u32, f32> = if self.decoding_finalized {
            &self.final_costs
        } else if use_final_probs {
            final_costs_local = self.compute_final_costs().0;
            &final_costs_local
        } else {
            final_costs_local = FxHashMap::default();
            &final_costs_local
        };

        let num_frames = self.token_net.len() - 1;
        assert!(num_frames > 0);
        for f in 0..=num_frames {
            if self.token_net[f].head == NO_TOKEN {
                warn!(
                    "get_raw_lattice_pruned: no tokens active on frame {}: not producing lattice",
                    f
                );
                return Ok(Lattice::new());
            }
        }

        let mut lat = Lattice::new();
        let mut tok_map: FxHashMap<u32, u32> = FxHashMap::default();
        let mut tok_queue: VecDeque<(u32, usize)> = VecDeque::new();

        // the start token sits at the tail of slot 0 (insertion prepends)
        let mut tok = self.token_net[0].head;
        while tok != NO_TOKEN {
            if self.tokens[tok].next == NO_TOKEN {
                let s = lat.add_state();
                tok_map.insert(tok, s);
                lat.set_start(s);
                tok_queue.push_back((tok, 0));
            }
            tok = self.tokens[tok].next;
        }

        while let Some((cur_tok, cur_frame)) = tok_queue.pop_front() {
            debug_assert!(cur_frame <= self.cost_offsets.len());
            let cur_state = tok_map[&cur_tok];

            let mut link = self.tokens[cur_tok].links;
            while link != NO_LINK {
                let l = self.links[link];
                if self.tokens[l.dst_tok].extra_cost < beam {
                    // both endpoints survive; create the arc
                    let next_frame = if l.ilabel == EPSILON {
                        cur_frame
                    } else {
                        cur_frame + 1
                    };
                    let nextstate = match tok_map.get(&l.dst_tok) {
                        Some(&s) => s,
                        None => {
                            let s = lat.add_state();
                            tok_map.insert(l.dst_tok, s);
                            tok_queue.push_back((l.dst_tok, next_frame));
                            s
                        }
                    };
                    let cost_offset = if l.ilabel != EPSILON {
                        self.cost_offsets[cur_frame]
                    } else {
                        0.0
                    };
                    lat.add_arc(
                        cur_state,
                        LatticeArc {
                            ilabel: l.ilabel,
                            olabel: l.olabel,
                            weight: LatticeWeight::new(
                                l.graph_cost,
                                l.acoustic_cost - cost_offset,
                            ),
                            nextstate,
                        },
                    );
                }
                link = l.next;
            }
            if cur_frame == num_frames {
                if use_final_probs && !final_costs.is_empty() {
                    if let Some(&fc) = final_costs.get(&cur_tok) {
                        lat.set_final(cur_state, LatticeWeight::new(fc, 0.0));
                    }
                } else {
                    lat.set_final(cur_state, LatticeWeight::one());
                }
            }
        }
        Ok(lat)
    }

    /// Topologically order one frame's tokens over their ε-links, into
    /// `topsorted` (which may contain `NO_TOKEN` holes the caller skips).
    /// Panics if the frame's ε-links form a cycle, which only happens for
    /// decoding graphs with ε-cycles.
    fn top_sort_tokens(&self, head: u32, topsorted: &mut Vec<u32>) {
        let mut token2pos: FxHashMap<u32, usize> = FxHashMap::default();
        let mut num_toks = 0usize;
        let mut tok = head;
        while tok != NO_TOKEN {
            num_toks += 1;
            tok = self.tokens[tok].next;
        }

        // Number the list back-to-front: tokens are prepended on creation,
        // so this starts out close to topological order already.
        let mut cur_pos = 0usize;
        tok = head;
        while tok != NO_TOKEN {
            cur_pos += 1;
            token2pos.insert(tok, num_toks - cur_pos);
            tok = self.tokens[tok].next;
        }

        let mut reprocess: FxHashSet<u32> = FxHashSet::default();
        tok = head;
        while tok != NO_TOKEN {
            let pos = token2pos[&tok];
            self.reposition_eps_successors(tok, pos, &mut token2pos, &mut cur_pos, &mut reprocess);
            // tok itself was just processed; it no longer needs reprocessing
            reprocess.remove(&tok);
            tok = self.tokens[tok].next;
        }

        let max_loop = 1_000_000usize;
        let mut loop_count = 0usize;
        while !reprocess.is_empty() && loop_count < max_loop {
            loop_count += 1;
            let reprocess_vec: Vec<u32> = reprocess.drain().collect();
            for tok in reprocess_vec {
                let pos = token2pos[&tok];
                self.reposition_eps_successors(
                    tok,
                    pos,
                    &mut token2pos,
                    &mut cur_pos,
                    &mut reprocess,
                );
            }
        }
        assert!(
            loop_count < max_loop,
            "epsilon cycle in the decoding graph (this is not allowed)"
        );

        topsorted.clear();
        topsorted.resize(cur_pos, NO_TOKEN);
        for (&tok, &pos) in &token2pos {
            topsorted[pos] = tok;
        }
    }

    /// Push every ε-successor of `tok` that currently sorts before it to a
    /// fresh position past the end, marking it for reprocessing.
    fn reposition_eps_successors(
        &self,
        tok: u32,
        pos: usize,
        token2pos: &mut FxHashMap<u32, usize>,
        cur_pos: &mut usize,
        reprocess: &mut FxHashSet<u32>,
    ) {
        let mut link = self.tokens[tok].links;
        while link != NO_LINK {
            let l = self.links[link];
            // non-ε links leave the frame and cannot affect this ordering
            if l.ilabel == EPSILON {
                if let Some(&next_pos) = token2pos.get(&l.dst_tok) {
                    if next_pos < pos {
                        token2pos.insert(l.dst_tok, *cur_pos);
                        *cur_pos += 1;
                        reprocess.insert(l.dst_tok);
                    }
                }
            }
            link = l.next;
        }
    }

    // -----------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------

    fn delete_links(&mut self, tok: u32) {
        let mut link = self.tokens[tok].links;
        while link != NO_LINK {
            let next = self.links[link].next;
            self.links.release(link);
            link = next;
        }
        self.tokens[tok].links = NO_LINK;
    }

    fn release_elems(&mut self, head: u32) {
        let mut e = head;
        while e != NO_ELEM {
            let next = self.tok_set.elem(e).tail;
            self.tok_set.release(e);
            e = next;
        }
    }

    fn clear_token_net(&mut self) {
        for f in 0..self.token_net.len() {
            let mut tok = self.token_net[f].head;
            while tok != NO_TOKEN {
                self.delete_links(tok);
                let next = self.tokens[tok].next;
                self.tokens.release(tok);
                self.num_toks -= 1;
                tok = next;
            }
        }
        self.token_net.clear();
        debug_assert_eq!(self.num_toks, 0);
    }
}

#[inline]
fn approx_equal(a: f32, b: f32, tol: f32) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= tol * (a.abs() + b.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::shortest_path;
    use crate::wfst::LmArc;

    struct VecScorer {
        /// loglikes[frame][ilabel]
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

    fn decode_all(core: &mut DecCore, scorer: &VecScorer) {
        core.init_decoding().unwrap();
        core.advance_decoding(scorer, -1).unwrap();
        core.finalize_decoding();
    }

    fn emitting_arcs(lat: &Lattice) -> Vec<(Label, Label)> {
        let mut out = Vec::new();
        for s in 0..lat.num_states() as u32 {
            for arc in lat.arcs_from(s) {
                if arc.ilabel != EPSILON {
                    out.push((arc.ilabel, arc.olabel));
                }
            }
        }
        out
    }

    #[test]
    fn test_single_arc_utterance() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[10], &[0.0], &[1]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -0.5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        assert_eq!(core.num_frames_decoded(), 1);
        assert!(core.reached_final());
        assert_eq!(core.final_relative_cost(), 0.0);

        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.ilabels(), vec![1]);
        assert_eq!(path.olabels(), vec![10]);
        assert!((path.weight.graph_cost - 0.0).abs() < 1e-6);
        assert!((path.weight.acoustic_cost - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_single_frame_lattice_layers() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[10], &[0.0], &[1]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -0.5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        let raw = core.get_raw_lattice(true).unwrap();
        // one token per layer: the start closure and the emitting layer
        assert_eq!(raw.num_states(), 2);
        assert_eq!(emitting_arcs(&raw), vec![(1, 10)]);
        assert_eq!(raw.final_weight(1), Some(LatticeWeight::one()));
        assert!(raw.final_weight(0).is_none());
    }

    #[test]
    fn test_epsilon_then_emitting() {
        let fst = Wfst::new(
            3,
            0,
            &[(2, 0.0)],
            &[0, 1],
            &[0, 2],
            &[0, 20],
            &[1.0, 0.0],
            &[1, 2],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0, 0.0]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.ilabels(), vec![2]);
        assert_eq!(path.olabels(), vec![20]);
        assert!((path.weight.graph_cost - 1.0).abs() < 1e-6);
        assert!((path.weight.acoustic_cost - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_picks_cheaper_alternative() {
        let fst = Wfst::new(
            2,
            0,
            &[(1, 0.0)],
            &[0, 0],
            &[1, 2],
            &[10, 20],
            &[0.0, 0.0],
            &[1, 1],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -2.0, -0.5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.ilabels(), vec![2]);
        assert_eq!(path.olabels(), vec![20]);
        assert!((path.weight.acoustic_cost - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_narrow_beam_drops_alternative() {
        let fst = Wfst::new(
            2,
            0,
            &[(1, 0.0)],
            &[0, 0],
            &[1, 2],
            &[10, 20],
            &[0.0, 0.0],
            &[1, 1],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -2.0, -0.5]],
        };
        let mut config = DecCoreConfig::default();
        config.beam = 0.1;
        let mut core = DecCore::new(&fst, config).unwrap();
        decode_all(&mut core, &scorer);

        let raw = core.get_raw_lattice(true).unwrap();
        assert_eq!(emitting_arcs(&raw), vec![(2, 20)]);

        let pruned = core.get_raw_lattice_pruned(true, 0.1).unwrap();
        assert_eq!(emitting_arcs(&pruned), vec![(2, 20)]);
    }

    #[test]
    fn test_max_active_tightens_frontier() {
        // three tokens on the start closure with costs {0.0, 0.2, 0.5}
        let fst = Wfst::new(
            4,
            0,
            &[(3, 0.0)],
            &[0, 0, 0, 1, 2],
            &[0, 0, 1, 2, 3],
            &[0, 0, 11, 12, 13],
            &[0.2, 0.5, 0.0, 0.0, 0.0],
            &[1, 2, 3, 3, 3],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0; 4]],
        };
        let mut config = DecCoreConfig::default();
        config.max_active = 1;
        let mut core = DecCore::new(&fst, config).unwrap();
        core.init_decoding().unwrap();

        let mut n = 0;
        let mut tok = core.token_net[0].head;
        while tok != NO_TOKEN {
            n += 1;
            tok = core.tokens[tok].next;
        }
        assert_eq!(n, 3);

        core.advance_decoding(&scorer, -1).unwrap();
        let mut frontier = 0;
        let mut tok = core.token_net[1].head;
        while tok != NO_TOKEN {
            frontier += 1;
            tok = core.tokens[tok].next;
        }
        assert!(frontier <= 1);

        core.finalize_decoding();
        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        // only the zero-cost token expanded, through its own emitting arc
        assert_eq!(path.ilabels(), vec![1]);
    }

    #[test]
    fn test_better_cost_overwrites_token_in_place() {
        let fst = Wfst::new(
            2,
            0,
            &[(1, 0.0)],
            &[0, 0],
            &[1, 2],
            &[10, 20],
            &[5.0, 3.0],
            &[1, 1],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0, 0.0]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        // one token per (frame, state): both arcs reach the same token
        let raw = core.get_raw_lattice(true).unwrap();
        assert_eq!(raw.num_states(), 2);
        assert_eq!(raw.arcs_from(0).len(), 2);

        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.ilabels(), vec![2]);
        assert!((path.weight.graph_cost - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_final_state_reached() {
        // state 1 is not final and has no outgoing arcs
        let fst = Wfst::new(2, 0, &[], &[0], &[1], &[10], &[0.0], &[1]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -0.5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        core.advance_decoding(&scorer, -1).unwrap();

        assert!(!core.reached_final());
        assert_eq!(core.final_relative_cost(), INFINITY);

        // all last-frame tokens are treated as final with weight one
        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.ilabels(), vec![1]);

        core.finalize_decoding();
        assert!(!core.reached_final());
        let best = core.get_best_path(true).unwrap();
        assert_eq!(shortest_path(&best).unwrap().ilabels(), vec![1]);
    }

    #[test]
    #[should_panic(expected = "epsilon cycle")]
    fn test_epsilon_cycle_detected() {
        // ε-cycle 0 <-> 1 inside the beam, plus an emitting escape
        let fst = Wfst::new(
            3,
            0,
            &[(2, 0.0)],
            &[0, 1, 0],
            &[0, 0, 1],
            &[0, 0, 10],
            &[0.5, 0.5, 0.0],
            &[1, 0, 2],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        core.advance_decoding(&scorer, -1).unwrap();
        let _ = core.get_raw_lattice(true);
    }

    #[test]
    fn test_best_path_matches_raw_lattice_shortest_path() {
        // diamond: two competing two-frame paths
        let fst = Wfst::new(
            4,
            0,
            &[(3, 0.2)],
            &[0, 0, 1, 2],
            &[1, 2, 3, 4],
            &[10, 20, 30, 40],
            &[0.3, 0.1, 0.0, 0.4],
            &[1, 2, 3, 3],
        );
        let scorer = VecScorer {
            loglikes: vec![
                vec![0.0, -1.0, -1.3, 0.0, 0.0],
                vec![0.0, 0.0, 0.0, -0.7, -0.3],
            ],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        assert!(core.decode(&scorer).unwrap());

        let best = core.get_best_path(true).unwrap();
        let raw = core.get_raw_lattice(true).unwrap();
        let best_path = shortest_path(&best).unwrap();
        let raw_path = shortest_path(&raw).unwrap();

        assert_eq!(best_path.olabels(), raw_path.olabels());
        assert!((best_path.weight.total() - raw_path.weight.total()).abs() < 0.1);
        assert_eq!(best_path.olabels(), vec![10, 30]);
    }

    #[test]
    fn test_partial_prune_is_idempotent() {
        let fst = Wfst::new(
            4,
            0,
            &[(3, 0.0)],
            &[0, 0, 1, 2],
            &[1, 2, 3, 4],
            &[10, 20, 30, 40],
            &[0.3, 0.1, 0.0, 0.4],
            &[1, 2, 3, 3],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0; 5], vec![0.0; 5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        core.advance_decoding(&scorer, -1).unwrap();

        let delta = core.config.lattice_beam * core.config.prune_scale;
        core.prune_token_net(delta);
        let count_after_first = core.token_count();
        let costs_after_first = snapshot_extra_costs(&core);

        core.prune_token_net(delta);
        assert_eq!(core.token_count(), count_after_first);
        assert_eq!(snapshot_extra_costs(&core), costs_after_first);
    }

    fn snapshot_extra_costs(core: &DecCore) -> Vec<(usize, u32, f32)> {
        let mut out = Vec::new();
        for f in 0..core.token_net.len() {
            let mut tok = core.token_net[f].head;
            while tok != NO_TOKEN {
                out.push((f, tok, core.tokens[tok].extra_cost));
                tok = core.tokens[tok].next;
            }
        }
        out
    }

    #[test]
    fn test_cost_offsets_bound_total_cost() {
        // a long utterance whose raw scores would drift far from zero
        let fst = Wfst::new(1, 0, &[(0, 0.0)], &[0], &[1], &[10], &[0.0], &[0]);
        let loglikes = vec![vec![0.0, 25.0]; 200];
        let scorer = VecScorer { loglikes };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        core.advance_decoding(&scorer, -1).unwrap();
        assert_eq!(core.num_frames_decoded(), 200);

        for f in 0..core.token_net.len() {
            let mut tok = core.token_net[f].head;
            while tok != NO_TOKEN {
                let cost = core.tokens[tok].total_cost;
                assert!(cost.is_finite());
                assert!(cost.abs() < 100.0, "total_cost {} drifted", cost);
                tok = core.tokens[tok].next;
            }
        }

        // read-out recovers the absolute acoustic score
        core.finalize_decoding();
        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert!((path.weight.acoustic_cost - (-25.0 * 200.0)).abs() < 1.0);
    }

    #[test]
    fn test_forward_costs_dominate_link_costs() {
        let fst = Wfst::new(
            4,
            0,
            &[(3, 0.2)],
            &[0, 0, 1, 2, 1],
            &[1, 2, 3, 4, 0],
            &[10, 20, 30, 40, 0],
            &[0.3, 0.1, 0.0, 0.4, 0.05],
            &[1, 2, 3, 3, 2],
        );
        let scorer = VecScorer {
            loglikes: vec![vec![0.0; 5], vec![0.0, -0.2, -0.4, -0.1, -0.3]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        core.advance_decoding(&scorer, -1).unwrap();

        // every link satisfies the Viterbi bound
        for f in 0..core.token_net.len() {
            let mut tok = core.token_net[f].head;
            while tok != NO_TOKEN {
                let mut link = core.tokens[tok].links;
                while link != NO_LINK {
                    let l = core.links[link];
                    let through = core.tokens[tok].total_cost + l.graph_cost + l.acoustic_cost;
                    assert!(
                        core.tokens[l.dst_tok].total_cost <= through + 1e-4,
                        "link undercuts the Viterbi cost of its destination"
                    );
                    link = l.next;
                }
                tok = core.tokens[tok].next;
            }
        }

        // after an exact prune, surviving slack is within the lattice beam
        core.prune_token_net(0.0);
        let lattice_beam = core.config.lattice_beam;
        for f in 0..core.token_net.len() - 1 {
            let mut tok = core.token_net[f].head;
            while tok != NO_TOKEN {
                let mut link = core.tokens[tok].links;
                while link != NO_LINK {
                    let l = core.links[link];
                    let link_extra = core.tokens[l.dst_tok].extra_cost
                        + (core.tokens[tok].total_cost + l.graph_cost + l.acoustic_cost
                            - core.tokens[l.dst_tok].total_cost);
                    assert!(link_extra <= lattice_beam + 1e-4);
                    link = l.next;
                }
                tok = core.tokens[tok].next;
            }
        }
    }

    #[test]
    fn test_frame_count_tracks_token_net() {
        let fst = Wfst::new(1, 0, &[(0, 0.0)], &[0], &[1], &[10], &[0.0], &[0]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0]; 5],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        assert_eq!(core.num_frames_decoded(), 0);
        core.advance_decoding(&scorer, 2).unwrap();
        assert_eq!(core.num_frames_decoded(), 2);
        assert_eq!(core.token_net.len(), 3);
        core.advance_decoding(&scorer, -1).unwrap();
        assert_eq!(core.num_frames_decoded(), 5);
        assert_eq!(core.token_net.len(), 6);
    }

    #[test]
    fn test_advance_after_finalize_is_an_error() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[10], &[0.0], &[1]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        assert!(matches!(
            core.advance_decoding(&scorer, -1),
            Err(DecodeError::ContractViolation(_))
        ));
        assert!(matches!(
            core.get_raw_lattice(false),
            Err(DecodeError::ContractViolation(_))
        ));
        assert!(matches!(
            core.get_best_path(false),
            Err(DecodeError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_reinit_reuses_pools() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[10], &[0.0], &[1]);
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, -0.5]],
        };
        let mut core = DecCore::new(&fst, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);
        let live_after_first = core.tokens.live();

        decode_all(&mut core, &scorer);
        assert_eq!(core.tokens.live(), live_after_first);
        assert!(core.reached_final());
    }

    struct TableLm {
        arcs: FxHashMap<(u32, Label), LmArc>,
        finals: FxHashMap<u32, f32>,
    }

    impl LmDiffFst for TableLm {
        fn start(&self) -> u32 {
            0
        }
        fn final_cost(&self, state: u32) -> f32 {
            self.finals.get(&state).copied().unwrap_or(INFINITY)
        }
        fn get_arc(&self, state: u32, olabel: Label) -> Option<LmArc> {
            self.arcs.get(&(state, olabel)).copied()
        }
    }

    #[test]
    fn test_lm_diff_weights_fold_into_graph_cost() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[10], &[0.0], &[1]);
        let mut arcs = FxHashMap::default();
        arcs.insert(
            (0u32, 10u32),
            LmArc {
                nextstate: 1,
                olabel: 10,
                weight: 0.7,
            },
        );
        let mut finals = FxHashMap::default();
        finals.insert(1u32, 0.0f32);
        let lm = TableLm { arcs, finals };

        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0]],
        };
        let mut core = DecCore::with_lm(&fst, &lm, DecCoreConfig::default()).unwrap();
        decode_all(&mut core, &scorer);

        assert!(core.reached_final());
        let best = core.get_best_path(true).unwrap();
        let path = shortest_path(&best).unwrap();
        assert_eq!(path.olabels(), vec![10]);
        assert!((path.weight.graph_cost - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_lm_diff_missing_arc_is_a_graph_error() {
        let fst = Wfst::new(2, 0, &[(1, 0.0)], &[0], &[1], &[99], &[0.0], &[1]);
        let lm = TableLm {
            arcs: FxHashMap::default(),
            finals: FxHashMap::default(),
        };
        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0]],
        };
        let mut core = DecCore::with_lm(&fst, &lm, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();
        assert!(matches!(
            core.advance_decoding(&scorer, -1),
            Err(DecodeError::Graph(_))
        ));
    }

    #[test]
    fn test_lm_states_split_tokens() {
        // two ε-paths reach graph state 2 with different LM histories:
        // the hash must keep them apart
        let fst = Wfst::new(
            3,
            0,
            &[(2, 0.0)],
            &[0, 0, 1, 1],
            &[0, 0, 1, 2],
            &[5, 6, 0, 0],
            &[0.0, 0.1, 0.0, 0.0],
            &[1, 1, 2, 2],
        );
        let mut arcs = FxHashMap::default();
        arcs.insert(
            (0u32, 5u32),
            LmArc {
                nextstate: 1,
                olabel: 5,
                weight: 0.0,
            },
        );
        arcs.insert(
            (0u32, 6u32),
            LmArc {
                nextstate: 2,
                olabel: 6,
                weight: 0.0,
            },
        );
        let mut finals = FxHashMap::default();
        finals.insert(1u32, 0.0f32);
        finals.insert(2u32, 0.0f32);
        let lm = TableLm { arcs, finals };

        let scorer = VecScorer {
            loglikes: vec![vec![0.0, 0.0, 0.0]],
        };
        let mut core = DecCore::with_lm(&fst, &lm, DecCoreConfig::default()).unwrap();
        core.init_decoding().unwrap();

        // slot 0 holds: start, two state-1 variants (one per LM history)
        let mut n = 0;
        let mut tok = core.token_net[0].head;
        while tok != NO_TOKEN {
            n += 1;
            tok = core.tokens[tok].next;
        }
        assert_eq!(n, 3);
    }
}
