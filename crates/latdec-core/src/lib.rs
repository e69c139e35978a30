//! Online lattice-generating decoder core for WFST-based speech
//! recognition: a token-passing search driven frame-by-frame by an
//! external acoustic scorer, producing a best path and a pruned word
//! lattice with per-arc graph and acoustic costs.

pub mod config;
pub mod decoder;
pub mod error;
pub mod hash_list;
pub mod lattice;
pub mod pool;
pub mod session;
pub mod wfst;

pub use config::DecCoreConfig;
pub use decoder::{BestPathIterator, DecCore};
pub use error::DecodeError;
pub use lattice::{CompactLattice, Lattice, LatticeArc, LatticePath, LatticeWeight};
pub use session::{Decoder, EndPointer};
pub use wfst::{AcousticScorer, Label, LmArc, LmDiffFst, StateId, Wfst, WfstArc, EPSILON};
