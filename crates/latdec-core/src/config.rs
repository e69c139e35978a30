use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Search and pruning options for [`DecCore`](crate::decoder::DecCore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecCoreConfig {
    /// Forward decoding beam. Larger is slower and more accurate.
    pub beam: f32,
    /// Cap on active tokens per frame; tightens the beam when exceeded.
    pub max_active: u32,
    /// Floor on active tokens per frame; loosens the beam when needed.
    pub min_active: u32,
    /// Lattice generation beam. Larger gives deeper lattices.
    pub lattice_beam: f32,
    /// Interval (in frames) at which to run the partial backward prune.
    pub prune_interval: u32,
    /// Not inspected by the core; consumed by calling code that
    /// determinizes the output lattice.
    pub determinize_lattice: bool,
    /// Additive slack when the beam is adapted at the max/min-active
    /// cutoffs.
    pub beam_delta: f32,
    /// Frontier-hash capacity as a multiple of the live token count.
    pub hash_ratio: f32,
    /// The partial prune runs with delta = lattice_beam * prune_scale.
    pub prune_scale: f32,
    /// Reservation granularity of the token slab pool.
    pub token_pool_realloc: usize,
    /// Reservation granularity of the forward-link slab pool.
    pub link_pool_realloc: usize,
}

impl Default for DecCoreConfig {
    fn default() -> Self {
        DecCoreConfig {
            beam: 16.0,
            max_active: u32::MAX,
            min_active: 200,
            lattice_beam: 10.0,
            prune_interval: 25,
            determinize_lattice: true,
            beam_delta: 0.5,
            hash_ratio: 2.0,
            prune_scale: 0.1,
            token_pool_realloc: 2048,
            link_pool_realloc: 8192,
        }
    }
}

impl DecCoreConfig {
    pub fn check(&self) -> Result<(), DecodeError> {
        if !(self.beam > 0.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "beam must be positive, got {}",
                self.beam
            )));
        }
        if self.max_active < 1 {
            return Err(DecodeError::InvalidConfig(
                "max_active must be at least 1".into(),
            ));
        }
        if !(self.lattice_beam > 0.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "lattice_beam must be positive, got {}",
                self.lattice_beam
            )));
        }
        if self.prune_interval == 0 {
            return Err(DecodeError::InvalidConfig(
                "prune_interval must be positive".into(),
            ));
        }
        if !(self.beam_delta > 0.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "beam_delta must be positive, got {}",
                self.beam_delta
            )));
        }
        if !(self.hash_ratio >= 1.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "hash_ratio must be at least 1, got {}",
                self.hash_ratio
            )));
        }
        if !(self.prune_scale > 0.0 && self.prune_scale < 1.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "prune_scale must lie in (0, 1), got {}",
                self.prune_scale
            )));
        }
        if self.token_pool_realloc == 0 || self.link_pool_realloc == 0 {
            return Err(DecodeError::InvalidConfig(
                "pool reservation sizes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_check() {
        let config = DecCoreConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.beam, 16.0);
        assert_eq!(config.min_active, 200);
        assert_eq!(config.prune_interval, 25);
    }

    #[test]
    fn test_check_rejects_bad_values() {
        let mut config = DecCoreConfig::default();
        config.beam = 0.0;
        assert!(config.check().is_err());

        let mut config = DecCoreConfig::default();
        config.hash_ratio = 0.5;
        assert!(config.check().is_err());

        let mut config = DecCoreConfig::default();
        config.prune_scale = 1.0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_roundtrips_through_serde() {
        let config = DecCoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: DecCoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.beam, config.beam);
        assert_eq!(back.max_active, config.max_active);
        assert_eq!(back.token_pool_realloc, config.token_pool_realloc);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: DecCoreConfig = serde_json::from_str(r#"{"beam": 12.0}"#).unwrap();
        assert_eq!(config.beam, 12.0);
        assert_eq!(config.lattice_beam, 10.0);
    }
}
