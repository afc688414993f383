//! Runtime configuration
//!
//! Aggregates every tunable the GC, IC, and JIT backends expose. Parsed
//! from TOML with `serde`/`toml`, the same pair `raya-pm` and
//! `raya-stdlib`'s template module use for on-disk manifests.

use serde::{Deserialize, Serialize};

use crate::error::AeroError;
use crate::gc::WriteBarrierType;
use crate::jit::codegen::TargetArch;

/// Top-level configuration for the runtime substrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Garbage collector tuning
    pub gc: GcConfig,
    /// Inline cache tuning
    pub ic: IcConfig,
    /// JIT backend selection
    pub jit: JitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gc: GcConfig::default(),
            ic: IcConfig::default(),
            jit: JitConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML document, validating every field.
    pub fn from_toml_str(s: &str) -> Result<Self, AeroError> {
        let cfg: Config = toml::from_str(s).map_err(|e| AeroError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate range and consistency constraints that `serde` cannot express.
    pub fn validate(&self) -> Result<(), AeroError> {
        self.gc.validate()?;
        self.ic.validate()?;
        Ok(())
    }
}

/// Garbage collector configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Heap utilization ratio that triggers a collection, in `[0.1, 0.95]`
    pub heap_target_utilization: f64,
    /// Microsecond budget for a single GC increment, capped at 2000
    pub increment_budget_us: u64,
    /// Write barrier discipline
    pub write_barrier_type: WriteBarrierType,
    /// Whether a dedicated marker thread runs concurrently with the mutator
    pub concurrent_mode: bool,
    /// Allocation alignment in bytes, default 8
    pub object_alignment: usize,
    /// Heap page size in bytes, default 4 KiB
    pub page_size: usize,
    /// Allocations since last GC that trigger a collection
    pub allocation_trigger_count: u64,
    /// Seconds since last GC that trigger a collection
    pub time_trigger_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            heap_target_utilization: 0.7,
            increment_budget_us: 1000,
            write_barrier_type: WriteBarrierType::SnapshotAtBeginning,
            concurrent_mode: false,
            object_alignment: 8,
            page_size: 4096,
            allocation_trigger_count: 10_000,
            time_trigger_secs: 60,
        }
    }
}

impl GcConfig {
    /// Hard ceiling on a single increment's time budget, regardless of
    /// configuration.
    pub const MAX_INCREMENT_TIME_US: u64 = 2000;

    /// Validate this configuration, rejecting out-of-range values.
    ///
    /// `WriteBarrierType::None` is rejected unconditionally: it is unsound
    /// while marking is active, and there is no way for a static config
    /// value to prove marking will never be active, so selecting it is a
    /// configuration error rather than an inferred intent.
    pub fn validate(&self) -> Result<(), AeroError> {
        if !(0.1..=0.95).contains(&self.heap_target_utilization) {
            return Err(AeroError::Config(format!(
                "gc.heap_target_utilization {} out of range [0.1, 0.95]",
                self.heap_target_utilization
            )));
        }
        if self.increment_budget_us == 0 || self.increment_budget_us > Self::MAX_INCREMENT_TIME_US
        {
            return Err(AeroError::Config(format!(
                "gc.increment_budget_us {} out of range (0, {}]",
                self.increment_budget_us,
                Self::MAX_INCREMENT_TIME_US
            )));
        }
        if self.write_barrier_type == WriteBarrierType::None {
            return Err(AeroError::Config(
                "gc.write_barrier_type = none is unsound while marking; pick a real barrier"
                    .to_string(),
            ));
        }
        if self.object_alignment == 0 || !self.object_alignment.is_power_of_two() {
            return Err(AeroError::Config(
                "gc.object_alignment must be a nonzero power of two".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inline cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcConfig {
    /// Entry count at which a cache becomes megamorphic
    pub megamorphic_threshold: usize,
    /// Miss count beyond which a cache becomes megamorphic
    pub miss_threshold: u64,
}

impl Default for IcConfig {
    fn default() -> Self {
        IcConfig {
            megamorphic_threshold: 8,
            miss_threshold: 64,
        }
    }
}

impl IcConfig {
    /// Validate this configuration.
    pub fn validate(&self) -> Result<(), AeroError> {
        if self.megamorphic_threshold == 0 {
            return Err(AeroError::Config(
                "ic.megamorphic_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Vector-extension policy for the JIT backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorPolicy {
    /// Use vector instructions when the target supports them
    Auto,
    /// Force vector instructions on, failing compilation if unsupported
    On,
    /// Always lower to scalar loops
    Off,
}

/// JIT backend configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Target architecture to compile for
    pub target_arch: TargetArch,
    /// Vector extension usage policy
    pub enable_vector_extensions: VectorPolicy,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            target_arch: TargetArch::RiscV64,
            enable_vector_extensions: VectorPolicy::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_write_barrier_none() {
        let mut cfg = Config::default();
        cfg.gc.write_barrier_type = WriteBarrierType::None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_utilization() {
        let mut cfg = Config::default();
        cfg.gc.heap_target_utilization = 0.05;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_increment_budget_over_max() {
        let mut cfg = Config::default();
        cfg.gc.increment_budget_us = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = Config::from_toml_str("[ic]\nmegamorphic_threshold = 4\n").unwrap();
        assert_eq!(cfg.ic.megamorphic_threshold, 4);
        assert_eq!(cfg.gc.page_size, 4096);
    }
}
