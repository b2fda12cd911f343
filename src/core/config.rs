// This module provides AllocatorConfig, the options one allocator run is built from: the
// register set handed to the allocator, the cap on pass0/pass1 rounds per block and whether the
// post-allocation verifier runs. Values are read from `key=value` parameters or from SPILLGEN_*
// environment variables, and validated into a Registers mask before any block is allocated.
// Unknown keys and malformed values are reported as AllocError::InvalidConfig.

//! Allocator configuration.
//!
//! Options come from `key=value` parameters (the form a compiler pass
//! receives them in) or from the environment:
//!
//! * `regs` / `SPILLGEN_REGS`: `ALL` or a comma separated register list.
//! * `max_iterations` / `SPILLGEN_MAX_ITERATIONS`: cap on pass0/pass1 rounds per block.
//! * `verify` / `SPILLGEN_VERIFY`: run the post-allocation verifier.

use super::error::{AllocError, AllocResult};
use super::register_file::Registers;
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub regs: String,
    pub max_iterations: usize,
    pub verify: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            regs: "ALL".to_string(),
            max_iterations: 32,
            verify: false,
        }
    }
}

impl AllocatorConfig {
    /// Apply `key=value` pairs on top of the defaults.
    pub fn from_params<'a, I>(params: I) -> AllocResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in params {
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Defaults overridden by `SPILLGEN_*` environment variables.
    pub fn from_env() -> AllocResult<Self> {
        let mut config = Self::default();
        for (var, key) in [
            ("SPILLGEN_REGS", "regs"),
            ("SPILLGEN_MAX_ITERATIONS", "max_iterations"),
            ("SPILLGEN_VERIFY", "verify"),
        ] {
            if let Ok(value) = env::var(var) {
                config.set(key, &value)?;
            }
        }
        Ok(config)
    }

    pub fn set(&mut self, key: &str, value: &str) -> AllocResult<()> {
        match key {
            "regs" => self.regs = value.trim().to_string(),
            "max_iterations" => {
                let n: usize = value.trim().parse().map_err(|e| AllocError::InvalidConfig {
                    reason: format!("max_iterations '{value}': {e}"),
                })?;
                if n == 0 {
                    return Err(AllocError::InvalidConfig {
                        reason: "max_iterations must be positive".to_string(),
                    });
                }
                self.max_iterations = n;
            }
            "verify" => {
                self.verify = match value.trim() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    other => {
                        return Err(AllocError::InvalidConfig {
                            reason: format!("verify expects a boolean, got '{other}'"),
                        })
                    }
                }
            }
            other => {
                return Err(AllocError::InvalidConfig {
                    reason: format!("unknown option '{other}'"),
                })
            }
        }
        Ok(())
    }

    /// The register-class table selected by `regs`.
    pub fn registers(&self) -> AllocResult<Registers> {
        Registers::parse(&self.regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::RegKind;

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.regs, "ALL");
        assert_eq!(config.registers().unwrap(), Registers::all());
    }

    #[test]
    fn test_from_params() {
        let config =
            AllocatorConfig::from_params([("regs", "eax,ecx"), ("max_iterations", "4")]).unwrap();
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.registers().unwrap().mask(RegKind::Gp), 0b11);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(AllocatorConfig::from_params([("max_iterations", "0")]).is_err());
        assert!(AllocatorConfig::from_params([("verify", "maybe")]).is_err());
        assert!(matches!(
            AllocatorConfig::from_params([("colour", "blue")]),
            Err(AllocError::InvalidConfig { .. })
        ));
    }
}
