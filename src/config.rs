//! Runtime configuration types.

use serde::{Deserialize, Serialize};

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// Always compile before running
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Loop-back edges between cooperative preemption polls.
    pub preempt_interval: u32,
    /// Register-file capacity in 8-byte words. Fixed for the VM's lifetime;
    /// overflow raises a script-visible exception.
    pub register_file_words: usize,
    /// Granularity of executable-memory reservations.
    pub pool_chunk_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            preempt_interval: 1000,
            register_file_words: 64 * 1024,
            pool_chunk_bytes: 256 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML configuration fragment, filling gaps with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Whether this build and configuration actually run the JIT.
    pub fn jit_enabled(&self) -> bool {
        let supported = cfg!(all(feature = "jit", target_arch = "x86_64", unix));
        match self.jit_mode {
            JitMode::Off => false,
            JitMode::On | JitMode::Auto => supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.jit_mode, JitMode::Auto);
        assert_eq!(c.preempt_interval, 1000);
    }

    #[test]
    fn test_from_toml() {
        let c = RuntimeConfig::from_toml_str(
            "jit_mode = \"off\"\npreempt_interval = 16\n",
        )
        .unwrap();
        assert_eq!(c.jit_mode, JitMode::Off);
        assert_eq!(c.preempt_interval, 16);
        assert_eq!(
            c.register_file_words,
            RuntimeConfig::default().register_file_words
        );
    }
}
