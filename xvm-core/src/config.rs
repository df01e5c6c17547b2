//! Engine configuration loading from .env files
//!
//! Values come from `.env` or the process environment, falling back to the
//! built-in defaults. Unparseable values are ignored.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

// Load .env the first time any setting is read
static DOTENV_INIT: Lazy<()> = Lazy::new(|| {
    let _ = dotenv::dotenv();
});

/// Ensure environment is loaded
#[inline]
fn ensure_loaded() {
    let _ = &*DOTENV_INIT;
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    ensure_loaded();
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Default number of script slots
pub const DEFAULT_MAX_SCRIPTS: usize = 1024;
/// Stack size used when a program header asks for 0
pub const DEFAULT_STACK_SIZE: usize = 1024;
/// Largest stack a program may request (1 Mi slots)
pub const DEFAULT_MAX_STACK_SIZE: usize = 1 << 20;
/// Default capacity of the host API table
pub const DEFAULT_MAX_HOST_APIS: usize = 1024;

/// Limits and timeslices of a [`VirtualMachine`](crate::VirtualMachine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Size of the fixed slot table
    pub max_scripts: usize,
    /// Stack slots for programs whose header asks for 0
    pub default_stack_size: usize,
    /// Requests above this fail with `OutOfMemory`
    pub max_stack_size: usize,
    /// Capacity of the host API registration table
    pub max_host_apis: usize,
    pub timeslice_low_ms: u32,
    pub timeslice_medium_ms: u32,
    pub timeslice_high_ms: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_scripts: DEFAULT_MAX_SCRIPTS,
            default_stack_size: DEFAULT_STACK_SIZE,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_host_apis: DEFAULT_MAX_HOST_APIS,
            timeslice_low_ms: 20,
            timeslice_medium_ms: 40,
            timeslice_high_ms: 80,
        }
    }
}

impl VmConfig {
    /// Read every setting from the environment
    ///
    /// | variable                  | default |
    /// |---------------------------|---------|
    /// | `XVM_MAX_SCRIPTS`         | 1024    |
    /// | `XVM_DEFAULT_STACK_SIZE`  | 1024    |
    /// | `XVM_MAX_STACK_SIZE`      | 1048576 |
    /// | `XVM_MAX_HOST_APIS`       | 1024    |
    /// | `XVM_TIMESLICE_LOW_MS`    | 20      |
    /// | `XVM_TIMESLICE_MEDIUM_MS` | 40      |
    /// | `XVM_TIMESLICE_HIGH_MS`   | 80      |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_scripts: env_or("XVM_MAX_SCRIPTS", defaults.max_scripts),
            default_stack_size: env_or("XVM_DEFAULT_STACK_SIZE", defaults.default_stack_size),
            max_stack_size: env_or("XVM_MAX_STACK_SIZE", defaults.max_stack_size),
            max_host_apis: env_or("XVM_MAX_HOST_APIS", defaults.max_host_apis),
            timeslice_low_ms: env_or("XVM_TIMESLICE_LOW_MS", defaults.timeslice_low_ms),
            timeslice_medium_ms: env_or("XVM_TIMESLICE_MEDIUM_MS", defaults.timeslice_medium_ms),
            timeslice_high_ms: env_or("XVM_TIMESLICE_HIGH_MS", defaults.timeslice_high_ms),
        }
    }

    pub fn with_max_scripts(mut self, max_scripts: usize) -> Self {
        self.max_scripts = max_scripts;
        self
    }

    pub fn with_max_host_apis(mut self, max_host_apis: usize) -> Self {
        self.max_host_apis = max_host_apis;
        self
    }

    pub fn with_max_stack_size(mut self, max_stack_size: usize) -> Self {
        self.max_stack_size = max_stack_size;
        self
    }
}

/// Process-wide configuration read once from the environment
pub static VM_CONFIG: Lazy<VmConfig> = Lazy::new(VmConfig::from_env);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_scripts, 1024);
        assert_eq!(config.default_stack_size, 1024);
        assert_eq!(config.max_stack_size, 1 << 20);
        assert_eq!(config.timeslice_low_ms, 20);
        assert_eq!(config.timeslice_medium_ms, 40);
        assert_eq!(config.timeslice_high_ms, 80);
    }

    #[test]
    fn test_env_override() {
        // SAFETY: this variable is only touched by this test
        unsafe { env::set_var("XVM_TEST_ONLY_SETTING", " 77 ") };
        assert_eq!(env_or("XVM_TEST_ONLY_SETTING", 5usize), 77);
        unsafe { env::set_var("XVM_TEST_ONLY_SETTING", "garbage") };
        assert_eq!(env_or("XVM_TEST_ONLY_SETTING", 5usize), 5);
        unsafe { env::remove_var("XVM_TEST_ONLY_SETTING") };
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VmConfig = serde_json::from_str(r#"{"max_scripts": 4}"#).unwrap();
        assert_eq!(config.max_scripts, 4);
        assert_eq!(config.timeslice_high_ms, 80);
    }

    #[test]
    fn test_builder_methods() {
        let config = VmConfig::default().with_max_scripts(2).with_max_host_apis(8);
        assert_eq!(config.max_scripts, 2);
        assert_eq!(config.max_host_apis, 8);
    }
}
