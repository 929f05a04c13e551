//! Device configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use gpuring_runtime::config::DeviceConfig;
//!
//! let config = DeviceConfig::from_env()
//!     .ring_dwords(4096)
//!     .preempt_timeout(Duration::from_millis(500));
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use gpuring_core::constants::GPU_PAGE_SIZE;
use gpuring_core::env::{env_get, env_get_bool, env_get_str, env_get_u64};
use gpuring_core::record::PREEMPT_RECORD_HEADER;
use gpuring_core::ConfigError;

/// Ring controller configuration with builder pattern
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Log prefix
    pub name: String,
    /// Size of each ring in dwords
    pub ring_dwords: u32,
    /// Command buffers per submission
    pub max_cmds_per_submit: usize,
    /// Idle polls before `IdleTimeout`
    pub idle_retries: u32,
    /// Delay between idle polls
    pub idle_poll_interval: Duration,
    /// Hardware init attempts during recovery
    pub init_retries: u32,
    /// Delay between recovery attempts
    pub recovery_backoff: Duration,
    /// Switch-complete deadline
    pub preempt_timeout: Duration,
    /// Longest single park inside `wait`
    pub wait_slice: Duration,
    /// Bytes per preemption record
    pub preempt_record_size: usize,
    /// Bytes per non-privileged restore area
    pub user_record_size: usize,
    /// Context switches save GMEM
    pub uses_gmem: bool,
    /// Context switches skip save/restore
    pub skip_save_restore: bool,
    /// Switch back to ring 0 as soon as ring 1 settles
    pub rearm_low_priority: bool,
    /// Diagnostic reports kept
    pub diag_capacity: usize,
    /// First iova of the built-in allocator
    pub iova_base: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DeviceConfig {
    /// Library defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `GPR_NAME` - Device name in log lines
    /// - `GPR_RING_DWORDS` - Ring size in dwords
    /// - `GPR_MAX_CMDS` - Command buffers per submission
    /// - `GPR_IDLE_RETRIES` - Idle polls before timeout
    /// - `GPR_IDLE_POLL_US` - Delay between idle polls
    /// - `GPR_INIT_RETRIES` - Init attempts during recovery
    /// - `GPR_RECOVERY_BACKOFF_MS` - Delay between recovery attempts
    /// - `GPR_PREEMPT_TIMEOUT_MS` - Switch-complete deadline
    /// - `GPR_WAIT_SLICE_MS` - Longest single park in `wait`
    /// - `GPR_PREEMPT_RECORD_SIZE` - Bytes per preemption record (hex ok)
    /// - `GPR_USER_RECORD_SIZE` - Bytes per non-privileged area (hex ok)
    /// - `GPR_USES_GMEM` - Save GMEM on switch (0/1)
    /// - `GPR_SKIP_SAVE_RESTORE` - Skip save/restore on switch (0/1)
    /// - `GPR_REARM_LOW` - Rearm ring 0 after ring 1 settles (0/1)
    /// - `GPR_DIAG_CAPACITY` - Diagnostic reports kept
    /// - `GPR_IOVA_BASE` - First device address (hex ok)
    pub fn from_env() -> Self {
        Self {
            name: env_get_str("GPR_NAME", defaults::NAME),
            ring_dwords: env_get("GPR_RING_DWORDS", defaults::RING_DWORDS),
            max_cmds_per_submit: env_get("GPR_MAX_CMDS", defaults::MAX_CMDS_PER_SUBMIT),
            idle_retries: env_get("GPR_IDLE_RETRIES", defaults::IDLE_RETRIES),
            idle_poll_interval: Duration::from_micros(env_get(
                "GPR_IDLE_POLL_US",
                defaults::IDLE_POLL_US,
            )),
            init_retries: env_get("GPR_INIT_RETRIES", defaults::INIT_RETRIES),
            recovery_backoff: Duration::from_millis(env_get(
                "GPR_RECOVERY_BACKOFF_MS",
                defaults::RECOVERY_BACKOFF_MS,
            )),
            preempt_timeout: Duration::from_millis(env_get(
                "GPR_PREEMPT_TIMEOUT_MS",
                defaults::PREEMPT_TIMEOUT_MS,
            )),
            wait_slice: Duration::from_millis(env_get(
                "GPR_WAIT_SLICE_MS",
                defaults::WAIT_SLICE_MS,
            )),
            preempt_record_size: env_get_u64(
                "GPR_PREEMPT_RECORD_SIZE",
                defaults::PREEMPT_RECORD_BYTES as u64,
            ) as usize,
            user_record_size: env_get_u64(
                "GPR_USER_RECORD_SIZE",
                defaults::USER_RECORD_BYTES as u64,
            ) as usize,
            uses_gmem: env_get_bool("GPR_USES_GMEM", defaults::USES_GMEM),
            skip_save_restore: env_get_bool("GPR_SKIP_SAVE_RESTORE", defaults::SKIP_SAVE_RESTORE),
            rearm_low_priority: env_get_bool("GPR_REARM_LOW", defaults::REARM_LOW_PRIORITY),
            diag_capacity: env_get("GPR_DIAG_CAPACITY", defaults::DIAG_CAPACITY),
            iova_base: env_get_u64("GPR_IOVA_BASE", defaults::IOVA_BASE),
        }
    }

    /// Library defaults only, no environment; what tests start from
    pub fn new() -> Self {
        Self {
            name: defaults::NAME.to_string(),
            ring_dwords: defaults::RING_DWORDS,
            max_cmds_per_submit: defaults::MAX_CMDS_PER_SUBMIT,
            idle_retries: defaults::IDLE_RETRIES,
            idle_poll_interval: Duration::from_micros(defaults::IDLE_POLL_US),
            init_retries: defaults::INIT_RETRIES,
            recovery_backoff: Duration::from_millis(defaults::RECOVERY_BACKOFF_MS),
            preempt_timeout: Duration::from_millis(defaults::PREEMPT_TIMEOUT_MS),
            wait_slice: Duration::from_millis(defaults::WAIT_SLICE_MS),
            preempt_record_size: defaults::PREEMPT_RECORD_BYTES,
            user_record_size: defaults::USER_RECORD_BYTES,
            uses_gmem: defaults::USES_GMEM,
            skip_save_restore: defaults::SKIP_SAVE_RESTORE,
            rearm_low_priority: defaults::REARM_LOW_PRIORITY,
            diag_capacity: defaults::DIAG_CAPACITY,
            iova_base: defaults::IOVA_BASE,
        }
    }

    // Builder methods

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn ring_dwords(mut self, n: u32) -> Self {
        self.ring_dwords = n;
        self
    }

    pub fn max_cmds_per_submit(mut self, n: usize) -> Self {
        self.max_cmds_per_submit = n;
        self
    }

    pub fn idle_retries(mut self, n: u32) -> Self {
        self.idle_retries = n;
        self
    }

    pub fn idle_poll_interval(mut self, d: Duration) -> Self {
        self.idle_poll_interval = d;
        self
    }

    pub fn init_retries(mut self, n: u32) -> Self {
        self.init_retries = n;
        self
    }

    pub fn recovery_backoff(mut self, d: Duration) -> Self {
        self.recovery_backoff = d;
        self
    }

    pub fn preempt_timeout(mut self, d: Duration) -> Self {
        self.preempt_timeout = d;
        self
    }

    pub fn wait_slice(mut self, d: Duration) -> Self {
        self.wait_slice = d;
        self
    }

    pub fn preempt_record_size(mut self, bytes: usize) -> Self {
        self.preempt_record_size = bytes;
        self
    }

    pub fn user_record_size(mut self, bytes: usize) -> Self {
        self.user_record_size = bytes;
        self
    }

    pub fn uses_gmem(mut self, enable: bool) -> Self {
        self.uses_gmem = enable;
        self
    }

    pub fn skip_save_restore(mut self, enable: bool) -> Self {
        self.skip_save_restore = enable;
        self
    }

    pub fn rearm_low_priority(mut self, enable: bool) -> Self {
        self.rearm_low_priority = enable;
        self
    }

    pub fn diag_capacity(mut self, n: usize) -> Self {
        self.diag_capacity = n;
        self
    }

    pub fn iova_base(mut self, iova: u64) -> Self {
        self.iova_base = iova;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_dwords.is_power_of_two() {
            return Err(ConfigError::InvalidValue("ring_dwords must be a power of two"));
        }
        if self.ring_dwords < 256 {
            return Err(ConfigError::InvalidValue("ring_dwords must be >= 256"));
        }
        if self.ring_dwords > 1 << 20 {
            return Err(ConfigError::InvalidValue("ring_dwords must be <= 1M"));
        }
        if self.max_cmds_per_submit == 0 {
            return Err(ConfigError::InvalidValue("max_cmds_per_submit must be > 0"));
        }
        // the largest submission must fit in an empty ring
        if crate::submit::max_submission_dwords(self.max_cmds_per_submit) > self.ring_dwords as usize - 1 {
            return Err(ConfigError::InvalidValue("max_cmds_per_submit does not fit in ring_dwords"));
        }
        if self.idle_retries == 0 {
            return Err(ConfigError::InvalidValue("idle_retries must be > 0"));
        }
        if self.init_retries == 0 {
            return Err(ConfigError::InvalidValue("init_retries must be > 0"));
        }
        if self.preempt_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("preempt_timeout must be > 0"));
        }
        if self.wait_slice.is_zero() {
            return Err(ConfigError::InvalidValue("wait_slice must be > 0"));
        }
        if self.preempt_record_size < PREEMPT_RECORD_HEADER {
            return Err(ConfigError::InvalidValue("preempt_record_size below record header"));
        }
        if self.user_record_size == 0 {
            return Err(ConfigError::InvalidValue("user_record_size must be > 0"));
        }
        if self.diag_capacity == 0 {
            return Err(ConfigError::InvalidValue("diag_capacity must be > 0"));
        }
        if self.iova_base == 0 || self.iova_base % GPU_PAGE_SIZE as u64 != 0 {
            return Err(ConfigError::InvalidValue("iova_base must be non-zero and page aligned"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("gpuring configuration ({}):", self.name);
        eprintln!("  ring_dwords:          {}", self.ring_dwords);
        eprintln!("  max_cmds_per_submit:  {}", self.max_cmds_per_submit);
        eprintln!("  idle_retries:         {}", self.idle_retries);
        eprintln!("  idle_poll_interval:   {:?}", self.idle_poll_interval);
        eprintln!("  init_retries:         {}", self.init_retries);
        eprintln!("  recovery_backoff:     {:?}", self.recovery_backoff);
        eprintln!("  preempt_timeout:      {:?}", self.preempt_timeout);
        eprintln!("  wait_slice:           {:?}", self.wait_slice);
        eprintln!("  preempt_record_size:  {:#x}", self.preempt_record_size);
        eprintln!("  user_record_size:     {:#x}", self.user_record_size);
        eprintln!("  uses_gmem:            {}", self.uses_gmem);
        eprintln!("  skip_save_restore:    {}", self.skip_save_restore);
        eprintln!("  rearm_low_priority:   {}", self.rearm_low_priority);
        eprintln!("  diag_capacity:        {}", self.diag_capacity);
        eprintln!("  iova_base:            {:#x}", self.iova_base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DeviceConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.rearm_low_priority);
        assert_eq!(config.ring_dwords, defaults::RING_DWORDS);
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new()
            .ring_dwords(1024)
            .preempt_timeout(Duration::from_millis(50))
            .rearm_low_priority(false)
            .name("gpu7");

        assert_eq!(config.ring_dwords, 1024);
        assert_eq!(config.preempt_timeout, Duration::from_millis(50));
        assert!(!config.rearm_low_priority);
        assert_eq!(config.name, "gpu7");
    }

    #[test]
    fn test_validation() {
        assert!(DeviceConfig::new().ring_dwords(1000).validate().is_err());
        assert!(DeviceConfig::new().ring_dwords(64).validate().is_err());
        assert!(DeviceConfig::new().max_cmds_per_submit(0).validate().is_err());
        assert!(DeviceConfig::new().iova_base(0x1234).validate().is_err());
        assert_eq!(
            DeviceConfig::new().preempt_record_size(16).validate(),
            Err(ConfigError::InvalidValue("preempt_record_size below record header"))
        );
    }

    #[test]
    fn test_cmd_budget_must_fit_ring() {
        assert_eq!(
            DeviceConfig::new().ring_dwords(256).max_cmds_per_submit(64).validate(),
            Err(ConfigError::InvalidValue("max_cmds_per_submit does not fit in ring_dwords"))
        );
        assert!(DeviceConfig::new().ring_dwords(256).validate().is_ok());
        assert!(DeviceConfig::new().ring_dwords(256).max_cmds_per_submit(55).validate().is_ok());
        assert!(DeviceConfig::new().ring_dwords(256).max_cmds_per_submit(56).validate().is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("GPR_IOVA_BASE", "0x2_0000_0000");
        let config = DeviceConfig::from_env();
        std::env::remove_var("GPR_IOVA_BASE");
        assert_eq!(config.iova_base, 0x2_0000_0000);
    }
}
