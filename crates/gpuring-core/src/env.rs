//! Environment variable helpers for `GPR_*` overrides
//!
//! ```ignore
//! use gpuring_core::env::{env_get, env_get_bool, env_get_u64};
//!
//! let dwords: u32 = env_get("GPR_RING_DWORDS", 8192);
//! let iova = env_get_u64("GPR_IOVA_BASE", 0x1_0000_0000); // accepts 0x...
//! let gmem = env_get_bool("GPR_USES_GMEM", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` if unset or malformed
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean variable; "1", "true", "yes", "on" are true
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse a decimal or `0x`-prefixed hex integer
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim().replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Like `env_get` for `u64`, but also accepts hex (device addresses)
#[inline]
pub fn env_get_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_u64(&v))
        .unwrap_or(default)
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__GPR_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__GPR_TEST_UNSET_VAR__", true));
        assert_eq!(env_get_u64("__GPR_TEST_UNSET_VAR__", 7), 7);
        assert_eq!(env_get_str("__GPR_TEST_UNSET_VAR__", "gpu0"), "gpu0");
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("4096"), Some(4096));
        assert_eq!(parse_u64("0x1_0000_0000"), Some(0x1_0000_0000));
        assert_eq!(parse_u64(" 0XfF "), Some(255));
        assert_eq!(parse_u64("0xzz"), None);
        assert_eq!(parse_u64(""), None);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("__GPR_TEST_HEX_VAR__", "0x2000");
        assert_eq!(env_get_u64("__GPR_TEST_HEX_VAR__", 0), 0x2000);
        let as_dec: u64 = env_get("__GPR_TEST_HEX_VAR__", 5);
        assert_eq!(as_dec, 5);
        std::env::remove_var("__GPR_TEST_HEX_VAR__");
    }
}
