//! Environment overrides for pool configuration
//!
//! `ServiceConfig::from_env()` reads its `CPORT_*` variables through these
//! helpers. A variable that is unset or fails to parse leaves the
//! default in place; configuration never fails because of the
//! environment.

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and valid
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true,
/// any other value is false, unset gives `default`
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Millisecond count as a `Duration`
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_unset_uses_default() {
        let val: usize = env_get("__CPORT_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__CPORT_TEST_UNSET__").is_none());
        assert!(env_get_bool("__CPORT_TEST_UNSET__", true));
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__CPORT_TEST_NUM__", " 17 ");
        assert_eq!(env_get("__CPORT_TEST_NUM__", 0usize), 17);
        std::env::set_var("__CPORT_TEST_NUM__", "seventeen");
        assert_eq!(env_get("__CPORT_TEST_NUM__", 3usize), 3);
        std::env::remove_var("__CPORT_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for yes in ["1", "true", "YES", "On"] {
            std::env::set_var("__CPORT_TEST_BOOL__", yes);
            assert!(env_get_bool("__CPORT_TEST_BOOL__", false), "{yes}");
        }
        for no in ["0", "off", "maybe"] {
            std::env::set_var("__CPORT_TEST_BOOL__", no);
            assert!(!env_get_bool("__CPORT_TEST_BOOL__", true), "{no}");
        }
        std::env::remove_var("__CPORT_TEST_BOOL__");
    }

    #[test]
    fn test_millis() {
        std::env::set_var("__CPORT_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__CPORT_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__CPORT_TEST_MS__");
        assert_eq!(
            env_get_millis("__CPORT_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
