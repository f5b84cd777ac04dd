use std::fmt::Display;
use std::str::FromStr;

use crate::error::{DuesError, Result};

/// Get environment variable with DUESLEDGER_ prefix, falling back to unprefixed version
///
/// Checks `DUESLEDGER_{key}` first, then `{key}`, so deployments can use
/// either naming scheme.
///
/// # Examples
///
/// ```rust
/// use duesledger::utils::get_env_with_prefix;
///
/// // Checks DUESLEDGER_ELIGIBILITY_MONTHS first, then ELIGIBILITY_MONTHS
/// let months = get_env_with_prefix("ELIGIBILITY_MONTHS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("DUESLEDGER_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read and parse an environment variable via [`get_env_with_prefix`].
///
/// Returns `Ok(None)` when the variable is unset. A value that is set but
/// does not parse is a configuration error naming the key; it is never
/// replaced by a default.
///
/// # Errors
///
/// `DuesError::Configuration` if the value does not parse as `T`.
pub fn parse_env_with_prefix<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    get_env_with_prefix(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                DuesError::configuration(format!("Invalid value {:?} for {}: {}", raw, key, e))
            })
        })
        .transpose()
}

/// Read a comma separated day list such as `REMINDER_SCHEDULE`.
///
/// # Errors
///
/// `DuesError::Configuration` naming the key if any entry is not a number.
pub fn parse_env_day_list(key: &str) -> Result<Option<Vec<u32>>> {
    get_env_with_prefix(key)
        .map(|raw| {
            parse_day_list(&raw).ok_or_else(|| {
                DuesError::configuration(format!(
                    "Invalid value {:?} for {}: expected comma separated day offsets",
                    raw, key
                ))
            })
        })
        .transpose()
}

/// Parse a comma separated list of day offsets, e.g. `"3, 7, 14"`.
///
/// Returns `None` if any entry fails to parse.
pub fn parse_day_list(raw: &str) -> Option<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("DUESLEDGER_TEST_VAR", "prefixed_value");
        }
        assert_eq!(get_env_with_prefix("TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("DUESLEDGER_TEST_VAR");
        }

        unsafe {
            std::env::set_var("DUES_FALLBACK_VAR", "unprefixed_value");
        }
        assert_eq!(get_env_with_prefix("DUES_FALLBACK_VAR"), Some("unprefixed_value".to_string()));
        unsafe {
            std::env::remove_var("DUES_FALLBACK_VAR");
        }

        assert_eq!(get_env_with_prefix("DUES_NON_EXISTENT_VAR"), None);
    }

    #[test]
    fn test_parse_day_list() {
        assert_eq!(parse_day_list("3,7,14"), Some(vec![3, 7, 14]));
        assert_eq!(parse_day_list(" 5 , 10 "), Some(vec![5, 10]));
        assert_eq!(parse_day_list("3,x"), None);
    }

    #[test]
    fn test_parse_env_names_bad_key() {
        unsafe {
            std::env::set_var("DUESLEDGER_DUES_PARSE_TEST", "twelve");
        }
        let err = parse_env_with_prefix::<u32>("DUES_PARSE_TEST").unwrap_err();
        assert!(matches!(err, DuesError::Configuration(_)));
        assert!(err.to_string().contains("DUES_PARSE_TEST"));

        unsafe {
            std::env::set_var("DUESLEDGER_DUES_PARSE_TEST", " 12 ");
        }
        assert_eq!(parse_env_with_prefix::<u32>("DUES_PARSE_TEST").unwrap(), Some(12));
        unsafe {
            std::env::remove_var("DUESLEDGER_DUES_PARSE_TEST");
        }
        assert_eq!(parse_env_with_prefix::<u32>("DUES_PARSE_TEST").unwrap(), None);

        unsafe {
            std::env::set_var("DUESLEDGER_DUES_DAYS_TEST", "5,ten,20");
        }
        assert!(parse_env_day_list("DUES_DAYS_TEST").is_err());
        unsafe {
            std::env::remove_var("DUESLEDGER_DUES_DAYS_TEST");
        }
    }
}
