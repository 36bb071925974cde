use std::str::FromStr;
use tokio::time::Duration;

/// Parses a duration string in the format "250ms", "30s", "10m", "5h", "3d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Unknown duration unit in '{}'. Use 'ms', 's', 'm', 'h', or 'd'.", s))?;
    let (value_str, unit) = s.split_at(split_at);

    let value = match u64::from_str(value_str) {
        Ok(v) => v,
        Err(_) => {
            return Err(format!(
                "Invalid numeric value in duration: '{}'",
                value_str
            ))
        }
    };

    let secs_per_unit: u64 = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => {
            return Err(format!(
                "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                unit
            ))
        }
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration '{}' is too large", s))
}

/// Renders a duration back into the shortest string `parse_duration_string`
/// accepts.
pub fn format_duration_string(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 || ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Masks a secret for display, keeping only a short prefix.
///
/// Bot tokens look like `123456:ABC-DEF...`; the numeric bot id before the
/// colon is kept since it is not secret and helps tell bots apart.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    match secret.split_once(':') {
        Some((id, _)) => format!("{}:***", id),
        None if secret.chars().count() > 4 => {
            format!("{}***", secret.chars().take(4).collect::<String>())
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod duration {
        use super::*;

        #[test]
        fn parse_milliseconds() {
            assert_eq!(
                parse_duration_string("250ms").unwrap(),
                Duration::from_millis(250)
            );
        }

        #[test]
        fn parse_seconds() {
            assert_eq!(
                parse_duration_string("30s").unwrap(),
                Duration::from_secs(30)
            );
        }

        #[test]
        fn overflowing_value_is_rejected() {
            let err = parse_duration_string("999999999999999999d").unwrap_err();
            assert!(err.contains("too large"), "{}", err);
            assert!(parse_duration_string("18446744073709551615m").is_err());
            assert_eq!(
                parse_duration_string("18446744073709551615s").unwrap(),
                Duration::from_secs(u64::MAX)
            );
        }

        #[test]
        fn parse_minutes() {
            assert_eq!(
                parse_duration_string("10m").unwrap(),
                Duration::from_secs(600)
            );
        }

        #[test]
        fn parse_hours() {
            assert_eq!(
                parse_duration_string("5h").unwrap(),
                Duration::from_secs(18000)
            );
        }

        #[test]
        fn parse_days() {
            assert_eq!(
                parse_duration_string("3d").unwrap(),
                Duration::from_secs(259200)
            );
        }

        #[test]
        fn trims_whitespace() {
            assert_eq!(
                parse_duration_string("  3s  ").unwrap(),
                Duration::from_secs(3)
            );
        }

        #[test]
        fn empty_string_errors() {
            let err = parse_duration_string("   ").unwrap_err();
            assert!(err.contains("empty"), "error was: {}", err);
        }

        #[test]
        fn no_suffix_errors() {
            let err = parse_duration_string("10").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn unknown_suffix_errors() {
            let err = parse_duration_string("10x").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn no_number_errors() {
            let err = parse_duration_string("ms").unwrap_err();
            assert!(err.contains("Invalid numeric"), "error was: {}", err);
        }

        #[test]
        fn fractional_number_errors() {
            let err = parse_duration_string("1.5s").unwrap_err();
            assert!(err.contains("Unknown duration unit"), "error was: {}", err);
        }

        #[test]
        fn formats_back() {
            assert_eq!(format_duration_string(Duration::from_millis(1500)), "1500ms");
            assert_eq!(format_duration_string(Duration::from_secs(3)), "3s");
            assert_eq!(format_duration_string(Duration::from_secs(120)), "2m");
            assert_eq!(format_duration_string(Duration::from_secs(7200)), "2h");
            assert_eq!(format_duration_string(Duration::ZERO), "0ms");
        }
    }

    #[test]
    fn masks_bot_token_secret_part() {
        assert_eq!(mask_secret("123456:AAH-secret-part"), "123456:***");
    }

    #[test]
    fn masks_plain_secret() {
        assert_eq!(mask_secret("hunter22"), "hunt***");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }
}
