//! Runtime ceilings for the staged mutation engine. Every knob is
//! env-tunable within hard bounds; out-of-range values are clamped with a
//! warning rather than rejected.

const SESSION_TTL_SECS: u64 = 300;
const SESSION_TTL_SECS_MIN: u64 = 60;
const SESSION_TTL_SECS_MAX: u64 = 3600;
const MAX_CHAIN_DEPTH: u32 = 5;
const MAX_CHAIN_DEPTH_MIN: u32 = 1;
const MAX_CHAIN_DEPTH_MAX: u32 = 10;
const BULK_CEILING: usize = 50;
const BULK_CEILING_MIN: usize = 1;
const BULK_CEILING_MAX: usize = 500;
const BATCH_DELAY_MS: u64 = 0;
const BATCH_DELAY_MS_MIN: u64 = 0;
const BATCH_DELAY_MS_MAX: u64 = 5000;

const SESSION_TTL_SECS_ENV: &str = "FOLIO_SESSION_TTL_SECS";
const MAX_CHAIN_DEPTH_ENV: &str = "FOLIO_MAX_CHAIN_DEPTH";
const BULK_CEILING_ENV: &str = "FOLIO_BULK_CEILING";
const BATCH_DELAY_MS_ENV: &str = "FOLIO_BATCH_DELAY_MS";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// How long a prepared session stays committable, in seconds.
    pub session_ttl_secs: u64,
    /// Hard ceiling on chain traversal depth; caller requests above it are
    /// clamped, requests below it are honored.
    pub max_chain_depth: u32,
    /// Maximum number of targets a single bulk plan may carry.
    pub bulk_ceiling: usize,
    /// Pause between batch items, in milliseconds.
    pub batch_delay_ms: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            session_ttl_secs: SESSION_TTL_SECS,
            max_chain_depth: MAX_CHAIN_DEPTH,
            bulk_ceiling: BULK_CEILING,
            batch_delay_ms: BATCH_DELAY_MS,
        }
    }
}

impl RuntimeLimits {
    pub fn from_env() -> Self {
        let (session_ttl_secs, ttl_clamped) = parse_u64_with_bounds(
            std::env::var(SESSION_TTL_SECS_ENV).ok(),
            SESSION_TTL_SECS_MIN,
            SESSION_TTL_SECS_MAX,
            SESSION_TTL_SECS,
        );
        let (max_chain_depth, depth_clamped) = parse_u32_with_bounds(
            std::env::var(MAX_CHAIN_DEPTH_ENV).ok(),
            MAX_CHAIN_DEPTH_MIN,
            MAX_CHAIN_DEPTH_MAX,
            MAX_CHAIN_DEPTH,
        );
        let (bulk_ceiling_raw, bulk_clamped) = parse_u64_with_bounds(
            std::env::var(BULK_CEILING_ENV).ok(),
            BULK_CEILING_MIN as u64,
            BULK_CEILING_MAX as u64,
            BULK_CEILING as u64,
        );
        let (batch_delay_ms, delay_clamped) = parse_u64_with_bounds(
            std::env::var(BATCH_DELAY_MS_ENV).ok(),
            BATCH_DELAY_MS_MIN,
            BATCH_DELAY_MS_MAX,
            BATCH_DELAY_MS,
        );

        for (clamped, name) in [
            (ttl_clamped, SESSION_TTL_SECS_ENV),
            (depth_clamped, MAX_CHAIN_DEPTH_ENV),
            (bulk_clamped, BULK_CEILING_ENV),
            (delay_clamped, BATCH_DELAY_MS_ENV),
        ] {
            if clamped {
                tracing::warn!("{name} out of bounds or unparsable, using clamped default");
            }
        }

        Self {
            session_ttl_secs,
            max_chain_depth,
            bulk_ceiling: bulk_ceiling_raw as usize,
            batch_delay_ms,
        }
    }
}

/// Parse an env value into `[min, max]`, falling back to `default`.
/// Returns `(value, was_clamped_or_invalid)`.
fn parse_u64_with_bounds(raw: Option<String>, min: u64, max: u64, default: u64) -> (u64, bool) {
    match raw.as_deref().map(str::trim) {
        None | Some("") => (default, false),
        Some(text) => match text.parse::<u64>() {
            Ok(value) if value < min => (min, true),
            Ok(value) if value > max => (max, true),
            Ok(value) => (value, false),
            Err(_) => (default, true),
        },
    }
}

fn parse_u32_with_bounds(raw: Option<String>, min: u32, max: u32, default: u32) -> (u32, bool) {
    let (value, clamped) =
        parse_u64_with_bounds(raw, u64::from(min), u64::from(max), u64::from(default));
    (value as u32, clamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_bounds() {
        let limits = RuntimeLimits::default();
        assert_eq!(limits.session_ttl_secs, 300);
        assert_eq!(limits.max_chain_depth, 5);
        assert_eq!(limits.bulk_ceiling, 50);
        assert_eq!(limits.batch_delay_ms, 0);
    }

    #[test]
    fn parse_clamps_and_falls_back() {
        assert_eq!(parse_u64_with_bounds(None, 60, 3600, 300), (300, false));
        assert_eq!(
            parse_u64_with_bounds(Some("120".into()), 60, 3600, 300),
            (120, false)
        );
        assert_eq!(
            parse_u64_with_bounds(Some("5".into()), 60, 3600, 300),
            (60, true)
        );
        assert_eq!(
            parse_u64_with_bounds(Some("999999".into()), 60, 3600, 300),
            (3600, true)
        );
        assert_eq!(
            parse_u64_with_bounds(Some("abc".into()), 60, 3600, 300),
            (300, true)
        );
        assert_eq!(
            parse_u64_with_bounds(Some("  ".into()), 60, 3600, 300),
            (300, false)
        );
    }
}
