use std::{
    process,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::errors::QueryParseError;

/// The (root_number, tick) pair that orders every observation on a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPosition {
    pub root_number: u32,
    pub ticks: u32,
}

/// Clock value recorded on file nodes: the tick plus a wall-clock timestamp
/// kept for timestamp-based since queries and age-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockStamp {
    pub ticks: u32,
    pub timestamp: SystemTime,
}

impl ClockStamp {
    pub const ZERO: ClockStamp = ClockStamp {
        ticks: 0,
        timestamp: UNIX_EPOCH,
    };
}

/// Identifies this service instance inside clock strings, so that a clock
/// minted by a previous incarnation is recognized as stale.
#[derive(Debug, Clone)]
pub struct ClockId {
    pub instance_start_secs: u64,
    pub unique: u32,
}

impl ClockId {
    pub fn new() -> Self {
        let instance_start_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            instance_start_secs,
            unique: process::id(),
        }
    }

    pub fn format(&self, position: ClockPosition) -> String {
        format!(
            "c:{}:{}:{}:{}",
            self.instance_start_secs, position.root_number, self.unique, position.ticks
        )
    }
}

impl Default for ClockId {
    fn default() -> Self {
        Self::new()
    }
}

/// A clock string parsed from a client, before evaluation against the
/// current clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedClock {
    /// Absent for the legacy `c:<tick>:<root_number>` form.
    pub instance_start_secs: Option<u64>,
    pub unique: Option<u32>,
    pub root_number: u32,
    pub ticks: u32,
}

/// The `since` parameter of a query. Evaluation is deferred to execution
/// time because named cursors and fresh-instance detection depend on the
/// state of the root at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinceSpec {
    Timestamp(SystemTime),
    Clock(ParsedClock),
    Cursor(String),
}

impl SinceSpec {
    /// Parses a since spec from a query value: an integer epoch timestamp, a
    /// `c:` clock string, or an `n:` named cursor.
    pub fn parse(value: &Value) -> Result<Self, QueryParseError> {
        match value {
            Value::Number(n) => {
                let secs = n
                    .as_u64()
                    .ok_or_else(|| QueryParseError::new("invalid value for 'since'"))?;
                Ok(Self::Timestamp(UNIX_EPOCH + Duration::from_secs(secs)))
            }
            Value::String(s) => Self::parse_str(s),
            _ => Err(QueryParseError::new("invalid value for 'since'")),
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, QueryParseError> {
        if let Some(name) = s.strip_prefix("n:") {
            if name.is_empty() {
                return Err(QueryParseError::new("cursor name must not be empty"));
            }
            return Ok(Self::Cursor(name.to_owned()));
        }
        if let Some(rest) = s.strip_prefix("c:") {
            let fields: Vec<&str> = rest.split(':').collect();
            let parse_u32 = |field: &str| {
                field
                    .parse::<u32>()
                    .map_err(|_| QueryParseError::new(format!("invalid clock string '{s}'")))
            };
            return match fields.as_slice() {
                [start, root_number, unique, ticks] => Ok(Self::Clock(ParsedClock {
                    instance_start_secs: Some(start.parse::<u64>().map_err(|_| {
                        QueryParseError::new(format!("invalid clock string '{s}'"))
                    })?),
                    unique: Some(parse_u32(unique)?),
                    root_number: parse_u32(root_number)?,
                    ticks: parse_u32(ticks)?,
                })),
                // Legacy form: c:<tick>:<root_number>
                [ticks, root_number] => Ok(Self::Clock(ParsedClock {
                    instance_start_secs: None,
                    unique: None,
                    root_number: parse_u32(root_number)?,
                    ticks: parse_u32(ticks)?,
                })),
                _ => Err(QueryParseError::new(format!("invalid clock string '{s}'"))),
            };
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self::Timestamp(UNIX_EPOCH + Duration::from_secs(secs)));
        }
        Err(QueryParseError::new(format!(
            "invalid since spec '{s}': expected a timestamp, clock string or named cursor"
        )))
    }

    /// Evaluates the spec against the current clock, producing the concrete
    /// boundary a query runs with.
    ///
    /// A clock from a different root incarnation, or one at or below the
    /// last age-out tick, degrades to a fresh instance because deletions
    /// before that point can no longer be reported.
    pub fn evaluate(
        &self,
        clock_id: &ClockId,
        current: ClockPosition,
        last_age_out_tick: u32,
        cursors: &mut FxHashMap<String, u32>,
    ) -> QuerySince {
        match self {
            Self::Timestamp(ts) => QuerySince::Timestamp(*ts),
            Self::Clock(parsed) => {
                let stale_instance = parsed.root_number != current.root_number
                    || parsed
                        .instance_start_secs
                        .is_some_and(|start| start != clock_id.instance_start_secs)
                    || parsed.unique.is_some_and(|unique| unique != clock_id.unique);
                QuerySince::Clock {
                    ticks: parsed.ticks,
                    fresh_instance: stale_instance || parsed.ticks < last_age_out_tick,
                }
            }
            Self::Cursor(name) => {
                let prior = cursors.insert(name.clone(), current.ticks);
                QuerySince::Clock {
                    ticks: prior.unwrap_or(0),
                    fresh_instance: match prior {
                        None => true,
                        Some(ticks) => ticks < last_age_out_tick,
                    },
                }
            }
        }
    }
}

/// The evaluated since boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySince {
    Timestamp(SystemTime),
    Clock { ticks: u32, fresh_instance: bool },
}

impl QuerySince {
    /// The since value used when a query carries no since spec at all.
    pub fn fresh() -> Self {
        Self::Clock {
            ticks: 0,
            fresh_instance: true,
        }
    }

    pub fn is_fresh_instance(&self) -> bool {
        matches!(
            self,
            Self::Clock {
                fresh_instance: true,
                ..
            }
        )
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self, Self::Timestamp(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_id() -> ClockId {
        ClockId {
            instance_start_secs: 1000,
            unique: 42,
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let id = clock_id();
        let formatted = id.format(ClockPosition {
            root_number: 7,
            ticks: 99,
        });
        assert_eq!(formatted, "c:1000:7:42:99");

        match SinceSpec::parse_str(&formatted).unwrap() {
            SinceSpec::Clock(parsed) => {
                assert_eq!(parsed.instance_start_secs, Some(1000));
                assert_eq!(parsed.root_number, 7);
                assert_eq!(parsed.unique, Some(42));
                assert_eq!(parsed.ticks, 99);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn legacy_clock_form() {
        match SinceSpec::parse_str("c:123:4").unwrap() {
            SinceSpec::Clock(parsed) => {
                assert_eq!(parsed.instance_start_secs, None);
                assert_eq!(parsed.ticks, 123);
                assert_eq!(parsed.root_number, 4);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn mismatched_root_number_is_fresh() {
        let id = clock_id();
        let spec = SinceSpec::parse_str("c:1000:3:42:50").unwrap();
        let since = spec.evaluate(
            &id,
            ClockPosition {
                root_number: 7,
                ticks: 60,
            },
            0,
            &mut FxHashMap::default(),
        );
        assert!(since.is_fresh_instance());
    }

    #[test]
    fn age_out_forces_fresh_instance() {
        let id = clock_id();
        let spec = SinceSpec::parse_str("c:1000:7:42:50").unwrap();
        let current = ClockPosition {
            root_number: 7,
            ticks: 60,
        };
        let since = spec.evaluate(&id, current, 55, &mut FxHashMap::default());
        assert!(since.is_fresh_instance());

        let since = spec.evaluate(&id, current, 40, &mut FxHashMap::default());
        assert!(!since.is_fresh_instance());
        assert_eq!(
            since,
            QuerySince::Clock {
                ticks: 50,
                fresh_instance: false
            }
        );
    }

    #[test]
    fn named_cursor_advances() {
        let id = clock_id();
        let mut cursors = FxHashMap::default();
        let current = ClockPosition {
            root_number: 1,
            ticks: 10,
        };
        let spec = SinceSpec::parse_str("n:build").unwrap();

        let first = spec.evaluate(&id, current, 0, &mut cursors);
        assert!(first.is_fresh_instance());

        let later = ClockPosition {
            root_number: 1,
            ticks: 20,
        };
        let second = spec.evaluate(&id, later, 0, &mut cursors);
        assert_eq!(
            second,
            QuerySince::Clock {
                ticks: 10,
                fresh_instance: false
            }
        );
        assert_eq!(cursors.get("build"), Some(&20));
    }

    #[test]
    fn integer_since_is_timestamp() {
        let spec = SinceSpec::parse(&serde_json::json!(1700000000u64)).unwrap();
        assert!(matches!(spec, SinceSpec::Timestamp(_)));
    }
}
