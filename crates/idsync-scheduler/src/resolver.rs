//! Schedule resolution.
//!
//! Expands recurrence definitions into `(timestamp, definition)` occurrences
//! over a window. Definitions are grouped by job definition; within a group a
//! timestamp keeps the highest-priority definition (lowest id on ties), then
//! CANCEL windows remove occurrences at or below their own priority.
//!
//! Resolution is pure: the same definitions and window always give the same
//! occurrences.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tracing::debug;

use idsync_types::{RecurrenceDefinition, RecurrenceRule};

use crate::calendar::{
    days_between, is_last_day_of_month, is_last_weekday_of_month, iso_weekday, week_of_month,
    weeks_between,
};
use crate::error::ScheduleError;

/// One resolved execution of a job definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub timestamp: DateTime<Utc>,
    pub definition: RecurrenceDefinition,
}

/// Parse a tagged recurrence payload, rejecting unknown kinds and
/// structurally invalid sets.
pub fn parse_definition(value: &Value) -> Result<RecurrenceDefinition, ScheduleError> {
    let id = value.get("id").and_then(Value::as_u64).unwrap_or_default();
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ScheduleError::InvalidPayload {
            id,
            reason: "missing kind".to_string(),
        })?;
    if !RecurrenceRule::KINDS.contains(&kind) {
        return Err(ScheduleError::UnknownKind(kind.to_string()));
    }

    let definition: RecurrenceDefinition =
        serde_json::from_value(value.clone()).map_err(|e| ScheduleError::InvalidPayload {
            id,
            reason: e.to_string(),
        })?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Check a definition's sets, interval and window.
pub fn validate_definition(definition: &RecurrenceDefinition) -> Result<(), ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidPayload {
        id: definition.id,
        reason,
    };

    match &definition.rule {
        RecurrenceRule::Daily { interval, .. } => check_interval(*interval).map_err(invalid),
        RecurrenceRule::Weekly {
            interval, weekdays, ..
        } => {
            check_interval(*interval).map_err(invalid)?;
            check_set("weekdays", weekdays, 1, 7).map_err(invalid)
        }
        RecurrenceRule::MonthlyDays { months, days, .. } => {
            check_set("months", months, 1, 12).map_err(invalid)?;
            check_set("days", days, 1, 31).map_err(invalid)
        }
        RecurrenceRule::MonthlyWeekdays {
            months,
            weekdays,
            weeks,
            ..
        } => {
            check_set("months", months, 1, 12).map_err(invalid)?;
            check_set("weekdays", weekdays, 1, 7).map_err(invalid)?;
            check_set("weeks", weeks, 1, 5).map_err(invalid)
        }
        RecurrenceRule::Once { .. } => Ok(()),
        RecurrenceRule::Cancel { from, to } => {
            if from > to {
                Err(invalid(format!("cancel window ends before it starts: {from} > {to}")))
            } else {
                Ok(())
            }
        }
    }
}

fn check_interval(interval: u32) -> Result<(), String> {
    if interval == 0 {
        return Err("interval must be at least 1".to_string());
    }
    Ok(())
}

fn check_set(name: &str, values: &[u32], min: u32, max: u32) -> Result<(), String> {
    if values.is_empty() {
        return Err(format!("{name} must not be empty"));
    }
    if let Some(bad) = values.iter().find(|v| **v < min || **v > max) {
        return Err(format!("{name} value {bad} outside {min}..={max}"));
    }
    Ok(())
}

/// Resolves recurrence definitions in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleResolver {
    tz: Tz,
}

impl Default for ScheduleResolver {
    fn default() -> Self {
        Self::utc()
    }
}

impl ScheduleResolver {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(Tz::UTC)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Resolve `definitions` over `[begin, end]`.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleError::InvalidWindow` if `begin > end` and
    /// `ScheduleError::InvalidPayload` for the first invalid definition.
    pub fn resolve(
        &self,
        definitions: &[RecurrenceDefinition],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, ScheduleError> {
        if begin > end {
            return Err(ScheduleError::InvalidWindow { begin, end });
        }
        for definition in definitions {
            validate_definition(definition)?;
        }

        let mut groups: BTreeMap<&str, Vec<&RecurrenceDefinition>> = BTreeMap::new();
        for definition in definitions {
            groups
                .entry(definition.jobdef_id.as_str())
                .or_default()
                .push(definition);
        }

        let mut occurrences = Vec::new();
        for (jobdef_id, group) in groups {
            let resolved = self.resolve_group(&group, begin, end);
            debug!(jobdef_id, count = resolved.len(), "Resolved recurrence group");
            occurrences.extend(resolved);
        }

        occurrences.sort_by(|a, b| {
            (a.timestamp, &a.definition.jobdef_id).cmp(&(b.timestamp, &b.definition.jobdef_id))
        });
        Ok(occurrences)
    }

    /// Resolve only the definitions belonging to `jobdef_id`.
    pub fn preview(
        &self,
        jobdef_id: &str,
        definitions: &[RecurrenceDefinition],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, ScheduleError> {
        let own: Vec<RecurrenceDefinition> = definitions
            .iter()
            .filter(|d| d.jobdef_id == jobdef_id)
            .cloned()
            .collect();
        self.resolve(&own, begin, end)
    }

    fn resolve_group(
        &self,
        group: &[&RecurrenceDefinition],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Occurrence> {
        let mut slots: BTreeMap<DateTime<Utc>, &RecurrenceDefinition> = BTreeMap::new();

        for &definition in group.iter().filter(|d| !d.rule.is_cancel()) {
            for timestamp in self.timestamps(&definition.rule, begin, end) {
                slots
                    .entry(timestamp)
                    .and_modify(|current| {
                        if outranks(definition, current) {
                            *current = definition;
                        }
                    })
                    .or_insert(definition);
            }
        }

        for cancel in group.iter().filter(|d| d.rule.is_cancel()) {
            if let RecurrenceRule::Cancel { from, to } = &cancel.rule {
                let (Some(from), Some(to)) = (self.to_utc(*from), self.to_utc(*to)) else {
                    continue;
                };
                slots.retain(|timestamp, definition| {
                    !(from <= *timestamp && *timestamp <= to
                        && definition.priority <= cancel.priority)
                });
            }
        }

        slots
            .into_iter()
            .map(|(timestamp, definition)| Occurrence {
                timestamp,
                definition: definition.clone(),
            })
            .collect()
    }

    /// Every timestamp a non-cancel rule produces within `[begin, end]`.
    fn timestamps(
        &self,
        rule: &RecurrenceRule,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let in_window = |t: &DateTime<Utc>| begin <= *t && *t <= end;

        let anchor = match rule {
            RecurrenceRule::Once { at } => {
                return self.to_utc(*at).filter(in_window).into_iter().collect();
            }
            RecurrenceRule::Cancel { .. } => return Vec::new(),
            RecurrenceRule::Daily { anchor, .. }
            | RecurrenceRule::Weekly { anchor, .. }
            | RecurrenceRule::MonthlyDays { anchor, .. }
            | RecurrenceRule::MonthlyWeekdays { anchor, .. } => *anchor,
        };

        // Local dates can straddle the UTC window by a day either way.
        let first = anchor
            .date()
            .max(begin.with_timezone(&self.tz).date_naive() - Duration::days(1));
        let last = end.with_timezone(&self.tz).date_naive() + Duration::days(1);

        first
            .iter_days()
            .take_while(|day| *day <= last)
            .filter(|day| matches_day(rule, anchor.date(), *day))
            .filter_map(|day| self.to_utc(day.and_time(anchor.time())))
            .filter(in_window)
            .collect()
    }

    /// Local wall-clock time to UTC. Ambiguous times take the earlier
    /// instant; times inside a DST gap move forward by an hour.
    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(local + Duration::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
    }
}

fn outranks(candidate: &RecurrenceDefinition, current: &RecurrenceDefinition) -> bool {
    candidate.priority > current.priority
        || (candidate.priority == current.priority && candidate.id < current.id)
}

fn matches_day(rule: &RecurrenceRule, anchor: NaiveDate, day: NaiveDate) -> bool {
    match rule {
        RecurrenceRule::Daily { interval, .. } => {
            days_between(anchor, day) % i64::from(*interval) == 0
        }
        RecurrenceRule::Weekly {
            interval, weekdays, ..
        } => {
            weekdays.contains(&iso_weekday(day))
                && weeks_between(anchor, day) % i64::from(*interval) == 0
        }
        RecurrenceRule::MonthlyDays { months, days, .. } => {
            let dom = day.day();
            months.contains(&day.month())
                && (days.contains(&dom)
                    || (is_last_day_of_month(day) && days.iter().max().is_some_and(|m| *m >= dom)))
        }
        RecurrenceRule::MonthlyWeekdays {
            months,
            weekdays,
            weeks,
            ..
        } => {
            let week = week_of_month(day);
            months.contains(&day.month())
                && weekdays.contains(&iso_weekday(day))
                && (weeks.contains(&week)
                    || (is_last_weekday_of_month(day)
                        && weeks.iter().max().is_some_and(|m| *m >= week)))
        }
        RecurrenceRule::Once { .. } | RecurrenceRule::Cancel { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn local(s: &str) -> NaiveDateTime {
        s.parse().unwrap()
    }

    fn def(id: u64, priority: i32, rule: RecurrenceRule) -> RecurrenceDefinition {
        RecurrenceDefinition {
            id,
            jobdef_id: "import-users".to_string(),
            priority,
            rule,
        }
    }

    fn days(occurrences: &[Occurrence]) -> Vec<(u32, u32)> {
        occurrences
            .iter()
            .map(|o| (o.timestamp.month(), o.timestamp.day()))
            .collect()
    }

    #[test]
    fn test_daily_every_other_day() {
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::Daily {
                anchor: local("2024-01-01T00:00:00"),
                interval: 2,
            },
        )];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 1, 6, 0, 0))
            .unwrap();
        assert_eq!(days(&result), vec![(1, 1), (1, 3), (1, 5)]);
        assert!(result.iter().all(|o| o.timestamp.hour() == 0));
    }

    #[test]
    fn test_monthly_days_last_day_fallback() {
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::MonthlyDays {
                anchor: local("2023-01-01T06:00:00"),
                months: vec![2],
                days: vec![31],
            },
        )];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2023, 1, 1, 0, 0), utc(2023, 3, 31, 23, 59))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].timestamp, utc(2023, 2, 28, 6, 0));
    }

    #[test]
    fn test_higher_priority_wins_collision() {
        let at = local("2024-03-01T00:00:00");
        let defs = vec![
            def(1, 1, RecurrenceRule::Once { at }),
            def(2, 5, RecurrenceRule::Once { at }),
        ];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].timestamp, utc(2024, 3, 1, 0, 0));
        assert_eq!(result[0].definition.id, 2);
    }

    #[test]
    fn test_equal_priority_prefers_lower_id() {
        let at = local("2024-03-01T00:00:00");
        let defs = vec![
            def(9, 3, RecurrenceRule::Once { at }),
            def(4, 3, RecurrenceRule::Once { at }),
        ];
        let resolver = ScheduleResolver::utc();
        let result = resolver
            .resolve(&defs, utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0))
            .unwrap();
        assert_eq!(result[0].definition.id, 4);

        let reversed: Vec<_> = defs.into_iter().rev().collect();
        let again = resolver
            .resolve(&reversed, utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0))
            .unwrap();
        assert_eq!(again, result);
    }

    #[test]
    fn test_cancel_respects_priority() {
        let at = local("2024-03-01T00:00:00");
        let base = vec![
            def(1, 1, RecurrenceRule::Once { at }),
            def(2, 5, RecurrenceRule::Once { at }),
        ];
        let cancel = |id, priority| {
            def(
                id,
                priority,
                RecurrenceRule::Cancel {
                    from: local("2024-03-01T00:00:00"),
                    to: local("2024-03-02T00:00:00"),
                },
            )
        };
        let resolver = ScheduleResolver::utc();
        let window = (utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0));

        let mut strong = base.clone();
        strong.push(cancel(10, 5));
        assert!(resolver.resolve(&strong, window.0, window.1).unwrap().is_empty());

        let mut weak = base;
        weak.push(cancel(11, 1));
        let result = resolver.resolve(&weak, window.0, window.1).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].definition.id, 2);
    }

    #[test]
    fn test_cancel_window_includes_both_bounds() {
        let once = |id, at: &str| def(id, 0, RecurrenceRule::Once { at: local(at) });
        let defs = vec![
            once(1, "2024-03-01T09:59:59"),
            once(2, "2024-03-01T10:00:00"),
            once(3, "2024-03-01T12:00:00"),
            once(4, "2024-03-01T12:00:01"),
            def(
                5,
                0,
                RecurrenceRule::Cancel {
                    from: local("2024-03-01T10:00:00"),
                    to: local("2024-03-01T12:00:00"),
                },
            ),
        ];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 3, 1, 0, 0), utc(2024, 3, 2, 0, 0))
            .unwrap();
        let kept: Vec<u64> = result.iter().map(|o| o.definition.id).collect();
        assert_eq!(kept, vec![1, 4]);
        assert_eq!(result[0].timestamp, utc(2024, 3, 1, 9, 59) + Duration::seconds(59));
        assert_eq!(result[1].timestamp, utc(2024, 3, 1, 12, 0) + Duration::seconds(1));
    }

    #[test]
    fn test_cancel_only_affects_its_group() {
        let at = local("2024-03-01T00:00:00");
        let mut other = def(2, 0, RecurrenceRule::Once { at });
        other.jobdef_id = "export-users".to_string();
        let defs = vec![
            def(1, 0, RecurrenceRule::Once { at }),
            other,
            def(
                3,
                9,
                RecurrenceRule::Cancel {
                    from: local("2024-02-01T00:00:00"),
                    to: local("2024-04-01T00:00:00"),
                },
            ),
        ];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].definition.jobdef_id, "export-users");
    }

    #[test]
    fn test_weekly_interval() {
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::Weekly {
                anchor: local("2024-01-01T12:00:00"),
                interval: 2,
                weekdays: vec![1, 3],
            },
        )];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 1, 31, 23, 0))
            .unwrap();
        assert_eq!(
            days(&result),
            vec![(1, 1), (1, 3), (1, 15), (1, 17), (1, 29), (1, 31)]
        );
    }

    #[test]
    fn test_monthly_weekdays_last_week_fallback() {
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::MonthlyWeekdays {
                anchor: local("2024-01-01T08:00:00"),
                months: vec![1, 2, 3],
                weekdays: vec![1],
                weeks: vec![5],
            },
        )];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 3, 31, 23, 0))
            .unwrap();
        assert_eq!(days(&result), vec![(1, 29), (2, 26), (3, 25)]);
    }

    #[test]
    fn test_nothing_before_anchor() {
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::Daily {
                anchor: local("2024-01-10T00:00:00"),
                interval: 1,
            },
        )];
        let result = ScheduleResolver::utc()
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 1, 11, 0, 0))
            .unwrap();
        assert_eq!(days(&result), vec![(1, 10), (1, 11)]);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let defs = vec![
            def(
                1,
                0,
                RecurrenceRule::Daily {
                    anchor: local("2024-01-01T03:00:00"),
                    interval: 1,
                },
            ),
            def(
                2,
                2,
                RecurrenceRule::Weekly {
                    anchor: local("2024-01-01T03:00:00"),
                    interval: 1,
                    weekdays: vec![5],
                },
            ),
        ];
        let resolver = ScheduleResolver::utc();
        let a = resolver
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0))
            .unwrap();
        let b = resolver
            .resolve(&defs, utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 31);
        assert!(a
            .iter()
            .filter(|o| iso_weekday(o.timestamp.date_naive()) == 5)
            .all(|o| o.definition.id == 2));
    }

    #[test]
    fn test_timezone_conversion() {
        let resolver = ScheduleResolver::new(chrono_tz::Europe::Berlin);
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::Daily {
                anchor: local("2024-01-15T09:00:00"),
                interval: 1,
            },
        )];
        let result = resolver
            .resolve(&defs, utc(2024, 1, 15, 0, 0), utc(2024, 1, 16, 23, 0))
            .unwrap();
        assert_eq!(
            result.iter().map(|o| o.timestamp).collect::<Vec<_>>(),
            vec![utc(2024, 1, 15, 8, 0), utc(2024, 1, 16, 8, 0)]
        );
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        let resolver = ScheduleResolver::new(chrono_tz::America::New_York);
        let defs = vec![def(
            1,
            0,
            RecurrenceRule::Once {
                at: local("2024-03-10T02:30:00"),
            },
        )];
        let result = resolver
            .resolve(&defs, utc(2024, 3, 9, 0, 0), utc(2024, 3, 11, 0, 0))
            .unwrap();
        // 03:30 EDT
        assert_eq!(result[0].timestamp, utc(2024, 3, 10, 7, 30));
    }

    #[test]
    fn test_empty_and_invalid_inputs() {
        let resolver = ScheduleResolver::utc();
        assert!(resolver
            .resolve(&[], utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0))
            .unwrap()
            .is_empty());

        assert!(matches!(
            resolver.resolve(&[], utc(2024, 2, 1, 0, 0), utc(2024, 1, 1, 0, 0)),
            Err(ScheduleError::InvalidWindow { .. })
        ));

        let zero = def(
            7,
            0,
            RecurrenceRule::Daily {
                anchor: local("2024-01-01T00:00:00"),
                interval: 0,
            },
        );
        assert!(matches!(
            resolver.resolve(&[zero], utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0)),
            Err(ScheduleError::InvalidPayload { id: 7, .. })
        ));
    }

    #[test]
    fn test_parse_definition() {
        let ok = parse_definition(&json!({
            "id": 1,
            "jobdef_id": "import-users",
            "kind": "MONTHLY_DAYS",
            "anchor": "2024-01-01T00:00:00",
            "months": [1, 2],
            "days": [15]
        }))
        .unwrap();
        assert_eq!(ok.rule.kind_name(), "MONTHLY_DAYS");

        let unknown = parse_definition(&json!({"id": 2, "jobdef_id": "x", "kind": "HOURLY"}));
        assert!(matches!(unknown, Err(ScheduleError::UnknownKind(k)) if k == "HOURLY"));

        let bad_month = parse_definition(&json!({
            "id": 3,
            "jobdef_id": "x",
            "kind": "MONTHLY_DAYS",
            "anchor": "2024-01-01T00:00:00",
            "months": [13],
            "days": [1]
        }));
        assert!(matches!(bad_month, Err(ScheduleError::InvalidPayload { id: 3, .. })));

        let inverted = parse_definition(&json!({
            "id": 4,
            "jobdef_id": "x",
            "kind": "CANCEL",
            "from": "2024-03-02T00:00:00",
            "to": "2024-03-01T00:00:00"
        }));
        assert!(matches!(inverted, Err(ScheduleError::InvalidPayload { id: 4, .. })));
    }

    #[test]
    fn test_preview_filters_by_jobdef() {
        let at = local("2024-03-01T00:00:00");
        let mut other = def(2, 0, RecurrenceRule::Once { at });
        other.jobdef_id = "export-users".to_string();
        let defs = vec![def(1, 0, RecurrenceRule::Once { at }), other];
        let result = ScheduleResolver::utc()
            .preview("export-users", &defs, utc(2024, 2, 1, 0, 0), utc(2024, 4, 1, 0, 0))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].definition.id, 2);
    }
}
