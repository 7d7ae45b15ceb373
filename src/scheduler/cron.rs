use chrono::{DateTime, Utc};
use croner::Cron;

use crate::core::{Result, TdmError};

/// Smallest accepted gap, in minutes, between two firings within an hour.
pub const MIN_MINUTE_GAP: u32 = 5;

/// Parse a 5- or 6-field cron expression (seconds optional, UTC).
///
/// Beyond syntax, schedules firing more than once a minute or more often
/// than every [`MIN_MINUTE_GAP`] minutes are refused: the seconds field must
/// name a single second and the minutes field must keep its firings at
/// least that far apart, including across the hour boundary.
pub fn parse_cron(expr: &str) -> Result<Cron> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(TdmError::Validation("cron expression is empty".into()));
    }

    let cron = Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| TdmError::Validation(format!("invalid cron expression '{}': {}", expr, e)))?;

    if !expr.starts_with('@') {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let minutes = match fields.len() {
            5 => fields[0],
            6 => {
                if expand_field(fields[0], 59)?.len() != 1 {
                    return Err(TdmError::Validation(format!(
                        "cron '{}' fires more than once a minute; seconds field must name one second",
                        expr
                    )));
                }
                fields[1]
            }
            n => {
                return Err(TdmError::Validation(format!(
                    "cron '{}' has {} fields, expected 5 or 6",
                    expr, n
                )));
            }
        };
        let gap = min_gap(&expand_field(minutes, 59)?, 60);
        if gap < MIN_MINUTE_GAP {
            return Err(TdmError::Validation(format!(
                "cron '{}' fires {} minute(s) apart; at least {} minutes are required",
                expr, gap, MIN_MINUTE_GAP
            )));
        }
    }

    Ok(cron)
}

/// Values in `0..=max` matched by one numeric cron field.
fn expand_field(field: &str, max: u32) -> Result<Vec<u32>> {
    let invalid = || TdmError::Validation(format!("unsupported cron field '{}'", field));
    let number = |s: &str| s.parse::<u32>().ok().filter(|v| *v <= max).ok_or_else(invalid);

    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<u32>().ok().filter(|s| *s > 0).ok_or_else(invalid)?)),
            None => (part, None),
        };
        let (from, to) = match range {
            "*" | "?" => (0, max),
            _ => match range.split_once('-') {
                Some((a, b)) => (number(a)?, number(b)?),
                None => {
                    let start = number(range)?;
                    (start, if step.is_some() { max } else { start })
                }
            },
        };
        if from > to {
            return Err(invalid());
        }
        values.extend((from..=to).step_by(step.unwrap_or(1) as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

/// Smallest distance between consecutive values on a cycle of `period`.
fn min_gap(values: &[u32], period: u32) -> u32 {
    match values {
        [] => period,
        [_] => period,
        _ => {
            let wrap = values[0] + period - values[values.len() - 1];
            values
                .windows(2)
                .map(|w| w[1] - w[0])
                .fold(wrap, u32::min)
        }
    }
}

pub fn validate_cron(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

/// First occurrence strictly after `after`, if the schedule fires again.
pub fn next_occurrence(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(&after, false).ok()
}
