use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::core::{Result, TdmError};

/// Which rows of a table a query sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    #[default]
    All,
    /// `OCCUPIED_BY IS NULL`
    Available,
    /// `OCCUPIED_BY IS NOT NULL`
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterKind {
    Equals,
    Contains,
    StartWith,
    /// Lower bound of a date range, inclusive.
    DateFrom,
    /// Upper bound of a date range, inclusive.
    DateTo,
}

impl FilterKind {
    pub fn is_date(&self) -> bool {
        matches!(self, Self::DateFrom | Self::DateTo)
    }
}

/// Predicate on one column. Only the first value is honored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub kind: FilterKind,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
    pub values: Vec<String>,
}

fn default_case_sensitive() -> bool {
    true
}

impl Filter {
    pub fn new(column: impl Into<String>, kind: FilterKind, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind,
            case_sensitive: true,
            values: vec![value.into()],
        }
    }

    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterKind::Equals, value)
    }

    pub fn contains(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterKind::Contains, value)
    }

    pub fn start_with(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterKind::StartWith, value)
    }

    pub fn date_from(column: impl Into<String>, date: NaiveDate) -> Self {
        Self::new(column, FilterKind::DateFrom, date.format("%Y-%m-%d").to_string())
    }

    pub fn date_to(column: impl Into<String>, date: NaiveDate) -> Self {
        Self::new(column, FilterKind::DateTo, date.format("%Y-%m-%d").to_string())
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    /// The value the predicate is built from; extra values are ignored.
    pub fn first_value(&self) -> Result<&str> {
        let value = self.values.first().ok_or_else(|| {
            TdmError::Validation(format!("filter on '{}' has no value", self.column))
        })?;

        if self.kind.is_date() {
            NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
                TdmError::Validation(format!(
                    "date filter on '{}' expects YYYY-MM-DD, got '{}'",
                    self.column, value
                ))
            })?;
        }

        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    #[serde(default)]
    pub direction: Direction,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_value_is_used() {
        let mut filter = Filter::equals("ICCID", "first");
        filter.values.push("second".into());
        assert_eq!(filter.first_value().unwrap(), "first");
    }

    #[test]
    fn test_empty_values_rejected() {
        let mut filter = Filter::equals("ICCID", "x");
        filter.values.clear();
        assert!(matches!(filter.first_value(), Err(TdmError::Validation(_))));
    }

    #[test]
    fn test_date_filter_requires_iso_date() {
        let filter = Filter::new("CREATED_WHEN", FilterKind::DateFrom, "19.10.2026");
        assert!(filter.first_value().is_err());

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(Filter::date_to("CREATED_WHEN", date).first_value().unwrap(), "2026-10-19");
    }

    #[test]
    fn test_filter_json_defaults() {
        let filter: Filter =
            serde_json::from_str(r#"{"column":"A","kind":"START_WITH","values":["89"]}"#).unwrap();
        assert_eq!(filter.kind, FilterKind::StartWith);
        assert!(filter.case_sensitive);
    }
}
