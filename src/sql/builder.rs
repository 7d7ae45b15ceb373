use super::filter::{Filter, FilterKind, Order, Scope};
use super::ident::{encode_literal, escape_like, quote_identifier};
use crate::core::types::OCCUPIED_BY;
use crate::core::{Result, Value};

/// Marker giving insertion order; used when no explicit order is requested.
const INSERTION_ORDER: &str = "rowid";

/// SQL text plus positional parameters bound in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// How filter values reach the statement.
enum Binding<'a> {
    /// `?` placeholders, values collected for binding.
    Params(&'a mut Vec<String>),
    /// Escaped literals spliced into the text.
    Literal,
}

impl Binding<'_> {
    fn push(&mut self, value: String) -> Result<String> {
        match self {
            Self::Params(params) => {
                params.push(value);
                Ok("?".to_string())
            }
            Self::Literal => encode_literal(&value),
        }
    }
}

/// Builder for reads and updates against one data table.
///
/// SELECT-family statements bind filter values as parameters; UPDATE
/// statements embed them as escaped literals.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    table: String,
    scope: Scope,
    filters: Vec<Filter>,
    order: Option<Order>,
    offset: Option<u64>,
    limit: Option<u64>,
    columns: Option<Vec<String>>,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order(mut self, order: Option<Order>) -> Self {
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: Option<u64>) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Restrict the projection; all columns are returned otherwise.
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter_list(&self) -> &[Filter] {
        &self.filters
    }

    /// Data query honoring projection, order, offset and limit.
    pub fn select(&self) -> Result<BuiltQuery> {
        let mut params = Vec::new();
        let projection = self.projection()?;
        let mut sql = format!(
            "SELECT {} FROM {}",
            projection,
            quote_identifier(&self.table)?
        );
        sql.push_str(&self.where_clause(&mut Binding::Params(&mut params))?);
        sql.push_str(&self.order_clause()?);
        sql.push_str(&self.page_clause());
        Ok(BuiltQuery { sql, params })
    }

    /// Row count under the same scope and filters, without paging.
    pub fn count(&self) -> Result<BuiltQuery> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&self.table)?);
        sql.push_str(&self.where_clause(&mut Binding::Params(&mut params))?);
        Ok(BuiltQuery { sql, params })
    }

    pub fn distinct(&self, column: &str) -> Result<BuiltQuery> {
        let mut params = Vec::new();
        let column = quote_identifier(column)?;
        let mut sql = format!(
            "SELECT DISTINCT {} FROM {}",
            column,
            quote_identifier(&self.table)?
        );
        sql.push_str(&self.where_clause(&mut Binding::Params(&mut params))?);
        sql.push_str(&format!(" ORDER BY {} ASC", column));
        sql.push_str(&self.page_clause());
        Ok(BuiltQuery { sql, params })
    }

    /// WHERE clause with literal values, for generated UPDATE statements.
    /// Empty when neither scope nor filters restrict the rows.
    pub fn update_where(&self) -> Result<String> {
        self.where_clause(&mut Binding::Literal)
    }

    /// `UPDATE ... SET` over the rows this query selects.
    pub fn update(&self, assignments: &[(String, Value)]) -> Result<String> {
        if assignments.is_empty() {
            return Err(crate::core::TdmError::Validation(
                "update requires at least one column value".into(),
            ));
        }

        let set = assignments
            .iter()
            .map(|(column, value)| {
                let rendered = match value.to_storage_text() {
                    Some(text) => encode_literal(&text)?,
                    None => "NULL".to_string(),
                };
                Ok(format!("{} = {}", quote_identifier(column)?, rendered))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "UPDATE {} SET {}{}",
            quote_identifier(&self.table)?,
            set.join(", "),
            self.update_where()?
        ))
    }

    fn projection(&self) -> Result<String> {
        match &self.columns {
            Some(columns) if !columns.is_empty() => Ok(columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")),
            _ => Ok("*".to_string()),
        }
    }

    fn where_clause(&self, binding: &mut Binding<'_>) -> Result<String> {
        let mut conditions = Vec::new();

        match self.scope {
            Scope::All => {}
            Scope::Available => conditions.push(format!("\"{}\" IS NULL", OCCUPIED_BY)),
            Scope::Occupied => conditions.push(format!("\"{}\" IS NOT NULL", OCCUPIED_BY)),
        }

        for filter in &self.filters {
            conditions.push(render_filter(filter, binding)?);
        }

        if conditions.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", conditions.join(" AND ")))
        }
    }

    fn order_clause(&self) -> Result<String> {
        match &self.order {
            Some(order) => Ok(format!(
                " ORDER BY {} {}, {} ASC",
                quote_identifier(&order.column)?,
                order.direction.as_sql(),
                INSERTION_ORDER
            )),
            None => Ok(format!(" ORDER BY {} ASC", INSERTION_ORDER)),
        }
    }

    fn page_clause(&self) -> String {
        match (self.limit, self.offset) {
            (None, None) => String::new(),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
        }
    }
}

fn render_filter(filter: &Filter, binding: &mut Binding<'_>) -> Result<String> {
    let column = quote_identifier(&filter.column)?;
    let value = filter.first_value()?.to_string();

    let (lhs, wrap): (String, fn(String) -> String) = if filter.case_sensitive || filter.kind.is_date() {
        (column.clone(), |v| v)
    } else {
        (format!("UPPER({})", column), |v| format!("UPPER({})", v))
    };

    Ok(match filter.kind {
        FilterKind::Equals => format!("{} = {}", lhs, wrap(binding.push(value)?)),
        FilterKind::Contains => format!(
            "{} LIKE {} ESCAPE '\\'",
            lhs,
            wrap(binding.push(format!("%{}%", escape_like(&value)))?)
        ),
        FilterKind::StartWith => format!(
            "{} LIKE {} ESCAPE '\\'",
            lhs,
            wrap(binding.push(format!("{}%", escape_like(&value)))?)
        ),
        FilterKind::DateFrom => format!("date({}) >= date({})", column, binding.push(value)?),
        FilterKind::DateTo => format!("date({}) <= date({})", column, binding.push(value)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::filter::Direction;

    #[test]
    fn test_plain_select_has_no_paging() {
        let q = TableQuery::new("t_1").select().unwrap();
        assert_eq!(q.sql, "SELECT * FROM \"t_1\" ORDER BY rowid ASC");
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_scope_and_filters_bind_params() {
        let q = TableQuery::new("t_1")
            .scope(Scope::Available)
            .filter(Filter::contains("ICCID", "026072").case_insensitive())
            .filter(Filter::equals("TYPE", "prepaid"))
            .limit(Some(10))
            .offset(Some(20))
            .select()
            .unwrap();

        assert_eq!(
            q.sql,
            "SELECT * FROM \"t_1\" WHERE \"OCCUPIED_BY\" IS NULL \
             AND UPPER(\"ICCID\") LIKE UPPER(?) ESCAPE '\\' \
             AND \"TYPE\" = ? ORDER BY rowid ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(q.params, vec!["%026072%".to_string(), "prepaid".to_string()]);
    }

    #[test]
    fn test_offset_without_limit() {
        let q = TableQuery::new("t_1").offset(Some(5)).select().unwrap();
        assert!(q.sql.ends_with("LIMIT -1 OFFSET 5"));
    }

    #[test]
    fn test_explicit_order_overrides_default() {
        let q = TableQuery::new("t_1")
            .order(Some(Order {
                column: "MSISDN".into(),
                direction: Direction::Desc,
            }))
            .select()
            .unwrap();
        assert!(q.sql.ends_with("ORDER BY \"MSISDN\" DESC, rowid ASC"));
    }

    #[test]
    fn test_count_ignores_paging_and_order() {
        let q = TableQuery::new("t_1")
            .scope(Scope::Occupied)
            .limit(Some(1))
            .count()
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) FROM \"t_1\" WHERE \"OCCUPIED_BY\" IS NOT NULL"
        );
    }

    #[test]
    fn test_date_range_filters() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let q = TableQuery::new("t_1")
            .filter(Filter::date_from("CREATED_WHEN", date))
            .filter(Filter::date_to("CREATED_WHEN", date))
            .count()
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) FROM \"t_1\" WHERE date(\"CREATED_WHEN\") >= date(?) \
             AND date(\"CREATED_WHEN\") <= date(?)"
        );
        assert_eq!(q.params, vec!["2026-10-19", "2026-10-19"]);
    }

    #[test]
    fn test_update_uses_escaped_literals() {
        let sql = TableQuery::new("t_1")
            .filter(Filter::start_with("NAME", "O'B").case_insensitive())
            .update(&[
                ("STATUS".into(), Value::from("used")),
                ("NOTE".into(), Value::Null),
            ])
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"t_1\" SET \"STATUS\" = 'used', \"NOTE\" = NULL \
             WHERE UPPER(\"NAME\") LIKE UPPER('O''B%') ESCAPE '\\'"
        );
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        assert!(TableQuery::new("t; DROP").select().is_err());
        assert!(
            TableQuery::new("t_1")
                .filter(Filter::equals("A B", "x"))
                .select()
                .is_err()
        );
        assert!(TableQuery::new("t_1").distinct("x\"y").is_err());
    }

    #[test]
    fn test_distinct_values_query() {
        let q = TableQuery::new("t_1")
            .scope(Scope::Available)
            .distinct("REGION")
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT DISTINCT \"REGION\" FROM \"t_1\" WHERE \"OCCUPIED_BY\" IS NULL ORDER BY \"REGION\" ASC"
        );
    }
}
