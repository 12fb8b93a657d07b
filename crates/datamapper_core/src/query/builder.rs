//! Raw SQL statement rendering.
//!
//! # Responsibility
//! - Render SELECT/INSERT/UPDATE/DELETE text from already-resolved
//!   identifiers plus positional parameters.
//!
//! # Invariants
//! - Clause order is fixed and every list is rendered in caller order, so the
//!   same builder always yields byte-identical SQL.
//! - WHERE `?` tokens must match the WHERE params exactly.
//! - Statements end with ` ;`.

use crate::error::{OrmError, OrmResult};
use crate::value::Value;

/// Statement kind rendered by a builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatementKind {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

/// ORDER BY direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// SQL aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Avg,
    Min,
    Max,
    Sum,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Sum => "SUM",
        }
    }
}

/// `FUNC(on) AS alias` select item.
///
/// In a raw `Builder`, `on` is a column expression; in a `Query` it is a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub on: String,
    pub alias: String,
}

impl Aggregate {
    pub fn new(function: AggregateFunction, on: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            function,
            on: on.into(),
            alias: alias.into(),
        }
    }

    pub fn count(on: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Count, on, alias)
    }

    fn render(&self) -> String {
        if self.alias.is_empty() {
            format!("{}({})", self.function.as_str(), self.on)
        } else {
            format!("{}({}) AS {}", self.function.as_str(), self.on, self.alias)
        }
    }
}

/// `JOIN table ON condition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub on: String,
}

impl Join {
    pub fn new(table: impl Into<String>, on: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            on: on.into(),
        }
    }
}

/// Rendered SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Raw statement description.
///
/// `from[0]` is the target table for INSERT/UPDATE/DELETE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Builder {
    pub kind: StatementKind,
    pub select: Vec<String>,
    pub from: Vec<String>,
    pub join: Vec<Join>,
    pub where_tokens: Vec<String>,
    pub params: Vec<Value>,
    pub group_by: Vec<String>,
    pub order_by: Vec<(String, Order)>,
    pub limit: i64,
    pub offset: i64,
    pub aggregates: Vec<Aggregate>,
    pub set: Vec<(String, Value)>,
}

impl Builder {
    pub fn build(&self) -> OrmResult<Statement> {
        match self.kind {
            StatementKind::Select => self.build_select(),
            StatementKind::Insert => self.build_insert(),
            StatementKind::Update => self.build_update(),
            StatementKind::Delete => self.build_delete(),
        }
    }

    fn build_select(&self) -> OrmResult<Statement> {
        if self.from.is_empty() {
            return Err(OrmError::UnsupportedStatement(
                "SELECT needs at least one FROM table".to_string(),
            ));
        }

        let aggregates = self
            .aggregates
            .iter()
            .map(Aggregate::render)
            .collect::<Vec<_>>()
            .join(", ");
        let columns = self.select.join(", ");
        let select_list = match (aggregates.is_empty(), columns.is_empty()) {
            (true, true) => "*".to_string(),
            (false, true) => aggregates,
            (true, false) => columns,
            (false, false) => format!("{aggregates}, {columns}"),
        };

        let mut parts = vec![
            format!("SELECT {select_list}"),
            format!("FROM {}", self.from.join(", ")),
        ];
        for join in &self.join {
            parts.push(format!("JOIN {} ON {}", join.table, join.on));
        }
        let params = self.push_where(&mut parts)?;
        if !self.group_by.is_empty() {
            parts.push(format!("GROUP BY {}", self.group_by.join(", ")));
        }
        if !self.order_by.is_empty() {
            let terms = self
                .order_by
                .iter()
                .map(|(column, order)| format!("{column} {}", order.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("ORDER BY {terms}"));
        }
        self.push_limit(&mut parts);
        if self.offset != 0 {
            parts.push(format!("OFFSET {}", self.offset));
        }

        Ok(finish(parts, params))
    }

    fn build_insert(&self) -> OrmResult<Statement> {
        let table = self.target_table("INSERT")?;
        if self.set.is_empty() {
            return Ok(finish(
                vec![format!("INSERT INTO {table} DEFAULT VALUES")],
                Vec::new(),
            ));
        }

        let columns = self
            .set
            .iter()
            .map(|(column, _)| column.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let placeholders = vec!["?"; self.set.len()].join(",");
        let params = self.set.iter().map(|(_, value)| value.clone()).collect();

        Ok(finish(
            vec![format!("INSERT INTO {table}({columns}) VALUES({placeholders})")],
            params,
        ))
    }

    fn build_update(&self) -> OrmResult<Statement> {
        let table = self.target_table("UPDATE")?;
        if self.set.is_empty() {
            return Err(OrmError::UnsupportedStatement(
                "UPDATE needs at least one SET column".to_string(),
            ));
        }

        let assignments = self
            .set
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params: Vec<Value> = self.set.iter().map(|(_, value)| value.clone()).collect();
        let mut parts = vec![format!("UPDATE {table} SET {assignments}")];
        params.extend(self.push_where(&mut parts)?);

        Ok(finish(parts, params))
    }

    fn build_delete(&self) -> OrmResult<Statement> {
        let table = self.target_table("DELETE")?;
        let mut parts = vec![format!("DELETE FROM {table}")];
        let params = self.push_where(&mut parts)?;
        self.push_limit(&mut parts);

        Ok(finish(parts, params))
    }

    fn target_table(&self, statement: &str) -> OrmResult<&str> {
        self.from
            .first()
            .map(String::as_str)
            .filter(|table| !table.trim().is_empty())
            .ok_or_else(|| OrmError::UnsupportedStatement(format!("{statement} needs a target table")))
    }

    fn push_where(&self, parts: &mut Vec<String>) -> OrmResult<Vec<Value>> {
        check_placeholders(&self.where_tokens, self.params.len())?;
        if self.where_tokens.is_empty() {
            return Ok(Vec::new());
        }
        parts.push(format!("WHERE {}", self.where_tokens.join(" ")));
        Ok(self.params.clone())
    }

    fn push_limit(&self, parts: &mut Vec<String>) {
        if self.limit != 0 {
            parts.push(format!("LIMIT {}", self.limit));
        }
    }
}

/// Fails unless `tokens` hold exactly `params` `?` placeholders.
pub fn check_placeholders(tokens: &[String], params: usize) -> OrmResult<()> {
    let placeholders = tokens.iter().filter(|token| token.trim() == "?").count();
    if placeholders != params {
        return Err(OrmError::PlaceholderMismatch {
            placeholders,
            params,
        });
    }
    Ok(())
}

fn finish(parts: Vec<String>, params: Vec<Value>) -> Statement {
    let mut sql = parts.join(" ");
    sql.push_str(" ;");
    Statement { sql, params }
}

#[cfg(test)]
mod tests {
    use super::{Aggregate, Builder, Join, Order, StatementKind};
    use crate::error::OrmError;
    use crate::value::Value;

    fn tokens(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn select_star_from_table() {
        let statement = Builder {
            select: tokens(&["*"]),
            from: tokens(&["articles"]),
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(statement.sql, "SELECT * FROM articles ;");
        assert!(statement.params.is_empty());
    }

    #[test]
    fn select_with_aliases_and_where() {
        let statement = Builder {
            select: tokens(&["a.title AS Title", "a.created_at AS CreatedAt"]),
            from: tokens(&["articles a"]),
            where_tokens: tokens(&["a.published", "=", "?"]),
            params: vec![Value::Integer(1)],
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT a.title AS Title, a.created_at AS CreatedAt FROM articles a WHERE a.published = ? ;"
        );
        assert_eq!(statement.params, vec![Value::Integer(1)]);
    }

    #[test]
    fn select_with_join_aggregate_and_group_by() {
        let statement = Builder {
            select: tokens(&["u.id AS ID"]),
            from: tokens(&["users u"]),
            join: vec![Join::new("followers f", "f.followee_id = u.id")],
            aggregates: vec![Aggregate::count("f.followee_id", "FollowerCount")],
            group_by: tokens(&["u.id"]),
            where_tokens: tokens(&["u.id", "=", "?"]),
            params: vec![Value::Integer(10)],
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT COUNT(f.followee_id) AS FollowerCount, u.id AS ID FROM users u JOIN followers f ON f.followee_id = u.id WHERE u.id = ? GROUP BY u.id ;"
        );
    }

    #[test]
    fn order_by_limit_and_offset_keep_caller_order() {
        let statement = Builder {
            from: tokens(&["articles"]),
            order_by: vec![
                ("articles.title".to_string(), Order::Desc),
                ("articles.id".to_string(), Order::Asc),
            ],
            limit: 10,
            offset: 20,
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT * FROM articles ORDER BY articles.title DESC, articles.id ASC LIMIT 10 OFFSET 20 ;"
        );
    }

    #[test]
    fn delete_with_where() {
        let statement = Builder {
            kind: StatementKind::Delete,
            from: tokens(&["articles"]),
            where_tokens: tokens(&["articles.author_id", "=", "?"]),
            params: vec![Value::Null],
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(statement.sql, "DELETE FROM articles WHERE articles.author_id = ? ;");
        assert_eq!(statement.params, vec![Value::Null]);
    }

    #[test]
    fn update_binds_set_values_before_where_params() {
        let statement = Builder {
            kind: StatementKind::Update,
            from: tokens(&["articles"]),
            set: vec![("title".to_string(), Value::Text("the title".to_string()))],
            where_tokens: tokens(&["articles.id", "=", "?"]),
            params: vec![Value::Integer(1)],
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(statement.sql, "UPDATE articles SET title = ? WHERE articles.id = ? ;");
        assert_eq!(
            statement.params,
            vec![Value::Text("the title".to_string()), Value::Integer(1)]
        );
    }

    #[test]
    fn insert_lists_columns_in_set_order() {
        let statement = Builder {
            kind: StatementKind::Insert,
            from: tokens(&["articles"]),
            set: vec![
                ("title".to_string(), Value::Text("new title".to_string())),
                ("author_id".to_string(), Value::Integer(3)),
            ],
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO articles(title,author_id) VALUES(?,?) ;"
        );
        assert_eq!(statement.params.len(), 2);
    }

    #[test]
    fn insert_without_columns_uses_default_values() {
        let statement = Builder {
            kind: StatementKind::Insert,
            from: tokens(&["counters"]),
            ..Builder::default()
        }
        .build()
        .unwrap();
        assert_eq!(statement.sql, "INSERT INTO counters DEFAULT VALUES ;");
    }

    #[test]
    fn placeholder_mismatch_is_rejected() {
        let err = Builder {
            from: tokens(&["articles"]),
            where_tokens: tokens(&["articles.id", "=", "?"]),
            ..Builder::default()
        }
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            OrmError::PlaceholderMismatch {
                placeholders: 1,
                params: 0
            }
        ));
    }

    #[test]
    fn missing_target_table_is_rejected() {
        for kind in [
            StatementKind::Select,
            StatementKind::Insert,
            StatementKind::Update,
            StatementKind::Delete,
        ] {
            let err = Builder {
                kind,
                ..Builder::default()
            }
            .build()
            .unwrap_err();
            assert!(matches!(err, OrmError::UnsupportedStatement(_)));
        }
    }
}
