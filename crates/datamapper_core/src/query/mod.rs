//! Declarative queries resolved against entity metadata.
//!
//! # Responsibility
//! - Translate field-level query descriptions into a raw `Builder` whose
//!   identifiers are `table.column`.
//! - Resolve joins through relation metadata.
//!
//! # Invariants
//! - A bare field in WHERE must be immediately followed by an operator token
//!   to be translated; other tokens pass through unchanged.
//! - Every unresolved field, relation or entity is an error, never a panic.

mod builder;

pub use builder::{
    check_placeholders, Aggregate, AggregateFunction, Builder, Join, Order, Statement,
    StatementKind,
};

use crate::error::{OrmError, OrmResult};
use crate::metadata::{Metadata, RelationKind};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;

const WHERE_OPERATORS: &[&str] = &[
    "=", "<", "<=", ">", ">=", "<>", "!=", "IN", "NOT IN", "LIKE", "NOT LIKE",
];

static SELECT_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(\w+)\.)?(\w+)(?:\s+AS\s+(\w+))?$").expect("select item pattern is valid")
});

/// Lookup of registered metadata by entity name.
pub trait MetadataSource {
    fn metadata_by_entity_name(&self, entity: &str) -> Option<&Metadata>;
}

/// Field-level query description.
///
/// - `select`: empty or `["*"]` selects every column; `[""]` selects none.
/// - `join`: target entity names reachable through relations.
/// - `filter`: flat WHERE token sequence (`field`, operator, `?`, ...).
/// - `set`: field values for INSERT/UPDATE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub kind: StatementKind,
    pub select: Vec<String>,
    pub join: Vec<String>,
    pub filter: Vec<String>,
    pub params: Vec<Value>,
    pub group_by: Vec<String>,
    pub order_by: Vec<(String, Order)>,
    pub limit: i64,
    pub offset: i64,
    pub aggregates: Vec<Aggregate>,
    pub set: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(set: Vec<(String, Value)>) -> Self {
        Self {
            kind: StatementKind::Insert,
            set,
            ..Self::default()
        }
    }

    pub fn update(set: Vec<(String, Value)>) -> Self {
        Self {
            kind: StatementKind::Update,
            set,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            kind: StatementKind::Delete,
            ..Self::default()
        }
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn join(mut self, entity: impl Into<String>) -> Self {
        self.join.push(entity.into());
        self
    }

    pub fn filter<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn params<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.params.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Resolves this query against `metadata` and renders it.
    ///
    /// # Errors
    /// - `UnresolvedField` for unmapped fields in any clause.
    /// - `UnresolvedRelation` / `EntityNotRegistered` for joins.
    /// - `PlaceholderMismatch` / `UnexpectedToken` for WHERE tokens.
    pub fn build(&self, metadata: &Metadata, source: &dyn MetadataSource) -> OrmResult<Statement> {
        self.to_builder(metadata, source)?.build()
    }

    /// Resolves fields and relations into a raw builder.
    pub fn to_builder(&self, metadata: &Metadata, source: &dyn MetadataSource) -> OrmResult<Builder> {
        let resolver = FieldResolver {
            own: metadata,
            source,
        };
        let table = metadata.table_name();

        let mut builder = Builder {
            kind: self.kind,
            from: vec![table],
            limit: self.limit,
            ..Builder::default()
        };

        match self.kind {
            StatementKind::Select => {
                builder.join = self.resolve_joins(metadata, source)?;
                builder.select = self.resolve_select(&resolver)?;
                builder.aggregates = self
                    .aggregates
                    .iter()
                    .map(|aggregate| {
                        Ok(Aggregate {
                            function: aggregate.function,
                            on: resolver.qualified(&aggregate.on)?,
                            alias: aggregate.alias.clone(),
                        })
                    })
                    .collect::<OrmResult<Vec<_>>>()?;
                builder.group_by = self
                    .group_by
                    .iter()
                    .map(|field| resolver.qualified(field))
                    .collect::<OrmResult<Vec<_>>>()?;
                builder.order_by = self
                    .order_by
                    .iter()
                    .map(|(field, order)| Ok((resolver.qualified(field)?, *order)))
                    .collect::<OrmResult<Vec<_>>>()?;
                builder.offset = self.offset;
            }
            StatementKind::Insert | StatementKind::Update => {
                builder.set = self.resolve_set(metadata)?;
            }
            StatementKind::Delete => {}
        }

        builder.where_tokens = translate_where(&self.filter, &resolver)?;
        check_placeholders(&builder.where_tokens, self.params.len())?;
        builder.params = self.params.clone();

        Ok(builder)
    }

    fn resolve_select(&self, resolver: &FieldResolver<'_>) -> OrmResult<Vec<String>> {
        let own = resolver.own;
        if self.select.len() == 1 && self.select[0].trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.select.is_empty() || (self.select.len() == 1 && self.select[0].trim() == "*") {
            let table = own.table_name();
            return Ok(own
                .columns
                .iter()
                .map(|column| format!("{table}.{} AS {}", column.column_name(), column.field))
                .collect());
        }

        self.select
            .iter()
            .map(|item| {
                let item = item.trim();
                let captures = SELECT_ITEM.captures(item).ok_or_else(|| OrmError::UnresolvedField {
                    entity: own.entity.clone(),
                    field: item.to_string(),
                })?;
                let field = &captures[2];
                let metadata = match captures.get(1) {
                    Some(entity) => self.joined_metadata(resolver, entity.as_str())?,
                    None => own,
                };
                let alias = captures.get(3).map_or(field, |alias| alias.as_str());
                Ok(format!("{} AS {alias}", metadata.qualified_column(field)?))
            })
            .collect()
    }

    fn joined_metadata<'a>(
        &self,
        resolver: &FieldResolver<'a>,
        entity: &str,
    ) -> OrmResult<&'a Metadata> {
        if entity == resolver.own.entity {
            return Ok(resolver.own);
        }
        if !self.join.iter().any(|joined| joined.trim() == entity) {
            return Err(OrmError::UnresolvedRelation {
                entity: resolver.own.entity.clone(),
                relation: entity.to_string(),
            });
        }
        resolver.entity(entity)
    }

    fn resolve_joins(&self, own: &Metadata, source: &dyn MetadataSource) -> OrmResult<Vec<Join>> {
        self.join
            .iter()
            .map(|target_entity| {
                let target_entity = target_entity.trim();
                let relation = own
                    .resolve_relation_for_target_entity(target_entity)
                    .ok_or_else(|| OrmError::UnresolvedRelation {
                        entity: own.entity.clone(),
                        relation: target_entity.to_string(),
                    })?;
                let target = source
                    .metadata_by_entity_name(target_entity)
                    .ok_or_else(|| OrmError::EntityNotRegistered(target_entity.to_string()))?;
                let target_table = target.table_name();

                let on = match relation.kind {
                    RelationKind::ManyToOne => format!(
                        "{} = {}",
                        target.qualified_column(target.primary_key_field()?)?,
                        own.qualified_column(&relation.foreign_key)?
                    ),
                    RelationKind::OneToMany | RelationKind::OneToOne => format!(
                        "{} = {}",
                        target.qualified_column(&relation.foreign_key)?,
                        own.qualified_column(own.primary_key_field()?)?
                    ),
                    RelationKind::ManyToMany => {
                        return Err(OrmError::UnsupportedRelation {
                            entity: own.entity.clone(),
                            relation: relation.field.clone(),
                        })
                    }
                };

                Ok(Join::new(target_table, on))
            })
            .collect()
    }

    fn resolve_set(&self, metadata: &Metadata) -> OrmResult<Vec<(String, Value)>> {
        let primary_key = metadata.primary_key_field()?;
        self.set
            .iter()
            .filter(|(field, _)| field != primary_key)
            .map(|(field, value)| Ok((metadata.require_column_name(field)?, value.clone())))
            .collect()
    }
}

struct FieldResolver<'a> {
    own: &'a Metadata,
    source: &'a dyn MetadataSource,
}

impl<'a> FieldResolver<'a> {
    fn entity(&self, entity: &str) -> OrmResult<&'a Metadata> {
        if entity == self.own.entity {
            return Ok(self.own);
        }
        self.source
            .metadata_by_entity_name(entity)
            .ok_or_else(|| OrmError::EntityNotRegistered(entity.to_string()))
    }

    /// Resolves `field` or `Entity.field` to `table.column`.
    fn qualified(&self, token: &str) -> OrmResult<String> {
        let token = token.trim();
        match token.split_once('.') {
            Some((entity, field)) => self.entity(entity)?.qualified_column(field),
            None => self.own.qualified_column(token),
        }
    }
}

fn is_operator(token: &str) -> bool {
    let normalized = token.trim().to_ascii_uppercase();
    WHERE_OPERATORS.contains(&normalized.as_str())
}

fn translate_where(tokens: &[String], resolver: &FieldResolver<'_>) -> OrmResult<Vec<String>> {
    let mut translated = tokens.to_vec();
    for (index, token) in tokens.iter().enumerate() {
        if !is_operator(token) {
            continue;
        }
        if index == 0 {
            return Err(OrmError::UnexpectedToken {
                token: token.clone(),
                index,
            });
        }
        translated[index - 1] = resolver.qualified(&tokens[index - 1])?;
    }
    Ok(translated)
}
