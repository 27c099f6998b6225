use serde::{Deserialize, Serialize};

use crate::entity::Value;

// ============================================================================
// Query Model
// ============================================================================
//
// A query is an immutable description over one primary container. Fields
// are referenced by name; `Id` and `LastPersistedAt` address the entity
// identifier and the store-assigned timestamp.
//
// ============================================================================

pub const ID_FIELD: &str = "Id";
pub const LAST_PERSISTED_FIELD: &str = "LastPersistedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    EqualTo,
    NotEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    Like,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

/// Equality join between a primary field and a field of another container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub container: String,
    pub primary_field: String,
    pub foreign_field: String,
}

/// Pulls `field` from a joined container into the result row as `alias`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSelect {
    pub container: String,
    pub field: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    conditions: Vec<Condition>,
    joins: Vec<Join>,
    selects: Vec<String>,
    join_selects: Vec<JoinSelect>,
    order_by: Option<OrderBy>,
    skip: Option<usize>,
    take: Option<usize>,
}

impl Query {
    /// Empty query; without conditions it selects every entity.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_all() -> Self {
        Self::default()
    }

    /// Adds an AND-combined condition.
    pub fn where_field(
        mut self,
        field: &str,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            operator,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.where_field(field, ConditionOperator::EqualTo, value)
    }

    pub fn join(mut self, kind: JoinKind, container: &str, primary_field: &str, foreign_field: &str) -> Self {
        self.joins.push(Join {
            kind,
            container: container.to_string(),
            primary_field: primary_field.to_string(),
            foreign_field: foreign_field.to_string(),
        });
        self
    }

    pub fn inner_join(self, container: &str, primary_field: &str, foreign_field: &str) -> Self {
        self.join(JoinKind::Inner, container, primary_field, foreign_field)
    }

    pub fn left_join(self, container: &str, primary_field: &str, foreign_field: &str) -> Self {
        self.join(JoinKind::Left, container, primary_field, foreign_field)
    }

    /// Restricts the result to the named primary fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn select_from_join(mut self, container: &str, field: &str, alias: &str) -> Self {
        self.join_selects.push(JoinSelect {
            container: container.to_string(),
            field: field.to_string(),
            alias: alias.to_string(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn selects(&self) -> &[String] {
        &self.selects
    }

    pub fn join_selects(&self) -> &[JoinSelect] {
        &self.join_selects
    }

    pub fn ordering(&self) -> Option<&OrderBy> {
        self.order_by.as_ref()
    }

    pub fn skip_count(&self) -> Option<usize> {
        self.skip
    }

    pub fn take_count(&self) -> Option<usize> {
        self.take
    }

    /// Whether any projection was specified.
    pub fn is_projected(&self) -> bool {
        !self.selects.is_empty() || !self.join_selects.is_empty()
    }

    /// Foreign containers a backend must load to evaluate this query.
    pub fn joined_containers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.joins.iter().map(|j| j.container.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
