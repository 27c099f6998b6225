use std::cmp::Ordering;
use std::collections::HashMap;

use super::model::{
    Condition, ConditionOperator, JoinKind, OrderDirection, Query, ID_FIELD, LAST_PERSISTED_FIELD,
};
use crate::entity::{EntityMetadata, PropertyBag, Value};

// ============================================================================
// Condition Evaluator
// ============================================================================
//
// Pure, backend-independent query execution. Backends hand over the primary
// container's entities in insertion order together with every joined
// container, and get back the result rows. No backend re-implements any of
// these semantics.
//
// Pipeline: materialize -> filter -> default order -> join -> explicit order -> page -> project
//
// ============================================================================

/// Entities of the containers named in the query's joins, in insertion order.
pub type JoinedContainers = HashMap<String, Vec<PropertyBag>>;

pub fn evaluate(
    entities: &[PropertyBag],
    query: &Query,
    metadata: &EntityMetadata,
    joined: &JoinedContainers,
) -> Vec<PropertyBag> {
    // Conditions and ordering see the same shape `retrieve` returns.
    let materialized: Vec<PropertyBag> = entities
        .iter()
        .map(|bag| metadata.materialize(bag.clone()))
        .collect();

    let mut rows: Vec<&PropertyBag> = materialized
        .iter()
        .filter(|bag| query.conditions().iter().all(|c| matches_condition(bag, c)))
        .collect();

    // Stable sort keeps insertion order among equal timestamps.
    rows.sort_by(|a, b| a.last_persisted_at.cmp(&b.last_persisted_at));

    let foreign: HashMap<&str, Vec<&PropertyBag>> = query
        .joined_containers()
        .into_iter()
        .map(|name| {
            let entities = joined.get(name).map(Vec::as_slice).unwrap_or(&[]);
            (name, default_ordered(entities))
        })
        .collect();

    let mut sources: Vec<(&PropertyBag, HashMap<String, Value>)> = Vec::with_capacity(rows.len());
    'rows: for row in rows {
        let mut pulled = HashMap::new();
        for join in query.joins() {
            let candidates = foreign.get(join.container.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let matched = field_value(row, &join.primary_field).and_then(|key| {
                candidates.iter().copied().find(|candidate| {
                    field_value(candidate, &join.foreign_field)
                        .map(|value| value.value_eq(&key))
                        .unwrap_or(false)
                })
            });

            match matched {
                Some(foreign_row) => {
                    for select in query.join_selects().iter().filter(|s| s.container == join.container) {
                        if let Some(value) = field_value(foreign_row, &select.field) {
                            pulled.insert(select.alias.clone(), value);
                        }
                    }
                }
                None if join.kind == JoinKind::Inner => continue 'rows,
                None => {}
            }
        }
        sources.push((row, pulled));
    }

    if let Some(order) = query.ordering() {
        sources.sort_by(|(a, a_pulled), (b, b_pulled)| {
            let left = a_pulled.get(&order.field).cloned().or_else(|| field_value(a, &order.field));
            let right = b_pulled.get(&order.field).cloned().or_else(|| field_value(b, &order.field));
            let ordering = compare_for_sort(left.as_ref(), right.as_ref());
            match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            }
        });
    }

    let skip = query.skip_count().unwrap_or(0);
    let take = query.take_count().unwrap_or(usize::MAX);

    sources
        .into_iter()
        .skip(skip)
        .take(take)
        .map(|(row, pulled)| project(row, pulled, query, metadata))
        .collect()
}

/// Reads a field, including the `Id` and `LastPersistedAt` pseudo-fields.
pub fn field_value(bag: &PropertyBag, field: &str) -> Option<Value> {
    match field {
        ID_FIELD => Some(Value::String(bag.id.clone())),
        LAST_PERSISTED_FIELD => bag.last_persisted_at.map(Value::DateTime),
        _ => bag.get(field).cloned(),
    }
}

pub fn matches_condition(bag: &PropertyBag, condition: &Condition) -> bool {
    let stored = field_value(bag, &condition.field).filter(|v| !v.is_null());
    let wanted = &condition.value;

    if wanted.is_null() {
        return match condition.operator {
            ConditionOperator::EqualTo => stored.is_none(),
            ConditionOperator::NotEqualTo => stored.is_some(),
            _ => false,
        };
    }

    let stored = match stored {
        Some(value) => value,
        // A missing value differs from every concrete value and orders with none.
        None => return condition.operator == ConditionOperator::NotEqualTo,
    };

    match condition.operator {
        ConditionOperator::EqualTo => stored.value_eq(wanted),
        ConditionOperator::NotEqualTo => !stored.value_eq(wanted),
        ConditionOperator::GreaterThan => stored.compare(wanted) == Some(Ordering::Greater),
        ConditionOperator::GreaterThanOrEqualTo => matches!(
            stored.compare(wanted),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::LessThan => stored.compare(wanted) == Some(Ordering::Less),
        ConditionOperator::LessThanOrEqualTo => {
            matches!(stored.compare(wanted), Some(Ordering::Less | Ordering::Equal))
        }
        ConditionOperator::Like => match (stored.as_text(), wanted.as_text()) {
            (Some(text), Some(pattern)) => like(text, pattern),
            _ => false,
        },
    }
}

/// Case-sensitive, unanchored match where `%` stands for any run of
/// characters. Without `%` this is a plain substring test.
pub fn like(text: &str, pattern: &str) -> bool {
    let mut remaining = text;
    for segment in pattern.split('%').filter(|s| !s.is_empty()) {
        match remaining.find(segment) {
            Some(position) => remaining = &remaining[position + segment.len()..],
            None => return false,
        }
    }
    true
}

fn default_ordered(entities: &[PropertyBag]) -> Vec<&PropertyBag> {
    let mut ordered: Vec<&PropertyBag> = entities.iter().collect();
    ordered.sort_by(|a, b| a.last_persisted_at.cmp(&b.last_persisted_at));
    ordered
}

/// Missing and null values sort first; incomparable kinds keep their order.
fn compare_for_sort(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let left = left.filter(|v| !v.is_null());
    let right = right.filter(|v| !v.is_null());
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

fn project(
    row: &PropertyBag,
    pulled: HashMap<String, Value>,
    query: &Query,
    metadata: &EntityMetadata,
) -> PropertyBag {
    let mut result = row.clone();
    if !query.is_projected() {
        result.properties.extend(pulled);
        return result;
    }

    let mut projected = PropertyBag::with_id(row.id.clone());
    projected.last_persisted_at = row.last_persisted_at;

    for (name, declared) in &metadata.properties {
        if let Some(zero) = declared.zero() {
            projected.properties.insert(name.clone(), zero);
        }
    }
    for select in query.join_selects() {
        match metadata.zero_of(&select.alias) {
            Some(zero) => projected.properties.insert(select.alias.clone(), zero),
            None => projected.properties.insert(select.alias.clone(), Value::Null),
        };
    }

    for field in query.selects() {
        if let Some(value) = result.properties.remove(field) {
            projected.properties.insert(field.clone(), value);
        }
    }
    // Joined values win over primary values projected under the same name.
    projected.properties.extend(pulled);
    projected
}
