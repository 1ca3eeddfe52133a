//! Record queries: criteria over payload fields, ordering and limits.
//!
//! Criteria follow SQL null semantics: a comparison against a missing or
//! `null` field never matches. Use `IsNull`/`NotNull` (or `AnyOf`) to reach
//! those rows explicitly.

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

use jobflow_core::{Entity, EntityId};

/// A predicate over one payload field (or a disjunction of predicates).
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    Eq(String, JsonValue),
    Ne(String, JsonValue),
    Lt(String, JsonValue),
    Le(String, JsonValue),
    Gt(String, JsonValue),
    Ge(String, JsonValue),
    IsNull(String),
    NotNull(String),
    In(String, Vec<JsonValue>),
    /// Matches when at least one inner criterion matches.
    AnyOf(Vec<Criterion>),
}

impl Criterion {
    pub fn eq(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Ne(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Lt(field.to_string(), value.into())
    }

    pub fn le(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Le(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Gt(field.to_string(), value.into())
    }

    pub fn ge(field: &str, value: impl Into<JsonValue>) -> Self {
        Criterion::Ge(field.to_string(), value.into())
    }

    pub fn is_null(field: &str) -> Self {
        Criterion::IsNull(field.to_string())
    }

    pub fn not_null(field: &str) -> Self {
        Criterion::NotNull(field.to_string())
    }

    pub fn one_of<V: Into<JsonValue>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Criterion::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn any_of(criteria: Vec<Criterion>) -> Self {
        Criterion::AnyOf(criteria)
    }

    /// Equality on an id-valued field.
    pub fn id_eq(field: &str, id: EntityId) -> Self {
        Self::eq(field, id.to_string())
    }

    pub fn matches(&self, payload: &JsonValue) -> bool {
        match self {
            Criterion::Eq(f, v) => compare(field(payload, f), v) == Some(Ordering::Equal),
            Criterion::Ne(f, v) => {
                matches!(compare(field(payload, f), v), Some(o) if o != Ordering::Equal)
                    || (field(payload, f).is_some() && !same_kind(field(payload, f), v))
            }
            Criterion::Lt(f, v) => compare(field(payload, f), v) == Some(Ordering::Less),
            Criterion::Le(f, v) => matches!(
                compare(field(payload, f), v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Criterion::Gt(f, v) => compare(field(payload, f), v) == Some(Ordering::Greater),
            Criterion::Ge(f, v) => matches!(
                compare(field(payload, f), v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Criterion::IsNull(f) => field(payload, f).is_none(),
            Criterion::NotNull(f) => field(payload, f).is_some(),
            Criterion::In(f, values) => {
                let actual = field(payload, f);
                values
                    .iter()
                    .any(|v| compare(actual, v) == Some(Ordering::Equal))
            }
            Criterion::AnyOf(inner) => inner.iter().any(|c| c.matches(payload)),
        }
    }
}

/// Field value, with JSON `null` treated as absent.
pub(crate) fn field<'a>(payload: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    payload.get(name).filter(|v| !v.is_null())
}

fn same_kind(a: Option<&JsonValue>, b: &JsonValue) -> bool {
    matches!(
        (a, b),
        (Some(JsonValue::Number(_)), JsonValue::Number(_))
            | (Some(JsonValue::String(_)), JsonValue::String(_))
            | (Some(JsonValue::Bool(_)), JsonValue::Bool(_))
    )
}

/// Orders two values of the same scalar kind; anything else is incomparable.
pub(crate) fn compare(actual: Option<&JsonValue>, expected: &JsonValue) -> Option<Ordering> {
    match (actual?, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
    pub nulls_first: bool,
}

/// Query over one entity type: a conjunction of criteria, sort keys applied
/// in order (nulls last unless a key asks otherwise, ties broken by id) and an
/// optional limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub entity_type: String,
    pub criteria: Vec<Criterion>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            criteria: Vec::new(),
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn of<E: Entity>() -> Self {
        Self::new(E::ENTITY_TYPE)
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn ascending(mut self, field: &str) -> Self {
        self.sort.push(SortKey {
            field: field.to_string(),
            direction: SortDirection::Ascending,
            nulls_first: false,
        });
        self
    }

    /// Ascending, with rows missing the field ordered before all others.
    pub fn ascending_nulls_first(mut self, field: &str) -> Self {
        self.sort.push(SortKey {
            field: field.to_string(),
            direction: SortDirection::Ascending,
            nulls_first: true,
        });
        self
    }

    pub fn descending(mut self, field: &str) -> Self {
        self.sort.push(SortKey {
            field: field.to_string(),
            direction: SortDirection::Descending,
            nulls_first: false,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, payload: &JsonValue) -> bool {
        self.criteria.iter().all(|c| c.matches(payload))
    }

    /// Ordering of two matching records under this query's sort keys.
    pub fn order(
        &self,
        (a_id, a): (EntityId, &JsonValue),
        (b_id, b): (EntityId, &JsonValue),
    ) -> Ordering {
        for key in &self.sort {
            let ord = match (field(a, &key.field), field(b, &key.field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) if key.nulls_first => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) if key.nulls_first => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => {
                    let natural = compare(Some(x), y).unwrap_or(Ordering::Equal);
                    match key.direction {
                        SortDirection::Ascending => natural,
                        SortDirection::Descending => natural.reverse(),
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a_id.cmp(&b_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn comparisons_ignore_missing_and_null_fields() {
        let payload = json!({"due_date": null, "retries": 2});
        assert!(!Criterion::le("due_date", 10).matches(&payload));
        assert!(Criterion::is_null("due_date").matches(&payload));
        assert!(Criterion::is_null("lock_owner").matches(&payload));
        assert!(Criterion::gt("retries", 0).matches(&payload));
        assert!(!Criterion::ne("lock_owner", "a").matches(&payload));
    }

    #[test]
    fn any_of_is_a_disjunction() {
        let due_or_unset = Criterion::any_of(vec![
            Criterion::is_null("due_date"),
            Criterion::le("due_date", 100),
        ]);
        assert!(due_or_unset.matches(&json!({})));
        assert!(due_or_unset.matches(&json!({"due_date": 50})));
        assert!(!due_or_unset.matches(&json!({"due_date": 150})));
    }

    #[test]
    fn in_matches_listed_values() {
        let c = Criterion::one_of("job_type", ["a", "b"]);
        assert!(c.matches(&json!({"job_type": "b"})));
        assert!(!c.matches(&json!({"job_type": "c"})));
    }

    #[test]
    fn sort_puts_nulls_last_in_both_directions() {
        let q = RecordQuery::new("job").descending("priority").ascending("due_date");
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let high = json!({"priority": 5, "due_date": 10});
        let low_early = json!({"priority": 1, "due_date": 1});
        let low_unset = json!({"priority": 1});

        let mut rows = vec![(c, &low_unset), (b, &low_early), (a, &high)];
        rows.sort_by(|x, y| q.order(*x, *y));

        assert_eq!(rows.iter().map(|r| r.0).collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn nulls_first_key_orders_missing_values_ahead() {
        let q = RecordQuery::new("job").descending("priority").ascending_nulls_first("due_date");
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let early = json!({"priority": 1, "due_date": 1});
        let late = json!({"priority": 1, "due_date": 50});
        let unset = json!({"priority": 1});

        let mut rows = vec![(a, &late), (b, &early), (c, &unset)];
        rows.sort_by(|x, y| q.order(*x, *y));

        assert_eq!(rows.iter().map(|r| r.0).collect::<Vec<_>>(), vec![c, b, a]);
    }
}
