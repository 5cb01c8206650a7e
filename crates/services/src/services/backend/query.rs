use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq { column: String, value: Value },
    /// Array column contains every element of `values`.
    Contains { column: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(column: &str, value: impl Serialize) -> Self {
        Self::Eq {
            column: column.to_string(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn contains<T: Serialize>(column: &str, values: &[T]) -> Self {
        Self::Contains {
            column: column.to_string(),
            values: values
                .iter()
                .map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
                .collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::Contains { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A `select` against one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    /// `(offset, limit)`
    pub range: Option<(usize, usize)>,
    pub exact_count: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Serialize) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn contains<T: Serialize>(mut self, column: &str, values: &[T]) -> Self {
        self.filters.push(Filter::contains(column, values));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending: true,
        });
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending: false,
        });
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some((offset, limit));
        self
    }

    pub fn limit(self, limit: usize) -> Self {
        self.range(0, limit)
    }

    pub fn exact_count(mut self) -> Self {
        self.exact_count = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub rows: Vec<Value>,
    /// Total matching rows ignoring the range; only set for `exact_count` queries.
    pub count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn builder_accumulates_clauses() {
        let id = Uuid::nil();
        let query = Query::new()
            .contains("category_ids", &[id])
            .order_desc("created_at")
            .range(10, 5)
            .exact_count();

        assert_eq!(
            query.filters,
            vec![Filter::Contains {
                column: "category_ids".into(),
                values: vec![json!("00000000-0000-0000-0000-000000000000")],
            }]
        );
        assert_eq!(query.order.len(), 1);
        assert!(!query.order[0].ascending);
        assert_eq!(query.range, Some((10, 5)));
        assert!(query.exact_count);
    }
}
