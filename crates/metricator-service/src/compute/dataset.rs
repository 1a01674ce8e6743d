use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The field value metrics read from every record.
pub const VALUE_FIELD: &str = "value";

/// An immutable snapshot of the fetched records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    records: Vec<Value>,
}

impl Dataset {
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The numeric `field` of every record, in order.
    ///
    /// Records without the field, or with a non-numeric one, contribute `0`.
    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.records
            .iter()
            .map(move |record| record.get(field).and_then(Value::as_f64).unwrap_or(0.0))
    }
}

impl From<Vec<Value>> for Dataset {
    fn from(records: Vec<Value>) -> Self {
        Self::new(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_values_count_as_zero() {
        let dataset: Dataset =
            serde_json::from_value(json!([{"value": 2}, {"other": 1}, {"value": "x"}, {"value": 1.5}]))
                .unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.values(VALUE_FIELD).collect::<Vec<_>>(), vec![2.0, 0.0, 0.0, 1.5]);
    }
}
