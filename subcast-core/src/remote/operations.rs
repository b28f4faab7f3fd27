//! List mutation vocabulary
//!
//! A diff entry whose value is an object with an `operation` field is a list
//! mutation; anything else is a scalar assignment.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ApplyError, ApplyResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum ListOperation {
    Append { item: Value },
    /// Index past the end appends
    Insert { index: usize, item: Value },
    Update { index: usize, item: Value },
    Delete { index: usize },
    Extend { items: Vec<Value> },
    /// Removes the last item when no index is given
    Pop {
        #[serde(default)]
        index: Option<usize>,
    },
    Clear,
    Replace { items: Vec<Value> },
}

impl ListOperation {
    /// `Some` if `value` is meant as a list operation. A value that carries
    /// an `operation` field but does not parse is an error, not a scalar.
    pub fn from_change(property: &str, value: &Value) -> ApplyResult<Option<Self>> {
        match value {
            Value::Object(map) if map.contains_key("operation") => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ApplyError::InvalidPayload(format!("'{}': {}", property, e))),
            _ => Ok(None),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ListOperation::Append { .. } => "append",
            ListOperation::Insert { .. } => "insert",
            ListOperation::Update { .. } => "update",
            ListOperation::Delete { .. } => "delete",
            ListOperation::Extend { .. } => "extend",
            ListOperation::Pop { .. } => "pop",
            ListOperation::Clear => "clear",
            ListOperation::Replace { .. } => "replace",
        }
    }

    pub fn apply(&self, property: &str, list: &mut Vec<Value>) -> ApplyResult<()> {
        let out_of_range = |index: usize, len: usize| ApplyError::IndexOutOfRange {
            property: property.to_string(),
            index,
            len,
        };

        match self {
            ListOperation::Append { item } => list.push(item.clone()),
            ListOperation::Insert { index, item } => {
                let at = (*index).min(list.len());
                list.insert(at, item.clone());
            }
            ListOperation::Update { index, item } => {
                let len = list.len();
                let slot = list.get_mut(*index).ok_or_else(|| out_of_range(*index, len))?;
                *slot = item.clone();
            }
            ListOperation::Delete { index } => {
                if *index >= list.len() {
                    return Err(out_of_range(*index, list.len()));
                }
                list.remove(*index);
            }
            ListOperation::Extend { items } => list.extend(items.iter().cloned()),
            ListOperation::Pop { index } => {
                let at = match index {
                    Some(index) => *index,
                    None => list.len().checked_sub(1).ok_or_else(|| out_of_range(0, 0))?,
                };
                if at >= list.len() {
                    return Err(out_of_range(at, list.len()));
                }
                list.remove(at);
            }
            ListOperation::Clear => list.clear(),
            ListOperation::Replace { items } => *list = items.clone(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(ops: Value, start: Value) -> ApplyResult<Value> {
        let mut list: Vec<Value> = serde_json::from_value(start).unwrap();
        for op in ops.as_array().unwrap() {
            let op = ListOperation::from_change("items", op)?.unwrap();
            op.apply("items", &mut list)?;
        }
        Ok(Value::Array(list))
    }

    #[test]
    fn test_operation_sequence() {
        let ops = json!([
            {"operation": "append", "item": "c"},
            {"operation": "insert", "index": 0, "item": "z"},
            {"operation": "update", "index": 1, "item": "A"},
            {"operation": "delete", "index": 2},
            {"operation": "extend", "items": [1, 2]},
            {"operation": "pop"},
            {"operation": "pop", "index": 0}
        ]);
        assert_eq!(run(ops, json!(["a", "b"])).unwrap(), json!(["A", "c", 1]));
    }

    #[test]
    fn test_clear_and_replace() {
        let ops = json!([{"operation": "clear"}, {"operation": "replace", "items": [true]}]);
        assert_eq!(run(ops, json!([1, 2, 3])).unwrap(), json!([true]));
    }

    #[test]
    fn test_insert_past_end_appends() {
        let ops = json!([{"operation": "insert", "index": 10, "item": "x"}]);
        assert_eq!(run(ops, json!(["a"])).unwrap(), json!(["a", "x"]));
    }

    #[test]
    fn test_out_of_range() {
        let err = run(json!([{"operation": "update", "index": 3, "item": 0}]), json!([1])).unwrap_err();
        assert!(matches!(err, ApplyError::IndexOutOfRange { index: 3, len: 1, .. }));

        let err = run(json!([{"operation": "pop"}]), json!([])).unwrap_err();
        assert!(matches!(err, ApplyError::IndexOutOfRange { len: 0, .. }));
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let err = ListOperation::from_change("items", &json!({"operation": "shuffle"})).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidPayload(_)));

        // Plain objects are scalar values
        assert!(ListOperation::from_change("p", &json!({"a": 1})).unwrap().is_none());
    }
}
