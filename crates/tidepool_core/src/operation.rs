//! Operations, references and baselines.

use crate::oid::Oid;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Marker key of serialized references.
pub const REF_TYPE_KEY: &str = "@@type";

/// A reference stored inside a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ref {
    /// Points at another identified object or list.
    Object(Oid),
    /// Points at an opaque file; never recursed into.
    File(String),
}

impl Ref {
    /// Recognizes `{"@@type": "ref" | "file", "id": ...}`.
    pub fn from_json(value: &JsonValue) -> Option<Ref> {
        let object = value.as_object()?;
        let id = object.get("id")?.as_str()?;
        match object.get(REF_TYPE_KEY)?.as_str()? {
            "ref" => Some(Ref::Object(Oid::parse(id).ok()?)),
            "file" => Some(Ref::File(id.to_string())),
            _ => None,
        }
    }

    /// Serializes the reference.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Ref::Object(oid) => json!({ "@@type": "ref", "id": oid.as_str() }),
            Ref::File(id) => json!({ "@@type": "file", "id": id }),
        }
    }

    /// Returns the referenced object identifier, if this is an object ref.
    pub fn oid(&self) -> Option<&Oid> {
        match self {
            Ref::Object(oid) => Some(oid),
            Ref::File(_) => None,
        }
    }
}

/// Which matching instance a `list-remove` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveOnly {
    /// The first matching item.
    First,
    /// The last matching item.
    Last,
}

/// Items carried by a `list-insert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertItems {
    /// Several items inserted in order.
    Many {
        /// The inserted items.
        values: Vec<JsonValue>,
    },
    /// A single item.
    One {
        /// The inserted item.
        value: JsonValue,
    },
}

impl InsertItems {
    /// Wraps items, using the single-item form when possible.
    pub fn from_vec(mut values: Vec<JsonValue>) -> Self {
        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return InsertItems::One { value };
            }
        }
        InsertItems::Many { values }
    }

    /// Returns the items as a vector.
    pub fn to_vec(&self) -> Vec<JsonValue> {
        match self {
            InsertItems::Many { values } => values.clone(),
            InsertItems::One { value } => vec![value.clone()],
        }
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        match self {
            InsertItems::Many { values } => values.len(),
            InsertItems::One { .. } => 1,
        }
    }

    /// Returns true if no items are carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The mutation carried by an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OperationData {
    /// Replaces the whole view.
    Initialize {
        /// The new view.
        value: JsonValue,
    },
    /// Sets an object field.
    Set {
        /// Field name.
        name: String,
        /// New value.
        value: JsonValue,
    },
    /// Removes an object field.
    Remove {
        /// Field name.
        name: String,
    },
    /// Deletes the whole view.
    Delete,
    /// Appends an item.
    ListPush {
        /// Appended item.
        value: JsonValue,
    },
    /// Inserts items at a position.
    ListInsert {
        /// Insert position.
        index: usize,
        /// Inserted items.
        #[serde(flatten)]
        items: InsertItems,
    },
    /// Replaces the item at a position.
    ListSet {
        /// Item position.
        index: usize,
        /// New item.
        value: JsonValue,
    },
    /// Deletes a run of items.
    ListDelete {
        /// First deleted position.
        index: usize,
        /// Number of deleted items.
        count: usize,
    },
    /// Appends an item unless an equal item is present.
    ListAdd {
        /// Candidate item.
        value: JsonValue,
    },
    /// Removes items equal to a value.
    ListRemove {
        /// Value to match.
        value: JsonValue,
        /// Restricts removal to one instance; all matches when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        only: Option<RemoveOnly>,
    },
    /// Moves the item at `from` to `to`.
    ListMoveByIndex {
        /// Source position.
        from: usize,
        /// Target position.
        to: usize,
    },
    /// Moves the item equal to `value` to `index`.
    ListMoveByRef {
        /// Reference of the moved item.
        value: JsonValue,
        /// Target position.
        index: usize,
    },
}

impl OperationData {
    /// Returns the kebab-case name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            OperationData::Initialize { .. } => "initialize",
            OperationData::Set { .. } => "set",
            OperationData::Remove { .. } => "remove",
            OperationData::Delete => "delete",
            OperationData::ListPush { .. } => "list-push",
            OperationData::ListInsert { .. } => "list-insert",
            OperationData::ListSet { .. } => "list-set",
            OperationData::ListDelete { .. } => "list-delete",
            OperationData::ListAdd { .. } => "list-add",
            OperationData::ListRemove { .. } => "list-remove",
            OperationData::ListMoveByIndex { .. } => "list-move-by-index",
            OperationData::ListMoveByRef { .. } => "list-move-by-ref",
        }
    }
}

/// A timestamped mutation of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Target object.
    pub oid: Oid,
    /// Logical time of the mutation.
    pub timestamp: Timestamp,
    /// The mutation.
    pub data: OperationData,
    /// Authorization scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<String>,
}

impl Operation {
    /// Creates an operation without authorization scope.
    pub fn new(oid: Oid, timestamp: Timestamp, data: OperationData) -> Self {
        Self {
            oid,
            timestamp,
            data,
            authz: None,
        }
    }
}

/// Compacted view of one object as of a timestamp.
///
/// A `null` snapshot records that the object was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBaseline {
    /// The object.
    pub oid: Oid,
    /// The view, or `null` when deleted.
    pub snapshot: JsonValue,
    /// Timestamp of the last operation folded into the snapshot.
    pub timestamp: Timestamp,
    /// Authorization scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<String>,
}

impl DocumentBaseline {
    /// Returns the view, or `None` if the object was deleted.
    pub fn view(&self) -> Option<&JsonValue> {
        if self.snapshot.is_null() {
            None
        } else {
            Some(&self.snapshot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> Timestamp {
        Timestamp::new(0, 1, 0, "r")
    }

    #[test]
    fn ref_json() {
        let oid = Oid::new("posts", "a").with_sub_id("1");
        let value = Ref::Object(oid.clone()).to_json();
        assert_eq!(value["@@type"], "ref");
        assert_eq!(Ref::from_json(&value), Some(Ref::Object(oid)));

        let file = Ref::File("f1".into());
        assert_eq!(Ref::from_json(&file.to_json()), Some(file));
        assert_eq!(Ref::from_json(&json!({"id": "x"})), None);
        assert_eq!(Ref::from_json(&json!({"@@type": "other", "id": "x"})), None);
    }

    #[test]
    fn operation_wire_shape() {
        let op = Operation::new(
            Oid::new("posts", "a"),
            ts(),
            OperationData::Set {
                name: "title".into(),
                value: json!("hi"),
            },
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["data"]["op"], "set");
        assert_eq!(value["data"]["name"], "title");
        assert!(value.get("authz").is_none());
    }

    #[test]
    fn list_insert_single_and_many() {
        let single = OperationData::ListInsert {
            index: 2,
            items: InsertItems::One { value: json!(3) },
        };
        let value = serde_json::to_value(&single).unwrap();
        assert_eq!(value, json!({"op": "list-insert", "index": 2, "value": 3}));
        let back: OperationData = serde_json::from_value(value).unwrap();
        assert_eq!(back, single);

        let many: OperationData =
            serde_json::from_value(json!({"op": "list-insert", "index": 0, "values": [1, 2]}))
                .unwrap();
        assert_eq!(
            many,
            OperationData::ListInsert {
                index: 0,
                items: InsertItems::Many {
                    values: vec![json!(1), json!(2)]
                }
            }
        );
    }

    #[test]
    fn list_remove_only_is_optional() {
        let data: OperationData =
            serde_json::from_value(json!({"op": "list-remove", "value": "x"})).unwrap();
        assert_eq!(
            data,
            OperationData::ListRemove {
                value: json!("x"),
                only: None
            }
        );
        let last = OperationData::ListRemove {
            value: json!("x"),
            only: Some(RemoveOnly::Last),
        };
        assert_eq!(serde_json::to_value(&last).unwrap()["only"], "last");
    }

    #[test]
    fn delete_has_only_tag() {
        let value = serde_json::to_value(&OperationData::Delete).unwrap();
        assert_eq!(value, json!({"op": "delete"}));
    }

    #[test]
    fn baseline_deleted_view() {
        let baseline = DocumentBaseline {
            oid: Oid::new("posts", "a"),
            snapshot: JsonValue::Null,
            timestamp: ts(),
            authz: None,
        };
        assert!(baseline.view().is_none());
    }
}
