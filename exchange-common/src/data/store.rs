// exchange-common/src/data/store.rs
// ====
// Path-addressed in-memory state store
// ====
// The shared store is a JSON tree mutated exclusively through ordered
// `ChangeCommand` batches. Workers emit commands against their local mirror
// and forward the same batch across the worker boundary, so the
// orchestrator's store replays the worker's view exactly.
// ====

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One atomic mutation of the store.
///
/// The serialized form (`{"type":"update",...}` /
/// `{"type":"removeArrayElement",...}`) is part of the worker wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeCommand {
    #[serde(rename_all = "camelCase")]
    Update { path: String, value: Value },
    #[serde(rename_all = "camelCase")]
    RemoveArrayElement { path: String, index: usize },
}

impl ChangeCommand {
    pub fn update<T: Serialize>(path: impl Into<String>, value: T) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| panic!("unserializable store value: {}", e));
        ChangeCommand::Update {
            path: path.into(),
            value,
        }
    }

    pub fn remove_array_element(path: impl Into<String>, index: usize) -> Self {
        ChangeCommand::RemoveArrayElement {
            path: path.into(),
            index,
        }
    }
}

/// Path-addressed JSON store.
///
/// Intermediate containers must already exist; a dangling path is a bug in
/// the producer and panics rather than being papered over at runtime.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    root: Value,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Sets the field addressed by `path`. Segments are split on `.`;
    /// a segment addressing into an array must be a valid index. On arrays,
    /// index == len appends and index < len replaces.
    pub fn update(&mut self, path: &str, value: Value) {
        let (parent, last) = Self::resolve_parent(&mut self.root, path);
        match parent {
            Value::Object(map) => {
                map.insert(last.to_string(), value);
            }
            Value::Array(items) => {
                let index = Self::array_index(last, path);
                match index.cmp(&items.len()) {
                    std::cmp::Ordering::Less => items[index] = value,
                    std::cmp::Ordering::Equal => items.push(value),
                    std::cmp::Ordering::Greater => {
                        panic!("store update out of bounds at '{}' (len {})", path, items.len())
                    }
                }
            }
            other => panic!(
                "store update into non-container at '{}' ({})",
                path,
                type_name(other)
            ),
        }
    }

    /// Splices one element out of the array at `path`.
    pub fn remove_array_element(&mut self, path: &str, index: usize) {
        let target = Self::resolve(&mut self.root, path);
        match target {
            Value::Array(items) => {
                if index >= items.len() {
                    panic!(
                        "store removal out of bounds at '{}' (index {}, len {})",
                        path,
                        index,
                        items.len()
                    );
                }
                items.remove(index);
            }
            other => panic!(
                "store removal target '{}' is not an array ({})",
                path,
                type_name(other)
            ),
        }
    }

    /// Executes an ordered batch, in order, synchronously. There is no
    /// rollback: the batch must be self-consistent, with removal indices
    /// accounting for removals applied earlier in the same batch.
    pub fn apply_changes(&mut self, commands: &[ChangeCommand]) {
        for command in commands {
            match command {
                ChangeCommand::Update { path, value } => self.update(path, value.clone()),
                ChangeCommand::RemoveArrayElement { path, index } => {
                    self.remove_array_element(path, *index)
                }
            }
        }
    }

    /// Reads the value at `path`, or None if any segment is missing.
    pub fn read(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Typed read; None when the path is missing or the shape mismatches.
    pub fn read_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        serde_json::from_value(self.read(path)?.clone()).ok()
    }

    fn resolve<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
        let mut current = root;
        for segment in path.split('.') {
            current = Self::step(current, segment, path);
        }
        current
    }

    fn resolve_parent<'a, 'p>(root: &'a mut Value, path: &'p str) -> (&'a mut Value, &'p str) {
        let (parent_path, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        let parent = match parent_path {
            Some(p) => Self::resolve(root, p),
            None => root,
        };
        (parent, last)
    }

    fn step<'a>(current: &'a mut Value, segment: &str, path: &str) -> &'a mut Value {
        match current {
            Value::Object(map) => map
                .get_mut(segment)
                .unwrap_or_else(|| panic!("missing container '{}' in path '{}'", segment, path)),
            Value::Array(items) => {
                let index = Self::array_index(segment, path);
                let len = items.len();
                items.get_mut(index).unwrap_or_else(|| {
                    panic!(
                        "index {} out of bounds (len {}) in path '{}'",
                        index, len, path
                    )
                })
            }
            other => panic!(
                "cannot traverse into {} at '{}' in path '{}'",
                type_name(other),
                segment,
                path
            ),
        }
    }

    fn array_index(segment: &str, path: &str) -> usize {
        segment
            .parse::<usize>()
            .unwrap_or_else(|_| panic!("non-numeric array index '{}' in path '{}'", segment, path))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.update(
            "bybit",
            json!({
                "public": { "tickers": {}, "markets": {} },
                "private": {
                    "a1": { "orders": [ {"id": "o1"}, {"id": "o2"}, {"id": "o3"}, {"id": "o4"} ] }
                }
            }),
        );
        store
    }

    #[test]
    fn test_update_then_read_roundtrip() {
        let mut store = fixture();
        store.update("bybit.public.tickers.BTCUSDT", json!({ "bid": "100" }));
        store.update("bybit.public.tickers.BTCUSDT.ask", json!("101"));
        assert_eq!(store.read("bybit.public.tickers.BTCUSDT.bid"), Some(&json!("100")));
        assert_eq!(store.read("bybit.public.tickers.BTCUSDT.ask"), Some(&json!("101")));
    }

    #[test]
    fn test_array_index_update_and_append() {
        let mut store = fixture();
        store.update("bybit.private.a1.orders.1.id", json!("o2b"));
        assert_eq!(store.read("bybit.private.a1.orders.1.id"), Some(&json!("o2b")));
        // index == len appends
        store.update("bybit.private.a1.orders.4", json!({"id": "o5"}));
        assert_eq!(store.read("bybit.private.a1.orders.4.id"), Some(&json!("o5")));
    }

    #[test]
    fn test_remove_array_element_shifts_down() {
        let mut store = fixture();
        store.remove_array_element("bybit.private.a1.orders", 1);
        let orders: Vec<Value> = store.read_as("bybit.private.a1.orders").unwrap();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[1]["id"], "o3");
    }

    #[test]
    fn test_sequential_removals_at_front() {
        let mut store = fixture();
        store.apply_changes(&[
            ChangeCommand::remove_array_element("bybit.private.a1.orders", 0),
            ChangeCommand::remove_array_element("bybit.private.a1.orders", 0),
        ]);
        let orders: Vec<Value> = store.read_as("bybit.private.a1.orders").unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0]["id"], "o3");
        assert_eq!(orders[1]["id"], "o4");
    }

    #[test]
    #[should_panic(expected = "missing container")]
    fn test_no_auto_vivification() {
        let mut store = MemoryStore::new();
        store.update("bybit.public.tickers.BTCUSDT", json!({}));
    }

    #[test]
    #[should_panic(expected = "not an array")]
    fn test_remove_on_non_array_panics() {
        let mut store = fixture();
        store.remove_array_element("bybit.public.tickers", 0);
    }

    #[test]
    fn test_command_wire_tags() {
        let update = ChangeCommand::update("a.b", 1);
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "update");
        let removal = ChangeCommand::remove_array_element("a.b", 2);
        let value = serde_json::to_value(&removal).unwrap();
        assert_eq!(value["type"], "removeArrayElement");
        assert_eq!(value["index"], 2);
    }
}
