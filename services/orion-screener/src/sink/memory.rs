//! In-process document tree with Realtime Database write semantics.
//!
//! Writing `null` deletes, and parents left empty by a delete disappear,
//! matching how the REST API behaves.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{DocumentStore, SinkError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    root: RwLock<Value>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, key| node.get(*key))
}

fn write(node: &mut Value, path: &[&str], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        write(child, rest, value);
        if child.is_null() || child.as_object().is_some_and(Map::is_empty) {
            map.remove(*first);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Null),
        }
    }

    /// Copy of the whole tree.
    pub async fn dump(&self) -> Value {
        self.root.read().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, SinkError> {
        let root = self.root.read().await;
        Ok(lookup(&root, &segments(path))
            .filter(|v| !v.is_null())
            .cloned())
    }

    async fn get_shallow_keys(&self, path: &str) -> Result<Vec<String>, SinkError> {
        let root = self.root.read().await;
        Ok(match lookup(&root, &segments(path)) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), SinkError> {
        let mut root = self.root.write().await;
        write(&mut root, &segments(path), value.clone());
        Ok(())
    }

    async fn update(&self, path: &str, value: &Map<String, Value>) -> Result<(), SinkError> {
        let mut root = self.root.write().await;
        let base = segments(path);
        for (key, child) in value {
            let mut full = base.clone();
            full.extend(segments(key));
            write(&mut root, &full, child.clone());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SinkError> {
        self.set(path, &Value::Null).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_overwrite() {
        let store = MemoryStore::new();
        store.set("a/b", &json!({"x": 1, "y": 2})).await.unwrap();
        assert_eq!(store.get("a/b/x").await.unwrap(), Some(json!(1)));

        store.set("a/b", &json!({"z": 3})).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), Some(json!({"z": 3})));
        assert_eq!(store.get("a/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_merges_children() {
        let store = MemoryStore::new();
        store.set("meta", &json!({"a": 1, "b": 2})).await.unwrap();

        let mut patch = Map::new();
        patch.insert("b".into(), json!(20));
        patch.insert("c/d".into(), json!(4));
        store.update("/meta/", &patch).await.unwrap();

        assert_eq!(store.get("meta").await.unwrap(), Some(json!({"a": 1, "b": 20, "c": {"d": 4}})));
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_parents() {
        let store = MemoryStore::new();
        store.set("root/snapshots/k1", &json!({"BTC": 1})).await.unwrap();
        store.set("root/other", &json!(true)).await.unwrap();

        store.delete("root/snapshots/k1").await.unwrap();
        assert_eq!(store.get("root/snapshots").await.unwrap(), None);
        assert!(store.get_shallow_keys("root/snapshots").await.unwrap().is_empty());
        assert_eq!(store.dump().await, json!({"root": {"other": true}}));
    }
}
