//! Schema validation for inbound message payloads.
//!
//! Walks the constant `Schema`/`PropertySchema` tree from `protocol::schema`
//! against a message's `data` object. A small LRU memoizes the outcome for a
//! given `(type, data)` pair — the teacher's completion cache shape (hash
//! key, `HashMap` + `VecDeque` order, hit/miss counters) reused for
//! validation results instead of completion insertions.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::errors::{ErrorTag, GatewayError, GatewayResult};
use crate::protocol::schema::{PropertySchema, Schema, SchemaStore};

#[derive(Clone)]
enum Outcome {
    Valid,
    Invalid(String),
}

struct ValidationCache {
    capacity: usize,
    map: HashMap<String, Outcome>,
    order: VecDeque<String>,
    pub hits: u64,
    pub misses: u64,
}

impl ValidationCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<Outcome> {
        if let Some(outcome) = self.map.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
            self.hits += 1;
            Some(outcome)
        } else {
            self.misses += 1;
            None
        }
    }

    fn insert(&mut self, key: String, outcome: Outcome) {
        if self.map.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.map.len() >= self.capacity {
            if let Some(evict) = self.order.pop_front() {
                self.map.remove(&evict);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, outcome);
    }
}

fn cache_key(message_type: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(data.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Validator {
    cache: Mutex<ValidationCache>,
}

impl Validator {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(ValidationCache::new(cache_capacity)),
        }
    }

    pub async fn validate(&self, message_type: &str, data: &Value) -> GatewayResult<()> {
        let key = cache_key(message_type, data);
        {
            let mut cache = self.cache.lock().await;
            if let Some(outcome) = cache.get(&key) {
                return outcome_to_result(outcome);
            }
        }

        let outcome = match SchemaStore::get(message_type) {
            // Message types with no registered schema (server-originated
            // tags a client would never send, e.g. AUTHENTICATED) pass
            // through unchecked.
            None => Outcome::Valid,
            Some(schema) => validate_against_schema(schema, data),
        };

        self.cache.lock().await.insert(key, outcome.clone());
        outcome_to_result(outcome)
    }

    pub async fn hit_ratio(&self) -> f64 {
        let cache = self.cache.lock().await;
        let total = cache.hits + cache.misses;
        if total == 0 {
            0.0
        } else {
            cache.hits as f64 / total as f64
        }
    }
}

fn outcome_to_result(outcome: Outcome) -> GatewayResult<()> {
    match outcome {
        Outcome::Valid => Ok(()),
        Outcome::Invalid(detail) => Err(GatewayError::new(ErrorTag::InvalidParams, detail)),
    }
}

fn validate_against_schema(schema: &Schema, data: &Value) -> Outcome {
    let obj = match data {
        Value::Object(obj) => obj,
        Value::Null if schema.required.is_empty() => return Outcome::Valid,
        _ => return Outcome::Invalid("data must be an object".to_string()),
    };

    for field in schema.required {
        match obj.get(*field) {
            Some(v) if !v.is_null() => {}
            _ => return Outcome::Invalid(format!("missing required field \"{field}\"")),
        }
    }

    // Extra fields not named in the schema are allowed (forward compatibility).
    for (name, schema_fn) in schema.properties {
        if let Some(value) = obj.get(*name) {
            if value.is_null() {
                // Null for an explicitly-present optional field is only
                // acceptable if the field wasn't required (checked above).
                if schema.required.contains(name) {
                    return Outcome::Invalid(format!("field \"{name}\" must not be null"));
                }
                continue;
            }
            if !validate_property(value, &schema_fn()) {
                return Outcome::Invalid(format!("field \"{name}\" has the wrong type"));
            }
        }
    }

    Outcome::Valid
}

fn validate_property(value: &Value, schema: &PropertySchema) -> bool {
    match schema {
        PropertySchema::String { enum_values } => match value {
            Value::String(s) => enum_values.map_or(true, |vals| vals.contains(&s.as_str())),
            _ => false,
        },
        PropertySchema::Number => value.is_number(),
        PropertySchema::Bool => value.is_boolean(),
        PropertySchema::Array { items } => match value {
            Value::Array(arr) => match items {
                // An array schema with no `items` sub-schema accepts any
                // element shape.
                Some(item_schema) => arr.iter().all(|v| validate_property(v, item_schema)),
                None => true,
            },
            _ => false,
        },
        PropertySchema::Object { properties } => match value {
            Value::Object(obj) => match properties {
                Some(props) => props.iter().all(|(name, sub)| match obj.get(*name) {
                    Some(v) if v.is_null() => false,
                    Some(v) => validate_property(v, sub),
                    None => true,
                }),
                None => true,
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn authenticate_requires_api_key() {
        let v = Validator::new(16);
        assert!(v.validate("AUTHENTICATE", &json!({})).await.is_err());
        assert!(v
            .validate("AUTHENTICATE", &json!({"apiKey": "abc"}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_message_type_passes_through() {
        let v = Validator::new(16);
        assert!(v.validate("SOMETHING_ELSE", &json!({"whatever": 1})).await.is_ok());
    }

    #[tokio::test]
    async fn extra_fields_are_allowed() {
        let v = Validator::new(16);
        assert!(v
            .validate("CONNECT", &json!({"deviceId": "d1", "extra": true}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn array_property_without_items_schema_accepts_anything() {
        let v = Validator::new(16);
        assert!(v
            .validate("START_SCAN", &json!({"filters": [1, "two", {"three": 3}]}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn repeated_validation_is_served_from_cache() {
        let v = Validator::new(16);
        let data = json!({"deviceId": "d1"});
        v.validate("CONNECT", &data).await.unwrap();
        v.validate("CONNECT", &data).await.unwrap();
        assert!(v.hit_ratio().await > 0.0);
    }

    #[tokio::test]
    async fn full_write_payload_validates_all_required_fields() {
        let v = Validator::new(16);
        let ok = json!({
            "deviceId": "d1",
            "serviceUuid": "s1",
            "characteristicUuid": "c1",
            "value": "AQ==",
        });
        assert!(v.validate("CHARACTERISTIC_WRITE", &ok).await.is_ok());
        let missing_value = json!({
            "deviceId": "d1",
            "serviceUuid": "s1",
            "characteristicUuid": "c1",
        });
        assert!(v.validate("CHARACTERISTIC_WRITE", &missing_value).await.is_err());
    }
}
