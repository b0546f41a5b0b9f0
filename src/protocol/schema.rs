//! Schemas defined once as constant data (§9 design note: "Schemas as nested
//! literals" → define once as constant data; the Validator walks them
//! without reflection).

use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum PropertySchema {
    String { enum_values: Option<&'static [&'static str]> },
    Array { items: Option<Box<PropertySchema>> },
    Object { properties: Option<&'static [(&'static str, PropertySchema)]> },
    Number,
    Bool,
}

pub fn string() -> PropertySchema {
    PropertySchema::String { enum_values: None }
}

pub fn string_enum(values: &'static [&'static str]) -> PropertySchema {
    PropertySchema::String {
        enum_values: Some(values),
    }
}

pub fn array(items: Option<PropertySchema>) -> PropertySchema {
    PropertySchema::Array {
        items: items.map(Box::new),
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub required: &'static [&'static str],
    pub properties: &'static [(&'static str, PropertySchemaFn)],
}

/// A function pointer rather than a `PropertySchema` value directly, since
/// `PropertySchema::Array`'s boxed `items` can't be built in a `const`
/// context; each entry is evaluated once by `SchemaStore::get`.
pub type PropertySchemaFn = fn() -> PropertySchema;

fn api_key_str() -> PropertySchema {
    string()
}
fn device_id_str() -> PropertySchema {
    string()
}
fn service_uuid_str() -> PropertySchema {
    string()
}
fn characteristic_uuid_str() -> PropertySchema {
    string()
}
fn value_str() -> PropertySchema {
    string()
}
fn token_str() -> PropertySchema {
    string()
}
fn reason_str() -> PropertySchema {
    string()
}
fn filters_arr() -> PropertySchema {
    array(None)
}

static SCHEMAS: Lazy<HashMap<&'static str, Schema>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "AUTHENTICATE",
        Schema {
            required: &["apiKey"],
            properties: &[("apiKey", api_key_str as PropertySchemaFn)],
        },
    );
    m.insert(
        "LOGOUT",
        Schema {
            required: &[],
            properties: &[("reason", reason_str as PropertySchemaFn)],
        },
    );
    m.insert(
        "SESSION_VALID",
        Schema {
            required: &["token"],
            properties: &[("token", token_str as PropertySchemaFn)],
        },
    );
    m.insert(
        "START_SCAN",
        Schema {
            required: &[],
            properties: &[("filters", filters_arr as PropertySchemaFn)],
        },
    );
    m.insert(
        "STOP_SCAN",
        Schema {
            required: &[],
            properties: &[],
        },
    );
    m.insert(
        "CONNECT",
        Schema {
            required: &["deviceId"],
            properties: &[("deviceId", device_id_str as PropertySchemaFn)],
        },
    );
    m.insert(
        "DISCONNECT",
        Schema {
            required: &["deviceId"],
            properties: &[("deviceId", device_id_str as PropertySchemaFn)],
        },
    );
    m.insert(
        "CHARACTERISTIC_READ",
        Schema {
            required: &["deviceId", "serviceUuid", "characteristicUuid"],
            properties: &[
                ("deviceId", device_id_str as PropertySchemaFn),
                ("serviceUuid", service_uuid_str as PropertySchemaFn),
                ("characteristicUuid", characteristic_uuid_str as PropertySchemaFn),
            ],
        },
    );
    m.insert(
        "CHARACTERISTIC_WRITE",
        Schema {
            required: &["deviceId", "serviceUuid", "characteristicUuid", "value"],
            properties: &[
                ("deviceId", device_id_str as PropertySchemaFn),
                ("serviceUuid", service_uuid_str as PropertySchemaFn),
                ("characteristicUuid", characteristic_uuid_str as PropertySchemaFn),
                ("value", value_str as PropertySchemaFn),
            ],
        },
    );
    m
});

/// In-memory authoritative schema store, registered at init.
pub struct SchemaStore;

impl SchemaStore {
    pub fn get(message_type: &str) -> Option<&'static Schema> {
        SCHEMAS.get(message_type)
    }
}
