//! Definition schema migration
//!
//! Works on raw JSON so records too old to decode into [`Definition`] can
//! still be upgraded. Steps run in order; each one is additive and leaves
//! every key it does not rename untouched. Migrating an up-to-date record is
//! a no-op, so `migrate(migrate(x)) == migrate(x)`.
//!
//! [`Definition`]: crate::definition::Definition

use semver::Version;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::definition::CURRENT_VERSION;
use crate::error::{HiveError, Result};

/// Version assumed for records without `definitionVersion`
pub const BASELINE_VERSION: &str = "1.0.0";

/// Twist joints created for legacy records that only stored `hasTwists = true`
pub const LEGACY_TWIST_COUNT: i64 = 4;

type Step = fn(&mut Map<String, Value>) -> std::result::Result<(), String>;

const STEPS: &[(&str, &str, Step)] = &[
    ("1.0.0", "1.1.0", parent_list_to_key),
    ("1.1.0", "2.0.0", structured_layers),
];

/// Upgrade a raw definition record to [`CURRENT_VERSION`]
pub fn migrate(mut value: Value) -> Result<Value> {
    let label = describe(&value);
    let failure = |reason: String| HiveError::SchemaMigrationFailure {
        component: label.clone(),
        reason,
    };

    let record = value
        .as_object_mut()
        .ok_or_else(|| failure("definition is not an object".to_string()))?;

    let current = Version::parse(CURRENT_VERSION)?;
    let mut version = record_version(record).map_err(failure)?;
    if version > current {
        return Err(failure(format!(
            "version {} is newer than supported {}",
            version, current
        )));
    }

    for (from, to, step) in STEPS {
        let from = Version::parse(from)?;
        let to = Version::parse(to)?;
        if version >= from && version < to {
            debug!(component = %label, from = %version, to = %to, "Migrating definition");
            step(record).map_err(failure)?;
            version = to;
        }
    }

    record.insert(
        "definitionVersion".to_string(),
        Value::String(current.to_string()),
    );
    Ok(value)
}

/// Whether a raw record is older than the current schema
pub fn needs_migration(value: &Value) -> bool {
    let Some(record) = value.as_object() else {
        return true;
    };
    match (record_version(record), Version::parse(CURRENT_VERSION)) {
        (Ok(version), Ok(current)) => version < current,
        _ => true,
    }
}

/// Best-effort `name:side` label for messages about raw records
pub(crate) fn describe(value: &Value) -> String {
    let field = |k: &str| value.get(k).and_then(Value::as_str).unwrap_or("?");
    format!("{}:{}", field("name"), field("side"))
}

fn record_version(record: &Map<String, Value>) -> std::result::Result<Version, String> {
    let raw = match record.get("definitionVersion") {
        None | Some(Value::Null) => BASELINE_VERSION.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(format!("unreadable definitionVersion {}", other)),
    };
    let cleaned = clean_version_string(&raw);
    Version::parse(&cleaned).map_err(|e| format!("invalid definitionVersion '{}': {}", raw, e))
}

/// Normalise loose version strings: strip a `v` prefix and pad to three parts
fn clean_version_string(version: &str) -> String {
    let mut v = version.trim();
    if v.starts_with('v') || v.starts_with('V') {
        v = &v[1..];
    }
    // keep pre-release and build metadata intact
    let (core, suffix) = match v.find(['-', '+']) {
        Some(index) => v.split_at(index),
        None => (v, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    format!("{}{}", parts.join("."), suffix)
}

/// 1.0.0 stored the parent as a `[name, side]` pair
fn parent_list_to_key(record: &mut Map<String, Value>) -> std::result::Result<(), String> {
    let Some(parent) = record.get_mut("parent") else {
        return Ok(());
    };
    if let Value::Array(items) = parent {
        *parent = match items.as_slice() {
            [] => Value::Null,
            [Value::String(name), Value::String(side)] => Value::String(format!("{}:{}", name, side)),
            _ => {
                return Err(format!(
                    "parent must be a [name, side] pair, got {} items",
                    items.len()
                ))
            }
        };
    }
    Ok(())
}

/// 2.0.0 layers are ordered lists, guides use named mirror behaviours,
/// connections are a record and twist support is a count
fn structured_layers(record: &mut Map<String, Value>) -> std::result::Result<(), String> {
    for layer in ["deformLayer", "inputLayer", "outputLayer", "rigLayer"] {
        if let Some(section) = record.get_mut(layer).and_then(Value::as_object_mut) {
            keyed_to_list(section, "entities")?;
        }
    }

    if let Some(guide_layer) = record.get_mut("guideLayer").and_then(Value::as_object_mut) {
        keyed_to_list(guide_layer, "guides")?;
        if let Some(guides) = guide_layer.get_mut("guides").and_then(Value::as_array_mut) {
            for guide in guides.iter_mut().filter_map(Value::as_object_mut) {
                if let Some(behaviour) = guide.get_mut("mirrorBehaviour") {
                    if let Some(n) = behaviour.as_i64() {
                        *behaviour = match n {
                            0 => json!("Behaviour"),
                            1 => json!("Relative"),
                            _ => return Err(format!("unknown mirrorBehaviour {}", n)),
                        };
                    }
                }
            }
        }
        if let Some(settings) = guide_layer.get_mut("settings").and_then(Value::as_object_mut) {
            if let Some(has_twists) = settings.remove("hasTwists") {
                let count = if has_twists.as_bool().unwrap_or(false) {
                    LEGACY_TWIST_COUNT
                } else {
                    0
                };
                settings.entry("twistCount").or_insert(json!(count));
            }
        }
    }

    if let Some(connections) = record.get_mut("connections") {
        if connections.is_array() {
            let constraints = connections.take();
            *connections = json!({ "id": "root", "constraints": constraints });
        }
    }
    Ok(())
}

/// Turn `{ "id": {..} }` maps into `[{ "id": "id", .. }]` lists, preserving order
fn keyed_to_list(section: &mut Map<String, Value>, key: &str) -> std::result::Result<(), String> {
    let Some(entries) = section.get_mut(key) else {
        return Ok(());
    };
    if let Value::Object(map) = entries {
        let mut list = Vec::with_capacity(map.len());
        for (id, entry) in std::mem::take(map) {
            let Value::Object(mut fields) = entry else {
                return Err(format!("{} entry '{}' is not an object", key, id));
            };
            fields.entry("id").or_insert(Value::String(id));
            list.push(Value::Object(fields));
        }
        *entries = Value::Array(list);
    }
    Ok(())
}
