//! Component definitions: the versioned record persisted for every component
//!
//! A definition carries five layer sections (guide, deform, input, output,
//! rig), the connection rules used to wire the component to its parent, and
//! a `name:side` parent reference. Records on disk may be older than
//! [`CURRENT_VERSION`]; [`Definition::from_value`] migrates them first.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{HiveError, Result};
use crate::guides::GuideTree;
use crate::math::Transform;
use crate::migrate;
use crate::scene::BindingKind;

/// Schema version written by this crate
pub const CURRENT_VERSION: &str = "2.0.0";

/// Identity of a component within a rig, serialized as `name:side`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentKey {
    pub name: String,
    pub side: String,
}

impl ComponentKey {
    pub fn new(name: impl Into<String>, side: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            side: side.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.side)
    }
}

impl FromStr for ComponentKey {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((name, side)) if !name.is_empty() && !side.is_empty() && !side.contains(':') => {
                Ok(Self::new(name, side))
            }
            _ => Err(HiveError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl TryFrom<String> for ComponentKey {
    type Error = HiveError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ComponentKey> for String {
    fn from(key: ComponentKey) -> Self {
        key.to_string()
    }
}

/// A role on a specific component, written `name:side:role`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleRef {
    pub key: ComponentKey,
    pub role: String,
}

impl RoleRef {
    pub fn new(key: ComponentKey, role: impl Into<String>) -> Self {
        Self {
            key,
            role: role.into(),
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.role)
    }
}

impl FromStr for RoleRef {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(side), Some(role))
                if !name.is_empty() && !side.is_empty() && !role.is_empty() =>
            {
                Ok(Self::new(ComponentKey::new(name, side), role))
            }
            _ => Err(HiveError::InvalidIdentifier(s.to_string())),
        }
    }
}

/// The five layer sections of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayerKind {
    Guide,
    Deform,
    Input,
    Output,
    Rig,
}

impl LayerKind {
    pub const ALL: [LayerKind; 5] = [
        LayerKind::Guide,
        LayerKind::Deform,
        LayerKind::Input,
        LayerKind::Output,
        LayerKind::Rig,
    ];

    /// Record key and logical value of the `layerType` naming field
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Guide => "guideLayer",
            LayerKind::Deform => "deformLayer",
            LayerKind::Input => "inputLayer",
            LayerKind::Output => "outputLayer",
            LayerKind::Rig => "rigLayer",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric, boolean or string setting stored on a layer or entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Float(f) => Some(*f as i64),
            SettingValue::Bool(b) => Some(i64::from(*b)),
            SettingValue::Text(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Serialized description of one entity in a deform, input, output or rig layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Local id of the parent entity in the same layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, SettingValue>,
}

impl EntityDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            parent: None,
            transform: Transform::IDENTITY,
            shape: None,
            attributes: IndexMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.shape = Some(shape.into());
        self
    }
}

/// Ordered entity descriptors of one layer plus layer-wide settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDefinition {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub settings: IndexMap<String, SettingValue>,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
}

impl LayerDefinition {
    pub fn get(&self, id: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut EntityDescriptor> {
        self.entities.iter_mut().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Replace the descriptor with the same id, or append it
    pub fn upsert(&mut self, descriptor: EntityDescriptor) {
        match self.get_mut(&descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => self.entities.push(descriptor),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityDescriptor> {
        let index = self.entities.iter().position(|e| e.id == id)?;
        Some(self.entities.remove(index))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.id.as_str())
    }
}

/// Guide section: the guide tree plus component-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideLayerDefinition {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub settings: IndexMap<String, SettingValue>,
    #[serde(default)]
    pub guides: GuideTree,
}

/// One wiring rule: bind the driven input to targets on upstream components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConstraint {
    #[serde(rename = "type")]
    pub kind: BindingKind,
    #[serde(default = "default_true")]
    pub maintain_offset: bool,
    /// `name:side:role` references to upstream outputs
    #[serde(default)]
    pub targets: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ConnectionConstraint {
    pub fn new(kind: BindingKind, targets: Vec<String>) -> Self {
        Self {
            kind,
            maintain_offset: true,
            targets,
        }
    }
}

/// Connection rules driving one input role of the component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connections {
    /// Input-layer role driven by the constraints
    #[serde(default = "default_connection_id")]
    pub id: String,
    #[serde(default)]
    pub constraints: Vec<ConnectionConstraint>,
}

fn default_connection_id() -> String {
    "root".to_string()
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            id: default_connection_id(),
            constraints: Vec::new(),
        }
    }
}

impl Connections {
    /// Every target reference across all constraints
    pub fn targets(&self) -> impl Iterator<Item = &String> {
        self.constraints.iter().flat_map(|c| c.targets.iter())
    }
}

/// The persisted record of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub definition_version: String,
    pub name: String,
    pub side: String,
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub connections: Connections,
    #[serde(default)]
    pub guide_layer: GuideLayerDefinition,
    #[serde(default)]
    pub deform_layer: LayerDefinition,
    #[serde(default)]
    pub input_layer: LayerDefinition,
    #[serde(default)]
    pub output_layer: LayerDefinition,
    #[serde(default)]
    pub rig_layer: LayerDefinition,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Definition {
    pub fn new(
        name: impl Into<String>,
        side: impl Into<String>,
        component_type: impl Into<String>,
    ) -> Self {
        Self {
            definition_version: CURRENT_VERSION.to_string(),
            name: name.into(),
            side: side.into(),
            component_type: component_type.into(),
            parent: None,
            connections: Connections::default(),
            guide_layer: GuideLayerDefinition::default(),
            deform_layer: LayerDefinition::default(),
            input_layer: LayerDefinition::default(),
            output_layer: LayerDefinition::default(),
            rig_layer: LayerDefinition::default(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.name.clone(), self.side.clone())
    }

    pub fn parent_key(&self) -> Result<Option<ComponentKey>> {
        self.parent.as_deref().map(str::parse).transpose()
    }

    /// Migrate a raw record to the current schema and decode it
    pub fn from_value(value: Value) -> Result<Self> {
        let label = migrate::describe(&value);
        let migrated = migrate::migrate(value).map_err(|e| match e {
            HiveError::SchemaMigrationFailure { .. } => e,
            other => HiveError::SchemaMigrationFailure {
                component: label.clone(),
                reason: other.to_string(),
            },
        })?;
        serde_json::from_value(migrated).map_err(|e| HiveError::SchemaMigrationFailure {
            component: label,
            reason: e.to_string(),
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(content)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Entity layer section; the guide layer has its own shape
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerDefinition> {
        match kind {
            LayerKind::Guide => None,
            LayerKind::Deform => Some(&self.deform_layer),
            LayerKind::Input => Some(&self.input_layer),
            LayerKind::Output => Some(&self.output_layer),
            LayerKind::Rig => Some(&self.rig_layer),
        }
    }

    pub fn layer_mut(&mut self, kind: LayerKind) -> Option<&mut LayerDefinition> {
        match kind {
            LayerKind::Guide => None,
            LayerKind::Deform => Some(&mut self.deform_layer),
            LayerKind::Input => Some(&mut self.input_layer),
            LayerKind::Output => Some(&mut self.output_layer),
            LayerKind::Rig => Some(&mut self.rig_layer),
        }
    }

    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.guide_layer.settings.get(name)
    }

    pub fn setting_i64(&self, name: &str, default: i64) -> i64 {
        self.setting(name).and_then(SettingValue::as_i64).unwrap_or(default)
    }

    pub fn setting_bool(&self, name: &str, default: bool) -> bool {
        self.setting(name).and_then(SettingValue::as_bool).unwrap_or(default)
    }

    /// Components referenced by the parent field or any connection target
    pub fn referenced_keys(&self) -> Vec<ComponentKey> {
        let mut keys: Vec<ComponentKey> = Vec::new();
        let parent = self.parent.as_deref().and_then(|p| p.parse().ok());
        let targets = self
            .connections
            .targets()
            .filter_map(|t| t.parse::<RoleRef>().ok().map(|r| r.key));
        for key in parent.into_iter().chain(targets) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Point every reference to `old` at `new` instead
    pub fn rewrite_references(&mut self, old: &ComponentKey, new: &ComponentKey) {
        if self.parent.as_deref().and_then(|p| p.parse::<ComponentKey>().ok()).as_ref() == Some(old)
        {
            self.parent = Some(new.to_string());
        }
        for constraint in &mut self.connections.constraints {
            for target in &mut constraint.targets {
                if let Ok(role) = target.parse::<RoleRef>() {
                    if &role.key == old {
                        *target = RoleRef::new(new.clone(), role.role).to_string();
                    }
                }
            }
        }
    }

    /// Drop the parent and any connection targeting `key`
    pub fn clear_references_to(&mut self, key: &ComponentKey) {
        if self.parent_key().ok().flatten().as_ref() == Some(key) {
            self.parent = None;
        }
        for constraint in &mut self.connections.constraints {
            constraint
                .targets
                .retain(|t| t.parse::<RoleRef>().map(|r| &r.key != key).unwrap_or(true));
        }
        self.connections.constraints.retain(|c| !c.targets.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_key_parse() {
        let key: ComponentKey = "arm:L".parse().unwrap();
        assert_eq!(key, ComponentKey::new("arm", "L"));
        assert_eq!(key.to_string(), "arm:L");
        assert!("arm".parse::<ComponentKey>().is_err());
        assert!(":L".parse::<ComponentKey>().is_err());
        assert!("arm:L:root".parse::<ComponentKey>().is_err());
    }

    #[test]
    fn test_role_ref_parse() {
        let role: RoleRef = "arm:L:end".parse().unwrap();
        assert_eq!(role.key, ComponentKey::new("arm", "L"));
        assert_eq!(role.role, "end");
        assert_eq!(role.to_string(), "arm:L:end");
        assert!("arm:L".parse::<RoleRef>().is_err());
    }

    #[test]
    fn test_definition_round_trip() {
        let mut def = Definition::new("arm", "L", "vchain");
        def.parent = Some("root:M".into());
        def.deform_layer.upsert(EntityDescriptor::new("upr"));
        def.deform_layer.upsert(EntityDescriptor::new("mid").with_parent("upr"));
        def.connections
            .constraints
            .push(ConnectionConstraint::new(BindingKind::Parent, vec!["root:M:root".into()]));

        let value = def.to_value().unwrap();
        assert_eq!(value["definitionVersion"], CURRENT_VERSION);
        assert_eq!(value["type"], "vchain");
        assert_eq!(value["connections"]["constraints"][0]["type"], "parent");

        let back = Definition::from_value(value).unwrap();
        assert_eq!(back, def);
        assert_eq!(back.parent_key().unwrap(), Some(ComponentKey::new("root", "M")));
    }

    #[test]
    fn test_from_value_migrates_legacy_record() {
        let legacy = json!({
            "name": "arm",
            "side": "L",
            "type": "fkchain",
            "parent": ["root", "M"],
        });
        let def = Definition::from_value(legacy).unwrap();
        assert_eq!(def.definition_version, CURRENT_VERSION);
        assert_eq!(def.parent.as_deref(), Some("root:M"));
    }

    #[test]
    fn test_from_value_reports_component() {
        let future = json!({"definitionVersion": "9.0.0", "name": "arm", "side": "L", "type": "fkchain"});
        match Definition::from_value(future).unwrap_err() {
            HiveError::SchemaMigrationFailure { component, .. } => assert_eq!(component, "arm:L"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rewrite_and_clear_references() {
        let mut def = Definition::new("hand", "L", "fkchain");
        def.parent = Some("arm:L".into());
        def.connections.constraints.push(ConnectionConstraint::new(
            BindingKind::Parent,
            vec!["arm:L:end".into(), "root:M:root".into()],
        ));
        let old = ComponentKey::new("arm", "L");
        let new = ComponentKey::new("limb", "L");

        def.rewrite_references(&old, &new);
        assert_eq!(def.parent.as_deref(), Some("limb:L"));
        assert_eq!(def.connections.constraints[0].targets[0], "limb:L:end");
        assert_eq!(def.referenced_keys(), vec![new.clone(), ComponentKey::new("root", "M")]);

        def.clear_references_to(&new);
        assert_eq!(def.parent, None);
        assert_eq!(def.connections.constraints[0].targets, vec!["root:M:root".to_string()]);
    }

    #[test]
    fn test_layer_upsert_keeps_order() {
        let mut layer = LayerDefinition::default();
        layer.upsert(EntityDescriptor::new("a"));
        layer.upsert(EntityDescriptor::new("b"));
        layer.upsert(EntityDescriptor::new("a").with_shape("circle"));
        assert_eq!(layer.ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(layer.get("a").unwrap().shape.as_deref(), Some("circle"));
        assert!(layer.remove("a").is_some());
        assert!(!layer.contains("a"));
    }
}
