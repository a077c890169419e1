//! Templates: named snapshots of component definitions plus configuration
//!
//! Loading is done in two passes. Components are created first with their
//! references held back, then every `parent` and connection target is
//! remapped onto the components that were actually created. References that
//! cannot be resolved, or that would close a parent loop, are reported and
//! dropped.
//!
//! A destructive update keeps deformation joints alive across the rebuild:
//! joints are captured by role before the rig is torn down and handed to the
//! new components of the same `name:side`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::RigConfig;
use crate::definition::{ComponentKey, Definition, LayerKind, RoleRef};
use crate::error::{HiveError, Result};
use crate::hooks::{BuildScriptEntry, Hook, PropertyValue};
use crate::layer::EntityRecord;
use crate::migrate;
use crate::naming::DEFAULT_PRESET;
use crate::rig::Rig;
use crate::scene::Scene;

/// Configuration subset stored with a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    /// Script id to property overrides, in dispatch order
    #[serde(default)]
    pub build_scripts: IndexMap<String, IndexMap<String, PropertyValue>>,
    #[serde(default = "default_preset")]
    pub naming_preset: String,
}

fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            build_scripts: IndexMap::new(),
            naming_preset: default_preset(),
        }
    }
}

impl TemplateConfig {
    pub fn from_rig_config(config: &RigConfig) -> Self {
        Self {
            build_scripts: config
                .build_scripts
                .iter()
                .map(|e| (e.id.clone(), e.properties.clone()))
                .collect(),
            naming_preset: config.naming_preset.clone(),
        }
    }

    /// `base` with this template's scripts and naming preset
    pub fn apply_to(&self, base: &RigConfig) -> RigConfig {
        let mut config = base.clone();
        config.naming_preset = self.naming_preset.clone();
        config.build_scripts = self
            .build_scripts
            .iter()
            .map(|(id, properties)| BuildScriptEntry {
                id: id.clone(),
                properties: properties.clone(),
            })
            .collect();
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    /// Raw component records; migrated when loaded
    #[serde(default)]
    pub components: Option<Vec<Value>>,
    #[serde(default)]
    pub config: TemplateConfig,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl Template {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    fn records(&self) -> Result<&[Value]> {
        self.components
            .as_deref()
            .ok_or_else(|| HiveError::TemplateMissingComponents(Vec::new()))
    }

    /// `name:side` of every record, read without decoding the whole record
    pub fn component_keys(&self) -> Result<Vec<ComponentKey>> {
        Ok(self.records()?.iter().filter_map(raw_key).collect())
    }
}

fn raw_key(record: &Value) -> Option<ComponentKey> {
    let name = record.get("name")?.as_str()?;
    let side = record.get("side")?.as_str()?;
    Some(ComponentKey::new(name, side))
}

/// How a template is applied to a rig
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    /// Template component key to the key it is loaded as
    pub remapping: IndexMap<ComponentKey, ComponentKey>,
    /// Replace the rig's build scripts and naming preset with the template's
    pub apply_config: bool,
}

impl LoadOptions {
    fn target(&self, key: &ComponentKey) -> ComponentKey {
        self.remapping.get(key).cloned().unwrap_or_else(|| key.clone())
    }
}

/// What a load did
#[derive(Debug, Default)]
pub struct LoadReport {
    pub created: Vec<ComponentKey>,
    pub updated: Vec<ComponentKey>,
    /// Records that could not be turned into components
    pub failures: Vec<(String, HiveError)>,
    /// References dropped in the remapping pass
    pub unresolved: Vec<HiveError>,
}

impl LoadReport {
    pub fn loaded(&self) -> impl Iterator<Item = &ComponentKey> {
        self.created.iter().chain(self.updated.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateValidation {
    pub missing_components: Vec<ComponentKey>,
}

impl UpdateValidation {
    pub fn is_blocking(&self) -> bool {
        !self.missing_components.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub load: LoadReport,
    /// Deform entities handed to the rebuilt component, by role
    pub preserved: Vec<(ComponentKey, String)>,
    /// Captured deform entities with nowhere to go; deleted
    pub discarded: Vec<(ComponentKey, String)>,
}

/// Snapshot `keys` (every component when `None`) with definitions synced
/// from the scene, parents first
pub fn save(rig: &Rig, scene: &dyn Scene, name: &str, keys: Option<&[ComponentKey]>) -> Result<Template> {
    let selected: Vec<ComponentKey> = match keys {
        Some(keys) => {
            for key in keys {
                if !rig.contains(key) {
                    return Err(HiveError::UnknownComponent(key.to_string()));
                }
            }
            rig.topological_order()
                .into_iter()
                .filter(|k| keys.contains(k))
                .collect()
        }
        None => rig.topological_order(),
    };

    let mut components = Vec::with_capacity(selected.len());
    for key in &selected {
        if let Some(component) = rig.component(key) {
            components.push(component.sync_definition(scene).to_value()?);
        }
    }
    let mut metadata = serde_json::Map::new();
    metadata.insert("rig".to_string(), Value::String(rig.name().to_string()));

    info!(template = name, components = components.len(), "Saved template");
    Ok(Template {
        name: name.to_string(),
        components: Some(components),
        config: TemplateConfig::from_rig_config(rig.config()),
        metadata,
    })
}

/// Held-back references of one loaded component
struct PendingReferences {
    key: ComponentKey,
    parent: Option<String>,
    definition: Definition,
}

/// Create or update the template's components on `rig`, then remap their
/// references onto the created components
pub fn load_from_template(
    rig: &mut Rig,
    scene: &mut dyn Scene,
    template: &Template,
    options: &LoadOptions,
) -> Result<LoadReport> {
    let records = template.records()?;
    if options.apply_config {
        rig.set_config(template.config.apply_to(rig.config()))?;
    }

    let mut report = LoadReport::default();
    let mut key_map: HashMap<ComponentKey, ComponentKey> = HashMap::new();
    let mut pending: Vec<PendingReferences> = Vec::new();

    for record in records {
        let label = migrate::describe(record);
        let mut definition = match Definition::from_value(record.clone()) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(component = %label, error = %e, "Skipping template component");
                report.failures.push((label, e));
                continue;
            }
        };
        if let Err(e) = rig.registry().get(&definition.component_type) {
            report.failures.push((label, e));
            continue;
        }
        let template_key = definition.key();
        let key = options.target(&template_key);
        if key_map.values().any(|k| k == &key) {
            report
                .failures
                .push((label, HiveError::DuplicateComponent(key.to_string())));
            continue;
        }
        key_map.insert(template_key, key.clone());

        definition.name = key.name.clone();
        definition.side = key.side.clone();
        let parent = definition.parent.take();
        let held = definition.clone();
        definition.connections.constraints.clear();

        let (key, created) = rig.upsert_definition(scene, definition)?;
        if created {
            report.created.push(key.clone());
        } else {
            report.updated.push(key.clone());
        }
        pending.push(PendingReferences {
            key,
            parent,
            definition: held,
        });
    }

    // second pass: references now point at what was created
    let resolve = |reference: &ComponentKey, rig: &Rig| -> Option<ComponentKey> {
        key_map
            .get(reference)
            .cloned()
            .or_else(|| rig.contains(reference).then(|| reference.clone()))
    };
    for item in pending {
        let parent = match item.parent.as_deref().map(str::parse::<ComponentKey>) {
            None => None,
            Some(Err(e)) => {
                report.unresolved.push(HiveError::InvalidParentAssignment(format!(
                    "{}: {}",
                    item.key, e
                )));
                None
            }
            Some(Ok(reference)) => match resolve(&reference, &*rig) {
                Some(parent) if rig.would_cycle(&item.key, &parent) => {
                    report.unresolved.push(HiveError::InvalidParentAssignment(format!(
                        "{} cannot be parented under {}: reference loop",
                        item.key, parent
                    )));
                    None
                }
                Some(parent) => Some(parent),
                None => {
                    report.unresolved.push(HiveError::InvalidParentAssignment(format!(
                        "{} references unknown parent {}",
                        item.key, reference
                    )));
                    None
                }
            },
        };

        // targets must name roles on the resolved parent
        let mut connections = item.definition.connections.clone();
        for constraint in &mut connections.constraints {
            let mut targets = Vec::with_capacity(constraint.targets.len());
            for target in &constraint.targets {
                let remapped = target
                    .parse::<RoleRef>()
                    .ok()
                    .and_then(|role| resolve(&role.key, &*rig).map(|k| RoleRef::new(k, role.role)));
                match remapped {
                    Some(role) if parent.as_ref() == Some(&role.key) => targets.push(role.to_string()),
                    Some(role) => report.unresolved.push(HiveError::InvalidParentAssignment(format!(
                        "{} connection target '{}' is not on its parent",
                        item.key, role
                    ))),
                    None => report.unresolved.push(HiveError::InvalidParentAssignment(format!(
                        "{} connection target '{}' does not resolve",
                        item.key, target
                    ))),
                }
            }
            constraint.targets = targets;
        }
        connections.constraints.retain(|c| !c.targets.is_empty());

        if let Some(component) = rig.component_mut(&item.key) {
            let definition = component.definition_mut();
            definition.parent = parent.map(|p| p.to_string());
            definition.connections = connections;
        }
    }

    for problem in &report.unresolved {
        warn!(template = %template.name, error = %problem, "Dropped template reference");
    }
    info!(
        template = %template.name,
        created = report.created.len(),
        updated = report.updated.len(),
        failed = report.failures.len(),
        "Loaded template"
    );
    Ok(report)
}

/// Components on `rig` that the template would not bring back
pub fn validate_update_rig_from_template(
    rig: &Rig,
    template: &Template,
    options: &LoadOptions,
) -> Result<UpdateValidation> {
    let incoming: Vec<ComponentKey> = template
        .component_keys()?
        .iter()
        .map(|k| options.target(k))
        .collect();
    let missing_components = rig
        .keys()
        .into_iter()
        .filter(|k| !incoming.contains(k))
        .collect();
    Ok(UpdateValidation { missing_components })
}

/// Tear the rig down and load the template fresh, keeping deform joints
/// whose role exists on the rebuilt component of the same `name:side`
pub fn update_rig_from_template(
    rig: &mut Rig,
    scene: &mut dyn Scene,
    template: &Template,
    options: &LoadOptions,
) -> Result<UpdateReport> {
    let validation = validate_update_rig_from_template(rig, template, options)?;
    if validation.is_blocking() {
        return Err(HiveError::TemplateMissingComponents(
            validation
                .missing_components
                .iter()
                .map(ComponentKey::to_string)
                .collect(),
        ));
    }
    if options.apply_config {
        rig.validate_config(&template.config.apply_to(rig.config()))?;
    }

    let keys = rig.keys();
    rig.dispatch_hook(Hook::PreDeleteRig, &keys, scene)?;

    // capture joints by role and detach them so the teardown leaves them be
    let mut captured: HashMap<ComponentKey, Vec<(String, EntityRecord)>> = HashMap::new();
    for key in &keys {
        let Some(component) = rig.component_mut(key) else {
            continue;
        };
        component.read_guides_from_scene(&*scene);
        let mapping = component.id_mapping();
        let mut joints = Vec::new();
        for record in component.layers().deform.records() {
            let role = mapping
                .role_for(LayerKind::Deform, &record.id)
                .unwrap_or(record.id.as_str())
                .to_string();
            joints.push((role, record.clone()));
        }
        for binding in component.layers().deform.bindings().to_vec() {
            if let Err(e) = scene.delete_binding(binding) {
                debug!(binding = %binding, error = %e, "Binding already gone");
            }
        }
        let deform = &mut component.layers_mut().deform;
        deform.retain(|_| false);
        deform.retain_bindings(|_| false);
        for (_, record) in &joints {
            if scene.exists(record.entity) {
                scene.set_parent(record.entity, None)?;
            }
        }
        if !joints.is_empty() {
            captured.insert(key.clone(), joints);
        }
    }

    rig.remove_components(scene, &keys)?;
    let load = load_from_template(rig, scene, template, options)?;

    let mut report = UpdateReport::default();
    for (key, joints) in captured {
        let component = rig.component_mut(&key);
        let (mapping, known): (Option<_>, Vec<String>) = match &component {
            Some(c) => (
                Some(c.id_mapping()),
                c.definition().deform_layer.ids().map(str::to_string).collect(),
            ),
            None => (None, Vec::new()),
        };
        let mut adopted = Vec::new();
        for (role, mut record) in joints {
            let local = mapping
                .as_ref()
                .and_then(|m| m.resolve(LayerKind::Deform, &role))
                .unwrap_or(role.as_str())
                .to_string();
            if mapping.is_some() && known.contains(&local) && scene.exists(record.entity) {
                record.id = local;
                adopted.push(record);
                report.preserved.push((key.clone(), role));
            } else {
                if scene.exists(record.entity) {
                    scene.delete_entity(record.entity)?;
                }
                report.discarded.push((key.clone(), role));
            }
        }
        if let Some(component) = component {
            for record in adopted {
                component.layers_mut().deform.insert(record);
            }
        }
    }

    info!(
        template = %template.name,
        preserved = report.preserved.len(),
        discarded = report.discarded.len(),
        "Updated rig from template"
    );
    report.load = load;
    Ok(report)
}
