//! Layers of created entities and the role mapping used to wire them
//!
//! A [`Layer`] is the arena side of a definition section: local id to the
//! scene entity created for it. Local ids are the join key for role mapping
//! and template reconciliation, so they never change across rebuilds of the
//! same component.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::definition::{ComponentKey, Definition, LayerKind, RoleRef};
use crate::error::{HiveError, Result};
use crate::scene::{BindingId, EntityId, EntityKind};

/// One entity owned by a layer
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub entity: EntityId,
    pub kind: EntityKind,
    pub name: String,
}

/// Entities and bindings created by a component for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub kind: LayerKind,
    /// Group holding every entity of the layer
    pub root: Option<EntityId>,
    entities: IndexMap<String, EntityRecord>,
    bindings: Vec<BindingId>,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            root: None,
            entities: IndexMap::new(),
            bindings: Vec::new(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.root.is_some()
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    /// Scene entity for a local id
    pub fn entity(&self, id: &str) -> Option<EntityId> {
        self.entities.get(id).map(|r| r.entity)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Add or replace a record, returning the one it replaced
    pub fn insert(&mut self, record: EntityRecord) -> Option<EntityRecord> {
        self.entities.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityRecord> {
        self.entities.shift_remove(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut EntityRecord> {
        self.entities.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn add_binding(&mut self, binding: BindingId) {
        self.bindings.push(binding);
    }

    pub fn bindings(&self) -> &[BindingId] {
        &self.bindings
    }

    /// Local id of a scene entity owned by this layer
    pub fn local_id(&self, entity: EntityId) -> Option<&str> {
        self.entities
            .values()
            .find(|r| r.entity == entity)
            .map(|r| r.id.as_str())
    }

    /// Forget everything, returning the root and entities for deletion
    pub fn clear(&mut self) -> (Option<EntityId>, Vec<EntityId>) {
        self.bindings.clear();
        let entities = self.entities.drain(..).map(|(_, r)| r.entity).collect();
        (self.root.take(), entities)
    }

    /// Keep only records whose entity satisfies `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityRecord) -> bool) {
        self.entities.retain(|_, r| keep(r));
    }

    pub fn retain_bindings(&mut self, keep: impl FnMut(&BindingId) -> bool) {
        self.bindings.retain(keep);
    }
}

/// Per-layer translation from role names to local ids
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(default)]
    pub deform: IndexMap<String, String>,
    #[serde(default)]
    pub input: IndexMap<String, String>,
    #[serde(default)]
    pub output: IndexMap<String, String>,
    #[serde(default)]
    pub rig: IndexMap<String, String>,
}

impl IdMapping {
    /// Every local id doubles as its own role
    pub fn identity(definition: &Definition) -> Self {
        let mut mapping = Self::default();
        for kind in [LayerKind::Deform, LayerKind::Input, LayerKind::Output, LayerKind::Rig] {
            let ids: Vec<String> = definition
                .layer(kind)
                .map(|layer| layer.ids().map(str::to_string).collect())
                .unwrap_or_default();
            for id in ids {
                mapping.set(kind, id.clone(), id);
            }
        }
        mapping
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&IndexMap<String, String>> {
        match kind {
            LayerKind::Guide => None,
            LayerKind::Deform => Some(&self.deform),
            LayerKind::Input => Some(&self.input),
            LayerKind::Output => Some(&self.output),
            LayerKind::Rig => Some(&self.rig),
        }
    }

    fn layer_mut(&mut self, kind: LayerKind) -> Option<&mut IndexMap<String, String>> {
        match kind {
            LayerKind::Guide => None,
            LayerKind::Deform => Some(&mut self.deform),
            LayerKind::Input => Some(&mut self.input),
            LayerKind::Output => Some(&mut self.output),
            LayerKind::Rig => Some(&mut self.rig),
        }
    }

    pub fn set(&mut self, kind: LayerKind, role: impl Into<String>, local_id: impl Into<String>) {
        if let Some(layer) = self.layer_mut(kind) {
            layer.insert(role.into(), local_id.into());
        }
    }

    /// Drop the role that currently points at `local_id`, if any
    pub fn unset_local(&mut self, kind: LayerKind, local_id: &str) {
        if let Some(layer) = self.layer_mut(kind) {
            layer.retain(|_, id| id != local_id);
        }
    }

    pub fn resolve(&self, kind: LayerKind, role: &str) -> Option<&str> {
        self.layer(kind)?.get(role).map(String::as_str)
    }

    /// Role whose local id is `local_id`
    pub fn role_for(&self, kind: LayerKind, local_id: &str) -> Option<&str> {
        self.layer(kind)?
            .iter()
            .find(|(_, id)| id.as_str() == local_id)
            .map(|(role, _)| role.as_str())
    }
}

/// Entities a component may bind its rig to, keyed `name:side:role`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionBindings {
    pub input_layer: Option<EntityId>,
    pub parent_output_layer: Option<EntityId>,
    pub bindings: IndexMap<String, EntityId>,
}

impl ConnectionBindings {
    /// Collect the component's own inputs and its parent's outputs by role.
    ///
    /// `parent` is the parent's key, output layer and mapping. Roles whose
    /// local id has no entity yet are left out.
    pub fn generate(
        key: &ComponentKey,
        inputs: &Layer,
        mapping: &IdMapping,
        parent: Option<(&ComponentKey, &Layer, &IdMapping)>,
    ) -> Self {
        let mut out = Self {
            input_layer: inputs.root,
            ..Self::default()
        };
        for (role, local) in &mapping.input {
            if let Some(entity) = inputs.entity(local) {
                out.bindings
                    .insert(RoleRef::new(key.clone(), role.clone()).to_string(), entity);
            }
        }
        if let Some((parent_key, outputs, parent_mapping)) = parent {
            out.parent_output_layer = outputs.root;
            for (role, local) in &parent_mapping.output {
                if let Some(entity) = outputs.entity(local) {
                    out.bindings
                        .insert(RoleRef::new(parent_key.clone(), role.clone()).to_string(), entity);
                }
            }
        }
        out
    }

    pub fn get(&self, reference: &str) -> Option<EntityId> {
        self.bindings.get(reference).copied()
    }

    pub fn require(&self, reference: &str) -> Result<EntityId> {
        self.get(reference)
            .ok_or_else(|| HiveError::MissingBinding(reference.to_string()))
    }
}
