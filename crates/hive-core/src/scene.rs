//! Scene collaborator interface and the in-memory scene
//!
//! The pipeline never touches host scene nodes directly. Every entity it
//! creates goes through [`Scene`], and is remembered by the owning layer as
//! an [`EntityId`]. Transforms are tracked in world space; parenting only
//! organises the hierarchy.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::math::Transform;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),
    #[error("Binding not found: {0}")]
    BindingNotFound(BindingId),
    #[error("Cannot parent {child} under {parent}: would create a cycle")]
    ParentCycle { child: EntityId, parent: EntityId },
    #[error("Binding on {0} has no drivers")]
    EmptyBinding(EntityId),
}

/// Handle to an entity created in the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a constraint-like binding between entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingId(pub Uuid);

impl BindingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an entity represents in the rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Group,
    Guide,
    GuideShape,
    Joint,
    Input,
    Output,
    Control,
}

impl EntityKind {
    /// Logical value of the `type` naming field
    pub fn type_token(self) -> &'static str {
        match self {
            EntityKind::Group => "group",
            EntityKind::Guide => "guide",
            EntityKind::GuideShape => "guideShape",
            EntityKind::Joint => "joint",
            EntityKind::Input => "input",
            EntityKind::Output => "output",
            EntityKind::Control => "control",
        }
    }

    /// Naming rule used for entities of this kind
    pub fn naming_rule(self) -> &'static str {
        match self {
            EntityKind::Group => "layerHrc",
            EntityKind::Guide => "guideName",
            EntityKind::GuideShape => "guideShapeName",
            EntityKind::Joint => "jointName",
            EntityKind::Input => "inputName",
            EntityKind::Output => "outputName",
            EntityKind::Control => "controlName",
        }
    }
}

/// Kind of binding created between entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingKind {
    Parent,
    Point,
    Orient,
    Scale,
    Aim,
    Matrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Request to create an entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpec {
    pub name: String,
    pub kind: EntityKind,
    pub parent: Option<EntityId>,
    pub transform: Transform,
    pub shape: Option<String>,
}

/// Request to bind a driven entity to one or more drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub kind: BindingKind,
    pub drivers: Vec<EntityId>,
    pub driven: EntityId,
    pub maintain_offset: bool,
}

/// The narrow interface the pipeline uses to reach the host scene
pub trait Scene {
    fn create_entity(&mut self, spec: EntitySpec) -> Result<EntityId, SceneError>;

    /// Delete an entity, its descendants and every binding touching them
    fn delete_entity(&mut self, id: EntityId) -> Result<(), SceneError>;

    fn exists(&self, id: EntityId) -> bool;

    fn rename(&mut self, id: EntityId, name: &str) -> Result<(), SceneError>;

    fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) -> Result<(), SceneError>;

    fn world_transform(&self, id: EntityId) -> Result<Transform, SceneError>;

    fn set_world_transform(&mut self, id: EntityId, transform: &Transform)
        -> Result<(), SceneError>;

    fn create_binding(&mut self, spec: BindingSpec) -> Result<BindingId, SceneError>;

    fn delete_binding(&mut self, id: BindingId) -> Result<(), SceneError>;

    fn set_attribute(
        &mut self,
        id: EntityId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), SceneError>;
}

/// Entity stored by [`MemoryScene`]
#[derive(Debug, Clone, PartialEq)]
pub struct SceneEntity {
    pub name: String,
    pub kind: EntityKind,
    pub parent: Option<EntityId>,
    pub transform: Transform,
    pub shape: Option<String>,
    pub attributes: HashMap<String, AttributeValue>,
}

/// In-memory scene arena
#[derive(Debug, Clone, Default)]
pub struct MemoryScene {
    entities: HashMap<EntityId, SceneEntity>,
    bindings: HashMap<BindingId, BindingSpec>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: EntityId) -> Option<&SceneEntity> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn binding(&self, id: BindingId) -> Option<&BindingSpec> {
        self.bindings.get(&id)
    }

    /// All bindings that drive the given entity
    pub fn bindings_driving(&self, driven: EntityId) -> Vec<&BindingSpec> {
        self.bindings.values().filter(|b| b.driven == driven).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(id, _)| *id)
    }

    pub fn children(&self, id: EntityId) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, e)| e.parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }

    fn descendants(&self, id: EntityId) -> HashSet<EntityId> {
        let mut found = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if found.insert(current) {
                stack.extend(self.children(current));
            }
        }
        found
    }

    fn get_mut(&mut self, id: EntityId) -> Result<&mut SceneEntity, SceneError> {
        self.entities
            .get_mut(&id)
            .ok_or(SceneError::EntityNotFound(id))
    }
}

impl Scene for MemoryScene {
    fn create_entity(&mut self, spec: EntitySpec) -> Result<EntityId, SceneError> {
        if let Some(parent) = spec.parent {
            if !self.entities.contains_key(&parent) {
                return Err(SceneError::EntityNotFound(parent));
            }
        }
        let id = EntityId::new();
        self.entities.insert(
            id,
            SceneEntity {
                name: spec.name,
                kind: spec.kind,
                parent: spec.parent,
                transform: spec.transform,
                shape: spec.shape,
                attributes: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn delete_entity(&mut self, id: EntityId) -> Result<(), SceneError> {
        if !self.entities.contains_key(&id) {
            return Err(SceneError::EntityNotFound(id));
        }
        let doomed = self.descendants(id);
        self.entities.retain(|eid, _| !doomed.contains(eid));
        self.bindings.retain(|_, b| {
            !doomed.contains(&b.driven) && !b.drivers.iter().any(|d| doomed.contains(d))
        });
        Ok(())
    }

    fn exists(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    fn rename(&mut self, id: EntityId, name: &str) -> Result<(), SceneError> {
        self.get_mut(id)?.name = name.to_string();
        Ok(())
    }

    fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) -> Result<(), SceneError> {
        if !self.entities.contains_key(&id) {
            return Err(SceneError::EntityNotFound(id));
        }
        if let Some(parent) = parent {
            if !self.entities.contains_key(&parent) {
                return Err(SceneError::EntityNotFound(parent));
            }
            if self.descendants(id).contains(&parent) {
                return Err(SceneError::ParentCycle { child: id, parent });
            }
        }
        self.get_mut(id)?.parent = parent;
        Ok(())
    }

    fn world_transform(&self, id: EntityId) -> Result<Transform, SceneError> {
        self.entities
            .get(&id)
            .map(|e| e.transform)
            .ok_or(SceneError::EntityNotFound(id))
    }

    fn set_world_transform(
        &mut self,
        id: EntityId,
        transform: &Transform,
    ) -> Result<(), SceneError> {
        self.get_mut(id)?.transform = *transform;
        Ok(())
    }

    fn create_binding(&mut self, spec: BindingSpec) -> Result<BindingId, SceneError> {
        if spec.drivers.is_empty() {
            return Err(SceneError::EmptyBinding(spec.driven));
        }
        for id in spec.drivers.iter().chain(std::iter::once(&spec.driven)) {
            if !self.entities.contains_key(id) {
                return Err(SceneError::EntityNotFound(*id));
            }
        }
        let id = BindingId::new();
        self.bindings.insert(id, spec);
        Ok(id)
    }

    fn delete_binding(&mut self, id: BindingId) -> Result<(), SceneError> {
        self.bindings
            .remove(&id)
            .map(|_| ())
            .ok_or(SceneError::BindingNotFound(id))
    }

    fn set_attribute(
        &mut self,
        id: EntityId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), SceneError> {
        self.get_mut(id)?.attributes.insert(name.to_string(), value);
        Ok(())
    }
}
