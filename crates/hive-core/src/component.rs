//! Components and the per-component build state machine
//!
//! A [`Component`] pairs a [`Definition`] with the layers it has built and
//! the [`ComponentType`] strategy selected by its `type` tag. Stages move it
//! forward one state at a time:
//!
//! ```text
//! NotBuilt -> GuidesBuilt -> ControlsVisible -> SkeletonBuilt -> RigBuilt -> Polished
//! ```
//!
//! A stage that fails removes whatever it created for this component and
//! leaves the state where it was.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RigSettings;
use crate::definition::{ComponentKey, Definition, EntityDescriptor, LayerKind};
use crate::error::{HiveError, Result};
use crate::guides::{GuideRecovery, GuideTree};
use crate::hooks::Hook;
use crate::layer::{ConnectionBindings, EntityRecord, IdMapping, Layer};
use crate::math::Transform;
use crate::naming::NameResolver;
use crate::scene::{AttributeValue, BindingId, BindingSpec, EntityId, EntityKind, EntitySpec, Scene};
use crate::subsystem::Subsystem;

/// Local id suffix of guide shape nodes
pub const SHAPE_SUFFIX: &str = "_shape";

/// Build progress of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildState {
    NotBuilt,
    GuidesBuilt,
    ControlsVisible,
    SkeletonBuilt,
    RigBuilt,
    Polished,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::NotBuilt => "NotBuilt",
            BuildState::GuidesBuilt => "GuidesBuilt",
            BuildState::ControlsVisible => "ControlsVisible",
            BuildState::SkeletonBuilt => "SkeletonBuilt",
            BuildState::RigBuilt => "RigBuilt",
            BuildState::Polished => "Polished",
        };
        f.write_str(s)
    }
}

/// A forward build operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Guides,
    GuideControls,
    Deform,
    Rig,
    Polish,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Guides,
        Stage::GuideControls,
        Stage::Deform,
        Stage::Rig,
        Stage::Polish,
    ];

    pub fn operation(self) -> &'static str {
        match self {
            Stage::Guides => "buildGuides",
            Stage::GuideControls => "buildGuideControls",
            Stage::Deform => "buildDeform",
            Stage::Rig => "buildRig",
            Stage::Polish => "polish",
        }
    }

    /// State a component must be in for this stage to run
    pub fn required_state(self) -> BuildState {
        match self {
            Stage::Guides => BuildState::NotBuilt,
            Stage::GuideControls => BuildState::GuidesBuilt,
            Stage::Deform => BuildState::ControlsVisible,
            Stage::Rig => BuildState::SkeletonBuilt,
            Stage::Polish => BuildState::RigBuilt,
        }
    }

    pub fn target_state(self) -> BuildState {
        match self {
            Stage::Guides => BuildState::GuidesBuilt,
            Stage::GuideControls => BuildState::ControlsVisible,
            Stage::Deform => BuildState::SkeletonBuilt,
            Stage::Rig => BuildState::RigBuilt,
            Stage::Polish => BuildState::Polished,
        }
    }

    pub fn pre_hook(self) -> Option<Hook> {
        match self {
            Stage::Guides => Some(Hook::PreGuideBuild),
            Stage::GuideControls => None,
            Stage::Deform => Some(Hook::PreDeformBuild),
            Stage::Rig => Some(Hook::PreRigBuild),
            Stage::Polish => Some(Hook::PrePolish),
        }
    }

    pub fn post_hook(self) -> Option<Hook> {
        match self {
            Stage::Guides => Some(Hook::PostGuideBuild),
            Stage::GuideControls => None,
            Stage::Deform => Some(Hook::PostDeformBuild),
            Stage::Rig => Some(Hook::PostRigBuild),
            Stage::Polish => Some(Hook::PostPolishBuild),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "guides" | "buildGuides" => Ok(Stage::Guides),
            "controls" | "guideControls" | "buildGuideControls" => Ok(Stage::GuideControls),
            "deform" | "buildDeform" => Ok(Stage::Deform),
            "rig" | "buildRig" => Ok(Stage::Rig),
            "polish" => Ok(Stage::Polish),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Root group of a component plus its five layers
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentLayers {
    pub root: Option<EntityId>,
    pub guide: Layer,
    pub deform: Layer,
    pub input: Layer,
    pub output: Layer,
    pub rig: Layer,
}

impl Default for ComponentLayers {
    fn default() -> Self {
        Self {
            root: None,
            guide: Layer::new(LayerKind::Guide),
            deform: Layer::new(LayerKind::Deform),
            input: Layer::new(LayerKind::Input),
            output: Layer::new(LayerKind::Output),
            rig: Layer::new(LayerKind::Rig),
        }
    }
}

impl ComponentLayers {
    pub fn get(&self, kind: LayerKind) -> &Layer {
        match kind {
            LayerKind::Guide => &self.guide,
            LayerKind::Deform => &self.deform,
            LayerKind::Input => &self.input,
            LayerKind::Output => &self.output,
            LayerKind::Rig => &self.rig,
        }
    }

    pub fn get_mut(&mut self, kind: LayerKind) -> &mut Layer {
        match kind {
            LayerKind::Guide => &mut self.guide,
            LayerKind::Deform => &mut self.deform,
            LayerKind::Input => &mut self.input,
            LayerKind::Output => &mut self.output,
            LayerKind::Rig => &mut self.rig,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        [&self.guide, &self.deform, &self.input, &self.output, &self.rig].into_iter()
    }

    /// Every entity owned by the component, roots included
    pub fn entity_ids(&self) -> HashSet<EntityId> {
        let mut ids: HashSet<EntityId> = self.root.into_iter().collect();
        for layer in self.iter() {
            ids.extend(layer.root);
            ids.extend(layer.records().map(|r| r.entity));
        }
        ids
    }

    pub fn binding_ids(&self) -> HashSet<BindingId> {
        self.iter()
            .flat_map(|layer| layer.bindings().iter().copied())
            .collect()
    }
}

/// What a child needs from its parent while wiring: a detached copy of the
/// parent's outputs and role mapping
#[derive(Debug, Clone, PartialEq)]
pub struct ParentView {
    pub key: ComponentKey,
    pub mapping: IdMapping,
    pub outputs: Layer,
}

/// Everything a stage method may touch
pub struct BuildContext<'a> {
    pub scene: &'a mut dyn Scene,
    pub names: NameResolver<'a>,
    pub definition: &'a mut Definition,
    pub layers: &'a mut ComponentLayers,
    pub mapping: &'a IdMapping,
    pub parent: Option<&'a ParentView>,
    pub settings: &'a RigSettings,
}

impl<'a> BuildContext<'a> {
    pub fn key(&self) -> ComponentKey {
        self.definition.key()
    }

    /// Resolved name of an entity in one of the component's layers
    pub fn entity_name(&self, kind: EntityKind, id: &str) -> Result<String> {
        entity_name(&self.names, self.definition, kind, id)
    }

    pub fn guide_transform(&self, id: &str) -> Option<Transform> {
        self.definition.guide_layer.guides.get(id).map(|g| g.transform)
    }

    /// Guide a layer entity takes its placement from: same id, then same role
    pub fn placement_guide(&self, kind: LayerKind, id: &str) -> Option<Transform> {
        self.guide_transform(id).or_else(|| {
            self.mapping
                .role_for(kind, id)
                .and_then(|role| self.guide_transform(role))
        })
    }

    pub fn require_entity(&self, kind: LayerKind, id: &str) -> Result<EntityId> {
        self.layers
            .get(kind)
            .entity(id)
            .ok_or_else(|| HiveError::MissingBinding(format!("{}:{}:{}", self.key(), kind, id)))
    }

    /// The component root group, created on first use
    pub fn ensure_component_root(&mut self) -> Result<EntityId> {
        if let Some(root) = self.layers.root.filter(|r| self.scene.exists(*r)) {
            return Ok(root);
        }
        let name = self.names.resolve(
            "componentName",
            &[
                ("componentName", self.definition.name.as_str()),
                ("side", self.definition.side.as_str()),
                ("type", "hrc"),
            ],
        )?;
        let root = self.scene.create_entity(EntitySpec {
            name,
            kind: EntityKind::Group,
            parent: None,
            transform: Transform::IDENTITY,
            shape: None,
        })?;
        self.layers.root = Some(root);
        Ok(root)
    }

    /// A layer's group under the component root, created on first use
    pub fn ensure_layer_root(&mut self, kind: LayerKind) -> Result<EntityId> {
        if let Some(root) = self.layers.get(kind).root.filter(|r| self.scene.exists(*r)) {
            return Ok(root);
        }
        let parent = self.ensure_component_root()?;
        let name = layer_group_name(&self.names, self.definition, kind)?;
        let root = self.scene.create_entity(EntitySpec {
            name,
            kind: EntityKind::Group,
            parent: Some(parent),
            transform: Transform::IDENTITY,
            shape: None,
        })?;
        self.layers.get_mut(kind).root = Some(root);
        Ok(root)
    }

    /// Create an entity in a layer, or update the one already recorded under
    /// `id`. Entities adopted from an earlier build keep their identity.
    pub fn create_in_layer(
        &mut self,
        kind: LayerKind,
        id: &str,
        entity_kind: EntityKind,
        parent: Option<EntityId>,
        transform: Transform,
        shape: Option<String>,
    ) -> Result<EntityId> {
        let parent = match parent {
            Some(p) => p,
            None => self.ensure_layer_root(kind)?,
        };
        let name = self.entity_name(entity_kind, id)?;

        if let Some(existing) = self.layers.get(kind).get(id).map(|r| r.entity) {
            if self.scene.exists(existing) {
                self.scene.set_parent(existing, Some(parent))?;
                self.scene.set_world_transform(existing, &transform)?;
                self.scene.rename(existing, &name)?;
                if let Some(record) = self.layers.get_mut(kind).records_mut().find(|r| r.id == id) {
                    record.name = name;
                }
                return Ok(existing);
            }
        }

        let entity = self.scene.create_entity(EntitySpec {
            name: name.clone(),
            kind: entity_kind,
            parent: Some(parent),
            transform,
            shape,
        })?;
        self.layers.get_mut(kind).insert(EntityRecord {
            id: id.to_string(),
            entity,
            kind: entity_kind,
            name,
        });
        Ok(entity)
    }

    /// Create a binding and record it on a layer
    pub fn bind(&mut self, kind: LayerKind, spec: BindingSpec) -> Result<BindingId> {
        let binding = self.scene.create_binding(spec)?;
        self.layers.get_mut(kind).add_binding(binding);
        Ok(binding)
    }

    pub fn connection_bindings(&self) -> ConnectionBindings {
        generate_connection_binding_io(
            &self.key(),
            &self.layers.input,
            self.mapping,
            self.parent,
        )
    }

    /// Create entities for every descriptor of a definition layer.
    ///
    /// Placement comes from the matching guide, then `placement`, then the
    /// descriptor itself. Descriptor parents are resolved within the layer.
    pub fn build_layer_entities(
        &mut self,
        kind: LayerKind,
        entity_kind: EntityKind,
        placement: impl Fn(&BuildContext<'_>, &EntityDescriptor) -> Option<Transform>,
    ) -> Result<()> {
        let descriptors: Vec<EntityDescriptor> = self
            .definition
            .layer(kind)
            .map(|layer| layer.entities.clone())
            .unwrap_or_default();
        for descriptor in descriptors {
            let transform = self
                .placement_guide(kind, &descriptor.id)
                .or_else(|| placement(self, &descriptor))
                .unwrap_or(descriptor.transform);
            let parent = descriptor
                .parent
                .as_deref()
                .and_then(|p| self.layers.get(kind).entity(p));
            self.create_in_layer(
                kind,
                &descriptor.id,
                entity_kind,
                parent,
                transform,
                descriptor.shape.clone(),
            )?;
            if let Some(stored) = self
                .definition
                .layer_mut(kind)
                .and_then(|layer| layer.get_mut(&descriptor.id))
            {
                stored.transform = transform;
            }
        }
        Ok(())
    }
}

/// Bindings available to a component: its own inputs and its parent's outputs
pub fn generate_connection_binding_io(
    key: &ComponentKey,
    inputs: &Layer,
    mapping: &IdMapping,
    parent: Option<&ParentView>,
) -> ConnectionBindings {
    ConnectionBindings::generate(
        key,
        inputs,
        mapping,
        parent.map(|p| (&p.key, &p.outputs, &p.mapping)),
    )
}

fn entity_name(
    names: &NameResolver<'_>,
    definition: &Definition,
    kind: EntityKind,
    id: &str,
) -> Result<String> {
    let naming_id = match kind {
        EntityKind::GuideShape => id.strip_suffix(SHAPE_SUFFIX).unwrap_or(id),
        _ => id,
    };
    names.resolve(
        kind.naming_rule(),
        &[
            ("componentName", definition.name.as_str()),
            ("side", definition.side.as_str()),
            ("id", naming_id),
            ("type", kind.type_token()),
        ],
    )
}

fn layer_group_name(
    names: &NameResolver<'_>,
    definition: &Definition,
    kind: LayerKind,
) -> Result<String> {
    names.resolve(
        "layerHrc",
        &[
            ("componentName", definition.name.as_str()),
            ("side", definition.side.as_str()),
            ("layerType", kind.as_str()),
            ("type", "hrc"),
        ],
    )
}

/// Behaviour selected by a component's `type` tag.
///
/// Default methods build the layers straight from the definition; types
/// override what they need.
pub trait ComponentType: Send + Sync {
    fn type_name(&self) -> &str;

    /// Fill a fresh definition with the type's guides, layers and settings
    fn initialize(&self, definition: &mut Definition) -> Result<()>;

    /// Role names to local ids, per layer
    fn id_mapping(&self, definition: &Definition) -> IdMapping {
        IdMapping::identity(definition)
    }

    fn align_guides(&self, guides: &mut GuideTree) -> Vec<GuideRecovery> {
        guides.align()
    }

    /// Extra guide-stage work after the guide entities exist
    fn setup_guide(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
        Ok(())
    }

    fn setup_inputs(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let root_guide = ctx
            .definition
            .guide_layer
            .guides
            .root()
            .map(|g| g.transform);
        ctx.build_layer_entities(LayerKind::Input, EntityKind::Input, move |_, _| root_guide)
    }

    fn setup_deform_layer(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        ctx.build_layer_entities(LayerKind::Deform, EntityKind::Joint, |_, _| None)
    }

    /// Outputs sit on the deform joint sharing their role
    fn setup_outputs(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        ctx.build_layer_entities(LayerKind::Output, EntityKind::Output, |ctx, descriptor| {
            let role = ctx
                .mapping
                .role_for(LayerKind::Output, &descriptor.id)
                .unwrap_or(descriptor.id.as_str());
            let joint = ctx.mapping.resolve(LayerKind::Deform, role).unwrap_or(role);
            let entity = ctx.layers.deform.entity(joint)?;
            ctx.scene.world_transform(entity).ok()
        })
    }

    fn post_setup_deform(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Controls from the rig layer, wired to the joints and outputs sharing
    /// their role. Top-level controls follow the connection input.
    fn setup_rig(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        ctx.build_layer_entities(LayerKind::Rig, EntityKind::Control, |_, _| None)?;
        wire_controls(ctx)
    }

    /// Subsystems active for this definition
    fn subsystems(&self, _definition: &Definition) -> Vec<Box<dyn Subsystem>> {
        Vec::new()
    }
}

/// Bind deform joints and outputs to the controls of the same role, and
/// top-level controls to the driven input
pub fn wire_controls(ctx: &mut BuildContext<'_>) -> Result<()> {
    let mut bindings: Vec<(LayerKind, BindingSpec)> = Vec::new();
    for (role, control_id) in &ctx.mapping.rig {
        let Some(control) = ctx.layers.rig.entity(control_id) else {
            continue;
        };
        for kind in [LayerKind::Deform, LayerKind::Output] {
            let target = ctx
                .mapping
                .resolve(kind, role)
                .and_then(|local| ctx.layers.get(kind).entity(local));
            if let Some(driven) = target {
                bindings.push((
                    kind,
                    BindingSpec {
                        kind: crate::scene::BindingKind::Parent,
                        drivers: vec![control],
                        driven,
                        maintain_offset: true,
                    },
                ));
            }
        }
    }

    let input_id = ctx
        .mapping
        .resolve(LayerKind::Input, &ctx.definition.connections.id)
        .unwrap_or(ctx.definition.connections.id.as_str())
        .to_string();
    if let Some(input) = ctx.layers.input.entity(&input_id) {
        for descriptor in &ctx.definition.rig_layer.entities {
            if descriptor.parent.is_some() {
                continue;
            }
            if let Some(control) = ctx.layers.rig.entity(&descriptor.id) {
                bindings.push((
                    LayerKind::Rig,
                    BindingSpec {
                        kind: crate::scene::BindingKind::Parent,
                        drivers: vec![input],
                        driven: control,
                        maintain_offset: true,
                    },
                ));
            }
        }
    }

    for (kind, spec) in bindings {
        ctx.bind(kind, spec)?;
    }
    Ok(())
}

/// A component of a rig
pub struct Component {
    definition: Definition,
    state: BuildState,
    layers: ComponentLayers,
    behaviour: Arc<dyn ComponentType>,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("key", &self.key().to_string())
            .field("type", &self.behaviour.type_name())
            .field("state", &self.state)
            .finish()
    }
}

impl Component {
    pub fn new(definition: Definition, behaviour: Arc<dyn ComponentType>) -> Self {
        Self {
            definition,
            state: BuildState::NotBuilt,
            layers: ComponentLayers::default(),
            behaviour,
        }
    }

    pub fn key(&self) -> ComponentKey {
        self.definition.key()
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub(crate) fn definition_mut(&mut self) -> &mut Definition {
        &mut self.definition
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn layers(&self) -> &ComponentLayers {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut ComponentLayers {
        &mut self.layers
    }

    pub fn behaviour(&self) -> &Arc<dyn ComponentType> {
        &self.behaviour
    }

    pub fn id_mapping(&self) -> IdMapping {
        self.behaviour.id_mapping(&self.definition)
    }

    pub fn parent_view(&self) -> ParentView {
        ParentView {
            key: self.key(),
            mapping: self.id_mapping(),
            outputs: self.layers.output.clone(),
        }
    }

    fn transition_error(&self, stage: Stage) -> HiveError {
        HiveError::InvalidStageTransition {
            component: self.key().to_string(),
            operation: stage.operation().to_string(),
            state: self.state.to_string(),
        }
    }

    /// Check that `stage` may run now
    pub fn check_stage(&self, stage: Stage) -> Result<()> {
        if self.state == stage.required_state() {
            Ok(())
        } else {
            Err(self.transition_error(stage))
        }
    }

    /// Run one stage. On failure everything the stage created is removed and
    /// the definition and layers are put back.
    pub fn run_stage(
        &mut self,
        stage: Stage,
        scene: &mut dyn Scene,
        names: NameResolver<'_>,
        settings: &RigSettings,
        parent: Option<&ParentView>,
    ) -> Result<()> {
        self.check_stage(stage)?;
        let behaviour = self.behaviour.clone();
        let saved_definition = self.definition.clone();
        let saved_layers = self.layers.clone();
        let mapping = behaviour.id_mapping(&self.definition);
        let subsystems = behaviour.subsystems(&self.definition);

        let result = {
            let mut ctx = BuildContext {
                scene: &mut *scene,
                names,
                definition: &mut self.definition,
                layers: &mut self.layers,
                mapping: &mapping,
                parent,
                settings,
            };
            run_stage_body(stage, behaviour.as_ref(), &subsystems, &mut ctx)
        };

        match result {
            Ok(()) => {
                self.state = stage.target_state();
                info!(component = %self.key(), stage = %stage, state = %self.state, "Stage complete");
                Ok(())
            }
            Err(e) => {
                self.rollback(scene, saved_definition, saved_layers);
                Err(e)
            }
        }
    }

    fn rollback(&mut self, scene: &mut dyn Scene, definition: Definition, layers: ComponentLayers) {
        let kept_bindings = layers.binding_ids();
        for binding in self.layers.binding_ids().difference(&kept_bindings) {
            if let Err(e) = scene.delete_binding(*binding) {
                debug!(binding = %binding, error = %e, "Binding already gone during rollback");
            }
        }
        let kept = layers.entity_ids();
        for entity in self.layers.entity_ids().difference(&kept) {
            if scene.exists(*entity) {
                if let Err(e) = scene.delete_entity(*entity) {
                    debug!(entity = %entity, error = %e, "Entity already gone during rollback");
                }
            }
        }
        self.definition = definition;
        self.layers = layers;
    }

    /// Definition refreshed from the scene: guide and entity transforms are
    /// read back, entity names recorded. The component is not modified.
    pub fn sync_definition(&self, scene: &dyn Scene) -> Definition {
        let mut definition = self.definition.clone();
        for record in self.layers.guide.records() {
            if record.kind != EntityKind::Guide {
                continue;
            }
            if let (Ok(world), Some(guide)) = (
                scene.world_transform(record.entity),
                definition.guide_layer.guides.get_mut(&record.id),
            ) {
                guide.transform = world;
            }
        }
        for kind in [LayerKind::Deform, LayerKind::Input, LayerKind::Output, LayerKind::Rig] {
            for record in self.layers.get(kind).records() {
                let Ok(world) = scene.world_transform(record.entity) else {
                    continue;
                };
                if let Some(descriptor) = definition
                    .layer_mut(kind)
                    .and_then(|layer| layer.get_mut(&record.id))
                {
                    descriptor.transform = world;
                    descriptor.name = Some(record.name.clone());
                }
            }
        }
        definition
    }

    /// Push guide parents and transforms from the definition onto built
    /// guide entities
    pub fn write_guides_to_scene(&self, scene: &mut dyn Scene) -> Result<()> {
        let Some(guide_root) = self.layers.guide.root.filter(|r| scene.exists(*r)) else {
            return Ok(());
        };
        let built: Vec<(&crate::guides::Guide, EntityId)> = self
            .definition
            .guide_layer
            .guides
            .iter()
            .filter_map(|g| self.layers.guide.entity(&g.id).map(|e| (g, e)))
            .filter(|(_, e)| scene.exists(*e))
            .collect();
        // flatten first so swapped parents never form a transient cycle
        for (_, entity) in &built {
            scene.set_parent(*entity, Some(guide_root))?;
        }
        for (guide, entity) in &built {
            let parent = guide
                .parent
                .as_deref()
                .and_then(|p| self.layers.guide.entity(p))
                .unwrap_or(guide_root);
            scene.set_parent(*entity, Some(parent))?;
            scene.set_world_transform(*entity, &guide.transform)?;
        }
        Ok(())
    }

    /// Read built guide transforms back into the definition
    pub fn read_guides_from_scene(&mut self, scene: &dyn Scene) {
        for record in self.layers.guide.records() {
            if record.kind != EntityKind::Guide {
                continue;
            }
            if let (Ok(world), Some(guide)) = (
                scene.world_transform(record.entity),
                self.definition.guide_layer.guides.get_mut(&record.id),
            ) {
                guide.transform = world;
            }
        }
    }

    /// Delete a layer's entities and bindings from the scene and forget them
    pub fn delete_layer(&mut self, kind: LayerKind, scene: &mut dyn Scene) -> Result<()> {
        let layer = self.layers.get_mut(kind);
        for binding in layer.bindings().to_vec() {
            if let Err(e) = scene.delete_binding(binding) {
                debug!(binding = %binding, error = %e, "Binding already gone");
            }
        }
        let (root, entities) = layer.clear();
        for entity in entities.into_iter().chain(root) {
            if scene.exists(entity) {
                scene.delete_entity(entity)?;
            }
        }
        debug!(component = %self.key(), layer = %kind, "Deleted layer");
        Ok(())
    }

    /// Delete every layer and the component root
    pub fn delete_all(&mut self, scene: &mut dyn Scene) -> Result<()> {
        for kind in LayerKind::ALL {
            self.delete_layer(kind, scene)?;
        }
        if let Some(root) = self.layers.root.take() {
            if scene.exists(root) {
                scene.delete_entity(root)?;
            }
        }
        self.state = BuildState::NotBuilt;
        Ok(())
    }

    /// Delete the guide layer. Guide transforms are read back first so a
    /// rebuild starts where they were left. A component past the guide
    /// stages keeps its state.
    pub fn delete_guide_layer(&mut self, scene: &mut dyn Scene) -> Result<()> {
        self.read_guides_from_scene(scene);
        self.delete_layer(LayerKind::Guide, scene)?;
        if self.state <= BuildState::ControlsVisible {
            self.state = BuildState::NotBuilt;
        }
        Ok(())
    }

    /// Delete the skeleton (input, deform and output layers) and the rig
    /// layer that depends on it
    pub fn delete_deform_layer(&mut self, scene: &mut dyn Scene) -> Result<()> {
        self.delete_rig_layer(scene)?;
        for kind in [LayerKind::Output, LayerKind::Deform, LayerKind::Input] {
            self.delete_layer(kind, scene)?;
        }
        self.state = if self.layers.guide.is_built() {
            self.state.min(BuildState::ControlsVisible)
        } else {
            BuildState::NotBuilt
        };
        Ok(())
    }

    /// Delete the controls and the connection bindings made at rig time
    pub fn delete_rig_layer(&mut self, scene: &mut dyn Scene) -> Result<()> {
        self.delete_layer(LayerKind::Rig, scene)?;
        for binding in self.layers.input.bindings().to_vec() {
            if let Err(e) = scene.delete_binding(binding) {
                debug!(binding = %binding, error = %e, "Binding already gone");
            }
        }
        self.layers.input.retain_bindings(|_| false);
        if self.state >= BuildState::RigBuilt {
            self.state = BuildState::SkeletonBuilt;
        }
        Ok(())
    }

    /// Swap in a new definition of the same type, keeping built layers
    pub fn replace_definition(&mut self, definition: Definition) {
        self.definition = definition;
    }

    /// Rename every built entity after the component's name or side changed.
    /// All names are resolved before anything is renamed.
    pub fn refresh_names(&mut self, scene: &mut dyn Scene, names: &NameResolver<'_>) -> Result<()> {
        let mut renames: Vec<(EntityId, String)> = Vec::new();
        if let Some(root) = self.layers.root.filter(|r| scene.exists(*r)) {
            let name = names.resolve(
                "componentName",
                &[
                    ("componentName", self.definition.name.as_str()),
                    ("side", self.definition.side.as_str()),
                    ("type", "hrc"),
                ],
            )?;
            renames.push((root, name));
        }
        let mut record_names: Vec<(LayerKind, Vec<String>)> = Vec::new();
        for kind in LayerKind::ALL {
            let layer = self.layers.get(kind);
            if let Some(root) = layer.root.filter(|r| scene.exists(*r)) {
                renames.push((root, layer_group_name(names, &self.definition, kind)?));
            }
            let mut resolved = Vec::new();
            for record in layer.records() {
                let name = entity_name(names, &self.definition, record.kind, &record.id)?;
                if scene.exists(record.entity) {
                    renames.push((record.entity, name.clone()));
                }
                resolved.push(name);
            }
            record_names.push((kind, resolved));
        }

        for (entity, name) in renames {
            scene.rename(entity, &name)?;
        }
        for (kind, resolved) in record_names {
            for (record, name) in self.layers.get_mut(kind).records_mut().zip(resolved) {
                record.name = name;
            }
        }
        Ok(())
    }
}

fn run_stage_body(
    stage: Stage,
    behaviour: &dyn ComponentType,
    subsystems: &[Box<dyn Subsystem>],
    ctx: &mut BuildContext<'_>,
) -> Result<()> {
    match stage {
        Stage::Guides => {
            let guide_root = ctx.ensure_layer_root(LayerKind::Guide)?;
            let guides: Vec<_> = ctx.definition.guide_layer.guides.iter().cloned().collect();
            for guide in guides {
                let parent = guide
                    .parent
                    .as_deref()
                    .and_then(|p| ctx.layers.guide.entity(p))
                    .unwrap_or(guide_root);
                ctx.create_in_layer(
                    LayerKind::Guide,
                    &guide.id,
                    EntityKind::Guide,
                    Some(parent),
                    guide.transform,
                    None,
                )?;
            }
            behaviour.setup_guide(ctx)?;
            for subsystem in subsystems {
                debug!(subsystem = subsystem.name(), "Subsystem guide setup");
                subsystem.setup_guide(ctx)?;
            }
        }
        Stage::GuideControls => {
            let guides: Vec<_> = ctx.definition.guide_layer.guides.iter().cloned().collect();
            for guide in guides {
                let Some(shape) = guide.shape.clone() else {
                    continue;
                };
                let parent = ctx.require_entity(LayerKind::Guide, &guide.id)?;
                let id = format!("{}{}", guide.id, SHAPE_SUFFIX);
                ctx.create_in_layer(
                    LayerKind::Guide,
                    &id,
                    EntityKind::GuideShape,
                    Some(parent),
                    guide.transform,
                    Some(shape),
                )?;
            }
        }
        Stage::Deform => {
            // guides may have been moved in the scene since they were built
            let records: Vec<(String, EntityId)> = ctx
                .layers
                .guide
                .records()
                .filter(|r| r.kind == EntityKind::Guide)
                .map(|r| (r.id.clone(), r.entity))
                .collect();
            for (id, entity) in &records {
                let world = ctx.scene.world_transform(*entity)?;
                if let Some(guide) = ctx.definition.guide_layer.guides.get_mut(id) {
                    guide.transform = world;
                }
            }
            behaviour.align_guides(&mut ctx.definition.guide_layer.guides);
            for (id, entity) in &records {
                if let Some(transform) = ctx.guide_transform(id) {
                    ctx.scene.set_world_transform(*entity, &transform)?;
                }
            }

            ctx.ensure_layer_root(LayerKind::Input)?;
            behaviour.setup_inputs(ctx)?;
            ctx.ensure_layer_root(LayerKind::Deform)?;
            behaviour.setup_deform_layer(ctx)?;
            for subsystem in subsystems {
                debug!(subsystem = subsystem.name(), "Subsystem deform setup");
                subsystem.setup_deform_layer(ctx)?;
            }
            ctx.ensure_layer_root(LayerKind::Output)?;
            behaviour.setup_outputs(ctx)?;
            behaviour.post_setup_deform(ctx)?;
        }
        Stage::Rig => {
            ctx.ensure_layer_root(LayerKind::Rig)?;
            wire_connections(ctx)?;
            behaviour.setup_rig(ctx)?;
            for subsystem in subsystems {
                debug!(subsystem = subsystem.name(), "Subsystem rig setup");
                subsystem.setup_rig(ctx)?;
            }
        }
        Stage::Polish => {
            if ctx.settings.hide_guides_on_polish {
                if let Some(root) = ctx.layers.guide.root {
                    ctx.scene
                        .set_attribute(root, "visibility", AttributeValue::Bool(false))?;
                }
            }
            let shapes: Vec<EntityId> = ctx
                .layers
                .guide
                .records()
                .chain(ctx.layers.rig.records())
                .filter(|r| matches!(r.kind, EntityKind::GuideShape | EntityKind::Control))
                .map(|r| r.entity)
                .collect();
            for entity in shapes {
                if ctx.settings.hide_control_shapes_in_outliner {
                    ctx.scene
                        .set_attribute(entity, "hiddenInOutliner", AttributeValue::Bool(true))?;
                }
                ctx.scene.set_attribute(
                    entity,
                    "selectionChildHighlighting",
                    AttributeValue::Bool(ctx.settings.selection_child_highlighting),
                )?;
            }
        }
    }
    Ok(())
}

/// Bind the driven input to the connection targets
fn wire_connections(ctx: &mut BuildContext<'_>) -> Result<()> {
    let connections = ctx.definition.connections.clone();
    if connections.constraints.is_empty() {
        return Ok(());
    }
    let io = ctx.connection_bindings();
    let driven = io.require(&format!("{}:{}", ctx.key(), connections.id))?;
    for constraint in &connections.constraints {
        let drivers = constraint
            .targets
            .iter()
            .map(|t| io.require(t))
            .collect::<Result<Vec<_>>>()?;
        ctx.bind(
            LayerKind::Input,
            BindingSpec {
                kind: constraint.kind,
                drivers,
                driven,
                maintain_offset: constraint.maintain_offset,
            },
        )?;
    }
    Ok(())
}
