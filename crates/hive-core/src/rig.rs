//! Rig orchestration: the component set, stage batches and hook dispatch
//!
//! A [`Rig`] owns its components keyed by `name:side`, the shared
//! [`RigConfig`] and the build scripts resolved from it. Stage operations
//! validate every requested component before anything runs, dispatch the
//! stage's pre-hooks, build components parents first, and report
//! per-component results in a [`StageReport`].

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::component::{Component, Stage};
use crate::components::ComponentRegistry;
use crate::config::RigConfig;
use crate::definition::{ComponentKey, ConnectionConstraint, Definition, RoleRef};
use crate::error::{HiveError, Result};
use crate::guides::GuideRecovery;
use crate::hooks::{BuildScript, BuildScriptRegistry, Hook, HookDispatcher, PropertyDecl};
use crate::math::{Axis, MirrorPlane};
use crate::naming::NameManager;
use crate::scene::{BindingKind, Scene};

/// What to do with the rest of a batch once a component fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Stop building; unprocessed components are reported as not run
    #[default]
    Abort,
    /// Keep going with every component that does not depend on a failure
    Continue,
}

/// Outcome of one stage operation over a batch of components
#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub completed: Vec<ComponentKey>,
    /// Already at or past the stage's target state
    pub skipped: Vec<ComponentKey>,
    pub failures: Vec<(ComponentKey, HiveError)>,
    /// Left untouched after an abort
    pub not_run: Vec<ComponentKey>,
    /// Post-hook errors; the stage work itself stands
    pub hook_failures: Vec<HiveError>,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            completed: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            not_run: Vec::new(),
            hook_failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.not_run.is_empty() && self.hook_failures.is_empty()
    }
}

/// Undo data for a guide operation on one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryData {
    pub component: ComponentKey,
    pub guides: Vec<GuideRecovery>,
}

impl RecoveryData {
    pub fn is_empty(&self) -> bool {
        self.guides.is_empty()
    }
}

pub struct Rig {
    name: String,
    config: RigConfig,
    registry: ComponentRegistry,
    scripts: BuildScriptRegistry,
    naming: NameManager,
    dispatcher: HookDispatcher,
    components: IndexMap<ComponentKey, Component>,
}

impl std::fmt::Debug for Rig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rig")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("components", &self.components.values().collect::<Vec<_>>())
            .finish()
    }
}

impl Rig {
    /// Rig with the built-in component types, scripts and naming preset
    pub fn new(name: &str) -> Result<Self> {
        Self::with_parts(
            name,
            RigConfig::default(),
            ComponentRegistry::builtin(),
            BuildScriptRegistry::builtin(),
            NameManager::builtin()?,
        )
    }

    pub fn with_parts(
        name: &str,
        config: RigConfig,
        registry: ComponentRegistry,
        scripts: BuildScriptRegistry,
        naming: NameManager,
    ) -> Result<Self> {
        if naming.preset(&config.naming_preset).is_none() {
            return Err(HiveError::UnknownPreset(config.naming_preset.clone()));
        }
        let dispatcher = HookDispatcher::resolve(&config.build_scripts, &scripts)?;
        Ok(Self {
            name: name.to_string(),
            config,
            registry,
            scripts,
            naming,
            dispatcher,
            components: IndexMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Replace the configuration, re-resolving build scripts. The rig is left
    /// unchanged when the new configuration is invalid.
    pub fn set_config(&mut self, config: RigConfig) -> Result<()> {
        self.validate_config(&config)?;
        self.dispatcher = HookDispatcher::resolve(&config.build_scripts, &self.scripts)?;
        self.config = config;
        Ok(())
    }

    /// Check a configuration against the rig's presets and build scripts
    pub fn validate_config(&self, config: &RigConfig) -> Result<()> {
        if self.naming.preset(&config.naming_preset).is_none() {
            return Err(HiveError::UnknownPreset(config.naming_preset.clone()));
        }
        HookDispatcher::resolve(&config.build_scripts, &self.scripts).map(|_| ())
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    pub fn naming(&self) -> &NameManager {
        &self.naming
    }

    pub fn naming_mut(&mut self) -> &mut NameManager {
        &mut self.naming
    }

    pub fn build_scripts(&self) -> &BuildScriptRegistry {
        &self.scripts
    }

    /// Make a build script available and re-resolve the active list
    pub fn register_build_script<F>(
        &mut self,
        id: &str,
        properties: Vec<PropertyDecl>,
        factory: F,
    ) -> Result<()>
    where
        F: Fn() -> Box<dyn BuildScript> + Send + Sync + 'static,
    {
        self.scripts.register(id, properties, factory);
        self.dispatcher = HookDispatcher::resolve(&self.config.build_scripts, &self.scripts)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.components.contains_key(key)
    }

    pub fn component(&self, key: &ComponentKey) -> Option<&Component> {
        self.components.get(key)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn keys(&self) -> Vec<ComponentKey> {
        self.components.keys().cloned().collect()
    }

    fn get(&self, key: &ComponentKey) -> Result<&Component> {
        self.components
            .get(key)
            .ok_or_else(|| HiveError::UnknownComponent(key.to_string()))
    }

    fn get_mut(&mut self, key: &ComponentKey) -> Result<&mut Component> {
        self.components
            .get_mut(key)
            .ok_or_else(|| HiveError::UnknownComponent(key.to_string()))
    }

    /// First free name of the form `base`, `base1`, `base2`, ... on `side`
    pub fn unique_name(&self, base: &str, side: &str) -> String {
        let mut name = base.to_string();
        let mut index = 1;
        while self.contains(&ComponentKey::new(name.as_str(), side)) {
            name = format!("{}{}", base, index);
            index += 1;
        }
        name
    }

    /// Create a component from its type's default definition under a free name
    pub fn create_component(&mut self, type_name: &str, name: &str, side: &str) -> Result<ComponentKey> {
        let name = self.unique_name(name, side);
        let component = self.registry.create(type_name, &name, side)?;
        let key = component.key();
        info!(component = %key, kind = type_name, "Created component");
        self.components.insert(key.clone(), component);
        Ok(key)
    }

    pub fn add_component(&mut self, component: Component) -> Result<ComponentKey> {
        let key = component.key();
        if self.contains(&key) {
            return Err(HiveError::DuplicateComponent(key.to_string()));
        }
        self.components.insert(key.clone(), component);
        Ok(key)
    }

    pub fn add_definition(&mut self, definition: Definition) -> Result<ComponentKey> {
        let component = self.registry.instantiate(definition)?;
        self.add_component(component)
    }

    /// Add a definition, or update the like-named component in place.
    ///
    /// A component of the same type keeps its built layers; one of another
    /// type is deleted and replaced. Returns whether a component was created.
    pub fn upsert_definition(&mut self, scene: &mut dyn Scene, definition: Definition) -> Result<(ComponentKey, bool)> {
        let key = definition.key();
        let behaviour = self.registry.get(&definition.component_type)?;
        match self.components.get_mut(&key) {
            Some(existing) if existing.behaviour().type_name() == behaviour.type_name() => {
                existing.replace_definition(definition);
                debug!(component = %key, "Updated component definition");
                Ok((key, false))
            }
            Some(existing) => {
                existing.delete_all(scene)?;
                *existing = Component::new(definition, behaviour);
                Ok((key, false))
            }
            None => {
                self.components
                    .insert(key.clone(), Component::new(definition, behaviour));
                Ok((key, true))
            }
        }
    }

    pub fn parent_of(&self, key: &ComponentKey) -> Option<ComponentKey> {
        self.components
            .get(key)
            .and_then(|c| c.definition().parent_key().ok().flatten())
    }

    /// Parent chain of a component, nearest first. Stops at a repeated key.
    pub fn ancestors(&self, key: &ComponentKey) -> Vec<ComponentKey> {
        let mut chain = Vec::new();
        let mut current = self.parent_of(key);
        while let Some(parent) = current {
            if &parent == key || chain.contains(&parent) {
                break;
            }
            current = self.parent_of(&parent);
            chain.push(parent);
        }
        chain
    }

    pub fn children(&self, key: &ComponentKey) -> Vec<ComponentKey> {
        self.components
            .keys()
            .filter(|k| self.parent_of(k).as_ref() == Some(key))
            .cloned()
            .collect()
    }

    /// Whether making `parent` the parent of `child` would close a loop
    pub fn would_cycle(&self, child: &ComponentKey, parent: &ComponentKey) -> bool {
        parent == child || self.ancestors(parent).contains(child)
    }

    /// Parent `child` under `parent`, driving the child's `child_role` input
    /// from the parent's `parent_role` output
    pub fn set_component_parent(
        &mut self,
        child: &ComponentKey,
        parent: &ComponentKey,
        parent_role: &str,
        child_role: &str,
    ) -> Result<()> {
        self.get(parent)?;
        self.get(child)?;
        if self.would_cycle(child, parent) {
            return Err(HiveError::InvalidParentAssignment(format!(
                "component '{}' cannot be parented under '{}'",
                child, parent
            )));
        }
        let definition = self.get_mut(child)?.definition_mut();
        definition.parent = Some(parent.to_string());
        definition.connections.id = child_role.to_string();
        definition.connections.constraints = vec![ConnectionConstraint::new(
            BindingKind::Parent,
            vec![RoleRef::new(parent.clone(), parent_role).to_string()],
        )];
        info!(child = %child, parent = %parent, role = parent_role, "Set component parent");
        Ok(())
    }

    pub fn clear_component_parent(&mut self, child: &ComponentKey) -> Result<()> {
        let definition = self.get_mut(child)?.definition_mut();
        definition.parent = None;
        definition.connections.constraints.clear();
        Ok(())
    }

    pub fn rename_component(
        &mut self,
        scene: &mut dyn Scene,
        key: &ComponentKey,
        name: &str,
    ) -> Result<ComponentKey> {
        let new_key = ComponentKey::new(name, key.side.as_str());
        self.rekey(scene, key, new_key)
    }

    pub fn set_side(&mut self, scene: &mut dyn Scene, key: &ComponentKey, side: &str) -> Result<ComponentKey> {
        let new_key = ComponentKey::new(key.name.as_str(), side);
        self.rekey(scene, key, new_key)
    }

    fn rekey(&mut self, scene: &mut dyn Scene, key: &ComponentKey, new_key: ComponentKey) -> Result<ComponentKey> {
        self.get(key)?;
        let new_key: ComponentKey = new_key.to_string().parse()?;
        if &new_key == key {
            return Ok(new_key);
        }
        if self.contains(&new_key) {
            return Err(HiveError::DuplicateComponent(new_key.to_string()));
        }
        {
            let resolver = self.naming.resolver(&self.config.naming_preset);
            let component = self
                .components
                .get_mut(key)
                .ok_or_else(|| HiveError::UnknownComponent(key.to_string()))?;
            let definition = component.definition_mut();
            definition.name = new_key.name.clone();
            definition.side = new_key.side.clone();
            if let Err(e) = component.refresh_names(scene, &resolver) {
                let definition = component.definition_mut();
                definition.name = key.name.clone();
                definition.side = key.side.clone();
                return Err(e);
            }
        }
        for component in self.components.values_mut() {
            component.definition_mut().rewrite_references(key, &new_key);
        }
        let components = std::mem::take(&mut self.components);
        self.components = components
            .into_iter()
            .map(|(k, c)| if &k == key { (new_key.clone(), c) } else { (k, c) })
            .collect();
        info!(from = %key, to = %new_key, "Renamed component");
        Ok(new_key)
    }

    /// Copy a component under a free name, optionally on another side. The
    /// copy starts unbuilt from the source's synced definition.
    pub fn duplicate_component(
        &mut self,
        scene: &dyn Scene,
        key: &ComponentKey,
        side: Option<&str>,
    ) -> Result<ComponentKey> {
        let side = side.unwrap_or(key.side.as_str()).to_string();
        let name = self.unique_name(&key.name, &side);
        self.duplicate_as(scene, key, ComponentKey::new(name, side))
    }

    fn duplicate_as(&mut self, scene: &dyn Scene, key: &ComponentKey, target: ComponentKey) -> Result<ComponentKey> {
        let source = self.get(key)?;
        let mut definition = source.sync_definition(scene);
        definition.name = target.name.clone();
        definition.side = target.side.clone();
        let component = Component::new(definition, source.behaviour().clone());
        self.add_component(component)
    }

    /// Mirror a component onto its symmetric side, creating the counterpart
    /// when it does not exist yet. References to components that have a
    /// counterpart are pointed at it.
    pub fn mirror_component(
        &mut self,
        scene: &mut dyn Scene,
        key: &ComponentKey,
        plane: Option<MirrorPlane>,
    ) -> Result<(ComponentKey, RecoveryData)> {
        self.get(key)?;
        let plane = plane.unwrap_or(self.config.settings.default_mirror_plane);
        let resolver = self.naming.resolver(&self.config.naming_preset);
        let side = resolver
            .mirror_side(&key.side)?
            .ok_or_else(|| HiveError::NoSymmetricSide(key.to_string()))?;
        let target = ComponentKey::new(key.name.as_str(), side);

        if !self.contains(&target) {
            let mut swaps = Vec::new();
            for reference in self.get(key)?.definition().referenced_keys() {
                if let Some(side) = resolver.mirror_side(&reference.side)? {
                    let counterpart = ComponentKey::new(reference.name.as_str(), side);
                    if self.contains(&counterpart) {
                        swaps.push((reference, counterpart));
                    }
                }
            }
            self.duplicate_as(scene, key, target.clone())?;
            let definition = self.get_mut(&target)?.definition_mut();
            for (from, to) in &swaps {
                definition.rewrite_references(from, to);
            }
        }

        let recovery = self.mirror_guides(scene, key, &target, &[plane.normal_axis()], plane)?;
        info!(source = %key, target = %target, plane = %plane, "Mirrored component");
        Ok((target, recovery))
    }

    /// Mirror the guides of `source` onto `target`. Both must carry the same
    /// guide ids; nothing changes when one is missing.
    pub fn mirror_guides(
        &mut self,
        scene: &mut dyn Scene,
        source: &ComponentKey,
        target: &ComponentKey,
        axes: &[Axis],
        plane: MirrorPlane,
    ) -> Result<RecoveryData> {
        self.get(target)?;
        let source_component = self.get_mut(source)?;
        source_component.read_guides_from_scene(scene);
        let changes = source_component
            .definition()
            .guide_layer
            .guides
            .mirrored(axes, plane);

        let target_component = self.get_mut(target)?;
        target_component.read_guides_from_scene(scene);
        let guides = target_component
            .definition_mut()
            .guide_layer
            .guides
            .apply(&changes)?;
        target_component.write_guides_to_scene(scene)?;
        Ok(RecoveryData {
            component: target.clone(),
            guides,
        })
    }

    /// Re-run auto alignment on a component's guides
    pub fn align_guides(&mut self, scene: &mut dyn Scene, key: &ComponentKey) -> Result<RecoveryData> {
        let component = self.get_mut(key)?;
        component.read_guides_from_scene(scene);
        let behaviour = component.behaviour().clone();
        let guides = behaviour.align_guides(&mut component.definition_mut().guide_layer.guides);
        component.write_guides_to_scene(scene)?;
        Ok(RecoveryData {
            component: key.clone(),
            guides,
        })
    }

    pub fn set_guide_parent(
        &mut self,
        scene: &mut dyn Scene,
        key: &ComponentKey,
        guide: &str,
        parent: &str,
        use_srt: bool,
    ) -> Result<RecoveryData> {
        self.set_guide_parents(scene, key, &[(guide.to_string(), parent.to_string())], use_srt)
    }

    /// Reparent several guides of one component; all requests are checked
    /// before the tree or scene change
    pub fn set_guide_parents(
        &mut self,
        scene: &mut dyn Scene,
        key: &ComponentKey,
        requests: &[(String, String)],
        use_srt: bool,
    ) -> Result<RecoveryData> {
        let component = self.get_mut(key)?;
        component.read_guides_from_scene(scene);
        let guides = component
            .definition_mut()
            .guide_layer
            .guides
            .set_parents(requests, use_srt)?;
        component.write_guides_to_scene(scene)?;
        Ok(RecoveryData {
            component: key.clone(),
            guides,
        })
    }

    /// Undo a guide operation
    pub fn restore(&mut self, scene: &mut dyn Scene, recovery: &RecoveryData) -> Result<()> {
        let component = self.get_mut(&recovery.component)?;
        component
            .definition_mut()
            .guide_layer
            .guides
            .restore(&recovery.guides)?;
        component.write_guides_to_scene(scene)
    }

    /// Refresh every stored definition from the scene
    pub fn sync_definitions(&mut self, scene: &dyn Scene) {
        for component in self.components.values_mut() {
            let synced = component.sync_definition(scene);
            component.replace_definition(synced);
        }
    }

    /// Component keys with parents before children. Ties keep insertion
    /// order; keys caught in a reference loop come last.
    pub fn topological_order(&self) -> Vec<ComponentKey> {
        let mut indegree: IndexMap<&ComponentKey, usize> =
            self.components.keys().map(|k| (k, 0)).collect();
        let mut edges: HashMap<ComponentKey, Vec<&ComponentKey>> = HashMap::new();
        for key in self.components.keys() {
            if let Some(parent) = self.parent_of(key).filter(|p| self.contains(p)) {
                edges.entry(parent).or_default().push(key);
                if let Some(d) = indegree.get_mut(key) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<&ComponentKey> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order: IndexSet<ComponentKey> = IndexSet::new();
        while let Some(key) = queue.pop_front() {
            order.insert(key.clone());
            if let Some(children) = edges.get(key) {
                for child in children {
                    if let Some(d) = indegree.get_mut(*child) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() != self.components.len() {
            warn!("Component parent references form a loop");
            for key in self.components.keys() {
                order.insert(key.clone());
            }
        }
        order.into_iter().collect()
    }

    fn resolve_keys(&self, keys: &[ComponentKey]) -> Result<Vec<ComponentKey>> {
        if keys.is_empty() {
            return Ok(self.keys());
        }
        for key in keys {
            self.get(key)?;
        }
        Ok(keys.to_vec())
    }

    /// Run one forward stage over `keys` (every component when empty)
    pub fn run_stage(
        &mut self,
        stage: Stage,
        scene: &mut dyn Scene,
        keys: &[ComponentKey],
        policy: BatchPolicy,
    ) -> Result<StageReport> {
        let requested = self.resolve_keys(keys)?;
        let mut report = StageReport::new(stage);

        // every component is checked before a hook runs or the scene changes
        let mut pending: HashSet<ComponentKey> = HashSet::new();
        for key in &requested {
            let component = self.get(key)?;
            if component.state() >= stage.target_state() {
                report.skipped.push(key.clone());
            } else {
                component.check_stage(stage)?;
                pending.insert(key.clone());
            }
        }
        if pending.is_empty() {
            debug!(stage = %stage, "Nothing to build");
            return Ok(report);
        }

        let order: Vec<ComponentKey> = self
            .topological_order()
            .into_iter()
            .filter(|k| pending.contains(k))
            .collect();
        if let Some(hook) = stage.pre_hook() {
            self.dispatcher.dispatch(hook, &self.name, &order, scene)?;
        }

        let mut failed: HashSet<ComponentKey> = HashSet::new();
        let mut aborted = false;
        for key in order.iter().cloned() {
            if aborted {
                report.not_run.push(key);
                continue;
            }
            if let Some(parent) = self.ancestors(&key).into_iter().find(|a| failed.contains(a)) {
                warn!(component = %key, parent = %parent, stage = %stage, "Skipping, parent failed");
                failed.insert(key.clone());
                report.failures.push((
                    key.clone(),
                    HiveError::DependencyFailed {
                        component: key.to_string(),
                        parent: parent.to_string(),
                    },
                ));
                continue;
            }

            let parent_view = self
                .parent_of(&key)
                .and_then(|p| self.components.get(&p))
                .map(Component::parent_view);
            let resolver = self.naming.resolver(&self.config.naming_preset);
            let settings = &self.config.settings;
            let Some(component) = self.components.get_mut(&key) else {
                continue;
            };
            match component.run_stage(stage, scene, resolver, settings, parent_view.as_ref()) {
                Ok(()) => report.completed.push(key),
                Err(e) => {
                    warn!(component = %key, stage = %stage, error = %e, "Stage failed");
                    failed.insert(key.clone());
                    report.failures.push((key, e));
                    aborted = policy == BatchPolicy::Abort;
                }
            }
        }

        if let Some(hook) = stage.post_hook() {
            if let Err(e) = self.dispatcher.dispatch(hook, &self.name, &order, scene) {
                report.hook_failures.push(e);
            }
        }

        info!(
            stage = %stage,
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Stage finished"
        );
        Ok(report)
    }

    pub fn build_guides(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey], policy: BatchPolicy) -> Result<StageReport> {
        self.run_stage(Stage::Guides, scene, keys, policy)
    }

    pub fn build_guide_controls(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey], policy: BatchPolicy) -> Result<StageReport> {
        self.run_stage(Stage::GuideControls, scene, keys, policy)
    }

    pub fn build_deform(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey], policy: BatchPolicy) -> Result<StageReport> {
        self.run_stage(Stage::Deform, scene, keys, policy)
    }

    pub fn build_rig(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey], policy: BatchPolicy) -> Result<StageReport> {
        self.run_stage(Stage::Rig, scene, keys, policy)
    }

    pub fn polish(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey], policy: BatchPolicy) -> Result<StageReport> {
        self.run_stage(Stage::Polish, scene, keys, policy)
    }

    /// Run every stage up to and including `stage`, stopping at the first
    /// report that is not a success
    pub fn build_to(
        &mut self,
        stage: Stage,
        scene: &mut dyn Scene,
        keys: &[ComponentKey],
        policy: BatchPolicy,
    ) -> Result<Vec<StageReport>> {
        let mut reports = Vec::new();
        for current in Stage::ALL {
            let report = self.run_stage(current, scene, keys, policy)?;
            let success = report.is_success();
            reports.push(report);
            if !success || current == stage {
                break;
            }
        }
        Ok(reports)
    }

    pub fn delete_guide_layer(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey]) -> Result<()> {
        let keys = self.resolve_keys(keys)?;
        self.dispatcher
            .dispatch(Hook::PreDeleteGuideLayer, &self.name, &keys, scene)?;
        for key in &keys {
            self.get_mut(key)?.delete_guide_layer(scene)?;
        }
        Ok(())
    }

    pub fn delete_deform_layer(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey]) -> Result<()> {
        let keys = self.resolve_keys(keys)?;
        self.dispatcher
            .dispatch(Hook::PreDeleteDeformLayer, &self.name, &keys, scene)?;
        for key in &keys {
            self.get_mut(key)?.delete_deform_layer(scene)?;
        }
        Ok(())
    }

    pub fn delete_rig_layer(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey]) -> Result<()> {
        let keys = self.resolve_keys(keys)?;
        self.dispatcher
            .dispatch(Hook::PreDeleteRigLayer, &self.name, &keys, scene)?;
        for key in &keys {
            self.get_mut(key)?.delete_rig_layer(scene)?;
        }
        Ok(())
    }

    /// Delete components and everything they built. Other components lose
    /// their references to them.
    pub fn delete_components(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey]) -> Result<()> {
        for key in keys {
            self.get(key)?;
        }
        self.dispatcher
            .dispatch(Hook::PreDeleteComponents, &self.name, keys, scene)?;
        self.remove_components(scene, keys)
    }

    /// Delete every component
    pub fn delete_rig(&mut self, scene: &mut dyn Scene) -> Result<()> {
        let keys = self.keys();
        self.dispatcher
            .dispatch(Hook::PreDeleteRig, &self.name, &keys, scene)?;
        self.remove_components(scene, &keys)
    }

    pub(crate) fn dispatch_hook(&mut self, hook: Hook, keys: &[ComponentKey], scene: &mut dyn Scene) -> Result<()> {
        self.dispatcher.dispatch(hook, &self.name, keys, scene)
    }

    pub(crate) fn remove_components(&mut self, scene: &mut dyn Scene, keys: &[ComponentKey]) -> Result<()> {
        for key in keys {
            if let Some(mut component) = self.components.shift_remove(key) {
                component.delete_all(scene)?;
                info!(component = %key, "Deleted component");
            }
            for other in self.components.values_mut() {
                other.definition_mut().clear_references_to(key);
            }
        }
        Ok(())
    }

    pub(crate) fn component_mut(&mut self, key: &ComponentKey) -> Option<&mut Component> {
        self.components.get_mut(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{BuildContext, BuildState, ComponentType};
    use crate::definition::{EntityDescriptor, LayerKind};
    use crate::guides::Guide;
    use crate::hooks::{BuildScriptEntry, HookContext};
    use crate::layer::IdMapping;
    use crate::scene::MemoryScene;
    use std::sync::{Arc, Mutex};

    /// Arm whose output local ids differ from their role names
    struct Arm {
        output_ids: [&'static str; 3],
    }

    const ROLES: [&str; 3] = ["upr", "mid", "end"];

    impl ComponentType for Arm {
        fn type_name(&self) -> &str {
            "testArm"
        }

        fn initialize(&self, definition: &mut Definition) -> Result<()> {
            let guides = &mut definition.guide_layer.guides;
            guides.insert(Guide::new("upr", None, [0.0, 10.0, 0.0]))?;
            guides.insert(Guide::new("mid", Some("upr"), [3.0, 10.0, 0.0]))?;
            guides.insert(Guide::new("end", Some("mid"), [6.0, 10.0, 0.0]))?;
            definition.input_layer.upsert(EntityDescriptor::new("root"));
            for (role, output) in ROLES.iter().zip(self.output_ids) {
                definition.deform_layer.upsert(EntityDescriptor::new(*role));
                definition.output_layer.upsert(EntityDescriptor::new(output));
            }
            Ok(())
        }

        fn id_mapping(&self, definition: &Definition) -> IdMapping {
            let mut mapping = IdMapping::identity(definition);
            mapping.output.clear();
            for (role, output) in ROLES.iter().zip(self.output_ids) {
                mapping.set(LayerKind::Output, *role, output);
            }
            mapping
        }
    }

    /// Hand whose `root` input role lives at local id `in_root`
    struct Hand;

    impl ComponentType for Hand {
        fn type_name(&self) -> &str {
            "testHand"
        }

        fn initialize(&self, definition: &mut Definition) -> Result<()> {
            definition
                .guide_layer
                .guides
                .insert(Guide::new("palm", None, [6.0, 10.0, 0.0]))?;
            definition.input_layer.upsert(EntityDescriptor::new("in_root"));
            definition.deform_layer.upsert(EntityDescriptor::new("palm"));
            definition.output_layer.upsert(EntityDescriptor::new("palm"));
            Ok(())
        }

        fn id_mapping(&self, definition: &Definition) -> IdMapping {
            let mut mapping = IdMapping::identity(definition);
            mapping.input.clear();
            mapping.set(LayerKind::Input, "root", "in_root");
            mapping
        }

        fn setup_rig(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn rig_with(arm_outputs: [&'static str; 3]) -> Rig {
        let mut rig = Rig::new("biped").unwrap();
        rig.registry_mut().register(Arc::new(Arm {
            output_ids: arm_outputs,
        }));
        rig.registry_mut().register(Arc::new(Hand));
        rig
    }

    fn arm_and_hand(rig: &mut Rig) -> (ComponentKey, ComponentKey) {
        let arm = rig.create_component("testArm", "arm", "L").unwrap();
        let hand = rig.create_component("testHand", "hand", "L").unwrap();
        rig.set_component_parent(&hand, &arm, "end", "root").unwrap();
        (arm, hand)
    }

    fn build(rig: &mut Rig, scene: &mut MemoryScene, last: Stage) {
        for report in rig.build_to(last, scene, &[], BatchPolicy::Abort).unwrap() {
            assert!(report.is_success(), "{:?}", report);
        }
    }

    #[test]
    fn test_child_binds_to_parent_output_by_role() {
        for outputs in [["out_upr", "out_mid", "out_end"], ["shoulder", "elbow", "wrist"]] {
            let mut rig = rig_with(outputs);
            let mut scene = MemoryScene::new();
            let (arm, hand) = arm_and_hand(&mut rig);
            build(&mut rig, &mut scene, Stage::Rig);

            let wrist = rig.component(&arm).unwrap().layers().output.entity(outputs[2]).unwrap();
            let hand_input = rig.component(&hand).unwrap().layers().input.entity("in_root").unwrap();
            let bindings = scene.bindings_driving(hand_input);
            assert_eq!(bindings.len(), 1);
            assert_eq!(bindings[0].drivers, vec![wrist]);
            assert_eq!(bindings[0].kind, BindingKind::Parent);
        }
    }

    #[test]
    fn test_out_of_order_stage_fails_without_mutation() {
        let mut rig = rig_with(["a", "b", "c"]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        rig.register_build_script("recorder", Vec::new(), move || {
            Box::new(Recorder(sink.clone())) as Box<dyn BuildScript>
        })
        .unwrap();
        let mut config = rig.config().clone();
        config.build_scripts.push(BuildScriptEntry::new("recorder"));
        rig.set_config(config).unwrap();

        let mut scene = MemoryScene::new();
        arm_and_hand(&mut rig);
        let err = rig
            .build_rig(&mut scene, &[], BatchPolicy::Continue)
            .unwrap_err();
        assert!(matches!(err, HiveError::InvalidStageTransition { .. }));
        assert_eq!(scene.entity_count(), 0);
        assert!(log.lock().unwrap().is_empty());

        rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["preGuideBuild".to_string(), "postGuideBuild".into()]
        );
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn record(&self, ctx: &HookContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.hook.name().to_string());
            Ok(())
        }
    }

    impl BuildScript for Recorder {
        fn pre_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.record(ctx)
        }
        fn post_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.record(ctx)
        }
        fn pre_rig_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.record(ctx)
        }
    }

    struct ComponentWitness(Arc<Mutex<Vec<Vec<ComponentKey>>>>);

    impl BuildScript for ComponentWitness {
        fn pre_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.components.to_vec());
            Ok(())
        }
        fn post_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.components.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_hooks_see_only_components_that_run() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        rig.build_guides(&mut scene, &[arm.clone()], BatchPolicy::Abort).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rig.register_build_script("witness", Vec::new(), move || {
            Box::new(ComponentWitness(sink.clone())) as Box<dyn BuildScript>
        })
        .unwrap();
        let mut config = rig.config().clone();
        config.build_scripts.push(BuildScriptEntry::new("witness"));
        rig.set_config(config).unwrap();

        let report = rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();
        assert_eq!(report.skipped, vec![arm]);
        assert_eq!(*seen.lock().unwrap(), vec![vec![hand.clone()], vec![hand]]);
    }

    struct FailingPreRig;

    impl BuildScript for FailingPreRig {
        fn pre_rig_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("license check failed")
        }
    }

    #[test]
    fn test_pre_hook_failure_aborts_stage() {
        let mut rig = rig_with(["a", "b", "c"]);
        rig.register_build_script("gate", Vec::new(), || Box::new(FailingPreRig) as Box<dyn BuildScript>)
            .unwrap();
        let mut config = rig.config().clone();
        config.build_scripts.push(BuildScriptEntry::new("gate"));
        rig.set_config(config).unwrap();

        let mut scene = MemoryScene::new();
        let (arm, _) = arm_and_hand(&mut rig);
        build(&mut rig, &mut scene, Stage::Deform);
        let entities = scene.entity_count();

        let err = rig.build_rig(&mut scene, &[], BatchPolicy::Abort).unwrap_err();
        match err {
            HiveError::HookExecutionFailure { script, hook, message } => {
                assert_eq!(script, "gate");
                assert_eq!(hook, "preRigBuild");
                assert!(message.contains("license"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(scene.entity_count(), entities);
        assert_eq!(rig.component(&arm).unwrap().state(), BuildState::SkeletonBuilt);
    }

    #[test]
    fn test_failure_marks_dependents_and_spares_siblings() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        let finger = rig.create_component("testHand", "finger", "L").unwrap();
        rig.set_component_parent(&finger, &hand, "palm", "root").unwrap();
        let other = rig.create_component("testArm", "arm", "R").unwrap();
        build(&mut rig, &mut scene, Stage::Deform);

        // the hand now points at a role its parent does not expose
        rig.component_mut(&hand)
            .unwrap()
            .definition_mut()
            .connections
            .constraints[0]
            .targets = vec!["arm:L:missing".into()];

        let report = rig.build_rig(&mut scene, &[], BatchPolicy::Continue).unwrap();
        assert!(report.completed.contains(&arm));
        assert!(report.completed.contains(&other));
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0], (ref k, HiveError::MissingBinding(_)) if k == &hand));
        assert!(matches!(report.failures[1], (ref k, HiveError::DependencyFailed { .. }) if k == &finger));
        assert_eq!(rig.component(&hand).unwrap().state(), BuildState::SkeletonBuilt);
        assert_eq!(rig.component(&other).unwrap().state(), BuildState::RigBuilt);
    }

    #[test]
    fn test_abort_policy_reports_not_run() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        let other = rig.create_component("testArm", "arm", "R").unwrap();
        rig.set_component_parent(&other, &arm, "end", "root").unwrap();
        build(&mut rig, &mut scene, Stage::Deform);
        rig.component_mut(&hand)
            .unwrap()
            .definition_mut()
            .connections
            .constraints[0]
            .targets = vec!["arm:L:missing".into()];

        let report = rig.build_rig(&mut scene, &[], BatchPolicy::Abort).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.not_run, vec![other]);
    }

    #[test]
    fn test_built_components_are_skipped() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        rig.build_guides(&mut scene, &[arm.clone()], BatchPolicy::Abort).unwrap();
        let report = rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();
        assert_eq!(report.skipped, vec![arm]);
        assert_eq!(report.completed, vec![hand]);
    }

    #[test]
    fn test_parents_build_first() {
        let mut rig = rig_with(["a", "b", "c"]);
        let hand = rig.create_component("testHand", "hand", "L").unwrap();
        let arm = rig.create_component("testArm", "arm", "L").unwrap();
        rig.set_component_parent(&hand, &arm, "end", "root").unwrap();
        assert_eq!(rig.topological_order(), vec![arm, hand]);
    }

    #[test]
    fn test_component_parent_cycle_rejected() {
        let mut rig = rig_with(["a", "b", "c"]);
        let (arm, hand) = arm_and_hand(&mut rig);
        let before = rig.component(&arm).unwrap().definition().clone();
        let err = rig.set_component_parent(&arm, &hand, "palm", "root").unwrap_err();
        assert!(matches!(err, HiveError::InvalidParentAssignment(_)));
        assert_eq!(rig.component(&arm).unwrap().definition(), &before);
    }

    #[test]
    fn test_rename_rewrites_references() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();

        let limb = rig.rename_component(&mut scene, &arm, "limb").unwrap();
        assert_eq!(limb, ComponentKey::new("limb", "L"));
        assert!(!rig.contains(&arm));
        let hand_def = rig.component(&hand).unwrap().definition();
        assert_eq!(hand_def.parent.as_deref(), Some("limb:L"));
        assert_eq!(hand_def.connections.constraints[0].targets, vec!["limb:L:end".to_string()]);
        assert!(scene.find_by_name("limb_L_upr_guide").is_some());
        // order is kept
        assert_eq!(rig.keys()[0], limb);

        assert!(matches!(
            rig.rename_component(&mut scene, &limb, "hand"),
            Err(HiveError::DuplicateComponent(_))
        ));
    }

    #[test]
    fn test_invalid_rename_leaves_component_untouched() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();

        for name in ["", "fore:arm"] {
            assert!(matches!(
                rig.rename_component(&mut scene, &arm, name),
                Err(HiveError::InvalidIdentifier(_))
            ));
        }
        assert!(matches!(
            rig.set_side(&mut scene, &arm, ""),
            Err(HiveError::InvalidIdentifier(_))
        ));

        assert!(rig.contains(&arm));
        assert_eq!(rig.component(&arm).unwrap().definition().key(), arm);
        assert_eq!(
            rig.component(&hand).unwrap().definition().parent.as_deref(),
            Some("arm:L")
        );
        assert!(scene.find_by_name("arm_L_upr_guide").is_some());
    }

    #[test]
    fn test_unique_names() {
        let mut rig = rig_with(["a", "b", "c"]);
        let first = rig.create_component("fkchain", "tail", "M").unwrap();
        let second = rig.create_component("fkchain", "tail", "M").unwrap();
        let third = rig.create_component("fkchain", "tail", "M").unwrap();
        assert_eq!(first.name, "tail");
        assert_eq!(second.name, "tail1");
        assert_eq!(third.name, "tail2");
    }

    #[test]
    fn test_mirror_component_and_restore() {
        let mut rig = Rig::new("biped").unwrap();
        let mut scene = MemoryScene::new();
        let arm = rig.create_component("vchain", "arm", "L").unwrap();
        rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();

        let (target, recovery) = rig.mirror_component(&mut scene, &arm, None).unwrap();
        assert_eq!(target, ComponentKey::new("arm", "R"));
        assert!(!recovery.is_empty());
        let source_mid = rig.component(&arm).unwrap().definition().guide_layer.guides.get("mid").unwrap().transform;
        let target_mid = rig.component(&target).unwrap().definition().guide_layer.guides.get("mid").unwrap().transform;
        assert!((target_mid.translate[0] + source_mid.translate[0]).abs() < 1e-9);
        assert_eq!(target_mid.translate[2], source_mid.translate[2]);

        rig.restore(&mut scene, &recovery).unwrap();
        let restored = rig.component(&target).unwrap().definition().guide_layer.guides.get("mid").unwrap().transform;
        assert_eq!(restored, source_mid);

        let mut center = Rig::new("c").unwrap();
        let spine = center.create_component("fkchain", "spine", "M").unwrap();
        assert!(matches!(
            center.mirror_component(&mut scene, &spine, None),
            Err(HiveError::NoSymmetricSide(_))
        ));
    }

    #[test]
    fn test_guide_reparent_updates_scene() {
        let mut rig = Rig::new("biped").unwrap();
        let mut scene = MemoryScene::new();
        let arm = rig.create_component("vchain", "arm", "L").unwrap();
        rig.build_guides(&mut scene, &[], BatchPolicy::Abort).unwrap();

        let recovery = rig.set_guide_parent(&mut scene, &arm, "upVec", "mid", true).unwrap();
        let layers = rig.component(&arm).unwrap().layers();
        let up_vec = layers.guide.entity("upVec").unwrap();
        let mid = layers.guide.entity("mid").unwrap();
        assert_eq!(scene.entity(up_vec).unwrap().parent, Some(mid));

        assert!(matches!(
            rig.set_guide_parent(&mut scene, &arm, "upr", "end", true),
            Err(HiveError::InvalidParentAssignment(_))
        ));

        rig.restore(&mut scene, &recovery).unwrap();
        let upr = rig.component(&arm).unwrap().layers().guide.entity("upr").unwrap();
        assert_eq!(scene.entity(up_vec).unwrap().parent, Some(upr));
    }

    #[test]
    fn test_delete_component_clears_references() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (arm, hand) = arm_and_hand(&mut rig);
        build(&mut rig, &mut scene, Stage::Rig);

        rig.delete_components(&mut scene, &[arm.clone()]).unwrap();
        assert!(!rig.contains(&arm));
        let hand_def = rig.component(&hand).unwrap().definition();
        assert!(hand_def.parent.is_none());
        assert!(hand_def.connections.constraints.is_empty());

        rig.delete_rig(&mut scene).unwrap();
        assert!(rig.is_empty());
        assert_eq!(scene.entity_count(), 0);
        assert_eq!(scene.binding_count(), 0);
    }

    #[test]
    fn test_rig_layer_rebuild() {
        let mut rig = rig_with(["a", "b", "c"]);
        let mut scene = MemoryScene::new();
        let (_, hand) = arm_and_hand(&mut rig);
        build(&mut rig, &mut scene, Stage::Rig);
        let bindings = scene.binding_count();

        rig.delete_rig_layer(&mut scene, &[]).unwrap();
        assert_eq!(rig.component(&hand).unwrap().state(), BuildState::SkeletonBuilt);
        assert!(scene.binding_count() < bindings);

        rig.build_rig(&mut scene, &[], BatchPolicy::Abort).unwrap();
        assert_eq!(scene.binding_count(), bindings);
    }

    #[test]
    fn test_unknown_build_script_keeps_config() {
        let mut rig = Rig::new("biped").unwrap();
        let mut config = rig.config().clone();
        config.build_scripts.push(BuildScriptEntry::new("nope"));
        assert!(matches!(
            rig.set_config(config),
            Err(HiveError::UnknownBuildScript(_))
        ));
        assert!(rig.config().build_scripts.is_empty());
    }
}
