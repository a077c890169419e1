//! Build scripts: pluggable pre/post hooks around build stages
//!
//! A rig's configuration lists the build scripts it uses, in order, with
//! optional property overrides. [`HookDispatcher::resolve`] turns that list
//! into live script instances once; [`HookDispatcher::dispatch`] then runs
//! one hook on every script in list order and stops at the first failure.
//! Hooks that already ran stay committed.

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::definition::ComponentKey;
use crate::error::{HiveError, Result};
use crate::scene::Scene;

/// Type of a build-script property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyKind {
    FilePath,
    String,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Text(String),
}

impl PropertyValue {
    fn matches(&self, kind: PropertyKind) -> bool {
        matches!(
            (self, kind),
            (PropertyValue::Bool(_), PropertyKind::Bool)
                | (PropertyValue::Text(_), PropertyKind::String | PropertyKind::FilePath)
        )
    }
}

/// A property a build script declares, with its default
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDecl {
    pub name: String,
    pub kind: PropertyKind,
    pub default: PropertyValue,
}

impl PropertyDecl {
    pub fn file_path(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::FilePath,
            default: PropertyValue::Text(default.to_string()),
        }
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::String,
            default: PropertyValue::Text(default.to_string()),
        }
    }

    pub fn bool(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Bool,
            default: PropertyValue::Bool(default),
        }
    }
}

/// Resolved property values of one active script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties(IndexMap<String, PropertyValue>);

impl Properties {
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(PropertyValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn path(&self, name: &str) -> Option<PathBuf> {
        self.text(name).map(PathBuf::from)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(PropertyValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

/// One active build script in a rig configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildScriptEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, PropertyValue>,
}

impl BuildScriptEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: IndexMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// The fixed set of hook points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreGuideBuild,
    PostGuideBuild,
    PreDeformBuild,
    PostDeformBuild,
    PreRigBuild,
    PostRigBuild,
    PrePolish,
    PostPolishBuild,
    PreDeleteGuideLayer,
    PreDeleteDeformLayer,
    PreDeleteRigLayer,
    PreDeleteComponents,
    PreDeleteRig,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::PreGuideBuild => "preGuideBuild",
            Hook::PostGuideBuild => "postGuideBuild",
            Hook::PreDeformBuild => "preDeformBuild",
            Hook::PostDeformBuild => "postDeformBuild",
            Hook::PreRigBuild => "preRigBuild",
            Hook::PostRigBuild => "postRigBuild",
            Hook::PrePolish => "prePolish",
            Hook::PostPolishBuild => "postPolishBuild",
            Hook::PreDeleteGuideLayer => "preDeleteGuideLayer",
            Hook::PreDeleteDeformLayer => "preDeleteDeformLayer",
            Hook::PreDeleteRigLayer => "preDeleteRigLayer",
            Hook::PreDeleteComponents => "preDeleteComponents",
            Hook::PreDeleteRig => "preDeleteRig",
        }
    }

    /// Call the matching method on a script
    pub fn invoke(self, script: &mut dyn BuildScript, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        match self {
            Hook::PreGuideBuild => script.pre_guide_build(ctx),
            Hook::PostGuideBuild => script.post_guide_build(ctx),
            Hook::PreDeformBuild => script.pre_deform_build(ctx),
            Hook::PostDeformBuild => script.post_deform_build(ctx),
            Hook::PreRigBuild => script.pre_rig_build(ctx),
            Hook::PostRigBuild => script.post_rig_build(ctx),
            Hook::PrePolish => script.pre_polish(ctx),
            Hook::PostPolishBuild => script.post_polish_build(ctx),
            Hook::PreDeleteGuideLayer => script.pre_delete_guide_layer(ctx),
            Hook::PreDeleteDeformLayer => script.pre_delete_deform_layer(ctx),
            Hook::PreDeleteRigLayer => script.pre_delete_rig_layer(ctx),
            Hook::PreDeleteComponents => script.pre_delete_components(ctx),
            Hook::PreDeleteRig => script.pre_delete_rig(ctx),
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a hook gets to see
pub struct HookContext<'a> {
    pub rig_name: &'a str,
    pub hook: Hook,
    /// Components the stage runs on, in build order
    pub components: &'a [ComponentKey],
    pub properties: &'a Properties,
    pub scene: &'a mut dyn Scene,
}

/// A build script. Every hook defaults to doing nothing.
pub trait BuildScript {
    fn pre_guide_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn post_guide_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_deform_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn post_deform_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_rig_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn post_rig_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_polish(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn post_polish_build(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_delete_guide_layer(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_delete_deform_layer(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_delete_rig_layer(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_delete_components(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
    fn pre_delete_rig(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

type ScriptFactory = Box<dyn Fn() -> Box<dyn BuildScript> + Send + Sync>;

struct Registration {
    properties: Vec<PropertyDecl>,
    factory: ScriptFactory,
}

/// Known build scripts by id
#[derive(Default)]
pub struct BuildScriptRegistry {
    scripts: IndexMap<String, Registration>,
}

impl fmt::Debug for BuildScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.scripts.keys()).finish()
    }
}

impl BuildScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the scripts shipped with the crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(STAGE_LOG_ID, StageLog::properties(), || {
            Box::new(StageLog) as Box<dyn BuildScript>
        });
        registry
    }

    pub fn register<F>(&mut self, id: &str, properties: Vec<PropertyDecl>, factory: F)
    where
        F: Fn() -> Box<dyn BuildScript> + Send + Sync + 'static,
    {
        self.scripts.insert(
            id.to_string(),
            Registration {
                properties,
                factory: Box::new(factory),
            },
        );
    }

    pub fn properties(&self, id: &str) -> Option<&[PropertyDecl]> {
        self.scripts.get(id).map(|r| r.properties.as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }
}

struct ActiveScript {
    id: String,
    properties: Properties,
    script: Box<dyn BuildScript>,
}

/// Ordered, resolved build scripts of one rig
#[derive(Default)]
pub struct HookDispatcher {
    scripts: Vec<ActiveScript>,
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.scripts.iter().map(|s| &s.id)).finish()
    }
}

impl HookDispatcher {
    /// Instantiate the configured scripts, checking ids and property types
    pub fn resolve(entries: &[BuildScriptEntry], registry: &BuildScriptRegistry) -> Result<Self> {
        let mut scripts = Vec::with_capacity(entries.len());
        for entry in entries {
            let registration = registry
                .scripts
                .get(&entry.id)
                .ok_or_else(|| HiveError::UnknownBuildScript(entry.id.clone()))?;

            let mut values: IndexMap<String, PropertyValue> = registration
                .properties
                .iter()
                .map(|p| (p.name.clone(), p.default.clone()))
                .collect();
            for (name, value) in &entry.properties {
                let decl = registration
                    .properties
                    .iter()
                    .find(|p| &p.name == name)
                    .ok_or_else(|| HiveError::InvalidProperty {
                        script: entry.id.clone(),
                        property: name.clone(),
                        reason: "not declared by the script".to_string(),
                    })?;
                if !value.matches(decl.kind) {
                    return Err(HiveError::InvalidProperty {
                        script: entry.id.clone(),
                        property: name.clone(),
                        reason: format!("expected {:?}", decl.kind),
                    });
                }
                values.insert(name.clone(), value.clone());
            }

            scripts.push(ActiveScript {
                id: entry.id.clone(),
                properties: Properties(values),
                script: (registration.factory)(),
            });
        }
        Ok(Self { scripts })
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|s| s.id.as_str())
    }

    /// Run `hook` on every script in order, stopping at the first error
    pub fn dispatch(
        &mut self,
        hook: Hook,
        rig_name: &str,
        components: &[ComponentKey],
        scene: &mut dyn Scene,
    ) -> Result<()> {
        for active in &mut self.scripts {
            debug!(script = %active.id, hook = %hook, "Running build script hook");
            let mut ctx = HookContext {
                rig_name,
                hook,
                components,
                properties: &active.properties,
                scene: &mut *scene,
            };
            if let Err(e) = hook.invoke(active.script.as_mut(), &mut ctx) {
                warn!(script = %active.id, hook = %hook, error = %format!("{:#}", e), "Build script hook failed");
                return Err(HiveError::HookExecutionFailure {
                    script: active.id.clone(),
                    hook: hook.name().to_string(),
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }
}

/// Id of the built-in script that appends a JSON line per hook call
pub const STAGE_LOG_ID: &str = "stageLog";

struct StageLog;

impl StageLog {
    fn properties() -> Vec<PropertyDecl> {
        vec![
            PropertyDecl::file_path("outputPath", "hive-stages.jsonl"),
            PropertyDecl::string("label", "hive"),
            PropertyDecl::bool("enabled", true),
        ]
    }

    fn append(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        if !ctx.properties.flag("enabled").unwrap_or(true) {
            return Ok(());
        }
        let path = ctx
            .properties
            .path("outputPath")
            .context("outputPath is not set")?;
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "label": ctx.properties.text("label").unwrap_or_default(),
            "rig": ctx.rig_name,
            "hook": ctx.hook.name(),
            "components": ctx.components.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        writeln!(file, "{}", line).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl BuildScript for StageLog {
    fn pre_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn post_guide_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_deform_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn post_deform_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_rig_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn post_rig_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_polish(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn post_polish_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_delete_guide_layer(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_delete_deform_layer(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_delete_rig_layer(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_delete_components(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
    fn pre_delete_rig(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.append(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::MemoryScene;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<Hook>,
    }

    impl BuildScript for Recorder {
        fn pre_rig_build(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, ctx.hook));
            if self.fail_on == Some(ctx.hook) {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn registry(log: &Arc<Mutex<Vec<String>>>) -> BuildScriptRegistry {
        let mut registry = BuildScriptRegistry::builtin();
        let a = log.clone();
        registry.register("first", Vec::new(), move || {
            Box::new(Recorder {
                name: "first",
                log: a.clone(),
                fail_on: None,
            }) as Box<dyn BuildScript>
        });
        let b = log.clone();
        registry.register("failing", Vec::new(), move || {
            Box::new(Recorder {
                name: "failing",
                log: b.clone(),
                fail_on: Some(Hook::PreRigBuild),
            }) as Box<dyn BuildScript>
        });
        let c = log.clone();
        registry.register("last", Vec::new(), move || {
            Box::new(Recorder {
                name: "last",
                log: c.clone(),
                fail_on: None,
            }) as Box<dyn BuildScript>
        });
        registry
    }

    #[test]
    fn test_dispatch_runs_in_list_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&log);
        let entries = vec![BuildScriptEntry::new("last"), BuildScriptEntry::new("first")];
        let mut dispatcher = HookDispatcher::resolve(&entries, &registry).unwrap();
        let mut scene = MemoryScene::new();
        dispatcher
            .dispatch(Hook::PreRigBuild, "rig", &[], &mut scene)
            .unwrap();
        // hooks a script does not implement are no-ops
        dispatcher
            .dispatch(Hook::PostRigBuild, "rig", &[], &mut scene)
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["last:preRigBuild".to_string(), "first:preRigBuild".to_string()]
        );
    }

    #[test]
    fn test_failure_stops_remaining_scripts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&log);
        let entries = vec![
            BuildScriptEntry::new("first"),
            BuildScriptEntry::new("failing"),
            BuildScriptEntry::new("last"),
        ];
        let mut dispatcher = HookDispatcher::resolve(&entries, &registry).unwrap();
        let mut scene = MemoryScene::new();
        let err = dispatcher
            .dispatch(Hook::PreRigBuild, "rig", &[], &mut scene)
            .unwrap_err();
        match err {
            HiveError::HookExecutionFailure {
                script,
                hook,
                message,
            } => {
                assert_eq!(script, "failing");
                assert_eq!(hook, "preRigBuild");
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_validates_properties() {
        let registry = BuildScriptRegistry::builtin();
        let unknown = vec![BuildScriptEntry::new("nope")];
        assert!(matches!(
            HookDispatcher::resolve(&unknown, &registry),
            Err(HiveError::UnknownBuildScript(_))
        ));

        let wrong_type = vec![BuildScriptEntry::new(STAGE_LOG_ID)
            .with_property("enabled", PropertyValue::Text("yes".into()))];
        assert!(matches!(
            HookDispatcher::resolve(&wrong_type, &registry),
            Err(HiveError::InvalidProperty { .. })
        ));

        let undeclared = vec![BuildScriptEntry::new(STAGE_LOG_ID)
            .with_property("colour", PropertyValue::Text("red".into()))];
        assert!(HookDispatcher::resolve(&undeclared, &registry).is_err());
    }

    #[test]
    fn test_stage_log_appends_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stages.jsonl");
        let registry = BuildScriptRegistry::builtin();
        let entries = vec![BuildScriptEntry::new(STAGE_LOG_ID)
            .with_property(
                "outputPath",
                PropertyValue::Text(path.to_string_lossy().into_owned()),
            )
            .with_property("label", PropertyValue::Text("test".into()))];
        let mut dispatcher = HookDispatcher::resolve(&entries, &registry).unwrap();
        let mut scene = MemoryScene::new();
        let keys = vec![ComponentKey::new("arm", "L")];
        dispatcher
            .dispatch(Hook::PreGuideBuild, "hero", &keys, &mut scene)
            .unwrap();
        dispatcher
            .dispatch(Hook::PostGuideBuild, "hero", &keys, &mut scene)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["hook"], "preGuideBuild");
        assert_eq!(lines[1]["hook"], "postGuideBuild");
        assert_eq!(lines[0]["label"], "test");
        assert_eq!(lines[0]["rig"], "hero");
        assert_eq!(lines[0]["components"][0], "arm:L");
    }

    #[test]
    fn test_stage_log_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stages.jsonl");
        let registry = BuildScriptRegistry::builtin();
        let entries = vec![BuildScriptEntry::new(STAGE_LOG_ID)
            .with_property(
                "outputPath",
                PropertyValue::Text(path.to_string_lossy().into_owned()),
            )
            .with_property("enabled", PropertyValue::Bool(false))];
        let mut dispatcher = HookDispatcher::resolve(&entries, &registry).unwrap();
        let mut scene = MemoryScene::new();
        dispatcher
            .dispatch(Hook::PrePolish, "hero", &[], &mut scene)
            .unwrap();
        assert!(!path.exists());
    }
}
