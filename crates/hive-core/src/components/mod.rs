//! Built-in component types and the registry that selects them by `type` tag

mod aim;
mod fkchain;
mod godnode;
mod vchain;

pub use aim::Aim;
pub use fkchain::FkChain;
pub use godnode::Godnode;
pub use vchain::VChain;

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

use crate::component::{Component, ComponentType};
use crate::definition::Definition;
use crate::error::{HiveError, Result};

/// Component types known to a rig, keyed by their `type` tag
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    types: IndexMap<String, Arc<dyn ComponentType>>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `godnode`, `fkchain`, `vchain` and `aim`
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Godnode));
        registry.register(Arc::new(FkChain));
        registry.register(Arc::new(VChain));
        registry.register(Arc::new(Aim));
        registry
    }

    /// Add a type, replacing any type registered under the same tag
    pub fn register(&mut self, behaviour: Arc<dyn ComponentType>) {
        self.types.insert(behaviour.type_name().to_string(), behaviour);
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn ComponentType>> {
        self.types
            .get(type_name)
            .cloned()
            .ok_or_else(|| HiveError::UnknownComponentType(type_name.to_string()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Fresh component with the type's default definition
    pub fn create(&self, type_name: &str, name: &str, side: &str) -> Result<Component> {
        let behaviour = self.get(type_name)?;
        let mut definition = Definition::new(name, side, type_name);
        behaviour.initialize(&mut definition)?;
        Ok(Component::new(definition, behaviour))
    }

    /// Component for an existing definition
    pub fn instantiate(&self, definition: Definition) -> Result<Component> {
        let behaviour = self.get(&definition.component_type)?;
        Ok(Component::new(definition, behaviour))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{BuildState, Stage};
    use crate::config::RigSettings;
    use crate::definition::LayerKind;
    use crate::naming::{NameManager, DEFAULT_PRESET};
    use crate::scene::MemoryScene;

    fn build_all(component: &mut Component, scene: &mut MemoryScene) {
        let names = NameManager::builtin().unwrap();
        let settings = RigSettings::default();
        for stage in Stage::ALL {
            component
                .run_stage(stage, scene, names.resolver(DEFAULT_PRESET), &settings, None)
                .unwrap();
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = ComponentRegistry::builtin();
        assert!(matches!(
            registry.create("tentacle", "a", "M"),
            Err(HiveError::UnknownComponentType(_))
        ));
        assert_eq!(
            registry.type_names().collect::<Vec<_>>(),
            vec!["godnode", "fkchain", "vchain", "aim"]
        );
    }

    #[test]
    fn test_every_builtin_builds_to_polished() {
        let registry = ComponentRegistry::builtin();
        let names: Vec<String> = registry.type_names().map(str::to_string).collect();
        for type_name in names {
            let mut scene = MemoryScene::new();
            let mut component = registry.create(&type_name, "part", "L").unwrap();
            build_all(&mut component, &mut scene);
            assert_eq!(component.state(), BuildState::Polished, "{}", type_name);
            assert!(!component.layers().deform.is_empty(), "{}", type_name);
            assert!(!component.layers().rig.is_empty(), "{}", type_name);
        }
    }

    #[test]
    fn test_default_definitions_survive_serde() {
        let registry = ComponentRegistry::builtin();
        for type_name in ["godnode", "fkchain", "vchain", "aim"] {
            let component = registry.create(type_name, "part", "R").unwrap();
            let value = component.definition().to_value().unwrap();
            let back = Definition::from_value(value).unwrap();
            assert_eq!(&back, component.definition());
            assert!(back.layer(LayerKind::Input).unwrap().contains("root"));
        }
    }
}
