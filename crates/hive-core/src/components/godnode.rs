//! Rig root: world placement controls that every other component hangs off

use crate::component::ComponentType;
use crate::definition::{Definition, EntityDescriptor, LayerKind};
use crate::error::Result;
use crate::guides::Guide;
use crate::layer::IdMapping;

#[derive(Debug, Clone, Copy, Default)]
pub struct Godnode;

const CONTROLS: [(&str, Option<&str>, &str); 3] = [
    ("godnode", None, "godnode"),
    ("offset", Some("godnode"), "circle"),
    ("rootMotion", Some("offset"), "arrow"),
];

impl ComponentType for Godnode {
    fn type_name(&self) -> &str {
        "godnode"
    }

    fn initialize(&self, definition: &mut Definition) -> Result<()> {
        for (id, parent, shape) in CONTROLS {
            let mut guide = Guide::new(id, parent, [0.0, 0.0, 0.0]).with_shape(shape);
            guide.mirror = false;
            definition.guide_layer.guides.insert(guide)?;

            let mut control = EntityDescriptor::new(id).with_shape(shape);
            control.parent = parent.map(str::to_string);
            definition.rig_layer.upsert(control);
            definition.output_layer.upsert(EntityDescriptor::new(id));
        }
        definition.deform_layer.upsert(EntityDescriptor::new("root"));
        definition.input_layer.upsert(EntityDescriptor::new("root"));
        Ok(())
    }

    /// The single deform joint is `root`, driven by the `rootMotion` role
    fn id_mapping(&self, definition: &Definition) -> IdMapping {
        let mut mapping = IdMapping::identity(definition);
        mapping.unset_local(LayerKind::Deform, "root");
        mapping.set(LayerKind::Deform, "rootMotion", "root");
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, Stage};
    use crate::config::RigSettings;
    use crate::naming::{NameManager, DEFAULT_PRESET};
    use crate::scene::MemoryScene;
    use std::sync::Arc;

    #[test]
    fn test_root_joint_follows_root_motion() {
        let mut definition = Definition::new("global", "M", "godnode");
        Godnode.initialize(&mut definition).unwrap();
        let mapping = Godnode.id_mapping(&definition);
        assert_eq!(mapping.resolve(LayerKind::Deform, "rootMotion"), Some("root"));
        assert_eq!(mapping.resolve(LayerKind::Deform, "root"), None);

        let mut component = Component::new(definition, Arc::new(Godnode));
        let mut scene = MemoryScene::new();
        let names = NameManager::builtin().unwrap();
        let settings = RigSettings::default();
        for stage in [Stage::Guides, Stage::GuideControls, Stage::Deform, Stage::Rig] {
            component
                .run_stage(stage, &mut scene, names.resolver(DEFAULT_PRESET), &settings, None)
                .unwrap();
        }

        let joint = component.layers().deform.entity("root").unwrap();
        let control = component.layers().rig.entity("rootMotion").unwrap();
        let drivers = scene.bindings_driving(joint);
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].drivers, vec![control]);
        assert!(scene.find_by_name("global_M_rootMotion_anim").is_some());
    }
}
