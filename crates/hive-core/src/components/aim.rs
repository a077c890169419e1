//! Eye-style aim component. The `eye` role shares the input-layer `root`
//! entity, so a parent can address "my eye input" without knowing the type.

use crate::component::{wire_controls, BuildContext, ComponentType};
use crate::definition::{Definition, EntityDescriptor, LayerKind};
use crate::error::Result;
use crate::guides::Guide;
use crate::layer::IdMapping;
use crate::scene::{BindingKind, BindingSpec, EntityKind};

const AIM_DISTANCE: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Aim;

impl ComponentType for Aim {
    fn type_name(&self) -> &str {
        "aim"
    }

    fn initialize(&self, definition: &mut Definition) -> Result<()> {
        let guides = &mut definition.guide_layer.guides;
        guides.insert(Guide::new("root", None, [0.0, 0.0, 0.0]))?;
        let mut eye = Guide::new("eye", Some("root"), [0.0, 0.0, 0.0])
            .with_auto_align()
            .with_shape("circle");
        eye.aim_target = Some("aim".into());
        eye.auto_align_aim_vector = [0.0, 0.0, 1.0];
        guides.insert(eye)?;
        guides.insert(Guide::new("aim", Some("root"), [0.0, 0.0, AIM_DISTANCE]).with_shape("cross"))?;

        definition.input_layer.upsert(EntityDescriptor::new("root"));
        definition.deform_layer.upsert(EntityDescriptor::new("eye"));
        definition.output_layer.upsert(EntityDescriptor::new("eye"));
        definition.rig_layer.upsert(EntityDescriptor::new("aim").with_shape("cross"));
        definition.rig_layer.upsert(EntityDescriptor::new("eye").with_shape("circle"));
        Ok(())
    }

    fn id_mapping(&self, definition: &Definition) -> IdMapping {
        let mut mapping = IdMapping::identity(definition);
        mapping.set(LayerKind::Input, "eye", "root");
        mapping
    }

    fn setup_rig(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        ctx.build_layer_entities(LayerKind::Rig, EntityKind::Control, |_, _| None)?;
        wire_controls(ctx)?;
        let target = ctx.require_entity(LayerKind::Rig, "aim")?;
        let eye = ctx.require_entity(LayerKind::Rig, "eye")?;
        ctx.bind(
            LayerKind::Rig,
            BindingSpec {
                kind: BindingKind::Aim,
                drivers: vec![target],
                driven: eye,
                maintain_offset: false,
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::component::Stage;
    use crate::config::RigSettings;
    use crate::naming::{NameManager, DEFAULT_PRESET};
    use crate::scene::MemoryScene;
    use std::sync::Arc;

    #[test]
    fn test_eye_role_maps_to_input_root() {
        let mut definition = Definition::new("eye", "L", "aim");
        Aim.initialize(&mut definition).unwrap();
        let mapping = Aim.id_mapping(&definition);
        assert_eq!(mapping.resolve(LayerKind::Input, "eye"), Some("root"));
        assert_eq!(mapping.resolve(LayerKind::Input, "root"), Some("root"));
        assert_eq!(mapping.role_for(LayerKind::Input, "root"), Some("root"));
    }

    #[test]
    fn test_eye_control_aims_at_target() {
        let mut definition = Definition::new("eye", "L", "aim");
        Aim.initialize(&mut definition).unwrap();
        let mut component = Component::new(definition, Arc::new(Aim));
        let mut scene = MemoryScene::new();
        let names = NameManager::builtin().unwrap();
        let settings = RigSettings::default();
        for stage in [Stage::Guides, Stage::GuideControls, Stage::Deform, Stage::Rig] {
            component
                .run_stage(stage, &mut scene, names.resolver(DEFAULT_PRESET), &settings, None)
                .unwrap();
        }
        let eye = component.layers().rig.entity("eye").unwrap();
        let target = component.layers().rig.entity("aim").unwrap();
        let aims: Vec<_> = scene
            .bindings_driving(eye)
            .into_iter()
            .filter(|b| b.kind == BindingKind::Aim)
            .collect();
        assert_eq!(aims.len(), 1);
        assert_eq!(aims[0].drivers, vec![target]);
    }
}
