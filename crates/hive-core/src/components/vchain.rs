//! Three-joint limb (`upr`, `mid`, `end`) with FK controls, an IK end
//! control and a pole vector. Twist and volume subsystems are switched on
//! through guide settings.

use crate::component::{wire_controls, BuildContext, ComponentType};
use crate::definition::{Definition, EntityDescriptor, LayerKind, SettingValue};
use crate::error::Result;
use crate::guides::Guide;
use crate::layer::IdMapping;
use crate::scene::{AttributeValue, EntityKind};
use crate::subsystem::{Subsystem, TwistSubsystem, VolumeSubsystem, TWIST_COUNT_SETTING, VOLUME_SETTING};

const DEFAULT_TWIST_COUNT: i64 = 2;

/// Role to rig-layer control
const CONTROL_ROLES: [(&str, &str); 5] = [
    ("upr", "uprFk"),
    ("mid", "midFk"),
    ("end", "endFk"),
    ("ik", "endIk"),
    ("upVec", "upVec"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct VChain;

impl ComponentType for VChain {
    fn type_name(&self) -> &str {
        "vchain"
    }

    fn initialize(&self, definition: &mut Definition) -> Result<()> {
        let settings = &mut definition.guide_layer.settings;
        settings
            .entry(TWIST_COUNT_SETTING.to_string())
            .or_insert(SettingValue::Int(DEFAULT_TWIST_COUNT));
        settings
            .entry(VOLUME_SETTING.to_string())
            .or_insert(SettingValue::Bool(false));

        let guides = &mut definition.guide_layer.guides;
        let mut upr = Guide::new("upr", None, [0.0, 0.0, 0.0]).with_auto_align();
        upr.aim_target = Some("mid".into());
        upr.up_reference = Some("upVec".into());
        let mut mid = Guide::new("mid", Some("upr"), [3.0, 0.0, -0.2]).with_auto_align();
        mid.aim_target = Some("end".into());
        mid.up_reference = Some("upVec".into());
        guides.insert(upr.with_shape("circle"))?;
        guides.insert(mid.with_shape("circle"))?;
        guides.insert(Guide::new("end", Some("mid"), [6.0, 0.0, 0.0]).with_shape("cube"))?;
        guides.insert(Guide::new("upVec", Some("upr"), [3.0, 0.0, -3.0]).with_shape("diamond"))?;

        for (id, parent) in [("upr", None), ("mid", Some("upr")), ("end", Some("mid"))] {
            let mut joint = EntityDescriptor::new(id);
            joint.parent = parent.map(str::to_string);
            definition.deform_layer.upsert(joint);
            definition.output_layer.upsert(EntityDescriptor::new(id));
        }
        definition.input_layer.upsert(EntityDescriptor::new("root"));

        definition.rig_layer.upsert(EntityDescriptor::new("uprFk").with_shape("circle"));
        definition
            .rig_layer
            .upsert(EntityDescriptor::new("midFk").with_parent("uprFk").with_shape("circle"));
        definition
            .rig_layer
            .upsert(EntityDescriptor::new("endFk").with_parent("midFk").with_shape("circle"));
        definition.rig_layer.upsert(EntityDescriptor::new("endIk").with_shape("cube"));
        definition.rig_layer.upsert(EntityDescriptor::new("upVec").with_shape("diamond"));
        Ok(())
    }

    fn id_mapping(&self, definition: &Definition) -> IdMapping {
        let mut mapping = IdMapping::identity(definition);
        mapping.rig.clear();
        for (role, local) in CONTROL_ROLES {
            if definition.rig_layer.contains(local) {
                mapping.set(LayerKind::Rig, role, local);
            }
        }
        mapping
    }

    fn setup_rig(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let end = ctx.guide_transform("end");
        ctx.build_layer_entities(LayerKind::Rig, EntityKind::Control, move |_, descriptor| {
            (descriptor.id == "endIk").then_some(end).flatten()
        })?;
        wire_controls(ctx)?;
        if let Some(ik) = ctx.layers.rig.entity("endIk") {
            ctx.scene.set_attribute(ik, "ikFkBlend", AttributeValue::Float(0.0))?;
        }
        Ok(())
    }

    fn subsystems(&self, definition: &Definition) -> Vec<Box<dyn Subsystem>> {
        let mut subsystems: Vec<Box<dyn Subsystem>> = Vec::new();
        let twists = definition
            .setting_i64(TWIST_COUNT_SETTING, DEFAULT_TWIST_COUNT)
            .max(0) as usize;
        if twists > 0 {
            subsystems.push(Box::new(TwistSubsystem::new("upr", "mid", twists)));
            subsystems.push(Box::new(TwistSubsystem::new("mid", "end", twists)));
        }
        if definition.setting_bool(VOLUME_SETTING, false) {
            subsystems.push(Box::new(VolumeSubsystem::new("mid")));
        }
        subsystems
    }
}
