//! Forward kinematic chain with a configurable number of segments

use crate::component::ComponentType;
use crate::definition::{Definition, EntityDescriptor, SettingValue};
use crate::error::Result;
use crate::guides::Guide;

/// Guide setting holding the number of chain joints
pub const JOINT_COUNT_SETTING: &str = "jointCount";
const DEFAULT_JOINT_COUNT: i64 = 3;
const SEGMENT_LENGTH: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct FkChain;

pub fn joint_id(index: usize) -> String {
    format!("fk{:02}", index + 1)
}

impl ComponentType for FkChain {
    fn type_name(&self) -> &str {
        "fkchain"
    }

    fn initialize(&self, definition: &mut Definition) -> Result<()> {
        let count = definition
            .setting_i64(JOINT_COUNT_SETTING, DEFAULT_JOINT_COUNT)
            .max(1) as usize;
        definition
            .guide_layer
            .settings
            .insert(JOINT_COUNT_SETTING.to_string(), SettingValue::Int(count as i64));

        for index in 0..count {
            let id = joint_id(index);
            let parent = index.checked_sub(1).map(joint_id);
            let position = [index as f64 * SEGMENT_LENGTH, 0.0, 0.0];
            let mut guide = Guide::new(id.as_str(), parent.as_deref(), position).with_shape("circle");
            // the last guide has nothing to aim at
            guide.auto_align = index + 1 < count;
            definition.guide_layer.guides.insert(guide)?;

            let mut joint = EntityDescriptor::new(id.as_str());
            let mut control = EntityDescriptor::new(id.as_str()).with_shape("circle");
            if let Some(parent) = parent {
                joint = joint.with_parent(parent.as_str());
                control = control.with_parent(parent);
            }
            definition.deform_layer.upsert(joint);
            definition.output_layer.upsert(EntityDescriptor::new(id.as_str()));
            definition.rig_layer.upsert(control);
        }
        definition.input_layer.upsert(EntityDescriptor::new("root"));
        Ok(())
    }
}
