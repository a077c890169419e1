//! Subsystems: optional features a component composes into its stages
//!
//! A subsystem shares its owner's state machine. The owner runs each
//! subsystem's stage method right after its own, with the same build context.

use glam::DVec3;

use crate::component::BuildContext;
use crate::definition::{EntityDescriptor, LayerKind};
use crate::error::{HiveError, Result};
use crate::guides::Guide;
use crate::math::Transform;
use crate::scene::{BindingKind, BindingSpec, EntityKind};

/// Definition setting holding the number of twist joints per segment
pub const TWIST_COUNT_SETTING: &str = "twistCount";
/// Definition setting enabling mid-joint volume preservation
pub const VOLUME_SETTING: &str = "volumePreservation";

pub trait Subsystem {
    fn name(&self) -> &str;

    fn setup_guide(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
        Ok(())
    }

    fn setup_deform_layer(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
        Ok(())
    }

    fn setup_rig(&self, _ctx: &mut BuildContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Evenly spaced twist joints between two deform joints
#[derive(Debug, Clone)]
pub struct TwistSubsystem {
    pub start: String,
    pub end: String,
    pub count: usize,
}

impl TwistSubsystem {
    pub fn new(start: &str, end: &str, count: usize) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            count,
        }
    }

    pub fn joint_ids(&self) -> Vec<String> {
        (1..=self.count)
            .map(|i| format!("{}Twist{:02}", self.start, i))
            .collect()
    }
}

impl Subsystem for TwistSubsystem {
    fn name(&self) -> &str {
        "twist"
    }

    fn setup_deform_layer(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let start = ctx.require_entity(LayerKind::Deform, &self.start)?;
        let end = ctx.require_entity(LayerKind::Deform, &self.end)?;
        let start_world = ctx.scene.world_transform(start)?;
        let end_world = ctx.scene.world_transform(end)?;
        let from = start_world.translation();
        let to = end_world.translation();

        for (i, id) in self.joint_ids().into_iter().enumerate() {
            // spread over the segment, the last twist stays short of the end joint
            let t = i as f64 / self.count as f64;
            let mut transform = start_world;
            transform.translate = from.lerp(to, t).to_array();
            ctx.create_in_layer(
                LayerKind::Deform,
                &id,
                EntityKind::Joint,
                Some(start),
                transform,
                None,
            )?;
            ctx.definition.deform_layer.upsert(
                EntityDescriptor::new(id.as_str())
                    .with_parent(self.start.as_str())
                    .with_transform(transform),
            );
        }
        Ok(())
    }

    fn setup_rig(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let start = ctx.require_entity(LayerKind::Deform, &self.start)?;
        let end = ctx.require_entity(LayerKind::Deform, &self.end)?;
        for id in self.joint_ids() {
            let joint = ctx.require_entity(LayerKind::Deform, &id)?;
            ctx.bind(
                LayerKind::Deform,
                BindingSpec {
                    kind: BindingKind::Orient,
                    drivers: vec![start, end],
                    driven: joint,
                    maintain_offset: true,
                },
            )?;
        }
        Ok(())
    }
}

/// Helper joint that scales with the bend of a mid joint
#[derive(Debug, Clone)]
pub struct VolumeSubsystem {
    pub joint: String,
}

impl VolumeSubsystem {
    pub fn new(joint: &str) -> Self {
        Self {
            joint: joint.to_string(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}Volume", self.joint)
    }
}

impl Subsystem for VolumeSubsystem {
    fn name(&self) -> &str {
        "volume"
    }

    fn setup_guide(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let id = self.id();
        let guides = &mut ctx.definition.guide_layer.guides;
        if !guides.contains(&id) {
            let anchor = guides.get(&self.joint).ok_or_else(|| HiveError::UnknownGuide {
                component: format!("{}:{}", ctx.definition.name, ctx.definition.side),
                guide: self.joint.clone(),
            })?;
            let position = anchor.transform.translation() + DVec3::Y;
            let mut guide = Guide::new(id.as_str(), Some(&self.joint), position.to_array());
            guide.transform.rotate = anchor.transform.rotate;
            guides.insert(guide)?;
        }
        let transform = ctx.guide_transform(&id).unwrap_or(Transform::IDENTITY);
        let parent = ctx.layers.guide.entity(&self.joint).or(ctx.layers.guide.root);
        ctx.create_in_layer(LayerKind::Guide, &id, EntityKind::Guide, parent, transform, None)?;
        Ok(())
    }

    fn setup_deform_layer(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let id = self.id();
        let parent = ctx.require_entity(LayerKind::Deform, &self.joint)?;
        let transform = match ctx.guide_transform(&id) {
            Some(t) => t,
            None => ctx.scene.world_transform(parent)?,
        };
        ctx.create_in_layer(LayerKind::Deform, &id, EntityKind::Joint, Some(parent), transform, None)?;
        ctx.definition.deform_layer.upsert(
            EntityDescriptor::new(id.as_str())
                .with_parent(self.joint.as_str())
                .with_transform(transform),
        );
        Ok(())
    }

    fn setup_rig(&self, ctx: &mut BuildContext<'_>) -> Result<()> {
        let driver = ctx.require_entity(LayerKind::Deform, &self.joint)?;
        let driven = ctx.require_entity(LayerKind::Deform, &self.id())?;
        ctx.bind(
            LayerKind::Deform,
            BindingSpec {
                kind: BindingKind::Scale,
                drivers: vec![driver],
                driven,
                maintain_offset: true,
            },
        )?;
        Ok(())
    }
}
