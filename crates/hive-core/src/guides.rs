//! Guide trees: placement markers with alignment, mirroring and reparenting
//!
//! Guide transforms are stored in world space. A tree has exactly one root and
//! every other guide names one parent; the ordering of the underlying map is
//! the authoring order and is preserved through serialization.
//!
//! Every mutating operation returns [`GuideRecovery`] records holding the
//! previous parent and transform of each guide it changed. Feeding them back
//! to [`GuideTree::restore`] puts the tree back exactly as it was.

use glam::{DAffine3, DQuat, DVec3};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::definition::SettingValue;
use crate::error::{HiveError, Result};
use crate::math::{self, dominant_axis, Axis, MirrorPlane, Transform, EPSILON};

/// How a guide's rotation is reflected when mirrored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorBehaviour {
    /// Keep the functional orientation: re-derive it from the mirrored aim
    #[default]
    Behaviour,
    /// Keep literal numeric symmetry of the rotation values
    Relative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guide {
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub transform: Transform,
    /// Shape used for the optional control drawn around the guide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default)]
    pub auto_align: bool,
    #[serde(default = "default_aim_vector")]
    pub auto_align_aim_vector: [f64; 3],
    #[serde(default = "default_up_vector")]
    pub auto_align_up_vector: [f64; 3],
    /// Guide aimed at when auto aligning; first child when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aim_target: Option<String>,
    /// Guide providing the world up; tree root when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_reference: Option<String>,
    #[serde(default = "default_true")]
    pub mirror: bool,
    #[serde(default)]
    pub mirror_behaviour: MirrorBehaviour,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, SettingValue>,
}

fn default_aim_vector() -> [f64; 3] {
    [1.0, 0.0, 0.0]
}

fn default_up_vector() -> [f64; 3] {
    [0.0, 1.0, 0.0]
}

fn default_true() -> bool {
    true
}

impl Guide {
    pub fn new(id: impl Into<String>, parent: Option<&str>, translate: [f64; 3]) -> Self {
        Self {
            id: id.into(),
            parent: parent.map(str::to_string),
            transform: Transform::from_translation(translate),
            shape: None,
            auto_align: false,
            auto_align_aim_vector: default_aim_vector(),
            auto_align_up_vector: default_up_vector(),
            aim_target: None,
            up_reference: None,
            mirror: true,
            mirror_behaviour: MirrorBehaviour::default(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_auto_align(mut self) -> Self {
        self.auto_align = true;
        self
    }

    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn aim_vector(&self) -> DVec3 {
        DVec3::from_array(self.auto_align_aim_vector)
    }

    pub fn up_vector(&self) -> DVec3 {
        DVec3::from_array(self.auto_align_up_vector)
    }
}

/// Previous state of one guide, enough to undo a change to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideRecovery {
    pub guide: String,
    pub parent: Option<String>,
    pub transform: Transform,
}

/// Ordered tree of guides for one component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Guide>", into = "Vec<Guide>")]
pub struct GuideTree {
    guides: IndexMap<String, Guide>,
}

impl TryFrom<Vec<Guide>> for GuideTree {
    type Error = HiveError;

    fn try_from(list: Vec<Guide>) -> Result<Self> {
        let mut guides = IndexMap::with_capacity(list.len());
        for guide in list {
            if guides.contains_key(&guide.id) {
                return Err(HiveError::InvalidGuideTree(format!(
                    "duplicate guide id '{}'",
                    guide.id
                )));
            }
            guides.insert(guide.id.clone(), guide);
        }
        let tree = Self { guides };
        tree.validate()?;
        Ok(tree)
    }
}

impl From<GuideTree> for Vec<Guide> {
    fn from(tree: GuideTree) -> Self {
        tree.guides.into_values().collect()
    }
}

impl GuideTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the single-root, known-parent and acyclic invariants
    pub fn validate(&self) -> Result<()> {
        let roots = self.guides.values().filter(|g| g.parent.is_none()).count();
        if !self.guides.is_empty() && roots != 1 {
            return Err(HiveError::InvalidGuideTree(format!(
                "expected one root guide, found {}",
                roots
            )));
        }
        for guide in self.guides.values() {
            if let Some(parent) = &guide.parent {
                if !self.guides.contains_key(parent) {
                    return Err(HiveError::InvalidGuideTree(format!(
                        "guide '{}' has unknown parent '{}'",
                        guide.id, parent
                    )));
                }
            }
            if self.ancestors(&guide.id).iter().any(|a| a == &guide.id) {
                return Err(HiveError::InvalidGuideTree(format!(
                    "guide '{}' is part of a parent cycle",
                    guide.id
                )));
            }
        }
        Ok(())
    }

    /// Add a guide. Its parent must already be present, and only the first
    /// guide may be a root.
    pub fn insert(&mut self, guide: Guide) -> Result<()> {
        if self.guides.contains_key(&guide.id) {
            return Err(HiveError::InvalidGuideTree(format!(
                "duplicate guide id '{}'",
                guide.id
            )));
        }
        match &guide.parent {
            Some(parent) if !self.guides.contains_key(parent) => {
                return Err(HiveError::InvalidGuideTree(format!(
                    "guide '{}' has unknown parent '{}'",
                    guide.id, parent
                )))
            }
            None if !self.guides.is_empty() => {
                return Err(HiveError::InvalidGuideTree(format!(
                    "guide '{}' would be a second root",
                    guide.id
                )))
            }
            _ => {}
        }
        self.guides.insert(guide.id.clone(), guide);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Guide> {
        self.guides.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Guide> {
        self.guides.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.guides.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.guides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guides.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Guide> {
        self.guides.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.guides.keys().map(String::as_str)
    }

    pub fn root(&self) -> Option<&Guide> {
        self.guides.values().find(|g| g.parent.is_none())
    }

    pub fn children(&self, id: &str) -> Vec<&Guide> {
        self.guides
            .values()
            .filter(|g| g.parent.as_deref() == Some(id))
            .collect()
    }

    /// Parent chain of a guide, nearest first. Stops on a loop.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut current = self.guides.get(id).and_then(|g| g.parent.clone());
        while let Some(parent) = current {
            if parent == id || chain.contains(&parent) {
                chain.push(parent);
                break;
            }
            current = self.guides.get(&parent).and_then(|g| g.parent.clone());
            chain.push(parent);
        }
        chain
    }

    /// Every guide below `id`, in tree order
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut stack: Vec<String> = self
            .children(id)
            .into_iter()
            .rev()
            .map(|g| g.id.clone())
            .collect();
        while let Some(current) = stack.pop() {
            if found.contains(&current) {
                continue;
            }
            stack.extend(self.children(&current).into_iter().rev().map(|g| g.id.clone()));
            found.push(current);
        }
        found
    }

    /// Remove a guide, handing its children to its parent
    pub fn remove(&mut self, id: &str) -> Result<Guide> {
        let guide = self.guides.get(id).ok_or_else(|| unknown(id))?;
        let parent = guide.parent.clone();
        if parent.is_none() && self.guides.len() > 1 {
            return Err(HiveError::InvalidGuideTree(format!(
                "cannot remove root guide '{}' while it has children",
                id
            )));
        }
        for child in self.guides.values_mut() {
            if child.parent.as_deref() == Some(id) {
                child.parent = parent.clone();
            }
        }
        self.guides.shift_remove(id).ok_or_else(|| unknown(id))
    }

    /// Reparent `id` under `new_parent`.
    ///
    /// With `use_srt` the guide keeps its world transform. Without it the
    /// guide keeps its offset relative to its parent, so it moves with the new
    /// parent and carries its descendants along. A move that would put a guide
    /// under its own descendant is rejected without touching the tree.
    pub fn set_parent(
        &mut self,
        id: &str,
        new_parent: &str,
        use_srt: bool,
    ) -> Result<Vec<GuideRecovery>> {
        let guide = self.guides.get(id).ok_or_else(|| unknown(id))?;
        let new_parent_guide = self.guides.get(new_parent).ok_or_else(|| unknown(new_parent))?;
        if id == new_parent || self.ancestors(new_parent).iter().any(|a| a == id) {
            return Err(HiveError::InvalidParentAssignment(format!(
                "guide '{}' cannot be parented under its descendant '{}'",
                id, new_parent
            )));
        }
        if guide.parent.as_deref() == Some(new_parent) {
            return Ok(Vec::new());
        }

        let old_world = guide.transform.to_affine();
        let moved_world = if use_srt {
            old_world
        } else {
            let old_parent_world = guide
                .parent
                .as_deref()
                .and_then(|p| self.guides.get(p))
                .map(|p| p.transform.to_affine())
                .unwrap_or(DAffine3::IDENTITY);
            let local = old_parent_world.inverse() * old_world;
            new_parent_guide.transform.to_affine() * local
        };

        let mut moved = vec![id.to_string()];
        if !use_srt {
            moved.extend(self.descendants(id));
        }
        let recovery = self.snapshot(&moved);

        let delta = moved_world * old_world.inverse();
        for guide_id in &moved {
            if let Some(guide) = self.guides.get_mut(guide_id) {
                if guide_id == id {
                    guide.parent = Some(new_parent.to_string());
                }
                if !use_srt {
                    guide.transform = Transform::from_affine(&(delta * guide.transform.to_affine()));
                }
            }
        }
        Ok(recovery)
    }

    /// Apply several reparent requests as one transaction.
    ///
    /// Requests are applied in order to a scratch copy; the tree is only
    /// updated when every request succeeds.
    pub fn set_parents(
        &mut self,
        requests: &[(String, String)],
        use_srt: bool,
    ) -> Result<Vec<GuideRecovery>> {
        let mut scratch = self.clone();
        let mut recovery = Vec::new();
        for (id, parent) in requests {
            recovery.extend(scratch.set_parent(id, parent, use_srt)?);
        }
        *self = scratch;
        Ok(recovery)
    }

    /// Orient every auto-aligned guide towards its aim target.
    ///
    /// The world up is the reference guide's axis matching the dominant
    /// axis of the guide's up vector. Guides without a target, or sitting on
    /// their target, keep their orientation.
    pub fn align(&mut self) -> Vec<GuideRecovery> {
        let root = self.root().map(|g| g.id.clone());
        let mut recovery = Vec::new();
        let ids: Vec<String> = self.guides.keys().cloned().collect();
        for id in ids {
            let Some(guide) = self.guides.get(&id) else {
                continue;
            };
            if !guide.auto_align {
                continue;
            }
            let target = guide
                .aim_target
                .clone()
                .or_else(|| self.children(&id).first().map(|c| c.id.clone()));
            let Some(target) = target.and_then(|t| self.guides.get(&t)) else {
                continue;
            };

            let reference = guide
                .up_reference
                .as_deref()
                .or(root.as_deref())
                .filter(|r| *r != id)
                .and_then(|r| self.guides.get(r))
                .map(|r| r.transform.rotation())
                .unwrap_or(DQuat::IDENTITY);
            let world_up = reference * (up_axis_offset(guide.up_vector()) * DVec3::Y);

            let Some(orientation) = math::look_at(
                guide.transform.translation(),
                target.transform.translation(),
                guide.aim_vector(),
                guide.up_vector(),
                world_up,
            ) else {
                continue;
            };

            let mut aligned = guide.transform;
            aligned.set_rotation(orientation);
            if !aligned.approx_eq(&guide.transform, EPSILON) {
                recovery.push(GuideRecovery {
                    guide: id.clone(),
                    parent: guide.parent.clone(),
                    transform: guide.transform,
                });
                if let Some(guide) = self.guides.get_mut(&id) {
                    guide.transform = aligned;
                }
            }
        }
        recovery
    }

    /// Mirrored world transforms for every guide flagged `mirror`.
    ///
    /// Translation components listed in `axes` are negated and the rotation is
    /// reflected across `plane` following each guide's [`MirrorBehaviour`].
    pub fn mirrored(&self, axes: &[Axis], plane: MirrorPlane) -> Vec<(String, Transform)> {
        self.guides
            .values()
            .filter(|g| g.mirror)
            .map(|g| (g.id.clone(), mirror_transform(g, axes, plane)))
            .collect()
    }

    /// Set world transforms, all or nothing.
    ///
    /// Every id is checked before anything changes. Returns recovery data for
    /// the guides whose transform actually changed.
    pub fn apply(&mut self, changes: &[(String, Transform)]) -> Result<Vec<GuideRecovery>> {
        if let Some((missing, _)) = changes.iter().find(|(id, _)| !self.guides.contains_key(id)) {
            return Err(unknown(missing));
        }
        let mut recovery = Vec::new();
        for (id, transform) in changes {
            if let Some(guide) = self.guides.get_mut(id) {
                if guide.transform != *transform {
                    recovery.push(GuideRecovery {
                        guide: id.clone(),
                        parent: guide.parent.clone(),
                        transform: guide.transform,
                    });
                    guide.transform = *transform;
                }
            }
        }
        Ok(recovery)
    }

    /// Undo changes described by recovery data, newest first
    pub fn restore(&mut self, recovery: &[GuideRecovery]) -> Result<()> {
        if let Some(entry) = recovery.iter().find(|r| !self.guides.contains_key(&r.guide)) {
            return Err(unknown(&entry.guide));
        }
        for entry in recovery.iter().rev() {
            if let Some(guide) = self.guides.get_mut(&entry.guide) {
                guide.parent = entry.parent.clone();
                guide.transform = entry.transform;
            }
        }
        Ok(())
    }

    fn snapshot(&self, ids: &[String]) -> Vec<GuideRecovery> {
        ids.iter()
            .filter_map(|id| self.guides.get(id))
            .map(|g| GuideRecovery {
                guide: g.id.clone(),
                parent: g.parent.clone(),
                transform: g.transform,
            })
            .collect()
    }
}

fn unknown(id: &str) -> HiveError {
    HiveError::InvalidGuideTree(format!("unknown guide '{}'", id))
}

/// Rotation taking world Y onto the dominant axis of `up`
fn up_axis_offset(up: DVec3) -> DQuat {
    use std::f64::consts::{FRAC_PI_2, PI};
    match dominant_axis(up) {
        (Axis::Y, s) if s > 0.0 => DQuat::IDENTITY,
        (Axis::Y, _) => DQuat::from_rotation_x(PI),
        (Axis::X, s) if s > 0.0 => DQuat::from_rotation_z(-FRAC_PI_2),
        (Axis::X, _) => DQuat::from_rotation_z(FRAC_PI_2),
        (Axis::Z, s) if s > 0.0 => DQuat::from_rotation_x(FRAC_PI_2),
        (Axis::Z, _) => DQuat::from_rotation_x(-FRAC_PI_2),
    }
}

fn mirror_transform(guide: &Guide, axes: &[Axis], plane: MirrorPlane) -> Transform {
    let rotation = guide.transform.rotation_matrix();
    let mirrored = match guide.mirror_behaviour {
        MirrorBehaviour::Relative => math::mirror_rotation_relative(rotation, plane),
        MirrorBehaviour::Behaviour => math::mirror_rotation_behaviour(
            rotation,
            plane,
            guide.aim_vector(),
            guide.up_vector(),
        ),
    };
    let mut out = guide.transform;
    out.translate = math::mirror_translation(guide.transform.translate, axes);
    out.set_rotation(DQuat::from_mat3(&mirrored));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GuideTree {
        let mut tree = GuideTree::new();
        tree.insert(Guide::new("upr", None, [1.0, 5.0, 0.0]).with_auto_align())
            .unwrap();
        tree.insert(Guide::new("mid", Some("upr"), [3.0, 5.0, -0.5]).with_auto_align())
            .unwrap();
        tree.insert(Guide::new("end", Some("mid"), [5.0, 5.0, 0.0]))
            .unwrap();
        tree
    }

    #[test]
    fn test_insert_enforces_single_root_and_known_parent() {
        let mut tree = chain();
        assert!(tree.insert(Guide::new("other", None, [0.0; 3])).is_err());
        assert!(tree.insert(Guide::new("x", Some("nope"), [0.0; 3])).is_err());
        assert!(tree.insert(Guide::new("mid", Some("upr"), [0.0; 3])).is_err());
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.root().unwrap().id, "upr");
    }

    #[test]
    fn test_set_parent_rejects_descendant_and_leaves_tree() {
        let mut tree = chain();
        let before = tree.clone();
        let err = tree.set_parent("upr", "end", true).unwrap_err();
        assert!(matches!(err, HiveError::InvalidParentAssignment(_)));
        assert!(tree.set_parent("mid", "mid", true).is_err());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_set_parent_keeps_world_with_srt() {
        let mut tree = chain();
        let end_before = tree.get("end").unwrap().transform;
        let recovery = tree.set_parent("end", "upr", true).unwrap();
        assert_eq!(tree.get("end").unwrap().parent.as_deref(), Some("upr"));
        assert_eq!(tree.get("end").unwrap().transform, end_before);
        assert_eq!(recovery.len(), 1);
        assert_eq!(recovery[0].parent.as_deref(), Some("mid"));
    }

    #[test]
    fn test_set_parent_without_srt_keeps_local_offset() {
        let mut tree = chain();
        tree.insert(Guide::new("tip", Some("end"), [6.0, 5.0, 0.0]))
            .unwrap();
        tree.insert(Guide::new("elbow", Some("upr"), [1.0, 8.0, 0.0]))
            .unwrap();
        // end sits 2 units from mid in x; under elbow it should sit 2 units from elbow
        let before = tree.clone();
        let recovery = tree.set_parent("end", "elbow", false).unwrap();
        let end = tree.get("end").unwrap().transform.translate;
        assert!((end[0] - 3.0).abs() < 1e-9);
        assert!((end[1] - 8.0).abs() < 1e-9);
        assert!((end[2] - 0.5).abs() < 1e-9);
        // descendants move with it
        let tip = tree.get("tip").unwrap().transform.translate;
        assert!((tip[0] - 4.0).abs() < 1e-9);

        tree.restore(&recovery).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn test_set_parents_is_transactional() {
        let mut tree = chain();
        tree.insert(Guide::new("extra", Some("upr"), [0.0; 3])).unwrap();
        let before = tree.clone();
        let requests = vec![
            ("extra".to_string(), "end".to_string()),
            ("upr".to_string(), "extra".to_string()),
        ];
        assert!(tree.set_parents(&requests, true).is_err());
        assert_eq!(tree, before);

        let ok = vec![("extra".to_string(), "end".to_string())];
        let recovery = tree.set_parents(&ok, true).unwrap();
        assert_eq!(tree.get("extra").unwrap().parent.as_deref(), Some("end"));
        tree.restore(&recovery).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn test_align_aims_at_first_child() {
        let mut tree = chain();
        let recovery = tree.align();
        assert_eq!(recovery.len(), 2);

        let upr = tree.get("upr").unwrap();
        let aim = upr.transform.rotation() * DVec3::X;
        let expected = (DVec3::new(3.0, 5.0, -0.5) - DVec3::new(1.0, 5.0, 0.0)).normalize();
        assert!(aim.abs_diff_eq(expected, 1e-9));

        // unaligned guides keep their orientation
        assert_eq!(tree.get("end").unwrap().transform.rotate, [0.0; 3]);
    }

    #[test]
    fn test_align_is_deterministic() {
        let mut a = chain();
        let mut b = chain();
        a.align();
        b.align();
        assert_eq!(a, b);
        // already aligned: nothing changes
        assert!(a.align().is_empty());
    }

    #[test]
    fn test_up_axis_offsets() {
        let cases = [
            (DVec3::Y, DVec3::Y),
            (DVec3::NEG_Y, DVec3::NEG_Y),
            (DVec3::X, DVec3::X),
            (DVec3::NEG_X, DVec3::NEG_X),
            (DVec3::Z, DVec3::Z),
            (DVec3::NEG_Z, DVec3::NEG_Z),
        ];
        for (up, expected) in cases {
            assert!((up_axis_offset(up) * DVec3::Y).abs_diff_eq(expected, 1e-9));
        }
    }

    #[test]
    fn test_double_mirror_is_identity() {
        let mut tree = chain();
        tree.align();
        tree.get_mut("mid").unwrap().mirror_behaviour = MirrorBehaviour::Relative;
        tree.get_mut("end").unwrap().transform.rotate = [12.0, -33.0, 71.0];
        let original = tree.clone();

        let axes = [Axis::X];
        let once = tree.mirrored(&axes, MirrorPlane::Yz);
        tree.apply(&once).unwrap();
        assert!((tree.get("upr").unwrap().transform.translate[0] + 1.0).abs() < 1e-9);

        let twice = tree.mirrored(&axes, MirrorPlane::Yz);
        tree.apply(&twice).unwrap();
        for guide in original.iter() {
            assert!(
                guide.transform.approx_eq(&tree.get(&guide.id).unwrap().transform, 1e-9),
                "{} drifted",
                guide.id
            );
        }
    }

    #[test]
    fn test_mirror_skips_unflagged_guides() {
        let mut tree = chain();
        tree.get_mut("end").unwrap().mirror = false;
        let changes = tree.mirrored(&[Axis::X], MirrorPlane::Yz);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|(id, _)| id != "end"));
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut tree = chain();
        let before = tree.clone();
        let changes = vec![
            ("upr".to_string(), Transform::from_translation([9.0, 9.0, 9.0])),
            ("ghost".to_string(), Transform::IDENTITY),
        ];
        assert!(tree.apply(&changes).is_err());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_serde_preserves_order_and_validates() {
        let tree = chain();
        let json = serde_json::to_string(&tree).unwrap();
        let back: GuideTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ids().collect::<Vec<_>>(), vec!["upr", "mid", "end"]);

        let cyclic = r#"[{"id": "a", "parent": "b"}, {"id": "b", "parent": "a"}]"#;
        assert!(serde_json::from_str::<GuideTree>(cyclic).is_err());
    }

    #[test]
    fn test_remove_hands_children_to_parent() {
        let mut tree = chain();
        tree.remove("mid").unwrap();
        assert_eq!(tree.get("end").unwrap().parent.as_deref(), Some("upr"));
        assert!(tree.remove("upr").is_err());
        assert_eq!(tree.descendants("upr"), vec!["end".to_string()]);
    }
}
