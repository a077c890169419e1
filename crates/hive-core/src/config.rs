//! Rig configuration shared by every component of a rig

use serde::{Deserialize, Serialize};

use crate::hooks::BuildScriptEntry;
use crate::math::MirrorPlane;
use crate::naming::DEFAULT_PRESET;

/// The rig's shared configuration: naming, build scripts and global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigConfig {
    /// Naming preset every entity name is resolved against
    #[serde(default = "default_preset")]
    pub naming_preset: String,
    /// Active build scripts, in dispatch order
    #[serde(default)]
    pub build_scripts: Vec<BuildScriptEntry>,
    #[serde(default)]
    pub settings: RigSettings,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            naming_preset: default_preset(),
            build_scripts: Vec::new(),
            settings: RigSettings::default(),
        }
    }
}

fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigSettings {
    /// Hide the guide layer once the rig is polished
    #[serde(default = "default_true")]
    pub hide_guides_on_polish: bool,
    /// Flag control shape nodes as hidden in the outliner at polish time
    #[serde(default)]
    pub hide_control_shapes_in_outliner: bool,
    /// Highlight child controls on selection
    #[serde(default = "default_true")]
    pub selection_child_highlighting: bool,
    /// Plane used when mirroring without an explicit plane
    #[serde(default = "default_mirror_plane")]
    pub default_mirror_plane: MirrorPlane,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            hide_guides_on_polish: true,
            hide_control_shapes_in_outliner: false,
            selection_child_highlighting: true,
            default_mirror_plane: default_mirror_plane(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mirror_plane() -> MirrorPlane {
    MirrorPlane::Yz
}
