//! Hive Core - Component model and staged build pipeline for character rigs
//!
//! This crate provides the foundational pieces of the Hive rig builder:
//! - Versioned component definitions and schema migration
//! - Naming presets and the rule resolver used for every created entity
//! - Guide trees with auto alignment, mirroring and transactional reparenting
//! - Layers and role mapping used to wire components to their parents
//! - The component state machine, subsystems and build-script hooks
//! - Templates and the on-disk template library
//!
//! The host scene is reached only through the [`Scene`] trait; [`MemoryScene`]
//! is the in-memory implementation used by tests and the command line driver.

pub mod component;
pub mod components;
pub mod config;
pub mod definition;
pub mod error;
pub mod guides;
pub mod hooks;
pub mod layer;
pub mod library;
pub mod math;
pub mod migrate;
pub mod naming;
pub mod rig;
pub mod scene;
pub mod subsystem;
pub mod template;

pub use component::{BuildContext, BuildState, Component, ComponentType, ParentView, Stage};
pub use components::ComponentRegistry;
pub use config::{RigConfig, RigSettings};
pub use definition::{
    ComponentKey, Connections, ConnectionConstraint, Definition, EntityDescriptor, LayerDefinition,
    LayerKind, RoleRef, SettingValue,
};
pub use error::{HiveError, Result};
pub use guides::{Guide, GuideRecovery, GuideTree, MirrorBehaviour};
pub use hooks::{
    BuildScript, BuildScriptEntry, BuildScriptRegistry, Hook, HookContext, HookDispatcher,
    PropertyDecl, PropertyKind, PropertyValue,
};
pub use layer::{ConnectionBindings, EntityRecord, IdMapping, Layer};
pub use library::{TemplateEntry, TemplateLibrary};
pub use math::{Axis, MirrorPlane, Transform};
pub use naming::{NameManager, NameResolver, NamingPreset};
pub use rig::{BatchPolicy, RecoveryData, Rig, StageReport};
pub use scene::{
    AttributeValue, BindingId, BindingKind, BindingSpec, EntityId, EntityKind, EntitySpec,
    MemoryScene, Scene, SceneError,
};
pub use template::{LoadOptions, LoadReport, Template, UpdateReport, UpdateValidation};
