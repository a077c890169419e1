//! Error types shared by the build pipeline

use thiserror::Error;

use crate::scene::SceneError;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Schema migration failed for {component}: {reason}")]
    SchemaMigrationFailure { component: String, reason: String },
    #[error("Naming rule '{rule}' is missing required field '{field}'")]
    MissingRequiredField { rule: String, field: String },
    #[error("Invalid parent assignment: {0}")]
    InvalidParentAssignment(String),
    #[error("{}", missing_components_message(.0))]
    TemplateMissingComponents(Vec<String>),
    #[error("Build script '{script}' failed in {hook}: {message}")]
    HookExecutionFailure {
        script: String,
        hook: String,
        message: String,
    },
    #[error("Cannot run {operation} on {component}: component is {state}")]
    InvalidStageTransition {
        component: String,
        operation: String,
        state: String,
    },
    #[error("Skipped {component}: parent {parent} failed earlier in the batch")]
    DependencyFailed { component: String, parent: String },
    #[error("Unknown component: {0}")]
    UnknownComponent(String),
    #[error("Unknown component type: {0}")]
    UnknownComponentType(String),
    #[error("Component already exists: {0}")]
    DuplicateComponent(String),
    #[error("Unknown guide '{guide}' on {component}")]
    UnknownGuide { component: String, guide: String },
    #[error("Invalid guide tree: {0}")]
    InvalidGuideTree(String),
    #[error("No binding available for '{0}'")]
    MissingBinding(String),
    #[error("Side '{0}' has no symmetric counterpart")]
    NoSymmetricSide(String),
    #[error("Template '{0}' already exists")]
    TemplateExists(String),
    #[error("Template not found: {0}")]
    TemplateNotFound(String),
    #[error("Unknown build script: {0}")]
    UnknownBuildScript(String),
    #[error("Invalid property '{property}' on build script '{script}': {reason}")]
    InvalidProperty {
        script: String,
        property: String,
        reason: String,
    },
    #[error("Unknown naming preset: {0}")]
    UnknownPreset(String),
    #[error("Unknown naming rule '{rule}' in preset '{preset}'")]
    UnknownRule { preset: String, rule: String },
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid version: {0}")]
    Version(#[from] semver::Error),
}

pub type Result<T, E = HiveError> = std::result::Result<T, E>;

fn missing_components_message(missing: &[String]) -> String {
    if missing.is_empty() {
        "Template has no component list".to_string()
    } else {
        format!("Template is missing components: {}", missing.join(", "))
    }
}
