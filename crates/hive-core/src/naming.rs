//! Naming presets and the rule resolver
//!
//! A rule is a template expression such as `{componentName}_{side}_{type}`.
//! Presets form a hierarchy: a project preset names a parent and overrides
//! only the rules and field values it cares about, inheriting the rest.
//! Field tables translate logical values into output tokens
//! (`type = joint` becomes `jnt` in the default preset).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{HiveError, Result};

/// Name of the preset every hierarchy falls back to
pub const DEFAULT_PRESET: &str = "default";

const BUILTIN_PRESET: &str = include_str!("../presets/default.toml");

/// Field holding side symmetry pairs used when mirroring components
pub const SIDE_SYMMETRY_FIELD: &str = "sideSymmetry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub expression: String,
    #[serde(default)]
    pub description: String,
    /// Representative field values used to self-test the rule
    #[serde(default)]
    pub example_fields: IndexMap<String, String>,
}

impl Rule {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            description: String::new(),
            example_fields: IndexMap::new(),
        }
    }

    /// Fields referenced by the expression, in order of first appearance
    pub fn required_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for segment in parse_expression(&self.expression) {
            if let Segment::Field(name) = segment {
                if !fields.iter().any(|f| f == name) {
                    fields.push(name.to_string());
                }
            }
        }
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub description: String,
    /// Logical value to output token
    #[serde(default)]
    pub values: IndexMap<String, String>,
}

/// A named set of rules and field tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingPreset {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub rules: IndexMap<String, Rule>,
    #[serde(default)]
    pub fields: IndexMap<String, Field>,
}

impl NamingPreset {
    pub fn new(name: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(str::to_string),
            rules: IndexMap::new(),
            fields: IndexMap::new(),
        }
    }

    /// Parse a preset from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a preset from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Field(&'a str),
}

/// Split an expression into literal text and `{field}` tokens.
///
/// An unclosed brace is kept as literal text.
fn parse_expression(expression: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = expression;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        segments.push(Segment::Field(&rest[open + 1..open + close]));
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

/// Registry of presets and the resolution entry point
#[derive(Debug, Clone, Default)]
pub struct NameManager {
    presets: IndexMap<String, NamingPreset>,
}

impl NameManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager holding the built-in default preset
    pub fn builtin() -> Result<Self> {
        let mut manager = Self::new();
        manager.add_preset(NamingPreset::from_toml(BUILTIN_PRESET)?);
        Ok(manager)
    }

    /// Add or replace a preset
    pub fn add_preset(&mut self, preset: NamingPreset) {
        debug!(preset = %preset.name, parent = ?preset.parent, "Registered naming preset");
        self.presets.insert(preset.name.clone(), preset);
    }

    /// Load and register a preset file, returning its name
    pub fn load_file(&mut self, path: &Path) -> Result<String> {
        let preset = NamingPreset::from_file(path)?;
        let name = preset.name.clone();
        self.add_preset(preset);
        Ok(name)
    }

    pub fn preset(&self, name: &str) -> Option<&NamingPreset> {
        self.presets.get(name)
    }

    pub fn preset_names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    /// The preset followed by its ancestors, nearest first
    fn chain(&self, name: &str) -> Result<Vec<&NamingPreset>> {
        let mut chain: Vec<&NamingPreset> = Vec::new();
        let mut current = Some(name);
        while let Some(preset_name) = current {
            if chain.iter().any(|p| p.name == preset_name) {
                // parent loop: stop at the first repeat
                break;
            }
            let preset = self
                .presets
                .get(preset_name)
                .ok_or_else(|| HiveError::UnknownPreset(preset_name.to_string()))?;
            chain.push(preset);
            current = preset.parent.as_deref();
        }
        Ok(chain)
    }

    /// Look up a rule, walking up the preset hierarchy
    pub fn rule(&self, preset: &str, rule: &str) -> Result<&Rule> {
        self.chain(preset)?
            .into_iter()
            .find_map(|p| p.rules.get(rule))
            .ok_or_else(|| HiveError::UnknownRule {
                preset: preset.to_string(),
                rule: rule.to_string(),
            })
    }

    /// Every rule visible from a preset, with overrides applied
    pub fn rules(&self, preset: &str) -> Result<IndexMap<String, Rule>> {
        let mut merged: IndexMap<String, Rule> = IndexMap::new();
        for p in self.chain(preset)?.into_iter().rev() {
            for (name, rule) in &p.rules {
                merged.insert(name.clone(), rule.clone());
            }
        }
        Ok(merged)
    }

    /// Output token for a logical field value, if any preset in the chain maps it
    pub fn field_value(&self, preset: &str, field: &str, value: &str) -> Result<Option<&str>> {
        Ok(self
            .chain(preset)?
            .into_iter()
            .find_map(|p| p.fields.get(field).and_then(|f| f.values.get(value)))
            .map(String::as_str))
    }

    /// Resolve a rule against a set of fields
    pub fn resolve(
        &self,
        preset: &str,
        rule: &str,
        fields: &IndexMap<String, String>,
    ) -> Result<String> {
        let rule_def = self.rule(preset, rule)?;
        let mut out = String::new();
        for segment in parse_expression(&rule_def.expression) {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = fields
                        .get(name)
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| HiveError::MissingRequiredField {
                            rule: rule.to_string(),
                            field: name.to_string(),
                        })?;
                    let token = self.field_value(preset, name, value)?.unwrap_or(value);
                    out.push_str(token);
                }
            }
        }
        if out.is_empty() {
            return Err(HiveError::MissingRequiredField {
                rule: rule.to_string(),
                field: "expression".to_string(),
            });
        }
        Ok(out)
    }

    /// Symmetric side for `side`, e.g. `L` to `R`
    pub fn mirror_side(&self, preset: &str, side: &str) -> Result<Option<String>> {
        Ok(self
            .field_value(preset, SIDE_SYMMETRY_FIELD, side)?
            .map(str::to_string))
    }

    /// Self-test every rule visible from `preset` against its example fields.
    ///
    /// Returns one error per failing rule; an empty list means the preset is valid.
    pub fn validate(&self, preset: &str) -> Result<Vec<HiveError>> {
        let mut problems = Vec::new();
        for (name, rule) in self.rules(preset)? {
            if let Some(field) = rule
                .required_fields()
                .into_iter()
                .find(|f| !rule.example_fields.contains_key(f))
            {
                problems.push(HiveError::MissingRequiredField {
                    rule: name.clone(),
                    field,
                });
                continue;
            }
            if let Err(e) = self.resolve(preset, &name, &rule.example_fields) {
                problems.push(e);
            }
        }
        Ok(problems)
    }

    /// Resolver bound to one preset
    pub fn resolver<'a>(&'a self, preset: &'a str) -> NameResolver<'a> {
        NameResolver {
            manager: self,
            preset,
        }
    }
}

/// A [`NameManager`] bound to the preset a rig is configured with
#[derive(Debug, Clone, Copy)]
pub struct NameResolver<'a> {
    manager: &'a NameManager,
    preset: &'a str,
}

impl<'a> NameResolver<'a> {
    pub fn preset(&self) -> &str {
        self.preset
    }

    pub fn resolve(&self, rule: &str, fields: &[(&str, &str)]) -> Result<String> {
        let fields: IndexMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.manager.resolve(self.preset, rule, &fields)
    }

    pub fn mirror_side(&self, side: &str) -> Result<Option<String>> {
        self.manager.mirror_side(self.preset, side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builtin_preset_validates() {
        let manager = NameManager::builtin().unwrap();
        let problems = manager.validate(DEFAULT_PRESET).unwrap();
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn test_resolve_translates_field_values() {
        let manager = NameManager::builtin().unwrap();
        let name = manager
            .resolve(
                DEFAULT_PRESET,
                "jointName",
                &fields(&[("componentName", "arm"), ("side", "L"), ("id", "upr"), ("type", "joint")]),
            )
            .unwrap();
        assert_eq!(name, "arm_L_upr_jnt");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let manager = NameManager::builtin().unwrap();
        let f = fields(&[("componentName", "leg"), ("side", "R"), ("id", "mid"), ("type", "control")]);
        let first = manager.resolve(DEFAULT_PRESET, "controlName", &f).unwrap();
        for _ in 0..5 {
            assert_eq!(manager.resolve(DEFAULT_PRESET, "controlName", &f).unwrap(), first);
        }
        assert!(!first.is_empty());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let manager = NameManager::builtin().unwrap();
        let err = manager
            .resolve(DEFAULT_PRESET, "jointName", &fields(&[("componentName", "arm"), ("side", "L")]))
            .unwrap_err();
        match err {
            HiveError::MissingRequiredField { rule, field } => {
                assert_eq!(rule, "jointName");
                assert_eq!(field, "id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_child_preset_overrides_and_inherits() {
        let mut manager = NameManager::builtin().unwrap();
        let mut project = NamingPreset::new("studio", Some(DEFAULT_PRESET));
        project
            .rules
            .insert("jointName".into(), Rule::new("{side}_{componentName}_{id}"));
        let mut type_field = Field::default();
        type_field.values.insert("control".into(), "ctrl".into());
        project.fields.insert("type".into(), type_field);
        manager.add_preset(project);

        let joint = manager
            .resolve(
                "studio",
                "jointName",
                &fields(&[("componentName", "arm"), ("side", "L"), ("id", "upr")]),
            )
            .unwrap();
        assert_eq!(joint, "L_arm_upr");

        // inherited rule, overridden field value
        let control = manager
            .resolve(
                "studio",
                "controlName",
                &fields(&[("componentName", "arm"), ("side", "L"), ("id", "ik"), ("type", "control")]),
            )
            .unwrap();
        assert_eq!(control, "arm_L_ik_ctrl");

        // inherited field value
        let guide = manager
            .resolve(
                "studio",
                "guideName",
                &fields(&[("componentName", "arm"), ("side", "L"), ("id", "ik"), ("type", "guide")]),
            )
            .unwrap();
        assert_eq!(guide, "arm_L_ik_guide");
    }

    #[test]
    fn test_validate_reports_incomplete_examples() {
        let mut manager = NameManager::new();
        let mut preset = NamingPreset::new("broken", None);
        let mut rule = Rule::new("{componentName}_{side}");
        rule.example_fields.insert("componentName".into(), "arm".into());
        preset.rules.insert("componentName".into(), rule);
        manager.add_preset(preset);

        let problems = manager.validate("broken").unwrap();
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            &problems[0],
            HiveError::MissingRequiredField { field, .. } if field == "side"
        ));
    }

    #[test]
    fn test_required_fields_and_literals() {
        let rule = Rule::new("pre_{a}_{b}_{a}_post{");
        assert_eq!(rule.required_fields(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_mirror_side() {
        let manager = NameManager::builtin().unwrap();
        assert_eq!(manager.mirror_side(DEFAULT_PRESET, "L").unwrap(), Some("R".into()));
        assert_eq!(manager.mirror_side(DEFAULT_PRESET, "M").unwrap(), None);
    }

    #[test]
    fn test_unknown_preset() {
        let manager = NameManager::builtin().unwrap();
        assert!(matches!(
            manager.rule("nope", "jointName"),
            Err(HiveError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_preset_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("studio.toml");
        let mut preset = NamingPreset::new("studio", Some(DEFAULT_PRESET));
        preset.rules.insert("rigName".into(), Rule::new("{rigName}"));
        preset.to_file(&path).unwrap();

        let mut manager = NameManager::builtin().unwrap();
        let name = manager.load_file(&path).unwrap();
        assert_eq!(name, "studio");
        assert_eq!(manager.rule("studio", "rigName").unwrap().expression, "{rigName}");
    }
}
