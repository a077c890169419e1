//! Subcommand implementations
//!
//! Rig files are template JSON. Each command loads the file into a fresh
//! rig backed by a [`MemoryScene`], does its work, and writes the synced
//! definitions back out when asked to.

use anyhow::{bail, Context, Result};
use hive_core::template::{self, LoadOptions};
use hive_core::{
    BatchPolicy, BuildScriptRegistry, ComponentKey, ComponentRegistry, MemoryScene, MirrorPlane,
    NameManager, Rig, Stage, StageReport, Template, TemplateLibrary,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::HiveConfig;

/// Name manager with the built-in preset plus every configured preset file
pub fn name_manager(config: &HiveConfig) -> Result<NameManager> {
    let mut naming = NameManager::builtin()?;
    for path in &config.naming.presets {
        let name = naming
            .load_file(path)
            .with_context(|| format!("loading naming preset {}", path.display()))?;
        info!(preset = %name, path = %path.display(), "Loaded naming preset");
    }
    Ok(naming)
}

/// Empty rig using the configured naming and rig defaults
pub fn new_rig(config: &HiveConfig, name: &str) -> Result<Rig> {
    let mut rig_config = config.rig.clone();
    if let Some(preset) = &config.naming.default_preset {
        rig_config.naming_preset = preset.clone();
    }
    Ok(Rig::with_parts(
        name,
        rig_config,
        ComponentRegistry::builtin(),
        BuildScriptRegistry::builtin(),
        name_manager(config)?,
    )?)
}

/// Load a rig file, or start an empty rig named after it when it is missing
pub fn open_rig(config: &HiveConfig, path: &Path) -> Result<(Rig, MemoryScene)> {
    let mut scene = MemoryScene::new();
    if !path.exists() {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rig");
        info!(path = %path.display(), "Rig file not found, starting empty rig");
        return Ok((new_rig(config, name)?, scene));
    }

    let file = Template::from_file(path).with_context(|| format!("reading rig {}", path.display()))?;
    let mut rig = new_rig(config, &file.name)?;
    let options = LoadOptions {
        apply_config: true,
        ..LoadOptions::default()
    };
    let report = template::load_from_template(&mut rig, &mut scene, &file, &options)?;
    for (label, error) in &report.failures {
        warn!(component = %label, error = %error, "Component not loaded");
    }
    for problem in &report.unresolved {
        warn!(error = %problem, "Reference dropped");
    }
    Ok((rig, scene))
}

/// Write the rig's synced definitions to `path`
pub fn write_rig(rig: &Rig, scene: &MemoryScene, path: &Path) -> Result<()> {
    let file = template::save(rig, scene, rig.name(), None)?;
    file.to_file(path)
        .with_context(|| format!("writing rig {}", path.display()))?;
    info!(path = %path.display(), components = rig.len(), "Wrote rig");
    Ok(())
}

fn parse_keys(raw: &[String]) -> Result<Vec<ComponentKey>> {
    raw.iter()
        .map(|k| k.parse::<ComponentKey>().with_context(|| format!("component '{}'", k)))
        .collect()
}

fn print_report(report: &StageReport) {
    println!(
        "{}: {} completed, {} skipped",
        report.stage,
        report.completed.len(),
        report.skipped.len()
    );
    for (key, error) in &report.failures {
        println!("  FAILED {}: {}", key, error);
    }
    for key in &report.not_run {
        println!("  not run: {}", key);
    }
    for error in &report.hook_failures {
        println!("  hook: {}", error);
    }
}

pub struct BuildArgs<'a> {
    pub rig: &'a Path,
    pub stage: Stage,
    pub components: &'a [String],
    pub continue_on_error: bool,
    pub output: Option<&'a Path>,
}

/// Run every stage up to the requested one
pub fn build(config: &HiveConfig, args: BuildArgs<'_>) -> Result<()> {
    let (mut rig, mut scene) = open_rig(config, args.rig)?;
    let keys = parse_keys(args.components)?;
    let policy = if args.continue_on_error {
        BatchPolicy::Continue
    } else {
        BatchPolicy::Abort
    };

    let reports = rig.build_to(args.stage, &mut scene, &keys, policy)?;
    for report in &reports {
        print_report(report);
    }
    println!(
        "{} entities, {} bindings in scene",
        scene.entity_count(),
        scene.binding_count()
    );

    if let Some(output) = args.output {
        write_rig(&rig, &scene, output)?;
    }
    if reports.iter().any(|r| !r.is_success()) {
        bail!("build of '{}' did not reach {}", rig.name(), args.stage);
    }
    Ok(())
}

/// Mirror a component onto its symmetric side, or onto an explicit target
pub fn mirror(
    config: &HiveConfig,
    rig_path: &Path,
    source: &str,
    target: Option<&str>,
    plane: Option<MirrorPlane>,
    output: Option<&Path>,
) -> Result<()> {
    let (mut rig, mut scene) = open_rig(config, rig_path)?;
    let source: ComponentKey = source.parse()?;
    let (target, recovery) = match target {
        Some(target) => {
            let target: ComponentKey = target.parse()?;
            let plane = plane.unwrap_or(rig.config().settings.default_mirror_plane);
            let recovery =
                rig.mirror_guides(&mut scene, &source, &target, &[plane.normal_axis()], plane)?;
            (target, recovery)
        }
        None => rig.mirror_component(&mut scene, &source, plane)?,
    };
    println!(
        "Mirrored {} onto {} ({} guides changed)",
        source,
        target,
        recovery.guides.len()
    );
    write_rig(&rig, &scene, output.unwrap_or(rig_path))
}

/// Snapshot a rig file into the template library
pub fn template_save(
    config: &HiveConfig,
    rig_path: &Path,
    name: &str,
    components: &[String],
    force: bool,
) -> Result<()> {
    let (rig, scene) = open_rig(config, rig_path)?;
    let keys = parse_keys(components)?;
    let selection = (!keys.is_empty()).then_some(keys.as_slice());
    let snapshot = template::save(&rig, &scene, name, selection)?;

    let mut library = TemplateLibrary::open(&config.library.path)?;
    if !library.has_changed(&snapshot)? {
        println!("Template '{}' is unchanged", name);
        return Ok(());
    }
    let entry = library.save(&snapshot, force)?;
    println!("Saved template '{}' ({})", entry.name, entry.short_sha());
    Ok(())
}

pub fn template_list(config: &HiveConfig) -> Result<()> {
    let library = TemplateLibrary::open(&config.library.path)?;
    let entries = library.list();
    if entries.is_empty() {
        println!("No templates in {}", library.base_dir().display());
    }
    for entry in entries {
        println!("  - {} ({}) saved {}", entry.name, entry.short_sha(), entry.saved_at);
    }
    Ok(())
}

/// Load a library template into a rig file, either merging or replacing
pub fn template_apply(
    config: &HiveConfig,
    name: &str,
    rig_path: &Path,
    update: bool,
    output: Option<&Path>,
) -> Result<()> {
    let library = TemplateLibrary::open(&config.library.path)?;
    let snapshot = library.load(name)?;
    let (mut rig, mut scene) = open_rig(config, rig_path)?;
    let options = LoadOptions::default();

    let load = if update {
        let validation = template::validate_update_rig_from_template(&rig, &snapshot, &options)?;
        if validation.is_blocking() {
            for key in &validation.missing_components {
                println!("  not in template: {}", key);
            }
            bail!("template '{}' would drop {} components", name, validation.missing_components.len());
        }
        let report = template::update_rig_from_template(&mut rig, &mut scene, &snapshot, &options)?;
        println!(
            "Kept {} deform joints, discarded {}",
            report.preserved.len(),
            report.discarded.len()
        );
        report.load
    } else {
        template::load_from_template(&mut rig, &mut scene, &snapshot, &options)?
    };

    println!(
        "Applied '{}': {} created, {} updated",
        name,
        load.created.len(),
        load.updated.len()
    );
    for (label, error) in &load.failures {
        println!("  FAILED {}: {}", label, error);
    }
    for problem in &load.unresolved {
        println!("  dropped: {}", problem);
    }
    let output: PathBuf = output.unwrap_or(rig_path).to_path_buf();
    write_rig(&rig, &scene, &output)
}

/// Check every rule of a preset against its example fields
pub fn naming_validate(config: &HiveConfig, preset_file: Option<&Path>) -> Result<()> {
    let mut naming = name_manager(config)?;
    let preset = match preset_file {
        Some(path) => naming.load_file(path)?,
        None => config
            .naming
            .default_preset
            .clone()
            .unwrap_or_else(|| config.rig.naming_preset.clone()),
    };

    let problems = naming.validate(&preset)?;
    if problems.is_empty() {
        println!("Preset '{}' is valid", preset);
        return Ok(());
    }
    for problem in &problems {
        println!("  {}", problem);
    }
    bail!("preset '{}' has {} invalid rules", preset, problems.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::BuildState;
    use tempfile::TempDir;

    fn config(dir: &Path) -> HiveConfig {
        let mut config = HiveConfig::default();
        config.library.path = dir.join("templates");
        config
    }

    fn write_biped(config: &HiveConfig, path: &Path) {
        let mut rig = new_rig(config, "biped").unwrap();
        let root = rig.create_component("godnode", "global", "M").unwrap();
        let arm = rig.create_component("vchain", "arm", "L").unwrap();
        rig.set_component_parent(&arm, &root, "rootMotion", "root").unwrap();
        write_rig(&rig, &MemoryScene::new(), path).unwrap();
    }

    #[test]
    fn test_build_writes_synced_rig() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let rig_path = dir.path().join("biped.json");
        let output = dir.path().join("built.json");
        write_biped(&config, &rig_path);

        build(
            &config,
            BuildArgs {
                rig: &rig_path,
                stage: Stage::Deform,
                components: &[],
                continue_on_error: false,
                output: Some(&output),
            },
        )
        .unwrap();

        let built = Template::from_file(&output).unwrap();
        assert_eq!(built.name, "biped");
        assert_eq!(built.component_keys().unwrap().len(), 2);
        // twist joints are recorded once the deform stage has run
        let arm = built
            .components
            .unwrap()
            .into_iter()
            .find(|c| c["name"] == "arm")
            .unwrap();
        let ids: Vec<_> = arm["deformLayer"]["entities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect();
        assert!(ids.contains(&"uprTwist01".to_string()));
    }

    #[test]
    fn test_build_rejects_bad_component_key() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let rig_path = dir.path().join("biped.json");
        write_biped(&config, &rig_path);
        let err = build(
            &config,
            BuildArgs {
                rig: &rig_path,
                stage: Stage::Guides,
                components: &["arm".to_string()],
                continue_on_error: false,
                output: None,
            },
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("component 'arm'"));
    }

    #[test]
    fn test_mirror_creates_counterpart() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let rig_path = dir.path().join("biped.json");
        write_biped(&config, &rig_path);

        mirror(&config, &rig_path, "arm:L", None, None, None).unwrap();
        let (rig, _) = open_rig(&config, &rig_path).unwrap();
        let right = rig.component(&ComponentKey::new("arm", "R")).unwrap();
        assert_eq!(right.definition().parent.as_deref(), Some("global:M"));
        assert_eq!(right.state(), BuildState::NotBuilt);
        let mid = right.definition().guide_layer.guides.get("mid").unwrap();
        assert!(mid.transform.translate[0] < 0.0);
    }

    #[test]
    fn test_template_save_and_apply() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let rig_path = dir.path().join("biped.json");
        write_biped(&config, &rig_path);

        template_save(&config, &rig_path, "biped", &[], false).unwrap();
        // unchanged snapshot is not rewritten, so no overwrite error
        template_save(&config, &rig_path, "biped", &[], false).unwrap();
        template_list(&config).unwrap();

        let fresh = dir.path().join("fresh.json");
        template_apply(&config, "biped", &fresh, false, None).unwrap();
        let (rig, _) = open_rig(&config, &fresh).unwrap();
        assert_eq!(rig.name(), "fresh");
        assert!(rig.contains(&ComponentKey::new("arm", "L")));

        template_apply(&config, "biped", &fresh, true, None).unwrap();
        let (rig, _) = open_rig(&config, &fresh).unwrap();
        assert_eq!(rig.len(), 2);
    }

    #[test]
    fn test_template_list_with_edited_manifest() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(&config.library.path).unwrap();
        std::fs::write(
            config.library.path.join("manifest.json"),
            r#"{
  "version": "1.0",
  "templates": {
    "biped": {"name": "biped", "sha256": "ab12", "path": "biped.template", "saved_at": "today"},
    "quad": {"name": "quad", "sha256": "", "path": "quad.template", "saved_at": "today"}
  }
}"#,
        )
        .unwrap();
        template_list(&config).unwrap();
    }

    #[test]
    fn test_update_refuses_to_drop_components() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let rig_path = dir.path().join("biped.json");
        write_biped(&config, &rig_path);
        template_save(&config, &rig_path, "root", &["global:M".to_string()], false).unwrap();

        let err = template_apply(&config, "root", &rig_path, true, None).unwrap_err();
        assert!(err.to_string().contains("would drop 1 components"));
    }

    #[test]
    fn test_naming_validate_builtin() {
        let dir = TempDir::new().unwrap();
        naming_validate(&config(dir.path()), None).unwrap();
    }
}
