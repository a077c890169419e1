//! On-disk template library
//!
//! A directory of `<name>.template` JSON files with a `manifest.json` that
//! records each template's SHA256 and save time. The hash lets callers
//! tell whether a template in memory differs from the stored copy without
//! re-reading it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HiveError, Result};
use crate::template::Template;

const MANIFEST_FILE: &str = "manifest.json";
const TEMPLATE_EXTENSION: &str = "template";

/// Manifest entry for a single stored template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    /// SHA256 of the stored file content
    pub sha256: String,
    /// File path relative to the library directory
    pub path: String,
    /// When this was saved (RFC 3339)
    pub saved_at: String,
}

impl TemplateEntry {
    /// Leading characters of the hash for display; a hand-edited manifest
    /// may carry fewer than eight
    pub fn short_sha(&self) -> &str {
        self.sha256.get(..8).unwrap_or(&self.sha256)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LibraryManifest {
    #[serde(default = "default_version")]
    version: String,
    /// Entries keyed by template name
    #[serde(default)]
    templates: BTreeMap<String, TemplateEntry>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl LibraryManifest {
    fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self {
                version: default_version(),
                templates: BTreeMap::new(),
            })
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    base_dir: PathBuf,
    manifest_path: PathBuf,
    manifest: LibraryManifest,
}

impl TemplateLibrary {
    /// Open the library at `base_dir`, creating the directory if needed
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let manifest_path = base_dir.join(MANIFEST_FILE);
        let manifest = LibraryManifest::load_or_create(&manifest_path)?;
        debug!(path = %base_dir.display(), templates = manifest.templates.len(), "Opened template library");
        Ok(Self {
            base_dir,
            manifest_path,
            manifest,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn template_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", name, TEMPLATE_EXTENSION))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.manifest.templates.contains_key(name) && self.template_path(name).exists()
    }

    /// Stored templates, sorted by name
    pub fn list(&self) -> Vec<&TemplateEntry> {
        self.manifest.templates.values().collect()
    }

    pub fn entry(&self, name: &str) -> Option<&TemplateEntry> {
        self.manifest.templates.get(name)
    }

    /// Store `template` under its name. An existing template is only
    /// replaced when `overwrite` is set.
    pub fn save(&mut self, template: &Template, overwrite: bool) -> Result<TemplateEntry> {
        let name = template.name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(HiveError::InvalidIdentifier(name.to_string()));
        }
        if !overwrite && self.contains(name) {
            return Err(HiveError::TemplateExists(name.to_string()));
        }

        let content = template.to_json()?;
        std::fs::write(self.template_path(name), &content)?;
        let entry = TemplateEntry {
            name: name.to_string(),
            sha256: sha256_hex(content.as_bytes()),
            path: format!("{}.{}", name, TEMPLATE_EXTENSION),
            saved_at: chrono::Utc::now().to_rfc3339(),
        };
        self.manifest.templates.insert(name.to_string(), entry.clone());
        self.manifest.save(&self.manifest_path)?;

        info!(template = name, sha = entry.short_sha(), "Stored template");
        Ok(entry)
    }

    pub fn load(&self, name: &str) -> Result<Template> {
        let entry = self
            .manifest
            .templates
            .get(name)
            .ok_or_else(|| HiveError::TemplateNotFound(name.to_string()))?;
        let path = self.base_dir.join(&entry.path);
        if !path.exists() {
            return Err(HiveError::TemplateNotFound(name.to_string()));
        }
        Template::from_file(&path)
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        let entry = self
            .manifest
            .templates
            .remove(name)
            .ok_or_else(|| HiveError::TemplateNotFound(name.to_string()))?;
        let path = self.base_dir.join(&entry.path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.manifest.save(&self.manifest_path)?;
        info!(template = name, "Deleted template");
        Ok(())
    }

    /// Whether `template` differs from the stored copy of the same name.
    /// A template that was never stored counts as changed.
    pub fn has_changed(&self, template: &Template) -> Result<bool> {
        let Some(entry) = self.manifest.templates.get(&template.name) else {
            return Ok(true);
        };
        let content = template.to_json()?;
        Ok(sha256_hex(content.as_bytes()) != entry.sha256)
    }
}

/// SHA256 of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
            components: Some(vec![json!({"name": "arm", "side": "L", "type": "vchain"})]),
            config: TemplateConfig::default(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_save_list_load_delete() {
        let dir = TempDir::new().unwrap();
        let mut library = TemplateLibrary::open(dir.path()).unwrap();
        library.save(&template("biped"), false).unwrap();
        library.save(&template("quad"), false).unwrap();

        let names: Vec<_> = library.list().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["biped", "quad"]);
        assert_eq!(library.load("biped").unwrap(), template("biped"));

        library.delete("biped").unwrap();
        assert!(!library.template_path("biped").exists());
        assert!(matches!(library.load("biped"), Err(HiveError::TemplateNotFound(_))));
        assert!(matches!(library.delete("biped"), Err(HiveError::TemplateNotFound(_))));
    }

    #[test]
    fn test_overwrite_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let mut library = TemplateLibrary::open(dir.path()).unwrap();
        library.save(&template("biped"), false).unwrap();

        let mut changed = template("biped");
        changed.config.naming_preset = "studio".into();
        let err = library.save(&changed, false).unwrap_err();
        assert_eq!(err.to_string(), "Template 'biped' already exists");
        assert_eq!(library.load("biped").unwrap(), template("biped"));

        library.save(&changed, true).unwrap();
        assert_eq!(library.load("biped").unwrap(), changed);
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let sha = {
            let mut library = TemplateLibrary::open(dir.path()).unwrap();
            library.save(&template("biped"), false).unwrap().sha256
        };
        let library = TemplateLibrary::open(dir.path()).unwrap();
        assert!(library.contains("biped"));
        let content = std::fs::read(library.template_path("biped")).unwrap();
        assert_eq!(library.entry("biped").unwrap().sha256, sha);
        assert_eq!(sha256_hex(&content), sha);
    }

    #[test]
    fn test_has_changed() {
        let dir = TempDir::new().unwrap();
        let mut library = TemplateLibrary::open(dir.path()).unwrap();
        assert!(library.has_changed(&template("biped")).unwrap());
        library.save(&template("biped"), false).unwrap();
        assert!(!library.has_changed(&template("biped")).unwrap());

        let mut changed = template("biped");
        changed.components = Some(Vec::new());
        assert!(library.has_changed(&changed).unwrap());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let mut library = TemplateLibrary::open(dir.path()).unwrap();
        assert!(matches!(
            library.save(&template("../escape"), false),
            Err(HiveError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_short_sha_tolerates_short_hashes() {
        let mut entry = TemplateEntry {
            name: "biped".into(),
            sha256: sha256_hex(b"biped"),
            path: "biped.template".into(),
            saved_at: String::new(),
        };
        assert_eq!(entry.short_sha(), &entry.sha256[..8]);
        entry.sha256 = "ab12".into();
        assert_eq!(entry.short_sha(), "ab12");
        entry.sha256 = "abcdefgé9".into();
        assert_eq!(entry.short_sha(), "abcdefgé9");
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
