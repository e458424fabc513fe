use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::logs::LogSink;
use crate::core::store::{hash_file, FileStore};
use crate::error::{Error, Result};

/// Manifest file expected in every model component directory.
pub const MANIFEST_FILE: &str = "MANIFEST.toml";

/// Parsed model component manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub attributes: AttributeBlock,
    #[serde(default)]
    pub model_components: ModelComponentBlock,
    /// Name of a registered plugin to run for this component.
    #[serde(default)]
    pub plugin: Option<String>,
    /// Name of a registered capability group contributed by this component.
    #[serde(default)]
    pub model_component_objects: Option<String>,
    #[serde(default)]
    pub vm_resources: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    /// Arguments forwarded to the plugin's `run`.
    #[serde(default)]
    pub arguments: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttributeBlock {
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub precedes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelComponentBlock {
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub precedes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSpec {
    pub paths: Vec<String>,
    #[serde(default)]
    pub architecture: Option<String>,
}

/// What an upload pass did for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was cached yet; the file was uploaded.
    NoDate,
    /// Disk and store differed by date and hash; re-uploaded.
    NewHash,
    /// Disk was newer but content identical; not uploaded.
    SameHash,
    /// The cached copy is at least as new as the disk copy.
    NotNewer,
}

impl UploadOutcome {
    pub fn uploaded(self) -> bool {
        matches!(self, UploadOutcome::NoDate | UploadOutcome::NewHash)
    }
}

/// A named unit of reusable experiment content on disk.
#[derive(Debug, Clone)]
pub struct ModelComponent {
    pub name: String,
    pub path: PathBuf,
    pub manifest: Manifest,
}

impl ModelComponent {
    /// Load the component rooted at `path`.
    pub fn load(path: &Path) -> Result<ModelComponent> {
        let manifest_path = path.join(MANIFEST_FILE);
        let contents =
            fs::read_to_string(&manifest_path).map_err(|err| Error::MalformedManifest {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        let manifest: Manifest =
            toml::from_str(&contents).map_err(|err| Error::MalformedManifest {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        if manifest.name.is_empty() {
            return Err(Error::MalformedManifest {
                path: path.to_path_buf(),
                message: "manifest has an empty `name`".to_string(),
            });
        }
        Ok(ModelComponent {
            name: manifest.name.clone(),
            path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn attribute_depends(&self) -> &[String] {
        &self.manifest.attributes.depends
    }

    pub fn attribute_provides(&self) -> &[String] {
        &self.manifest.attributes.provides
    }

    pub fn attribute_precedes(&self) -> &[String] {
        &self.manifest.attributes.precedes
    }

    pub fn component_depends(&self) -> &[String] {
        &self.manifest.model_components.depends
    }

    pub fn component_precedes(&self) -> &[String] {
        &self.manifest.model_components.precedes
    }

    /// Upload the component's VM resources and images to the stores.
    /// Resource failures are counted rather than aborting the build; image
    /// problems are fatal for that image.
    pub fn upload_files(
        &self,
        vm_resources: &FileStore,
        images: &FileStore,
        log: &LogSink,
    ) -> Result<usize> {
        let mut errors = self.upload_vm_resources(vm_resources, log)?;
        if let Err(err) = self.upload_images(images, log) {
            log.error(&format!("image upload failed for {}: {err}", self.name));
            errors += 1;
        }
        Ok(errors)
    }

    fn upload_vm_resources(&self, store: &FileStore, log: &LogSink) -> Result<usize> {
        let mut errors = 0;
        for pattern in &self.manifest.vm_resources {
            let resolved = expand_resource_pattern(&self.path, pattern);
            for relative in resolved {
                match self.upload_one(&relative, store, false, log) {
                    Ok(outcome) => log.debug(&format!(
                        "resource {} from {}: {:?}",
                        relative.display(),
                        self.name,
                        outcome
                    )),
                    Err(err) => {
                        errors += 1;
                        log.error(&format!(
                            "failed to upload {} from {}: {err}",
                            relative.display(),
                            self.name
                        ));
                    }
                }
            }
        }
        Ok(errors)
    }

    fn upload_images(&self, store: &FileStore, log: &LogSink) -> Result<Vec<UploadOutcome>> {
        let mut outcomes = Vec::new();
        for image in &self.manifest.images {
            for end_path in &image.paths {
                let outcome =
                    self.upload_one(Path::new(end_path), store, true, log)?;
                if outcome.uploaded() {
                    log.info(&format!(
                        "added image {end_path} from {} to the cache",
                        self.name
                    ));
                }
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Compare disk mtime against the store upload date, hashing only when
    /// the dates disagree, and upload when the content is genuinely new.
    fn upload_one(
        &self,
        relative: &Path,
        store: &FileStore,
        image: bool,
        log: &LogSink,
    ) -> Result<UploadOutcome> {
        let path = self.path.join(relative);
        let metadata = fs::metadata(&path).map_err(|_| Error::MissingResource {
            component: self.name.clone(),
            path: path.clone(),
        })?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|stamp| stamp.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs())
            .ok_or_else(|| Error::MissingResource {
                component: self.name.clone(),
                path: path.clone(),
            })?;

        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let upload_date = store.upload_date(&basename);

        let add = |store: &FileStore| -> Result<()> {
            if image {
                store.add_image(&path, true)
            } else {
                store.add(&path, true)
            }
        };

        match upload_date {
            None => {
                log.debug(&format!("{basename} not found in store, uploading"));
                add(store)?;
                Ok(UploadOutcome::NoDate)
            }
            Some(upload) if upload != modified => {
                let disk_hash = hash_file(&path).unwrap_or_default();
                let store_hash = store.hash(&basename);
                if disk_hash != store_hash {
                    add(store)?;
                    Ok(UploadOutcome::NewHash)
                } else {
                    Ok(UploadOutcome::SameHash)
                }
            }
            Some(_) => Ok(UploadOutcome::NotNewer),
        }
    }
}

/// A set of repositories holding installed model components, indexed by
/// component name. Name collisions across repositories are forbidden.
#[derive(Debug, Default)]
pub struct ComponentRepository {
    components: BTreeMap<String, ModelComponent>,
}

impl ComponentRepository {
    /// Scan repository directories; every immediate subdirectory holding a
    /// manifest is a component.
    pub fn scan(repositories: &[PathBuf]) -> Result<ComponentRepository> {
        let mut components: BTreeMap<String, ModelComponent> = BTreeMap::new();
        for repository in repositories {
            let entries = fs::read_dir(repository).map_err(|err| Error::PreflightFailed {
                message: format!(
                    "Unable to scan repository {}: {err}",
                    repository.display()
                ),
            })?;
            for entry in entries {
                let entry = entry.map_err(|err| Error::PreflightFailed {
                    message: format!(
                        "Unable to scan repository {}: {err}",
                        repository.display()
                    ),
                })?;
                let path = entry.path();
                if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
                    continue;
                }
                let component = ModelComponent::load(&path)?;
                if let Some(existing) = components.get(&component.name) {
                    return Err(Error::DuplicateComponentName {
                        name: component.name,
                        first: existing.path.clone(),
                        second: path,
                    });
                }
                components.insert(component.name.clone(), component);
            }
        }
        Ok(ComponentRepository { components })
    }

    pub fn get(&self, name: &str) -> Option<&ModelComponent> {
        self.components.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelComponent> {
        self.components.values()
    }

    /// Installed components providing `attribute`.
    pub fn providers_of(&self, attribute: &str) -> Vec<&ModelComponent> {
        self.components
            .values()
            .filter(|component| {
                component
                    .attribute_provides()
                    .iter()
                    .any(|provided| provided == attribute)
            })
            .collect()
    }
}

/// Expand a manifest resource pattern relative to the component root.
///
/// * `dir`, `dir/` → `dir/*` (non-recursive)
/// * `dir/**`, `dir/**/` → `dir/**/*` (recursive)
/// * patterns with explicit extensions are taken verbatim
///
/// Only regular files are returned.
pub fn expand_resource_pattern(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut pattern = pattern.trim_end_matches('/').to_string();
    if root.join(&pattern).is_dir() {
        pattern.push_str("/*");
    }
    pattern = pattern.replace("**/*", "**").replace("**", "**/*");

    if !pattern.contains('*') {
        return vec![PathBuf::from(pattern)];
    }

    let segments: Vec<&str> = pattern.split('/').collect();
    let mut matches = Vec::new();
    walk_pattern(root, Path::new(""), &segments, &mut matches);
    matches.sort();
    matches
}

fn walk_pattern(root: &Path, relative: &Path, segments: &[&str], matches: &mut Vec<PathBuf>) {
    let Some((segment, rest)) = segments.split_first() else {
        let full = root.join(relative);
        if full.is_file() {
            matches.push(relative.to_path_buf());
        }
        return;
    };

    if *segment == "**" {
        // `**` matches zero or more directories.
        walk_pattern(root, relative, rest, matches);
        let Ok(entries) = fs::read_dir(root.join(relative)) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                walk_pattern(root, &relative.join(entry.file_name()), segments, matches);
            }
        }
        return;
    }

    if segment.contains('*') {
        let Ok(entries) = fs::read_dir(root.join(relative)) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if segment_matches(segment, &name) {
                walk_pattern(root, &relative.join(entry.file_name()), rest, matches);
            }
        }
        return;
    }

    walk_pattern(root, &relative.join(segment), rest, matches);
}

fn segment_matches(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name) || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component_dir(manifest: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("component");
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(path.join(MANIFEST_FILE), manifest).expect("manifest");
        (dir, path)
    }

    #[test]
    fn manifest_parses_attribute_blocks() {
        let (_dir, path) = component_dir(
            "name = \"router\"\n\
             plugin = \"router_plugin\"\n\
             [attributes]\n\
             depends = [\"topology\"]\n\
             provides = [\"routing\"]\n\
             [model_components]\n\
             depends = [\"base_objects\"]\n\
             precedes = [\"launch\"]\n",
        );
        let component = ModelComponent::load(&path).expect("load");
        assert_eq!(component.name, "router");
        assert_eq!(component.attribute_depends(), ["topology"]);
        assert_eq!(component.attribute_provides(), ["routing"]);
        assert_eq!(component.component_depends(), ["base_objects"]);
        assert_eq!(component.component_precedes(), ["launch"]);
        assert_eq!(component.manifest.plugin.as_deref(), Some("router_plugin"));
    }

    #[test]
    fn empty_name_is_rejected() {
        let (_dir, path) = component_dir("name = \"\"\n");
        assert!(matches!(
            ModelComponent::load(&path),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn duplicate_names_across_repositories_are_forbidden() {
        let repo_a = tempfile::TempDir::new().expect("tempdir");
        let repo_b = tempfile::TempDir::new().expect("tempdir");
        for repo in [&repo_a, &repo_b] {
            let path = repo.path().join("dup");
            fs::create_dir_all(&path).expect("mkdir");
            fs::write(path.join(MANIFEST_FILE), "name = \"dup\"\n").expect("manifest");
        }
        let result = ComponentRepository::scan(&[
            repo_a.path().to_path_buf(),
            repo_b.path().to_path_buf(),
        ]);
        assert!(matches!(
            result,
            Err(Error::DuplicateComponentName { .. })
        ));
    }

    #[test]
    fn glob_expansion_handles_directories_and_recursion() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("scripts/nested")).expect("mkdir");
        fs::write(root.join("scripts/a.sh"), b"a").expect("write");
        fs::write(root.join("scripts/b.py"), b"b").expect("write");
        fs::write(root.join("scripts/nested/c.sh"), b"c").expect("write");

        // Bare directory expands non-recursively.
        let flat = expand_resource_pattern(root, "scripts");
        assert_eq!(
            flat,
            vec![PathBuf::from("scripts/a.sh"), PathBuf::from("scripts/b.py")]
        );

        // `**` expands recursively.
        let recursive = expand_resource_pattern(root, "scripts/**");
        assert_eq!(
            recursive,
            vec![
                PathBuf::from("scripts/a.sh"),
                PathBuf::from("scripts/b.py"),
                PathBuf::from("scripts/nested/c.sh"),
            ]
        );

        // Explicit extension patterns are taken verbatim.
        let shell_only = expand_resource_pattern(root, "scripts/**/*.sh");
        assert_eq!(
            shell_only,
            vec![
                PathBuf::from("scripts/a.sh"),
                PathBuf::from("scripts/nested/c.sh"),
            ]
        );

        // Literal paths pass through.
        assert_eq!(
            expand_resource_pattern(root, "scripts/a.sh"),
            vec![PathBuf::from("scripts/a.sh")]
        );
    }

    #[test]
    fn providers_are_indexed_by_attribute() {
        let repo = tempfile::TempDir::new().expect("tempdir");
        for (name, provides) in [("m_a", "c1"), ("m_b", "c1"), ("m_c", "c2")] {
            let path = repo.path().join(name);
            fs::create_dir_all(&path).expect("mkdir");
            fs::write(
                path.join(MANIFEST_FILE),
                format!(
                    "name = \"{name}\"\n[attributes]\nprovides = [\"{provides}\"]\n"
                ),
            )
            .expect("manifest");
        }
        let repository =
            ComponentRepository::scan(&[repo.path().to_path_buf()]).expect("scan");
        let providers = repository.providers_of("c1");
        let names: Vec<&str> = providers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["m_a", "m_b"]);
    }
}
