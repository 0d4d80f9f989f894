use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// Extensions accepted for reference images, in preference order.
const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Sub-spaces of an app's image directory.
const SUB_CONTACTS: &str = "contacts";
const SUB_SYSTEM: &str = "system";

#[derive(Debug, Deserialize, Default)]
struct AliasFile {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Read-only resolver from a logical reference name to on-disk image paths.
///
/// Resolution order: cache, alias table, exact file in the root, exact file
/// in `contacts/`, fuzzy stem match in root then `contacts/`. A missing
/// reference resolves to nothing rather than an error, so workflow authors
/// can ship optional indicators. Resolution is idempotent within a run: the
/// first answer for a name is cached and returned thereafter.
pub struct AssetStore {
    root: PathBuf,
    aliases: BTreeMap<String, String>,
    cache: DashMap<String, Option<PathBuf>>,
}

impl AssetStore {
    /// Open the image root for one app. `aliases.yaml` next to the root is
    /// optional.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let aliases = Self::load_aliases(&root);
        Self {
            root,
            aliases,
            cache: DashMap::new(),
        }
    }

    fn load_aliases(root: &Path) -> BTreeMap<String, String> {
        let path = root.join("aliases.yaml");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return BTreeMap::new(),
        };
        match serde_yaml::from_str::<AliasFile>(&content) {
            Ok(file) => file.aliases,
            Err(e) => {
                warn!("ignoring malformed alias table {}: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference name to its main image path.
    pub fn get_image(&self, name: &str) -> Option<PathBuf> {
        if let Some(hit) = self.cache.get(name) {
            return hit.clone();
        }
        let resolved = self.resolve_uncached(name);
        self.cache.insert(name.to_string(), resolved.clone());
        resolved
    }

    fn resolve_uncached(&self, name: &str) -> Option<PathBuf> {
        let real = self.aliases.get(name).map(String::as_str).unwrap_or(name);

        if let Some(path) = self.exact_in(&self.root, real) {
            return Some(path);
        }
        if let Some(path) = self.exact_in(&self.root.join(SUB_CONTACTS), real) {
            return Some(path);
        }
        if let Some(path) = self.fuzzy_in(&self.root, real) {
            debug!("fuzzy-resolved reference '{}' -> {}", name, path.display());
            return Some(path);
        }
        if let Some(path) = self.fuzzy_in(&self.root.join(SUB_CONTACTS), real) {
            debug!("fuzzy-resolved contact '{}' -> {}", name, path.display());
            return Some(path);
        }
        None
    }

    fn exact_in(&self, dir: &Path, stem: &str) -> Option<PathBuf> {
        IMAGE_EXTS
            .iter()
            .map(|ext| dir.join(format!("{stem}.{ext}")))
            .find(|p| p.is_file())
    }

    fn fuzzy_in(&self, dir: &Path, needle: &str) -> Option<PathBuf> {
        let needle = needle.to_lowercase();
        let entries = std::fs::read_dir(dir).ok()?;
        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_image(p))
            .filter(|p| {
                stem_of(p)
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    /// Main image followed by any `_v2, _v3, …` variants. Variants start at
    /// `_v2` by convention; the bare name is v1.
    pub fn get_image_variants(&self, name: &str) -> Vec<PathBuf> {
        let Some(main) = self.get_image(name) else {
            return Vec::new();
        };
        let mut paths = vec![main.clone()];
        let (Some(stem), Some(dir)) = (stem_of(&main), main.parent()) else {
            return paths;
        };
        let pattern = format!("{}/{}_v[0-9]*.*", dir.display(), glob::Pattern::escape(stem));
        if let Ok(matches) = glob::glob(&pattern) {
            let mut variants: Vec<PathBuf> =
                matches.flatten().filter(|p| is_image(p)).collect();
            variants.sort();
            paths.extend(variants);
        }
        paths
    }

    /// All reference names available in the root and its sub-spaces.
    pub fn list_references(&self) -> Vec<String> {
        let mut names = Vec::new();
        for dir in [
            self.root.clone(),
            self.root.join(SUB_SYSTEM),
            self.root.join(SUB_CONTACTS),
        ] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if is_image(&path) {
                    if let Some(stem) = stem_of(&path) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Display names from the alias table (human-language synonyms).
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
}

fn stem_of(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::write(path, b"\x89PNG\r\n\x1a\n").unwrap();
    }

    fn store_with_fixtures() -> (tempfile::TempDir, AssetStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        fs::create_dir_all(root.join("contacts")).unwrap();
        fs::create_dir_all(root.join("system")).unwrap();

        touch(&root.join("send_button.png"));
        touch(&root.join("send_button_v2.png"));
        touch(&root.join("send_button_v3.png"));
        touch(&root.join("home_tab.png"));
        touch(&root.join("contacts/zhang_san.png"));
        touch(&root.join("system/back_button.png"));

        fs::write(
            root.join("aliases.yaml"),
            "aliases:\n  发送: send_button\n  首页: home_tab\n",
        )
        .unwrap();

        let store = AssetStore::open(&root);
        (dir, store)
    }

    #[test]
    fn exact_resolution() {
        let (_dir, store) = store_with_fixtures();
        let path = store.get_image("send_button").unwrap();
        assert!(path.ends_with("send_button.png"));
    }

    #[test]
    fn alias_resolution() {
        let (_dir, store) = store_with_fixtures();
        let path = store.get_image("发送").unwrap();
        assert!(path.ends_with("send_button.png"));
    }

    #[test]
    fn contact_subspace_resolution() {
        let (_dir, store) = store_with_fixtures();
        let path = store.get_image("zhang_san").unwrap();
        assert!(path.to_string_lossy().contains("contacts"));
    }

    #[test]
    fn fuzzy_resolution_is_case_insensitive() {
        let (_dir, store) = store_with_fixtures();
        let path = store.get_image("SEND").unwrap();
        assert!(path.ends_with("send_button.png"));
    }

    #[test]
    fn missing_reference_is_empty_not_error() {
        let (_dir, store) = store_with_fixtures();
        assert!(store.get_image("does_not_exist").is_none());
        assert!(store.get_image_variants("does_not_exist").is_empty());
    }

    #[test]
    fn variants_follow_main_in_order() {
        let (_dir, store) = store_with_fixtures();
        let variants = store.get_image_variants("send_button");
        assert_eq!(variants.len(), 3);
        assert!(variants[0].ends_with("send_button.png"));
        assert!(variants[1].ends_with("send_button_v2.png"));
        assert!(variants[2].ends_with("send_button_v3.png"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let (_dir, store) = store_with_fixtures();
        let first = store.get_image("home_tab");
        let second = store.get_image("home_tab");
        assert_eq!(first, second);
    }

    #[test]
    fn listing_walks_subspaces() {
        let (_dir, store) = store_with_fixtures();
        let names = store.list_references();
        assert!(names.contains(&"send_button".to_string()));
        assert!(names.contains(&"back_button".to_string()));
        assert!(names.contains(&"zhang_san".to_string()));
    }
}
