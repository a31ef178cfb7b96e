//! On-disk image enumeration: scans the configured image directory, reads
//! each `manifest.json`, and surfaces the default command / working dir
//! embedded in the first history entry's `v1Compatibility` blob.
//!
//! Grounded on `commands/images.py`'s `find_images`/`Image` dataclass from
//! the original implementation this runtime was distilled from: the on-disk
//! layout (`manifest.json`, `layers/`, `contents/`) and the size/cmd
//! extraction logic are carried over unchanged. The teacher's own
//! `image.rs` is registry-pull machinery this runtime does not need, since
//! images are assumed pre-staged on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config;
use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub version: String,
    pub size: u64,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub image_dir: PathBuf,
}

impl Image {
    pub fn content_dir(&self) -> PathBuf {
        self.image_dir.join("contents")
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    tag: String,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    config: V1Config,
}

#[derive(Debug, Deserialize, Default)]
struct V1Config {
    #[serde(rename = "Cmd", default)]
    cmd: Vec<String>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: String,
}

/// Scans `<image_dir>/*` for `manifest.json` files. Iteration order matches
/// directory-listing order; the spec does not require stability.
pub fn list() -> Result<Vec<Image>> {
    let root = config::image_dir();
    let mut images = Vec::new();

    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(_) => return Ok(images),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match load_image(&entry.path()) {
            Ok(image) => images.push(image),
            Err(e) => eprintln!("skipping image at {}: {}", entry.path().display(), e),
        }
    }

    Ok(images)
}

fn load_image(image_dir: &Path) -> Result<Image> {
    let manifest_path = image_dir.join("manifest.json");
    let manifest_text = fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;

    let manifest: Manifest = serde_json::from_str(&manifest_text).map_err(|e| RuntimeError::ManifestParse {
        path: manifest_path.display().to_string(),
        reason: e.to_string(),
    })?;

    let first_entry = manifest.history.first().ok_or_else(|| RuntimeError::ManifestParse {
        path: manifest_path.display().to_string(),
        reason: "history is empty".to_string(),
    })?;

    let state: V1Compatibility =
        serde_json::from_str(&first_entry.v1_compatibility).map_err(|e| RuntimeError::ManifestParse {
            path: manifest_path.display().to_string(),
            reason: format!("v1Compatibility: {}", e),
        })?;

    let size = layers_size(&image_dir.join("layers"))?;

    let working_dir = if state.config.working_dir.is_empty() {
        None
    } else {
        Some(state.config.working_dir)
    };

    Ok(Image {
        name: manifest.name,
        version: manifest.tag,
        size,
        cmd: state.config.cmd,
        working_dir,
        image_dir: image_dir.to_path_buf(),
    })
}

/// Sums regular-file sizes directly under `layers/` — not recursive into
/// subdirectories, matching the original's `os.path.isfile` filter.
fn layers_size(layers_dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let entries = fs::read_dir(layers_dir).with_context(|| format!("reading {}", layers_dir.display()))?;

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            total += entry.metadata()?.len();
        }
    }

    Ok(total)
}

/// First match wins, same as the original's `next(... for v in find_images() ...)`.
pub fn find(registry: &str, name: &str, tag: &str) -> Result<Option<Image>> {
    let full_name = format!("{}/{}", registry, name);
    let images = list()?;
    Ok(images.into_iter().find(|img| img.name == full_name && img.version == tag))
}

/// Splits a bare `<image>:<tag>` or `<registry>/<image>:<tag>` reference,
/// defaulting the registry segment to `library` and the tag to `latest`,
/// matching `commands/__init__.py`'s `parse_image_str`.
pub fn parse_reference(reference: &str) -> Result<(String, String, String)> {
    let (path, tag) = match reference.rsplit_once(':') {
        Some((path, tag)) => (path, tag.to_string()),
        None => (reference, "latest".to_string()),
    };

    let (registry, name) = match path.rsplit_once('/') {
        Some((registry, name)) => (registry.to_string(), name.to_string()),
        None => ("library".to_string(), path.to_string()),
    };

    Ok((registry, name, tag))
}

/// Plain column print, no `AsciiTable`-equivalent dependency (table
/// rendering is out of scope) and no human-readable byte formatting
/// (likewise out of scope).
pub fn print_available_images() -> Result<()> {
    println!("NAME\tVERSION\tSIZE\tPATH");
    for image in list()? {
        println!(
            "{}\t{}\t{}\t{}",
            image.name,
            image.version,
            image.size,
            image.image_dir.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_image(dir: &Path, name: &str, tag: &str, cmd: &[&str], working_dir: &str, layer_sizes: &[usize]) {
        fs::create_dir_all(dir.join("layers")).unwrap();
        fs::create_dir_all(dir.join("contents")).unwrap();

        let v1 = serde_json::json!({
            "config": {
                "Cmd": cmd,
                "WorkingDir": working_dir,
            }
        })
        .to_string();

        let manifest = serde_json::json!({
            "name": name,
            "tag": tag,
            "history": [{"v1Compatibility": v1}],
        });

        fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();

        for (i, size) in layer_sizes.iter().enumerate() {
            let bytes = vec![0u8; *size];
            fs::write(dir.join("layers").join(format!("layer-{}", i)), bytes).unwrap();
        }
    }

    #[test]
    fn extracts_cmd_and_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let image_dir = tmp.path().join("library-alpine-3");
        write_image(&image_dir, "library/alpine", "3", &["/bin/sh", "-c", "echo hi"], "/srv", &[10, 20]);

        let image = load_image(&image_dir).unwrap();
        assert_eq!(image.cmd, vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(image.working_dir.as_deref(), Some("/srv"));
        assert_eq!(image.size, 30);
    }

    #[test]
    fn empty_working_dir_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let image_dir = tmp.path().join("library-alpine-3");
        write_image(&image_dir, "library/alpine", "3", &["/bin/sh"], "", &[]);

        let image = load_image(&image_dir).unwrap();
        assert_eq!(image.working_dir, None);
        assert_eq!(image.size, 0);
    }

    #[test]
    fn layers_size_ignores_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = tmp.path().join("layers");
        fs::create_dir_all(layers.join("nested")).unwrap();
        fs::write(layers.join("a"), vec![0u8; 5]).unwrap();
        fs::write(layers.join("nested").join("b"), vec![0u8; 100]).unwrap();

        assert_eq!(layers_size(&layers).unwrap(), 5);
    }

    #[test]
    fn parse_reference_defaults_registry_and_tag() {
        assert_eq!(
            parse_reference("alpine").unwrap(),
            ("library".to_string(), "alpine".to_string(), "latest".to_string())
        );
        assert_eq!(
            parse_reference("alpine:3").unwrap(),
            ("library".to_string(), "alpine".to_string(), "3".to_string())
        );
        assert_eq!(
            parse_reference("myregistry/alpine:3").unwrap(),
            ("myregistry".to_string(), "alpine".to_string(), "3".to_string())
        );
    }

    #[test]
    fn find_matches_registry_name_and_tag() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("BOXRUN_IMAGE_DIR", tmp.path());

        write_image(&tmp.path().join("img1"), "library/alpine", "3", &["/bin/sh"], "", &[1]);
        write_image(&tmp.path().join("img2"), "library/alpine", "latest", &["/bin/sh"], "", &[1]);

        let found = find("library", "alpine", "3").unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().version, "3");

        let missing = find("library", "missing", "latest").unwrap();
        assert!(missing.is_none());

        std::env::remove_var("BOXRUN_IMAGE_DIR");
    }
}
