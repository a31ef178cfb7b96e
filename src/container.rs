//! Container Builder: allocates a container id, prepares the rw/work dirs,
//! and mounts the overlay rootfs. Grounded on `commands/run.py`'s
//! `_init_container_dir` and the overlay `linux.mount(...)` call (exact
//! option string and `MS_NODEV` flag), and on the teacher's own
//! `mount_overlay_fs` for the `nix::mount::mount` call shape. The teacher's
//! id scheme (`rand`-derived hex) and container-fs layout (`fs/mnt`,
//! `fs/upperdir`, `fs/workdir` under a registry-keyed image store) are
//! replaced with the spec's `<name>_<tag>_<uuid4>` id and flat
//! `cow_rw`/`cow_workdir` layout under a manifest-addressed image.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::mount::{mount, MsFlags};
use uuid::Uuid;

use crate::config;
use crate::error::RuntimeError;
use crate::image::Image;

pub struct Container {
    pub id: String,
    pub root_dir: PathBuf,
    pub rw_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// `<image-name-with-/-replaced-by-->_<tag>_<uuid4>`.
pub fn container_id(image: &Image, tag: &str) -> String {
    let flattened_name = image.name.replace('/', "-");
    format!("{}_{}_{}", flattened_name, tag, Uuid::new_v4())
}

/// Creates `root_dir`/`rw_dir`/`work_dir` and mounts the overlay. Leaves
/// whatever directories it managed to create on failure — reclaimable by
/// the clean sweep, per §4.3's "no cleanup on partial failure".
pub fn init(image: &Image, tag: &str) -> Result<Container> {
    let id = container_id(image, tag);
    let root_dir = PathBuf::from(config::container_dir()).join(&id);
    let rw_dir = root_dir.join("cow_rw");
    let work_dir = root_dir.join("cow_workdir");

    for dir in [&root_dir, &rw_dir, &work_dir] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    mount_overlay(&root_dir, &rw_dir, &work_dir, &image.content_dir())?;

    Ok(Container {
        id,
        root_dir,
        rw_dir,
        work_dir,
    })
}

fn mount_overlay(root_dir: &std::path::Path, rw_dir: &std::path::Path, work_dir: &std::path::Path, content_dir: &std::path::Path) -> Result<()> {
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        content_dir.display(),
        rw_dir.display(),
        work_dir.display()
    );

    println!("mounting docker image directory");
    println!("{}", content_dir.display());

    mount(
        Some("overlay"),
        root_dir,
        Some("overlay"),
        MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .map_err(|e| RuntimeError::MountFailure(format!("overlay mount at {}: {}", root_dir.display(), e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_image() -> Image {
        Image {
            name: "library/alpine".to_string(),
            version: "3".to_string(),
            size: 0,
            cmd: vec!["/bin/sh".to_string()],
            working_dir: None,
            image_dir: PathBuf::from("/var/opt/app/image/library-alpine-3"),
        }
    }

    #[test]
    fn container_id_replaces_slashes_and_embeds_tag() {
        let image = sample_image();
        let id = container_id(&image, "3");
        assert!(id.starts_with("library-alpine_3_"));
        // remainder after the two known prefixes must parse as a uuid
        let uuid_part = id.strip_prefix("library-alpine_3_").unwrap();
        assert!(Uuid::parse_str(uuid_part).is_ok());
    }

    #[test]
    fn container_id_is_unique_per_call() {
        let image = sample_image();
        let a = container_id(&image, "3");
        let b = container_id(&image, "3");
        assert_ne!(a, b);
    }

    #[test]
    fn init_creates_directories_before_mount_would_run() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("BOXRUN_CONTAINER_DIR", tmp.path());

        let image = sample_image();
        let id = container_id(&image, "3");
        let root_dir = tmp.path().join(&id);
        let rw_dir = root_dir.join("cow_rw");
        let work_dir = root_dir.join("cow_workdir");

        for dir in [&root_dir, &rw_dir, &work_dir] {
            fs::create_dir_all(dir).unwrap();
        }

        assert!(rw_dir.exists());
        assert!(work_dir.exists());

        std::env::remove_var("BOXRUN_CONTAINER_DIR");
    }
}
