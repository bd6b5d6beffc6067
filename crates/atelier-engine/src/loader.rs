use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use atelier_contracts::config::ReferencePaths;
use atelier_contracts::references::{BodyAnchor, ImageHandle, ReferenceSet};

/// Reads a persona's configured reference files into memory. Relative paths
/// resolve against `base_dir` (normally the config file's directory).
pub fn load_reference_set(paths: &ReferencePaths, base_dir: &Path) -> Result<ReferenceSet> {
    let Some(pose_source) = paths.pose_source.as_ref() else {
        bail!("references.pose_source is not configured");
    };
    let pose_source = load_image(&resolve(base_dir, pose_source))?;
    let face_anchors = paths
        .face_anchors
        .iter()
        .map(|path| load_image(&resolve(base_dir, path)))
        .collect::<Result<Vec<_>>>()?;
    let body_anchors = paths
        .body_anchors
        .iter()
        .map(|anchor| {
            Ok(BodyAnchor {
                image: load_image(&resolve(base_dir, &anchor.path))?,
                orientation: anchor.orientation,
                primary: anchor.primary,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let background = paths
        .background
        .as_ref()
        .map(|path| load_image(&resolve(base_dir, path)))
        .transpose()?;
    Ok(ReferenceSet {
        pose_source,
        face_anchors,
        body_anchors,
        background,
    })
}

pub fn load_image(path: &Path) -> Result<ImageHandle> {
    let Some(mime_type) = mime_for_path(path) else {
        bail!("unsupported reference image type: {}", path.display());
    };
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed reading reference image {}", path.display()))?;
    let label = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("reference")
        .to_string();
    Ok(ImageHandle::new(label, mime_type, bytes))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::config::BodyAnchorPath;
    use atelier_contracts::references::Orientation;

    use super::*;

    #[test]
    fn loads_relative_paths_against_base_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for name in ["pose.png", "face.jpg", "back.webp"] {
            std::fs::write(temp.path().join(name), name.as_bytes())?;
        }
        let paths = ReferencePaths {
            pose_source: Some(PathBuf::from("pose.png")),
            face_anchors: vec![PathBuf::from("face.jpg")],
            body_anchors: vec![BodyAnchorPath {
                path: temp.path().join("back.webp"),
                orientation: Orientation::Back,
                primary: true,
            }],
            background: None,
        };
        let set = load_reference_set(&paths, temp.path())?;
        assert_eq!(set.pose_source.label, "pose.png");
        assert_eq!(set.pose_source.bytes(), b"pose.png");
        assert_eq!(set.face_anchors[0].mime_type, "image/jpeg");
        assert_eq!(set.body_anchors[0].orientation, Orientation::Back);
        assert_eq!(set.body_anchors[0].image.mime_type, "image/webp");
        Ok(())
    }

    #[test]
    fn missing_pose_source_and_unknown_types_are_errors() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(load_reference_set(&ReferencePaths::default(), temp.path()).is_err());

        std::fs::write(temp.path().join("notes.txt"), b"x")?;
        assert!(load_image(&temp.path().join("notes.txt")).is_err());
        assert!(load_image(&temp.path().join("absent.png")).is_err());
        Ok(())
    }

    #[test]
    fn mime_and_extension_mapping() {
        assert_eq!(mime_for_path(Path::new("a/B.JPEG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("noext")), None);
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }
}
