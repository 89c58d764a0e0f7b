//! OCI layer unpacking: apply layers bottom-up into a target directory,
//! honoring whiteout files (spec §4.B). Runs on a blocking thread since tar
//! extraction is CPU- and syscall-heavy.
//!
//! Container UID/GID 0 maps to the caller's own UID/GID by construction:
//! extraction never attempts to `chown`, so every created file is simply
//! owned by the process doing the unpacking, which is exactly the mapping
//! an unprivileged unpack needs.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "oci_unpack";

/// One layer ready to be applied: its decompressed-or-not tarball path plus
/// the manifest media type that says whether it needs gzip decoding.
pub struct LayerFile {
    pub path: PathBuf,
    pub media_type: String,
}

/// Extract `layers` in order into `target`, applying OCI whiteout semantics
/// as each layer is unpacked. Blocking; call via `spawn_blocking`.
pub fn apply_layers_blocking(layers: &[LayerFile], target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(Error::from)?;
    for layer in layers {
        apply_one_layer(layer, target)?;
    }
    Ok(())
}

fn apply_one_layer(layer: &LayerFile, target: &Path) -> Result<()> {
    let file = fs::File::open(&layer.path).map_err(Error::from)?;
    let reader: Box<dyn Read> =
        if layer.media_type.contains("gzip") { Box::new(GzDecoder::new(file)) } else { Box::new(file) };
    let mut archive = Archive::new(reader);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    for entry in archive.entries().map_err(Error::from)? {
        let mut entry = entry.map_err(Error::from)?;
        let entry_path = entry.path().map_err(Error::from)?.into_owned();
        let Some(file_name) = entry_path.file_name().and_then(|n| n.to_str()) else { continue };
        let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));

        if file_name == ".wh..wh..opq" {
            clear_directory_contents(&target.join(parent))?;
            continue;
        }
        if let Some(removed) = file_name.strip_prefix(".wh.") {
            remove_path(&target.join(parent).join(removed))?;
            continue;
        }

        let dest = target.join(&entry_path);
        if let Some(dest_parent) = dest.parent() {
            fs::create_dir_all(dest_parent).map_err(Error::from)?;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(Error::from)?;
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name().map_err(Error::from)? else { continue };
                let _ = fs::remove_file(&dest);
                std::os::unix::fs::symlink(&link, &dest).map_err(Error::from)?;
            }
            EntryType::Link => {
                let Some(link) = entry.link_name().map_err(Error::from)? else { continue };
                let src = target.join(link);
                let _ = fs::remove_file(&dest);
                fs::hard_link(&src, &dest).or_else(|_| fs::copy(&src, &dest).map(|_| ())).map_err(Error::from)?;
            }
            _ => {
                let _ = fs::remove_file(&dest);
                entry.unpack(&dest).map_err(Error::from)?;
            }
        }
    }
    Ok(())
}

/// Opaque whiteout (`.wh..wh..opq`): remove everything already materialized
/// under this directory from earlier layers, then let this layer's own
/// entries repopulate it.
fn clear_directory_contents(dir: &Path) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else { return Ok(()) };
    for entry in entries.flatten() {
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(Error::from),
        Ok(_) => fs::remove_file(path).map_err(Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(entries: &[(&str, &[u8])]) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.into_path().join("layer.tar");
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.finish().unwrap();
        path
    }

    #[test]
    fn base_layer_then_whiteout_removes_file() {
        let base = write_tar(&[("keep.txt", b"a"), ("drop.txt", b"b")]);
        let overlay = write_tar(&[(".wh.drop.txt", b"")]);
        let target = tempfile::tempdir().unwrap();

        apply_layers_blocking(
            &[
                LayerFile { path: base, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
                LayerFile { path: overlay, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
            ],
            target.path(),
        )
        .unwrap();

        assert!(target.path().join("keep.txt").exists());
        assert!(!target.path().join("drop.txt").exists());
    }

    #[test]
    fn opaque_whiteout_clears_directory_before_repopulating() {
        let base = write_tar(&[("dir/old-a.txt", b"a"), ("dir/old-b.txt", b"b")]);
        let overlay = write_tar(&[("dir/.wh..wh..opq", b""), ("dir/new.txt", b"c")]);
        let target = tempfile::tempdir().unwrap();

        apply_layers_blocking(
            &[
                LayerFile { path: base, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
                LayerFile { path: overlay, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
            ],
            target.path(),
        )
        .unwrap();

        assert!(!target.path().join("dir/old-a.txt").exists());
        assert!(!target.path().join("dir/old-b.txt").exists());
        let mut content = String::new();
        fs::File::open(target.path().join("dir/new.txt")).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "c");
    }

    #[test]
    fn later_layer_overwrites_earlier_file_content() {
        let base = write_tar(&[("f.txt", b"old")]);
        let overlay = write_tar(&[("f.txt", b"new")]);
        let target = tempfile::tempdir().unwrap();

        apply_layers_blocking(
            &[
                LayerFile { path: base, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
                LayerFile { path: overlay, media_type: "application/vnd.oci.image.layer.v1.tar".into() },
            ],
            target.path(),
        )
        .unwrap();

        let mut content = Vec::new();
        fs::File::open(target.path().join("f.txt")).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"new");
    }
}
