//! FUSE availability checks, run before anything touches the network.

use std::path::{Path, PathBuf};

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The FUSE kernel device is absent.
    #[error(
        "{path} does not exist. Load the fuse kernel module (modprobe fuse) or install your \
         distribution's fuse3 package."
    )]
    DeviceMissing {
        /// Path of the device node.
        path: &'static str,
    },

    /// No setuid mount helper on `PATH`.
    #[error(
        "None of {} was found on PATH. Install your distribution's fuse3 package.",
        .names.join(", ")
    )]
    HelperNotOnPath {
        /// Helper binaries that were searched for.
        names: &'static [&'static str],
    },

    /// Neither macFUSE nor osxfuse is installed.
    #[error(
        "macFUSE is not installed. dicom-fuse requires macFUSE to mount a DICOM store.\n\
         Install it from: https://macfuse.github.io/"
    )]
    MacFuseMissing,

    /// A file the macOS install should have shipped is missing.
    #[error("{} is missing. Reinstall macFUSE from https://macfuse.github.io/", .path.display())]
    IncompleteInstall {
        /// The missing file.
        path: PathBuf,
    },
}

/// Find the first of `names` in the directories of `search_path`.
fn find_on_path(names: &[&str], search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| candidate.is_file())
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(not(target_os = "macos"))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    const FUSE_DEVICE: &str = "/dev/fuse";
    const HELPERS: &[&str] = &["fusermount3", "fusermount"];

    if !Path::new(FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing { path: FUSE_DEVICE });
    }
    find_on_path(HELPERS, std::env::var_os("PATH").as_deref())
        .map(drop)
        .ok_or(FuseCheckError::HelperNotOnPath { names: HELPERS })
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Accepts either the macFUSE or the older osxfuse bundle, as long as its mount helper and the
/// libfuse dylib are present.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    const BUNDLES: &[(&str, &str)] = &[
        ("/Library/Filesystems/macfuse.fs", "Contents/Resources/mount_macfuse"),
        ("/Library/Filesystems/osxfuse.fs", "Contents/Resources/mount_osxfuse"),
    ];
    const LIBFUSE: &str = "/usr/local/lib/libfuse.2.dylib";

    let (bundle, helper) = BUNDLES
        .iter()
        .find(|(bundle, _)| Path::new(bundle).is_dir())
        .ok_or(FuseCheckError::MacFuseMissing)?;

    for required in [Path::new(bundle).join(helper), PathBuf::from(LIBFUSE)] {
        if !required.exists() {
            return Err(FuseCheckError::IncompleteInstall { path: required });
        }
    }
    Ok(())
}
