use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dicom_fuse::access::{AccessChecker, AccessError};
use dicom_fuse::cache::{ContentCache, InvalidRootPathError, MetaCache};
use dicom_fuse::fs::fuser::FuserAdapter;
use dicom_fuse::fs::{DicomFs, FsConfig};
use dicom_fuse::io;
use dicom_fuse::remote::DicomWebStore;
use dicomweb::{ClientConfig, Credentials, DicomWebClient, HttpClientError, ReqwestClient};
use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info};

use crate::app_config;

/// Environment variable holding a bearer token when no key file is configured.
const TOKEN_ENV_VAR: &str = "DICOM_FUSE_TOKEN";

/// Upper bound for the pre-mount access check, retries included.
const ACCESS_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the kernel gets to show the mount.
const MOUNT_DEADLINE: Duration = Duration::from_secs(10);
const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Failed to prepare the cache directory: {0}")]
    Cache(#[from] InvalidRootPathError),

    #[error("Failed to build the HTTP client: {0}")]
    Http(#[from] HttpClientError),

    #[error("Mount point '{}' did not become a mount within {:?}.", .path.display(), .waited)]
    NotReady { path: PathBuf, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

mod managed_fuse {
    //! This module feels a little confusing, but it's designed to help you manage the lifecycle of
    //! fuse slightly better. fuser will not attempt to fuse unmount the filesystem when the
    //! `BackgroundSession` is dropped, and will only do a regular unmount, but we want to be
    //! aggressive and force an unmount if possible.
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use fuser::BackgroundSession;
    use nix::errno::Errno;

    use super::{debug, error};

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn<FS: fuser::Filesystem + Send + 'static>(
            fs: FS,
            mount_point: &Path,
        ) -> Result<Self, std::io::Error> {
            Ok(Self {
                _session: fuser::spawn_mount2(fs, mount_point, &Self::mount_options())?,
            })
        }

        fn mount_options() -> Vec<fuser::MountOption> {
            let mut opts = vec![
                fuser::MountOption::FSName("dicom-fuse".to_owned()),
                fuser::MountOption::Subtype("dicom-fuse".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::DefaultPermissions,
            ];
            // fusermount only honours auto_unmount together with allow_other.
            if allow_other_permitted() {
                opts.push(fuser::MountOption::AllowOther);
                opts.push(fuser::MountOption::AutoUnmount);
            } else {
                debug!("allow_other is not permitted, mounting without auto_unmount");
            }
            opts
        }
    }

    fn allow_other_permitted() -> bool {
        nix::unistd::Uid::effective().is_root()
            || std::fs::read_to_string("/etc/fuse.conf").is_ok_and(|conf| {
                conf.lines()
                    .map(str::trim)
                    .any(|line| line == "user_allow_other")
            })
    }

    /// Unmounts on drop, whether or not the mount ever happened.
    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: &Path) -> Self {
            Self {
                mount_point: mount_point.to_path_buf(),
            }
        }

        pub fn spawn<FS: fuser::Filesystem + Send + 'static>(
            &self,
            fs: FS,
        ) -> Result<FuseCoreScope, std::io::Error> {
            FuseCoreScope::spawn(fs, &self.mount_point)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Poll until `mount_point` is a mount, or `deadline` has passed.
async fn wait_until_mounted(
    mount_point: &Path,
    deadline: Duration,
    poll: Duration,
) -> Result<(), MountError> {
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        if io::is_mount_point(mount_point).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= give_up {
            return Err(MountError::NotReady {
                path: mount_point.to_path_buf(),
                waited: deadline,
            });
        }
        debug!(mount_point = %mount_point.display(), "Mount is not visible yet.");
        tokio::time::sleep(poll).await;
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), MountError> {
    let http = ReqwestClient::new(Duration::from_secs(config.request_timeout_secs))?;
    let tokens = Credentials::resolve(config.key_file.as_deref(), TOKEN_ENV_VAR);
    let client = DicomWebClient::new(
        http,
        tokens,
        ClientConfig::new(config.dataset_addr.clone()),
    );
    let remote = Arc::new(DicomWebStore::new(client));

    AccessChecker::new(config.dataset_addr.clone(), ACCESS_CHECK_TIMEOUT)
        .check(&*remote)
        .await?;
    info!(dataset = %config.dataset_addr, "Dataset is reachable.");

    prepare_mount_point(&config.mount_point).await?;

    let meta = MetaCache::new(Arc::clone(&remote), config.meta_ttls());
    let content = ContentCache::new(Arc::clone(&remote), &config.content_cache()).await?;
    let fs = Arc::new(DicomFs::new(
        remote,
        meta,
        content,
        FsConfig {
            uid: config.uid,
            gid: config.gid,
            enable_deletion: config.enable_deletion,
        },
    ));

    info!(
        profile = ?config.profile,
        "Mounting filesystem at {}.",
        config.mount_point.display()
    );

    let fuse = managed_fuse::ManagedFuse::new(&config.mount_point);
    {
        let _session = fuse.spawn(FuserAdapter::new(fs, handle))?;
        wait_until_mounted(&config.mount_point, MOUNT_DEADLINE, MOUNT_POLL_INTERVAL).await?;
        info!("dicom-fuse is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), MountError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
