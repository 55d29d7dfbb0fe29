//! Mount-time pre-flight check.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::remote::{RemoteError, RemoteStore};

/// Why the configured dataset cannot be mounted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The store answered, but refused the credential.
    #[error(
        "permission denied for {dataset}: {detail}. Check that Project, Location and Dataset in \
         the dataset address are correct and that the account holds the Healthcare DICOM Editor \
         role"
    )]
    PermissionDenied {
        /// The dataset address that was checked.
        dataset: String,
        /// What the store said.
        detail: String,
    },

    /// The store could not be reached, or the address does not name a store.
    #[error("cannot reach {dataset}: {detail}")]
    Unreachable {
        /// The dataset address that was checked.
        dataset: String,
        /// What went wrong.
        detail: String,
    },
}

/// Runs one bounded listing call before anything is exposed to the kernel.
#[derive(Debug, Clone)]
pub struct AccessChecker {
    dataset: String,
    timeout: Duration,
}

impl AccessChecker {
    /// Create a checker for `dataset`. The whole check, retries included, is bounded by `timeout`.
    #[must_use]
    pub fn new(dataset: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dataset: dataset.into(),
            timeout,
        }
    }

    /// Probe the store.
    ///
    /// # Errors
    ///
    /// [`AccessError::PermissionDenied`] when the store rejects the credential, and
    /// [`AccessError::Unreachable`] for everything else, including a timeout.
    #[instrument(name = "AccessChecker::check", skip(self, remote), fields(dataset = %self.dataset))]
    pub async fn check<R: RemoteStore>(&self, remote: &R) -> Result<(), AccessError> {
        let outcome = tokio::time::timeout(self.timeout, remote.probe()).await;
        let err = match outcome {
            Ok(Ok(())) => {
                debug!("dataset is reachable and authorized");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => {
                return Err(AccessError::Unreachable {
                    dataset: self.dataset.clone(),
                    detail: format!("no answer within {:?}", self.timeout),
                });
            }
        };

        let dataset = self.dataset.clone();
        Err(match err {
            RemoteError::Unauthorized(detail) | RemoteError::Forbidden(detail) => {
                AccessError::PermissionDenied { dataset, detail }
            }
            RemoteError::NotFound(detail)
            | RemoteError::Transient(detail)
            | RemoteError::Unknown(detail) => AccessError::Unreachable { dataset, detail },
        })
    }
}
