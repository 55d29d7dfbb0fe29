//! [`RemoteStore`] over a DICOMweb endpoint.

use bytes::Bytes;
use dicomweb::{DicomWebClient, DicomWebError, HttpClient, InstanceUid, TokenProvider};
use tracing::{debug, instrument};

use super::{EntryKind, RemoteAttributes, RemoteError, RemoteStore};
use crate::path::{InstanceId, VirtualPath};

impl From<DicomWebError> for RemoteError {
    fn from(err: DicomWebError) -> Self {
        match err {
            DicomWebError::Unauthorized(m) => Self::Unauthorized(m),
            DicomWebError::Forbidden(m) => Self::Forbidden(m),
            DicomWebError::NotFound(m) => Self::NotFound(m),
            DicomWebError::Transient(m) => Self::Transient(m),
            DicomWebError::Unknown(m) => Self::Unknown(m),
            DicomWebError::Auth(e) => Self::Unauthorized(e.to_string()),
            DicomWebError::Decode(e) => Self::Unknown(e.to_string()),
        }
    }
}

impl From<InstanceUid> for InstanceId {
    fn from(uid: InstanceUid) -> Self {
        Self {
            study: uid.study,
            series: uid.series,
            instance: uid.instance,
        }
    }
}

fn to_uid(id: &InstanceId) -> InstanceUid {
    InstanceUid {
        study: id.study.clone(),
        series: id.series.clone(),
        instance: id.instance.clone(),
    }
}

fn not_found(path: &VirtualPath) -> RemoteError {
    RemoteError::NotFound(path.to_string())
}

/// The production store: studies, series and instances of one DICOM store.
pub struct DicomWebStore<C, T> {
    client: DicomWebClient<C, T>,
}

impl<C: HttpClient, T: TokenProvider> DicomWebStore<C, T> {
    /// Wrap a configured client.
    #[must_use]
    pub fn new(client: DicomWebClient<C, T>) -> Self {
        Self { client }
    }
}

impl<C: HttpClient, T: TokenProvider> RemoteStore for DicomWebStore<C, T> {
    #[instrument(name = "DicomWebStore::list_children", skip(self, path), fields(%path))]
    async fn list_children(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        let names = match path {
            VirtualPath::Root => self.client.search_studies().uids().await?,
            VirtualPath::Study { study } => self.client.search_series(study).uids().await?,
            VirtualPath::Series { study, series } => self
                .client
                .search_instances(study, series)
                .uids()
                .await?
                .into_iter()
                .map(|uid| format!("{uid}{}", crate::path::INSTANCE_SUFFIX))
                .collect(),
            VirtualPath::Instance(_) => {
                return Err(RemoteError::Unknown(format!("{path} is not a directory")));
            }
        };
        debug!(count = names.len(), "listed children");
        Ok(names)
    }

    async fn get_attributes(&self, path: &VirtualPath) -> Result<RemoteAttributes, RemoteError> {
        let found = match path {
            VirtualPath::Root => return Ok(RemoteAttributes::bare(EntryKind::Directory)),
            VirtualPath::Study { study } => self.client.find_study(study).await?,
            VirtualPath::Series { study, series } => self.client.find_series(study, series).await?,
            VirtualPath::Instance(id) => {
                self.client
                    .find_instance(&id.study, &id.series, &id.instance)
                    .await?
            }
        };
        let kind = if path.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        found
            .map(|_| RemoteAttributes::bare(kind))
            .ok_or_else(|| not_found(path))
    }

    async fn fetch_instance(&self, id: &InstanceId) -> Result<Bytes, RemoteError> {
        Ok(self.client.retrieve_instance(&to_uid(id)).await?)
    }

    #[instrument(name = "DicomWebStore::store_instance", skip(self, parent, data), fields(%parent))]
    async fn store_instance(
        &self,
        parent: &VirtualPath,
        data: Bytes,
    ) -> Result<InstanceId, RemoteError> {
        let stored: InstanceId = self.client.store_instance(data).await?.into();
        let actual_parent = VirtualPath::Instance(stored.clone()).parent();
        if actual_parent.as_ref() != Some(parent) {
            debug!(
                stored_under = %VirtualPath::Instance(stored.clone()),
                "store placed the instance according to its own UIDs"
            );
        }
        Ok(stored)
    }

    #[instrument(name = "DicomWebStore::delete_resource", skip(self, path), fields(%path))]
    async fn delete_resource(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        match path {
            VirtualPath::Root => Err(RemoteError::Forbidden(
                "refusing to delete the whole store".to_owned(),
            )),
            VirtualPath::Study { study } => Ok(self.client.delete_study(study).await?),
            VirtualPath::Series { study, series } => {
                Ok(self.client.delete_series(study, series).await?)
            }
            VirtualPath::Instance(id) => Ok(self.client.delete_instance(&to_uid(id)).await?),
        }
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.client
            .search_studies()
            .with_page_size(1)
            .next_page()
            .await?;
        Ok(())
    }
}
