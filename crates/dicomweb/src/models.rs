//! The DICOM JSON model (PS3.18 Annex F), reduced to what search and store responses need.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::DicomWebError;

/// Attribute tags used by this client, in the 8-hex-digit form the JSON model keys on.
pub mod tags {
    /// (0008,0018) SOP Instance UID.
    pub const SOP_INSTANCE_UID: &str = "00080018";
    /// (0020,000D) Study Instance UID.
    pub const STUDY_INSTANCE_UID: &str = "0020000D";
    /// (0020,000E) Series Instance UID.
    pub const SERIES_INSTANCE_UID: &str = "0020000E";
    /// (0008,1190) Retrieve URL.
    pub const RETRIEVE_URL: &str = "00081190";
    /// (0008,1198) Failed SOP Sequence.
    pub const FAILED_SOP_SEQUENCE: &str = "00081198";
    /// (0008,1199) Referenced SOP Sequence.
    pub const REFERENCED_SOP_SEQUENCE: &str = "00081199";
    /// (0008,1155) Referenced SOP Instance UID.
    pub const REFERENCED_SOP_INSTANCE_UID: &str = "00081155";
    /// (0008,1197) Failure Reason.
    pub const FAILURE_REASON: &str = "00081197";
}

/// One attribute of a DICOM JSON object.
#[derive(Debug, Clone, Deserialize)]
pub struct DicomAttribute {
    /// Value representation, e.g. `UI` or `SQ`.
    pub vr: String,
    /// The values; absent for empty attributes.
    #[serde(rename = "Value", default)]
    pub value: Vec<serde_json::Value>,
}

/// A DICOM JSON object: attributes keyed by tag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DicomObject(HashMap<String, DicomAttribute>);

impl DicomObject {
    /// The first value of `tag` when it is a string.
    #[must_use]
    pub fn string(&self, tag: &str) -> Option<&str> {
        self.0.get(tag)?.value.first()?.as_str()
    }

    /// The first value of `tag` when it is a number.
    #[must_use]
    pub fn number(&self, tag: &str) -> Option<i64> {
        self.0.get(tag)?.value.first()?.as_i64()
    }

    /// The items of a sequence attribute. Items that do not parse are skipped.
    #[must_use]
    pub fn sequence(&self, tag: &str) -> Vec<Self> {
        self.0
            .get(tag)
            .map(|attr| {
                attr.value
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fully qualified identity of one stored instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceUid {
    /// Study Instance UID.
    pub study: String,
    /// Series Instance UID.
    pub series: String,
    /// SOP Instance UID.
    pub instance: String,
}

impl InstanceUid {
    /// Parse the UIDs out of a WADO-RS retrieve URL ending in
    /// `studies/{study}/series/{series}/instances/{instance}`.
    #[must_use]
    pub fn from_retrieve_url(url: &str) -> Option<Self> {
        let mut segments = url.trim_end_matches('/').rsplit('/');
        let instance = segments.next()?;
        (segments.next()? == "instances").then_some(())?;
        let series = segments.next()?;
        (segments.next()? == "series").then_some(())?;
        let study = segments.next()?;
        (segments.next()? == "studies").then_some(())?;
        Some(Self {
            study: study.to_owned(),
            series: series.to_owned(),
            instance: instance.to_owned(),
        })
    }
}

/// Extract the stored instance from a STOW-RS response.
///
/// # Errors
///
/// Fails with [`DicomWebError::Unknown`] when the store reports the instance under the Failed SOP
/// Sequence, or when the response does not name a stored instance.
pub fn parse_store_response(response: &DicomObject) -> Result<InstanceUid, DicomWebError> {
    for stored in response.sequence(tags::REFERENCED_SOP_SEQUENCE) {
        if let Some(uid) = stored
            .string(tags::RETRIEVE_URL)
            .and_then(InstanceUid::from_retrieve_url)
        {
            return Ok(uid);
        }
    }

    if let Some(failed) = response
        .sequence(tags::FAILED_SOP_SEQUENCE)
        .into_iter()
        .next()
    {
        let reason = failed
            .number(tags::FAILURE_REASON)
            .map_or_else(|| "unspecified".to_owned(), |r| format!("{r:#06x}"));
        let sop = failed
            .string(tags::REFERENCED_SOP_INSTANCE_UID)
            .unwrap_or("<unknown>");
        return Err(DicomWebError::Unknown(format!(
            "store rejected instance {sop} (failure reason {reason})"
        )));
    }

    Err(DicomWebError::Unknown(
        "store response does not reference a stored instance".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SEARCH: &str = r#"[
        {"0020000D": {"vr": "UI", "Value": ["1.2.840.1"]}, "00080020": {"vr": "DA"}},
        {"0020000D": {"vr": "UI", "Value": ["1.2.840.2"]}}
    ]"#;

    #[test]
    fn search_results_expose_uids() {
        let objects: Vec<DicomObject> = serde_json::from_str(SEARCH).unwrap();
        let uids: Vec<_> = objects
            .iter()
            .filter_map(|o| o.string(tags::STUDY_INSTANCE_UID))
            .collect();
        assert_eq!(uids, ["1.2.840.1", "1.2.840.2"]);
        assert!(objects[0].string("00080020").is_none(), "empty attribute has no value");
    }

    #[test]
    fn retrieve_url_round_trips_into_uids() {
        let uid = InstanceUid::from_retrieve_url(
            "https://h/v1/projects/p/locations/l/datasets/d/dicomStores/s/dicomWeb/studies/1.2/series/3.4/instances/5.6",
        )
        .unwrap();
        assert_eq!(uid.study, "1.2");
        assert_eq!(uid.series, "3.4");
        assert_eq!(uid.instance, "5.6");
        assert!(InstanceUid::from_retrieve_url("https://h/studies/1.2/series/3.4").is_none());
    }

    #[test]
    fn store_response_names_the_stored_instance() {
        let body = r#"{
            "00081190": {"vr": "UR", "Value": ["https://h/dicomWeb/studies/1.2"]},
            "00081199": {"vr": "SQ", "Value": [{
                "00081150": {"vr": "UI", "Value": ["1.2.840.10008.5.1.4.1.1.2"]},
                "00081155": {"vr": "UI", "Value": ["5.6"]},
                "00081190": {"vr": "UR", "Value": ["https://h/dicomWeb/studies/1.2/series/3.4/instances/5.6"]}
            }]}
        }"#;
        let response: DicomObject = serde_json::from_str(body).unwrap();
        let uid = parse_store_response(&response).unwrap();
        assert_eq!(
            uid,
            InstanceUid {
                study: "1.2".to_owned(),
                series: "3.4".to_owned(),
                instance: "5.6".to_owned(),
            }
        );
    }

    #[test]
    fn store_response_reports_rejections() {
        let body = r#"{
            "00081198": {"vr": "SQ", "Value": [{
                "00081155": {"vr": "UI", "Value": ["5.6"]},
                "00081197": {"vr": "US", "Value": [49442]}
            }]}
        }"#;
        let response: DicomObject = serde_json::from_str(body).unwrap();
        let err = parse_store_response(&response).unwrap_err();
        assert!(err.to_string().contains("0xc122"), "got: {err}");
    }
}
