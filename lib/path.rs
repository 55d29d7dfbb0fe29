//! Virtual paths: positions in the study / series / instance hierarchy.

use std::ffi::OsStr;
use std::fmt;

use thiserror::Error;

/// File name suffix of every instance.
pub const INSTANCE_SUFFIX: &str = ".dcm";

/// Identity of one remote instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    /// Study Instance UID.
    pub study: String,
    /// Series Instance UID.
    pub series: String,
    /// SOP Instance UID.
    pub instance: String,
}

impl InstanceId {
    /// The file name this instance is exposed under.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{INSTANCE_SUFFIX}", self.instance)
    }
}

/// A position in the mounted tree.
///
/// The mapping to a remote resource is pure: every variant names exactly one remote object and
/// every remote object has exactly one `VirtualPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VirtualPath {
    /// The mount root; its children are studies.
    Root,
    /// `/{study}`
    Study {
        /// Study Instance UID.
        study: String,
    },
    /// `/{study}/{series}`
    Series {
        /// Study Instance UID.
        study: String,
        /// Series Instance UID.
        series: String,
    },
    /// `/{study}/{series}/{instance}.dcm`
    Instance(InstanceId),
}

/// Why a name or path does not map into the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Empty, `.`/`..`, contains a separator, is not UTF-8, or lacks the instance suffix.
    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    /// Deeper than `study/series/instance`.
    #[error("path is deeper than study/series/instance")]
    TooDeep,

    /// A child was requested of an instance.
    #[error("instances have no children")]
    NotADirectory,
}

impl From<PathError> for std::io::Error {
    fn from(err: PathError) -> Self {
        let errno = match err {
            PathError::InvalidName(_) => libc::EINVAL,
            PathError::TooDeep => libc::ENOENT,
            PathError::NotADirectory => libc::ENOTDIR,
        };
        Self::from_raw_os_error(errno)
    }
}

fn validate(name: &str) -> Result<&str, PathError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(PathError::InvalidName(name.to_owned()));
    }
    Ok(name)
}

impl VirtualPath {
    /// Parse a slash separated path relative to the mount root. Leading, trailing and repeated
    /// slashes are ignored.
    ///
    /// # Errors
    ///
    /// Fails on invalid segments, on instance names without the `.dcm` suffix and on paths deeper
    /// than three levels.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(Self::Root, |parent, segment| {
                parent.child_str(segment).map_err(|e| match e {
                    PathError::NotADirectory => PathError::TooDeep,
                    other @ (PathError::InvalidName(_) | PathError::TooDeep) => other,
                })
            })
    }

    /// The path of the entry `name` inside this directory.
    ///
    /// # Errors
    ///
    /// See [`PathError`].
    pub fn child(&self, name: &OsStr) -> Result<Self, PathError> {
        let name = name
            .to_str()
            .ok_or_else(|| PathError::InvalidName(name.to_string_lossy().into_owned()))?;
        self.child_str(name)
    }

    fn child_str(&self, name: &str) -> Result<Self, PathError> {
        let name = validate(name)?;
        match self {
            Self::Root => Ok(Self::Study {
                study: name.to_owned(),
            }),
            Self::Study { study } => Ok(Self::Series {
                study: study.clone(),
                series: name.to_owned(),
            }),
            Self::Series { study, series } => {
                let instance = name
                    .strip_suffix(INSTANCE_SUFFIX)
                    .filter(|uid| !uid.is_empty())
                    .ok_or_else(|| PathError::InvalidName(name.to_owned()))?;
                Ok(Self::Instance(InstanceId {
                    study: study.clone(),
                    series: series.clone(),
                    instance: instance.to_owned(),
                }))
            }
            Self::Instance(_) => Err(PathError::NotADirectory),
        }
    }

    /// The containing directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        match self {
            Self::Root => None,
            Self::Study { .. } => Some(Self::Root),
            Self::Series { study, .. } => Some(Self::Study {
                study: study.clone(),
            }),
            Self::Instance(id) => Some(Self::Series {
                study: id.study.clone(),
                series: id.series.clone(),
            }),
        }
    }

    /// This path's parent, grandparent and so on, up to and including the root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        std::iter::successors(self.parent(), Self::parent).collect()
    }

    /// The last path segment as shown in a directory listing.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Root => None,
            Self::Study { study } => Some(study.clone()),
            Self::Series { series, .. } => Some(series.clone()),
            Self::Instance(id) => Some(id.file_name()),
        }
    }

    /// Whether this path is exposed as a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        !matches!(self, Self::Instance(_))
    }

    /// The instance this path names, if it is a file.
    #[must_use]
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::Instance(id) => Some(id),
            Self::Root | Self::Study { .. } | Self::Series { .. } => None,
        }
    }

    /// Whether the instance `id` lies at or below this path.
    #[must_use]
    pub fn contains_instance(&self, id: &InstanceId) -> bool {
        match self {
            Self::Root => true,
            Self::Study { study } => id.study == *study,
            Self::Series { study, series } => id.study == *study && id.series == *series,
            Self::Instance(own) => own == id,
        }
    }

    /// Whether `other` is this path or lies below it.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self == other || other.ancestors().iter().any(|a| a == self)
    }
}

impl From<InstanceId> for VirtualPath {
    fn from(id: InstanceId) -> Self {
        Self::Instance(id)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("/"),
            Self::Study { study } => write!(f, "/{study}"),
            Self::Series { study, series } => write!(f, "/{study}/{series}"),
            Self::Instance(id) => write!(f, "/{}/{}/{}", id.study, id.series, id.file_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn instance(study: &str, series: &str, instance: &str) -> VirtualPath {
        VirtualPath::Instance(InstanceId {
            study: study.to_owned(),
            series: series.to_owned(),
            instance: instance.to_owned(),
        })
    }

    #[test]
    fn parse_maps_every_depth() {
        assert_eq!(VirtualPath::parse("/").unwrap(), VirtualPath::Root);
        assert_eq!(
            VirtualPath::parse("1.2//").unwrap(),
            VirtualPath::Study {
                study: "1.2".to_owned()
            }
        );
        assert_eq!(
            VirtualPath::parse("/1.2/3.4/5.6.dcm").unwrap(),
            instance("1.2", "3.4", "5.6")
        );
    }

    #[test]
    fn parse_rejects_bad_paths() {
        assert!(matches!(
            VirtualPath::parse("/1.2/3.4/5.6"),
            Err(PathError::InvalidName(_))
        ));
        assert!(matches!(
            VirtualPath::parse("/1.2/3.4/.dcm"),
            Err(PathError::InvalidName(_))
        ));
        assert_eq!(
            VirtualPath::parse("/a/b/c.dcm/d"),
            Err(PathError::TooDeep)
        );
        assert!(matches!(
            VirtualPath::parse("/a/../b"),
            Err(PathError::InvalidName(_))
        ));
    }

    #[test]
    fn parent_and_display_round_trip() {
        let p = instance("1", "2", "3");
        assert_eq!(p.to_string(), "/1/2/3.dcm");
        assert_eq!(VirtualPath::parse(&p.to_string()).unwrap(), p);
        assert_eq!(p.parent().unwrap().to_string(), "/1/2");
        assert_eq!(p.ancestors().len(), 3);
        assert_eq!(p.ancestors().last(), Some(&VirtualPath::Root));
        assert_eq!(VirtualPath::Root.parent(), None);
    }

    #[test]
    fn child_of_instance_is_not_a_directory() {
        let p = instance("1", "2", "3");
        assert_eq!(p.child(OsStr::new("x")), Err(PathError::NotADirectory));
        assert!(!p.is_dir());
        assert_eq!(p.file_name().as_deref(), Some("3.dcm"));
    }

    #[test]
    fn containment_follows_the_hierarchy() {
        let study = VirtualPath::parse("/1").unwrap();
        let other = VirtualPath::parse("/10").unwrap();
        let file = instance("1", "2", "3");
        assert!(study.contains(&file));
        assert!(study.contains(&study));
        assert!(!other.contains(&file));
        assert!(VirtualPath::Root.contains(&file));
    }
}
