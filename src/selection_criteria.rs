//! Contains the types for read preferences and their role in server selection.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{ErrorKind, Result},
    sdam::public::ServerInfo,
    serde_util,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SelectionCriteria::ReadPreference(r1), SelectionCriteria::ReadPreference(r2)) => {
                r1 == r2
            }
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    /// Creates a `SelectionCriteria` from the given predicate.
    pub fn from_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&ServerInfo) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Fn(&ServerInfo) -> bool + Send + Sync>;

/// Specifies how the driver routes read operations among the members of a replica set.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more
/// details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary { options: Option<ReadPreferenceOptions> },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred { options: Option<ReadPreferenceOptions> },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred { options: Option<ReadPreferenceOptions> },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest { options: Option<ReadPreferenceOptions> },
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (mode, options) = match self {
            ReadPreference::Primary => ("Primary", None),
            ReadPreference::Secondary { options } => ("Secondary", options.as_ref()),
            ReadPreference::PrimaryPreferred { options } => ("PrimaryPreferred", options.as_ref()),
            ReadPreference::SecondaryPreferred { options } => {
                ("SecondaryPreferred", options.as_ref())
            }
            ReadPreference::Nearest { options } => ("Nearest", options.as_ref()),
        };
        write!(f, "{{ Mode: {}", mode)?;
        if let Some(options) = options {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }
        write!(f, " }}")
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[serde_with::skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: &'static str,
            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set
    /// will be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none", alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Must be at least 90 seconds.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_util::duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(max_staleness) = self.max_staleness() {
            if max_staleness < Duration::from_secs(90) {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness cannot be less than 90 seconds".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bson::doc;

    use super::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet};

    #[test]
    fn predicate_criteria_implements_debug() {
        let criteria = SelectionCriteria::from_predicate(|_| true);
        assert!(format!("{:?}", criteria).contains("Predicate"));
    }

    #[test]
    fn primary_serializes_to_bare_mode() {
        assert_eq!(
            bson::to_document(&ReadPreference::Primary).unwrap(),
            doc! { "mode": "primary" }
        );
    }

    #[test]
    fn options_included_in_document() {
        let tag_set: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        let options = Some(
            ReadPreferenceOptions::builder()
                .tag_sets(vec![tag_set])
                .max_staleness(Duration::from_secs(120))
                .build(),
        );

        assert_eq!(
            bson::to_document(&ReadPreference::Secondary { options }).unwrap(),
            doc! {
                "mode": "secondary",
                "tagSets": [{ "dc": "east" }],
                "maxStalenessSeconds": 120,
            }
        );
    }
}
