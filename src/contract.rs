//! The contract between the settings service and its clients.
//!
//! Names the single settings table and its columns, and defines the resource
//! identifiers used both as query targets and as change-notification keys:
//!
//! - `{authority}/settings` addresses the whole collection
//! - `{authority}/settings/{id}` addresses one row

use std::fmt;

use crate::error::{Error, Result};

/// Name of the settings table.
pub const TABLE: &str = "settings";

/// Path segment of the settings collection.
pub const SETTINGS_PATH: &str = "settings";

/// Column names of the settings table.
pub mod columns {
    /// Store-assigned row identity.
    pub const ID: &str = "id";
    /// Unique setting key.
    pub const KEY: &str = "key";
    /// Value type tag.
    pub const TYPE: &str = "type";
    /// Encoded value.
    pub const VALUE: &str = "value";
}

/// Content type of a collection result.
pub const CONTENT_TYPE: &str = "vnd.prefbox.dir/settings";

/// Content type of a single-row result.
pub const CONTENT_ITEM_TYPE: &str = "vnd.prefbox.item/settings";

/// Address of the settings collection or of one row in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    Collection,
    Item(i64),
}

impl ResourceId {
    /// The resource of a single row.
    pub fn item(id: i64) -> Self {
        Self::Item(id)
    }

    /// Row id carried by an item resource.
    pub fn row_id(&self) -> Option<i64> {
        match self {
            Self::Collection => None,
            Self::Item(id) => Some(*id),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection)
    }

    /// Whether `self` is `other` or lies underneath it.
    pub fn is_within(&self, other: &ResourceId) -> bool {
        match other {
            Self::Collection => true,
            Self::Item(_) => self == other,
        }
    }

    /// Content type of results addressed by this resource.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Collection => CONTENT_TYPE,
            Self::Item(_) => CONTENT_ITEM_TYPE,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection => write!(f, "{SETTINGS_PATH}"),
            Self::Item(id) => write!(f, "{SETTINGS_PATH}/{id}"),
        }
    }
}

/// Renders and parses fully qualified resource identifiers for one authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    authority: String,
}

impl Contract {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Fully qualified identifier, e.g. `prefbox/settings/7`.
    pub fn uri(&self, resource: &ResourceId) -> String {
        format!("{}/{}", self.authority, resource)
    }

    /// Parse a fully qualified identifier issued by [`Contract::uri`].
    pub fn parse(&self, uri: &str) -> Result<ResourceId> {
        let invalid = || Error::InvalidResource(uri.to_string());

        let path = uri
            .strip_prefix(self.authority.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(invalid)?;

        let mut segments = path.split('/');
        if segments.next() != Some(SETTINGS_PATH) {
            return Err(invalid());
        }

        match (segments.next(), segments.next()) {
            (None, _) => Ok(ResourceId::Collection),
            (Some(id), None) => id
                .parse::<i64>()
                .map(ResourceId::Item)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl Default for Contract {
    fn default() -> Self {
        Self::new("prefbox")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_rendering() {
        let contract = Contract::new("com.example.settings");
        assert_eq!(
            contract.uri(&ResourceId::Collection),
            "com.example.settings/settings"
        );
        assert_eq!(
            contract.uri(&ResourceId::item(42)),
            "com.example.settings/settings/42"
        );
    }

    #[test]
    fn test_parse_issued_uris() {
        let contract = Contract::default();
        for resource in [ResourceId::Collection, ResourceId::item(7)] {
            assert_eq!(contract.parse(&contract.uri(&resource)).unwrap(), resource);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_or_malformed() {
        let contract = Contract::default();
        assert!(contract.parse("other/settings").is_err());
        assert!(contract.parse("prefbox/accounts").is_err());
        assert!(contract.parse("prefbox/settings/abc").is_err());
        assert!(contract.parse("prefbox/settings/1/2").is_err());
        assert!(contract.parse("prefboxsettings").is_err());
    }

    #[test]
    fn test_item_is_within_collection() {
        assert!(ResourceId::item(3).is_within(&ResourceId::Collection));
        assert!(ResourceId::item(3).is_within(&ResourceId::item(3)));
        assert!(!ResourceId::item(3).is_within(&ResourceId::item(4)));
        assert!(!ResourceId::Collection.is_within(&ResourceId::item(4)));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(ResourceId::Collection.content_type(), CONTENT_TYPE);
        assert_eq!(ResourceId::item(1).content_type(), CONTENT_ITEM_TYPE);
    }
}
