//! Types shared by the rendering cache, the job runner and the invalidation listener.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The identifier of a wiki.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WikiId(Arc<str>);

impl WikiId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WikiId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WikiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WikiId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The kind of entity an [`EntityReference`] points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Wiki,
    Space,
    Document,
    Attachment,
    Object,
    ObjectProperty,
}

impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Wiki => "wiki",
            Self::Space => "space",
            Self::Document => "document",
            Self::Attachment => "attachment",
            Self::Object => "object",
            Self::ObjectProperty => "object_property",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A reference to an entity stored in a wiki.
///
/// The `path` holds the names from the outermost space down to the entity itself, e.g.
/// `["Main", "WebHome"]` for a document, or `["Main", "WebHome", "logo.png"]` for an
/// attachment of that document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    #[serde(rename = "type")]
    pub ty: EntityType,
    pub wiki: WikiId,
    pub path: Arc<[Arc<str>]>,
}

impl EntityReference {
    pub fn new<I, S>(ty: EntityType, wiki: impl Into<WikiId>, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            ty,
            wiki: wiki.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a reference to a document in the given spaces.
    pub fn document(wiki: impl Into<WikiId>, spaces: &[&str], name: &str) -> Self {
        let path = spaces.iter().copied().chain(std::iter::once(name));
        Self::new(EntityType::Document, wiki, path)
    }

    /// Creates a reference to the wiki itself.
    pub fn wiki(wiki: impl Into<WikiId>) -> Self {
        Self::new(EntityType::Wiki, wiki, std::iter::empty::<Arc<str>>())
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.ty, self.wiki)?;
        for (i, segment) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

/// A right that can be required before rendering something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Right {
    View,
    Comment,
    Edit,
    Script,
    Admin,
    Programming,
}

impl AsRef<str> for Right {
    fn as_ref(&self) -> &str {
        match self {
            Self::View => "view",
            Self::Comment => "comment",
            Self::Edit => "edit",
            Self::Script => "script",
            Self::Admin => "admin",
            Self::Programming => "programming",
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Something a rendered outcome depends on.
///
/// Whenever the thing behind a token changes, every cached outcome listing that token has to
/// be recomputed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DependencyToken {
    /// An entity that was read while rendering.
    Entity(EntityReference),
    /// A wiki as a whole, e.g. its preferences.
    Wiki(WikiId),
    /// A component that was looked up while rendering.
    ///
    /// Without a `hint`, the outcome depends on the set of components implementing `role`,
    /// e.g. because it enumerated all of them.
    Component {
        role: Arc<str>,
        hint: Option<Arc<str>>,
    },
}

impl DependencyToken {
    pub fn component(role: impl Into<Arc<str>>, hint: Option<&str>) -> Self {
        Self::Component {
            role: role.into(),
            hint: hint.map(Into::into),
        }
    }

    /// The wiki this token belongs to, if any.
    pub fn wiki(&self) -> Option<&WikiId> {
        match self {
            Self::Entity(reference) => Some(&reference.wiki),
            Self::Wiki(wiki) => Some(wiki),
            Self::Component { .. } => None,
        }
    }
}

impl From<EntityReference> for DependencyToken {
    fn from(reference: EntityReference) -> Self {
        Self::Entity(reference)
    }
}

impl From<WikiId> for DependencyToken {
    fn from(wiki: WikiId) -> Self {
        Self::Wiki(wiki)
    }
}

impl fmt::Display for DependencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(reference) => write!(f, "entity({reference})"),
            Self::Wiki(wiki) => write!(f, "wiki({wiki})"),
            Self::Component { role, hint: None } => write!(f, "component({role})"),
            Self::Component {
                role,
                hint: Some(hint),
            } => write!(f, "component({role}/{hint})"),
        }
    }
}
