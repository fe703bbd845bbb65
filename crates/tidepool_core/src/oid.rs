//! Object identifiers.
//!
//! Every object or list reachable from a document root carries an
//! identifier of the form `collection/documentId[:subId]`. The root node
//! of a document uses the bare `collection/documentId` form; nested nodes
//! append a sub-identifier allocated from a [`SubIdSource`].

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between collection and document id.
const COLLECTION_SEPARATOR: char = '/';
/// Separator between document id and sub-identifier.
const SUB_ID_SEPARATOR: char = ':';

/// Identifier of one node in a document graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(String);

impl Oid {
    /// Creates the root identifier for a document.
    pub fn new(collection: &str, document_id: &str) -> Self {
        Self(format!("{collection}{COLLECTION_SEPARATOR}{document_id}"))
    }

    /// Parses and validates an identifier string.
    pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        let valid = match value.split_once(COLLECTION_SEPARATOR) {
            Some((collection, rest)) => {
                let document_id = rest.split(SUB_ID_SEPARATOR).next().unwrap_or_default();
                !collection.is_empty() && !document_id.is_empty()
            }
            None => false,
        };
        if valid {
            Ok(Self(value))
        } else {
            Err(CoreError::InvalidOid { value })
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the collection name.
    pub fn collection(&self) -> &str {
        match self.0.split_once(COLLECTION_SEPARATOR) {
            Some((collection, _)) => collection,
            None => &self.0,
        }
    }

    /// Returns the document id.
    pub fn document_id(&self) -> &str {
        let rest = match self.0.split_once(COLLECTION_SEPARATOR) {
            Some((_, rest)) => rest,
            None => "",
        };
        match rest.split_once(SUB_ID_SEPARATOR) {
            Some((document_id, _)) => document_id,
            None => rest,
        }
    }

    /// Returns the sub-identifier, if this is not a document root.
    pub fn sub_id(&self) -> Option<&str> {
        let (_, rest) = self.0.split_once(COLLECTION_SEPARATOR)?;
        rest.split_once(SUB_ID_SEPARATOR).map(|(_, sub)| sub)
    }

    /// Returns true if this identifies a document root.
    pub fn is_root(&self) -> bool {
        self.sub_id().is_none()
    }

    /// Returns the identifier of the document root this node belongs to.
    pub fn root(&self) -> Oid {
        Oid::new(self.collection(), self.document_id())
    }

    /// Returns a nested identifier within the same document.
    pub fn with_sub_id(&self, sub_id: &str) -> Oid {
        let root = self.root();
        Oid(format!("{}{SUB_ID_SEPARATOR}{sub_id}", root.0))
    }

    /// Returns true if this node belongs to the document rooted at `root`.
    pub fn belongs_to(&self, root: &Oid) -> bool {
        match self.0.strip_prefix(root.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(SUB_ID_SEPARATOR) && root.is_root(),
            None => false,
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Oid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Oid::parse(s)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of sub-identifiers for newly identified nested nodes.
pub trait SubIdSource {
    /// Returns a sub-identifier that has not been handed out before.
    fn next_sub_id(&mut self) -> String;
}

impl<F> SubIdSource for F
where
    F: FnMut() -> String,
{
    fn next_sub_id(&mut self) -> String {
        self()
    }
}

/// Random sub-identifiers backed by UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSubIds;

impl SubIdSource for RandomSubIds {
    fn next_sub_id(&mut self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..16].to_string()
    }
}

/// Deterministic sub-identifiers (`prefix0`, `prefix1`, ...).
#[derive(Debug, Clone)]
pub struct SequentialSubIds {
    prefix: String,
    next: u64,
}

impl SequentialSubIds {
    /// Creates a sequence with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }
}

impl SubIdSource for SequentialSubIds {
    fn next_sub_id(&mut self) -> String {
        let id = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_components() {
        let oid = Oid::parse("posts/abc:x1").unwrap();
        assert_eq!(oid.collection(), "posts");
        assert_eq!(oid.document_id(), "abc");
        assert_eq!(oid.sub_id(), Some("x1"));
        assert!(!oid.is_root());
        assert_eq!(oid.root(), Oid::new("posts", "abc"));
    }

    #[test]
    fn sub_id_may_contain_separators() {
        let oid = Oid::parse("posts/abc:x:y").unwrap();
        assert_eq!(oid.document_id(), "abc");
        assert_eq!(oid.sub_id(), Some("x:y"));
    }

    #[test]
    fn reject_malformed() {
        assert!(Oid::parse("posts").is_err());
        assert!(Oid::parse("/abc").is_err());
        assert!(Oid::parse("posts/").is_err());
        assert!(Oid::parse("posts/:x").is_err());
    }

    #[test]
    fn belongs_to_root() {
        let root = Oid::new("posts", "abc");
        assert!(root.belongs_to(&root));
        assert!(root.with_sub_id("1").belongs_to(&root));
        assert!(!Oid::new("posts", "abcd").belongs_to(&root));
        assert!(!Oid::new("posts", "abcd").with_sub_id("1").belongs_to(&root));
    }

    #[test]
    fn with_sub_id_uses_root() {
        let nested = Oid::new("posts", "abc").with_sub_id("1");
        assert_eq!(nested.with_sub_id("2").as_str(), "posts/abc:2");
    }

    #[test]
    fn sequential_ids() {
        let mut ids = SequentialSubIds::new("n");
        assert_eq!(ids.next_sub_id(), "n0");
        assert_eq!(ids.next_sub_id(), "n1");
    }

    #[test]
    fn closure_source() {
        let mut counter = 0;
        let mut source = || {
            counter += 1;
            format!("c{counter}")
        };
        assert_eq!(source.next_sub_id(), "c1");
    }

    #[test]
    fn random_ids_differ() {
        let mut ids = RandomSubIds;
        assert_ne!(ids.next_sub_id(), ids.next_sub_id());
    }

    #[test]
    fn serde_transparent() {
        let oid = Oid::new("posts", "abc");
        let json = serde_json::to_string(&oid).unwrap();
        assert_eq!(json, "\"posts/abc\"");
    }
}
