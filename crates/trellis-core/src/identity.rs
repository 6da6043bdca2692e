//! Identity registry: stable opaque IDs and positional handles.
//!
//! Every window, workspace, pane and surface gets an opaque ID that stays
//! valid for the process lifetime and is never handed out again after the
//! entity is destroyed. Positional handles (`workspace:2`) are a convenience
//! layer: they are recomputed from the current listing on every call and
//! never cached.
//!
//! # Resolution
//!
//! ```text
//! "5F3C…"        → Handle::Id          (unique, resolved first)
//! "workspace:2"  → Handle::Positional  (1-based, current listing order)
//! "1"            → Handle::Index       (0-based, legacy line protocol)
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Entity kinds tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Window,
    Workspace,
    Pane,
    Surface,
}

impl EntityKind {
    /// Prefix used by positional aliases.
    #[must_use]
    pub const fn alias_prefix(self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Workspace => "workspace",
            Self::Pane => "pane",
            Self::Surface => "surface",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "window" => Some(Self::Window),
            "workspace" => Some(Self::Workspace),
            "pane" => Some(Self::Pane),
            "surface" => Some(Self::Surface),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias_prefix())
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing opaque ID string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

entity_id!(
    /// Opaque window ID.
    WindowId
);
entity_id!(
    /// Opaque workspace ID.
    WorkspaceId
);
entity_id!(
    /// Opaque pane ID (leaf or split node).
    PaneId
);
entity_id!(
    /// Opaque surface ID.
    SurfaceId
);

/// Format the positional alias for the entity at `index` (0-based).
#[must_use]
pub fn positional_ref(kind: EntityKind, index: usize) -> String {
    format!("{}:{}", kind.alias_prefix(), index + 1)
}

/// A caller-supplied reference to an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle {
    /// Opaque ID string.
    Id(String),
    /// `kind:N`, 1-based position in the current listing.
    Positional { kind: EntityKind, position: usize },
    /// Bare 0-based index into the current listing.
    Index(usize),
}

impl Handle {
    /// Classify a raw reference string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Protocol("empty handle".to_string()));
        }
        if let Ok(index) = raw.parse::<usize>() {
            return Ok(Self::Index(index));
        }
        if let Some((prefix, number)) = raw.split_once(':') {
            if let Some(kind) = EntityKind::from_prefix(&prefix.to_ascii_lowercase()) {
                return match number.parse::<usize>() {
                    Ok(position) if position >= 1 => Ok(Self::Positional { kind, position }),
                    _ => Err(Error::not_found(kind, raw)),
                };
            }
        }
        Ok(Self::Id(raw.to_string()))
    }

    /// Resolve against `listing`, the current ordered IDs of `kind`.
    ///
    /// Opaque IDs must appear in the listing; aliases index into it. The
    /// listing is read at call time, so an alias obtained from an earlier
    /// listing may name a different entity if the tree changed in between.
    pub fn resolve_in<T>(&self, kind: EntityKind, listing: &[T]) -> Result<T>
    where
        T: AsRef<str> + Clone,
    {
        match self {
            Self::Id(raw) => listing
                .iter()
                .find(|id| id.as_ref().eq_ignore_ascii_case(raw))
                .cloned()
                .ok_or_else(|| Error::not_found(kind, raw.clone())),
            Self::Positional {
                kind: alias_kind,
                position,
            } => {
                if *alias_kind != kind {
                    return Err(Error::not_found(kind, self.to_string()));
                }
                resolve_positional(listing, position - 1)
                    .ok_or_else(|| Error::not_found(kind, self.to_string()))
            }
            Self::Index(index) => resolve_positional(listing, *index)
                .ok_or_else(|| Error::not_found(kind, self.to_string())),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(raw) => f.write_str(raw),
            Self::Positional { kind, position } => write!(f, "{kind}:{position}"),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Pure lookup of the entity at `index` (0-based) in `listing`.
#[must_use]
pub fn resolve_positional<T: Clone>(listing: &[T], index: usize) -> Option<T> {
    listing.get(index).cloned()
}

/// Allocates and tracks IDs for the process lifetime.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    live: HashSet<String>,
    retired: HashSet<String>,
}

impl IdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self) -> String {
        loop {
            let candidate = uuid::Uuid::new_v4().to_string().to_ascii_uppercase();
            if !self.live.contains(&candidate) && !self.retired.contains(&candidate) {
                self.live.insert(candidate.clone());
                return candidate;
            }
        }
    }

    pub fn allocate_window(&mut self) -> WindowId {
        WindowId(self.fresh())
    }

    pub fn allocate_workspace(&mut self) -> WorkspaceId {
        WorkspaceId(self.fresh())
    }

    pub fn allocate_pane(&mut self) -> PaneId {
        PaneId(self.fresh())
    }

    pub fn allocate_surface(&mut self) -> SurfaceId {
        SurfaceId(self.fresh())
    }

    /// Register an ID read back from a snapshot.
    pub fn adopt(&mut self, kind: EntityKind, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Err(Error::invalid(format!("empty {kind} id in snapshot")));
        }
        if self.retired.contains(raw) {
            return Err(Error::invalid(format!(
                "{kind} id {raw} was already retired in this process"
            )));
        }
        if !self.live.insert(raw.to_string()) {
            return Err(Error::invalid(format!("duplicate {kind} id {raw}")));
        }
        Ok(())
    }

    /// Mark an ID as destroyed. It will never be reused.
    pub fn retire(&mut self, raw: &str) {
        if self.live.remove(raw) {
            self.retired.insert(raw.to_string());
        }
    }

    #[must_use]
    pub fn is_live(&self, raw: &str) -> bool {
        self.live.contains(raw)
    }

    #[must_use]
    pub fn is_retired(&self, raw: &str) -> bool {
        self.retired.contains(raw)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_classifies_handles() {
        assert_eq!(Handle::parse("2").unwrap(), Handle::Index(2));
        assert_eq!(
            Handle::parse("workspace:3").unwrap(),
            Handle::Positional {
                kind: EntityKind::Workspace,
                position: 3
            }
        );
        assert_eq!(
            Handle::parse("ABC-123").unwrap(),
            Handle::Id("ABC-123".to_string())
        );
        assert!(Handle::parse("  ").is_err());
        assert!(matches!(
            Handle::parse("pane:0"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn positional_alias_reads_current_listing() {
        let mut listing = vec![WorkspaceId::new("A"), WorkspaceId::new("B")];
        let handle = Handle::parse("workspace:2").unwrap();
        assert_eq!(
            handle.resolve_in(EntityKind::Workspace, &listing).unwrap(),
            WorkspaceId::new("B")
        );
        listing.insert(0, WorkspaceId::new("C"));
        assert_eq!(
            handle.resolve_in(EntityKind::Workspace, &listing).unwrap(),
            WorkspaceId::new("A")
        );
    }

    #[test]
    fn alias_of_wrong_kind_is_not_found() {
        let listing = vec![PaneId::new("P")];
        let err = Handle::parse("workspace:1")
            .unwrap()
            .resolve_in(EntityKind::Pane, &listing)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: EntityKind::Pane, .. }));
    }

    #[test]
    fn ids_match_case_insensitively() {
        let listing = vec![SurfaceId::new("ABCD")];
        let found = Handle::Id("abcd".into())
            .resolve_in(EntityKind::Surface, &listing)
            .unwrap();
        assert_eq!(found.as_str(), "ABCD");
    }

    #[test]
    fn retired_ids_are_never_adopted_again() {
        let mut registry = IdentityRegistry::new();
        let id = registry.allocate_pane();
        assert!(registry.is_live(id.as_str()));
        registry.retire(id.as_str());
        assert!(registry.is_retired(id.as_str()));
        assert!(registry.adopt(EntityKind::Pane, id.as_str()).is_err());
    }

    #[test]
    fn adopt_rejects_duplicates() {
        let mut registry = IdentityRegistry::new();
        registry.adopt(EntityKind::Window, "W1").unwrap();
        assert!(registry.adopt(EntityKind::Workspace, "W1").is_err());
        assert!(registry.adopt(EntityKind::Window, "").is_err());
    }

    #[test]
    fn positional_ref_is_one_based() {
        assert_eq!(positional_ref(EntityKind::Surface, 0), "surface:1");
    }
}
