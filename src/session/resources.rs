//! Tracking of the resources a session owns or references.

use std::fmt;

/// Kind of tracked resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// SSH keypair.
    Keypair,
    /// Boot image.
    Image,
    /// Compute instance.
    Instance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keypair => "Keypair",
            Self::Image => "Image",
            Self::Instance => "Instance",
        })
    }
}

/// Snapshot of one resource for post-mortem reporting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceStatus {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Provider identifier.
    pub id: String,
    /// Resource name.
    pub name: String,
    /// Supplied by the caller rather than created by this session.
    pub pre_existed: bool,
    /// Removed during cleanup.
    pub was_removed: bool,
    /// Eligible for deletion at cleanup.
    pub deletable: bool,
}

impl ResourceStatus {
    /// Returns `true` when the session created the resource and it is still
    /// present, either because it was kept or because deletion failed.
    #[must_use]
    pub const fn needs_manual_cleanup(&self) -> bool {
        !self.pre_existed && !self.was_removed
    }
}

/// A resource handle owned by a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TrackedResource {
    kind: ResourceKind,
    id: String,
    name: String,
    pre_existed: bool,
    removed: bool,
    deletable: bool,
}

impl TrackedResource {
    /// A resource created by this session; deletable by default.
    pub(crate) fn created(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            pre_existed: false,
            removed: false,
            deletable: true,
        }
    }

    /// A resource supplied by the caller; never deletable by default.
    pub(crate) fn existing(
        kind: ResourceKind,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            pre_existed: true,
            removed: false,
            deletable: false,
        }
    }

    pub(crate) const fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) const fn deletable(&self) -> bool {
        self.deletable
    }

    pub(crate) const fn removed(&self) -> bool {
        self.removed
    }

    /// Marks the resource as kept. Always allowed.
    pub(crate) const fn keep(&mut self) {
        self.deletable = false;
    }

    /// Opts a pre-existing resource into deletion. Created resources are
    /// deletable already.
    pub(crate) const fn allow_delete(&mut self) {
        self.deletable = true;
    }

    pub(crate) const fn mark_removed(&mut self) {
        self.removed = true;
    }

    pub(crate) fn status(&self) -> ResourceStatus {
        ResourceStatus {
            kind: self.kind,
            id: self.id.clone(),
            name: self.name.clone(),
            pre_existed: self.pre_existed,
            was_removed: self.removed,
            deletable: self.deletable,
        }
    }
}
