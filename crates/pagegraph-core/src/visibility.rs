use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Lifecycle flags of a page that decide whether a viewer may see it at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VisibilityFlags {
    pub is_deleted: bool,
    pub is_published: bool,
    pub see_group_id: Option<Id>,
    pub creator_id: Option<Id>,
}

impl VisibilityFlags {
    #[must_use]
    pub fn published() -> Self {
        Self {
            is_published: true,
            ..Self::default()
        }
    }
}

/// Whoever the graph is being loaded for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Viewer {
    pub user_id: Option<Id>,
    #[serde(default)]
    pub group_ids: BTreeSet<Id>,
}

impl Viewer {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An invalid user id yields an anonymous viewer.
    #[must_use]
    pub fn user(user_id: Id) -> Self {
        Self {
            user_id: user_id.is_valid().then_some(user_id),
            group_ids: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_groups(mut self, group_ids: impl IntoIterator<Item = Id>) -> Self {
        self.group_ids.extend(group_ids);
        self
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.user_id.is_some()
    }

    #[must_use]
    pub fn is(&self, user_id: Option<&Id>) -> bool {
        matches!((&self.user_id, user_id), (Some(mine), Some(other)) if mine == other)
    }

    #[must_use]
    pub fn is_member(&self, group_id: &Id) -> bool {
        self.group_ids.contains(group_id)
    }

    /// The one visibility predicate every page-fetching stage applies: the
    /// page is not deleted, is published unless the viewer wrote it, and any
    /// see-group is one the viewer belongs to.
    #[must_use]
    pub fn can_see(&self, flags: &VisibilityFlags) -> bool {
        if flags.is_deleted {
            return false;
        }
        if !flags.is_published && !self.is(flags.creator_id.as_ref()) {
            return false;
        }
        match &flags.see_group_id {
            Some(group_id) if group_id.is_valid() => self.is_member(group_id),
            _ => true,
        }
    }
}
