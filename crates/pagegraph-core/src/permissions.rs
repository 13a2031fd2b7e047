use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::Id;
use crate::records::{DomainRecord, DomainRole, PageRecord, PageType};
use crate::visibility::Viewer;

pub const REASON_LOCKED: &str = "This page is being edited by someone else";
pub const REASON_SEE_GROUP: &str = "You don't have group permission to view this page";
pub const REASON_EDIT_GROUP: &str = "You don't have group permission to edit this page";
pub const REASON_LOG_IN: &str = "You have to log in";
pub const REASON_EDIT_DOMAIN: &str = "You don't have domain permission to edit this page";
pub const REASON_DELETE_DOMAIN: &str = "You don't have domain permission to delete this page";
pub const REASON_COMMENT_DOMAIN: &str = "You don't have domain permission to comment on this page";

/// One authorization decision. `reason` is empty when `allowed` is true.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Permission {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Permission {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    #[must_use]
    pub fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Permissions {
    pub edit: Permission,
    pub delete: Permission,
    pub comment: Permission,
}

/// Minimum domain role needed for each action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionPolicy {
    #[serde(default = "default_edit_role")]
    pub edit: DomainRole,
    #[serde(default = "default_delete_role")]
    pub delete: DomainRole,
    #[serde(default = "default_comment_role")]
    pub comment: DomainRole,
}

fn default_edit_role() -> DomainRole {
    DomainRole::Default
}

fn default_delete_role() -> DomainRole {
    DomainRole::Reviewer
}

fn default_comment_role() -> DomainRole {
    DomainRole::Default
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            edit: default_edit_role(),
            delete: default_delete_role(),
            comment: default_comment_role(),
        }
    }
}

type Verdict = Result<(), &'static str>;

struct Subject<'a> {
    page: &'a PageRecord,
    viewer: &'a Viewer,
    role: DomainRole,
    now: OffsetDateTime,
}

impl Subject<'_> {
    fn lock_conflict(&self) -> bool {
        let Some(owner) = self.page.lock_owner_id.as_ref().filter(|owner| owner.is_valid()) else {
            return false;
        };
        let still_locked = self.page.locked_until.is_some_and(|until| until > self.now);
        still_locked && !self.viewer.is(Some(owner))
    }

    fn outside_group(&self, group_id: Option<&Id>) -> bool {
        group_id.is_some_and(|group_id| group_id.is_valid() && !self.viewer.is_member(group_id))
    }

    fn authored_comment(&self) -> bool {
        self.page.page_type == PageType::Comment && self.viewer.is(self.page.creator_id.as_ref())
    }

    fn default_deny(&self, reason: &'static str) -> Verdict {
        if self.viewer.is_logged_in() {
            Err(reason)
        } else {
            Err(REASON_LOG_IN)
        }
    }

    /// Unpublished, then domain role, then self-authored comment, then deny.
    fn tail(&self, required: DomainRole, reason: &'static str) -> Verdict {
        if !self.page.is_published {
            return Ok(());
        }
        if self.role.at_least(required) {
            return Ok(());
        }
        if self.authored_comment() {
            return Ok(());
        }
        self.default_deny(reason)
    }

    fn edit(&self, policy: &PermissionPolicy) -> Verdict {
        if self.lock_conflict() {
            return Err(REASON_LOCKED);
        }
        if self.outside_group(self.page.see_group_id.as_ref()) {
            return Err(REASON_SEE_GROUP);
        }
        if let Some(group_id) = self.page.edit_group_id.as_ref().filter(|id| id.is_valid()) {
            return if self.viewer.is_member(group_id) {
                Ok(())
            } else {
                Err(REASON_EDIT_GROUP)
            };
        }
        self.tail(policy.edit, REASON_EDIT_DOMAIN)
    }
}

fn into_permission(verdict: &Verdict) -> Permission {
    match verdict {
        Ok(()) => Permission::allow(),
        Err(reason) => Permission::deny(reason),
    }
}

/// Highest role the viewer holds across the page's domains. Pages outside
/// every domain treat any logged-in viewer as a default member.
fn viewer_role(page: &PageRecord, viewer: &Viewer, domains: &BTreeMap<Id, DomainRecord>) -> DomainRole {
    if page.domain_ids.is_empty() {
        return if viewer.is_logged_in() {
            DomainRole::Default
        } else {
            DomainRole::None
        };
    }
    page.domain_ids
        .iter()
        .filter_map(|domain_id| domains.get(domain_id))
        .map(|domain| domain.viewer_role)
        .max()
        .unwrap_or_default()
}

/// Edit, delete and comment decisions for one page.
///
/// Edit walks: lock conflict, see-group, edit-group, unpublished, domain role,
/// self-authored comment, deny. Delete and comment return the edit denial
/// unchanged when edit is denied, and otherwise continue from the unpublished
/// rule with their own domain threshold.
#[must_use]
pub fn compute_permissions(
    page: &PageRecord,
    viewer: &Viewer,
    domains: &BTreeMap<Id, DomainRecord>,
    policy: &PermissionPolicy,
    now: OffsetDateTime,
) -> Permissions {
    let subject = Subject {
        page,
        viewer,
        role: viewer_role(page, viewer, domains),
        now,
    };

    let edit = subject.edit(policy);

    let delete = match &edit {
        Err(_) => edit,
        Ok(()) => subject.tail(policy.delete, REASON_DELETE_DOMAIN),
    };

    let comment = match &edit {
        Err(_) => edit,
        Ok(()) => subject.tail(policy.comment, REASON_COMMENT_DOMAIN),
    };

    Permissions {
        edit: into_permission(&edit),
        delete: into_permission(&delete),
        comment: into_permission(&comment),
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn page() -> PageRecord {
        let mut page = PageRecord::new(Id::new("5k"), crate::Requirements::FULL_ITEM);
        page.is_published = true;
        page.creator_id = Some(Id::new("3"));
        page.domain_ids = vec![Id::new("1d")];
        page
    }

    fn domains(role: DomainRole) -> BTreeMap<Id, DomainRecord> {
        let mut map = BTreeMap::new();
        map.insert(
            Id::new("1d"),
            DomainRecord {
                id: Id::new("1d"),
                page_id: Id::new("1"),
                alias: "math".to_string(),
                viewer_role: role,
                ..DomainRecord::default()
            },
        );
        map
    }

    fn viewer() -> Viewer {
        Viewer::user(Id::new("4"))
    }

    fn compute(page: &PageRecord, viewer: &Viewer, role: DomainRole) -> Permissions {
        compute_permissions(page, viewer, &domains(role), &PermissionPolicy::default(), now())
    }

    // Test IDs: TPERM-001
    #[test]
    fn lock_conflict_wins_regardless_of_trust() {
        let mut locked = page();
        locked.lock_owner_id = Some(Id::new("7"));
        locked.locked_until = Some(now() + Duration::minutes(5));
        for role in [DomainRole::Default, DomainRole::Reviewer, DomainRole::Arbiter] {
            let permissions = compute(&locked, &viewer(), role);
            assert!(!permissions.edit.allowed);
            assert_eq!(permissions.edit.reason, REASON_LOCKED);
            assert_eq!(permissions.delete, permissions.edit);
            assert_eq!(permissions.comment, permissions.edit);
        }
    }

    #[test]
    fn expired_or_own_lock_is_not_a_conflict() {
        let mut locked = page();
        locked.lock_owner_id = Some(Id::new("7"));
        locked.locked_until = Some(now() - Duration::minutes(1));
        assert!(compute(&locked, &viewer(), DomainRole::Default).edit.allowed);

        locked.locked_until = Some(now() + Duration::minutes(5));
        let owner = Viewer::user(Id::new("7"));
        assert!(compute(&locked, &owner, DomainRole::Default).edit.allowed);
    }

    // Test IDs: TPERM-002
    #[test]
    fn see_group_denial_is_reused_by_every_decision() {
        let mut restricted = page();
        restricted.see_group_id = Some(Id::new("9g"));
        let permissions = compute(&restricted, &viewer(), DomainRole::Arbiter);
        for decision in [&permissions.edit, &permissions.delete, &permissions.comment] {
            assert!(!decision.allowed);
            assert_eq!(decision.reason, REASON_SEE_GROUP);
        }
    }

    #[test]
    fn edit_group_membership_decides_edit() {
        let mut grouped = page();
        grouped.edit_group_id = Some(Id::new("8g"));

        let outsider = compute(&grouped, &viewer(), DomainRole::Arbiter);
        assert_eq!(outsider.edit.reason, REASON_EDIT_GROUP);
        assert_eq!(outsider.delete.reason, REASON_EDIT_GROUP);
        assert_eq!(outsider.comment.reason, REASON_EDIT_GROUP);
        assert!(!outsider.comment.allowed);

        let member = viewer().with_groups([Id::new("8g")]);
        let inside = compute(&grouped, &member, DomainRole::None);
        assert!(inside.edit.allowed);
        assert_eq!(inside.delete.reason, REASON_DELETE_DOMAIN);
    }

    #[test]
    fn unpublished_pages_are_open_to_their_viewer() {
        let mut draft = page();
        draft.is_published = false;
        let permissions = compute(&draft, &viewer(), DomainRole::None);
        assert!(permissions.edit.allowed);
        assert!(permissions.delete.allowed);
        assert!(permissions.comment.allowed);
    }

    // Test IDs: TPERM-003
    #[test]
    fn domain_role_thresholds_follow_policy() {
        let default_member = compute(&page(), &viewer(), DomainRole::Default);
        assert!(default_member.edit.allowed);
        assert!(!default_member.delete.allowed);
        assert_eq!(default_member.delete.reason, REASON_DELETE_DOMAIN);
        assert!(default_member.comment.allowed);

        let reviewer = compute(&page(), &viewer(), DomainRole::Reviewer);
        assert!(reviewer.delete.allowed);

        let banned = compute(&page(), &viewer(), DomainRole::Banned);
        assert_eq!(banned.edit.reason, REASON_EDIT_DOMAIN);
        assert_eq!(banned.delete.reason, REASON_EDIT_DOMAIN);
        assert_eq!(banned.comment.reason, REASON_EDIT_DOMAIN);
    }

    #[test]
    fn authors_keep_control_of_their_comments() {
        let mut comment = page();
        comment.page_type = PageType::Comment;
        comment.creator_id = Some(Id::new("4"));
        let permissions = compute(&comment, &viewer(), DomainRole::Banned);
        assert!(permissions.edit.allowed);
        assert!(permissions.delete.allowed);
        assert!(permissions.comment.allowed);
    }

    #[test]
    fn anonymous_viewers_are_asked_to_log_in() {
        let permissions = compute(&page(), &Viewer::anonymous(), DomainRole::None);
        assert_eq!(permissions.edit.reason, REASON_LOG_IN);
        assert_eq!(permissions.delete.reason, REASON_LOG_IN);
        assert_eq!(permissions.comment.reason, REASON_LOG_IN);
    }

    #[test]
    fn pages_outside_domains_accept_logged_in_viewers() {
        let mut loose = page();
        loose.domain_ids.clear();
        let permissions =
            compute_permissions(&loose, &viewer(), &BTreeMap::new(), &PermissionPolicy::default(), now());
        assert!(permissions.edit.allowed);
        assert!(!permissions.delete.allowed);
        assert!(permissions.comment.allowed);
    }

    #[test]
    fn allowed_decisions_carry_no_reason() -> Result<(), serde_json::Error> {
        let permissions = compute(&page(), &viewer(), DomainRole::Arbiter);
        let json = serde_json::to_value(&permissions)?;
        assert_eq!(json["edit"], serde_json::json!({ "allowed": true }));
        Ok(())
    }
}
