use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::facets::Requirements;
use crate::ids::Id;
use crate::permissions::Permissions;
use crate::visibility::VisibilityFlags;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    #[default]
    Wiki,
    Comment,
    Question,
    Group,
}

impl PageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wiki => "wiki",
            Self::Comment => "comment",
            Self::Question => "question",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "wiki" => Some(Self::Wiki),
            "comment" => Some(Self::Comment),
            "question" => Some(Self::Question),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Edge kinds stored between two pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PairType {
    Parent,
    Tag,
    Prerequisite,
    Subject,
}

impl PairType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Tag => "tag",
            Self::Prerequisite => "prerequisite",
            Self::Subject => "subject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(Self::Parent),
            "tag" => Some(Self::Tag),
            "prerequisite" => Some(Self::Prerequisite),
            "subject" => Some(Self::Subject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarkType {
    #[default]
    Query,
    Typo,
    Confusion,
}

impl MarkType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Typo => "typo",
            Self::Confusion => "confusion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query" => Some(Self::Query),
            "typo" => Some(Self::Typo),
            "confusion" => Some(Self::Confusion),
            _ => None,
        }
    }
}

/// A viewer's standing inside one domain. Variants are declared in ascending
/// order of trust, so `Ord` compares privilege.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DomainRole {
    #[default]
    None,
    Banned,
    Default,
    Trusted,
    Reviewer,
    Arbiter,
}

impl DomainRole {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Banned => 1,
            Self::Default => 2,
            Self::Trusted => 3,
            Self::Reviewer => 4,
            Self::Arbiter => 5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Banned => "banned",
            Self::Default => "default",
            Self::Trusted => "trusted",
            Self::Reviewer => "reviewer",
            Self::Arbiter => "arbiter",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "banned" => Some(Self::Banned),
            "default" => Some(Self::Default),
            "trusted" => Some(Self::Trusted),
            "reviewer" => Some(Self::Reviewer),
            "arbiter" => Some(Self::Arbiter),
            _ => None,
        }
    }

    #[must_use]
    pub fn at_least(self, required: Self) -> bool {
        self.rank() >= required.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Vote {
    pub user_id: Id,
    pub value: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EditSummary {
    pub edit_num: u32,
    pub creator_id: Id,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub edit_summary: String,
    pub is_live_edit: bool,
    pub is_autosave: bool,
    pub is_snapshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeLog {
    pub edit_num: u32,
    pub user_id: Id,
    pub change_type: String,
    pub aux_id: Option<Id>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A content item. Base fields are written by the `base` stage for every page
/// that survives it; every other field stays at its zero value unless the
/// matching facet is present in `requirements`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageRecord {
    pub id: Id,
    pub requirements: Requirements,

    pub page_type: PageType,
    pub title: String,
    pub clickbait: String,
    pub alias: String,
    pub edit_num: u32,
    pub creator_id: Option<Id>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub is_deleted: bool,
    pub is_published: bool,
    pub is_autosave: bool,
    pub is_snapshot: bool,
    pub see_group_id: Option<Id>,
    pub edit_group_id: Option<Id>,
    pub lock_owner_id: Option<Id>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,

    pub text: String,
    pub summaries: BTreeMap<String, String>,
    pub child_ids: Vec<Id>,
    pub has_children: bool,
    pub parent_ids: Vec<Id>,
    pub has_parents: bool,
    pub tag_ids: Vec<Id>,
    pub related_ids: Vec<Id>,
    pub lens_ids: Vec<Id>,
    pub prerequisite_ids: Vec<Id>,
    pub subject_ids: Vec<Id>,
    pub comment_ids: Vec<Id>,
    pub question_ids: Vec<Id>,
    pub answer_ids: Vec<Id>,
    pub mark_ids: Vec<Id>,
    pub link_ids: Vec<Id>,
    pub child_count: u32,
    pub comment_count: u32,
    pub answer_count: u32,
    pub linked_mark_count: u32,
    pub view_count: u32,
    pub like_count: i32,
    pub my_like_value: i32,
    pub liker_ids: Vec<Id>,
    pub votes: Vec<Vote>,
    pub is_subscribed: bool,
    pub subscriber_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_visit: Option<OffsetDateTime>,
    pub has_draft: bool,
    pub used_as_mastery: bool,
    pub creator_ids: Vec<Id>,
    pub edit_history: Vec<EditSummary>,
    pub change_logs: Vec<ChangeLog>,
    pub domain_ids: Vec<Id>,
    pub permissions: Option<Permissions>,
}

impl PageRecord {
    #[must_use]
    pub fn new(id: Id, requirements: Requirements) -> Self {
        Self {
            id,
            requirements,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn visibility(&self) -> VisibilityFlags {
        VisibilityFlags {
            is_deleted: self.is_deleted,
            is_published: self.is_published,
            see_group_id: self.see_group_id.clone(),
            creator_id: self.creator_id.clone(),
        }
    }

    /// Facets whose fields on this record hold a non-zero value. Facets that
    /// only cascade onto other records (`lens_text`, `descendant_counts`) are
    /// never observed.
    #[must_use]
    pub fn observed_facets(&self) -> Requirements {
        let checks = [
            (Requirements::TEXT, !self.text.is_empty()),
            (Requirements::SUMMARIES, !self.summaries.is_empty()),
            (Requirements::CHILDREN, !self.child_ids.is_empty()),
            (Requirements::HAS_CHILDREN, self.has_children),
            (Requirements::PARENTS, !self.parent_ids.is_empty()),
            (Requirements::HAS_PARENTS, self.has_parents),
            (Requirements::TAGS, !self.tag_ids.is_empty()),
            (Requirements::RELATED, !self.related_ids.is_empty()),
            (Requirements::LENSES, !self.lens_ids.is_empty()),
            (Requirements::PREREQUISITES, !self.prerequisite_ids.is_empty()),
            (Requirements::SUBJECTS, !self.subject_ids.is_empty()),
            (Requirements::COMMENTS, !self.comment_ids.is_empty()),
            (Requirements::QUESTIONS, !self.question_ids.is_empty()),
            (Requirements::ANSWERS, !self.answer_ids.is_empty()),
            (Requirements::MARKS, !self.mark_ids.is_empty()),
            (Requirements::LINKS, !self.link_ids.is_empty()),
            (Requirements::SUBPAGE_COUNTS, self.child_count > 0),
            (Requirements::COMMENT_COUNT, self.comment_count > 0),
            (Requirements::ANSWER_COUNT, self.answer_count > 0),
            (Requirements::LINKED_MARK_COUNT, self.linked_mark_count > 0),
            (Requirements::VIEW_COUNT, self.view_count > 0),
            (Requirements::LIKES, self.like_count != 0 || self.my_like_value != 0),
            (Requirements::INDIVIDUAL_LIKES, !self.liker_ids.is_empty()),
            (Requirements::VOTES, !self.votes.is_empty()),
            (Requirements::IS_SUBSCRIBED, self.is_subscribed),
            (Requirements::SUBSCRIBER_COUNT, self.subscriber_count > 0),
            (Requirements::LAST_VISIT, self.last_visit.is_some()),
            (Requirements::HAS_DRAFT, self.has_draft),
            (Requirements::USED_AS_MASTERY, self.used_as_mastery),
            (Requirements::CREATORS, !self.creator_ids.is_empty()),
            (Requirements::EDIT_HISTORY, !self.edit_history.is_empty()),
            (Requirements::CHANGE_LOGS, !self.change_logs.is_empty()),
            (
                Requirements::DOMAINS_AND_PERMISSIONS,
                !self.domain_ids.is_empty() || self.permissions.is_some(),
            ),
        ];
        checks
            .into_iter()
            .filter(|(_, observed)| *observed)
            .fold(Requirements::empty(), |acc, (facet, _)| acc | facet)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRecord {
    pub id: Id,
    pub first_name: String,
    pub last_name: String,
    pub is_subscribed: bool,
    #[serde(skip)]
    pub(crate) loaded: bool,
}

impl UserRecord {
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// An annotation a reader left on a page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MarkRecord {
    pub id: Id,
    pub page_id: Id,
    pub creator_id: Id,
    pub mark_type: MarkType,
    pub anchor_context: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub resolved_page_id: Option<Id>,
    pub is_submitted: bool,
    #[serde(skip)]
    pub(crate) loaded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DomainRecord {
    pub id: Id,
    pub page_id: Id,
    pub alias: String,
    pub viewer_role: DomainRole,
    #[serde(skip)]
    pub(crate) loaded: bool,
}

/// The viewer's progress on one page used as a learning requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MasteryRecord {
    pub page_id: Id,
    pub has: bool,
    pub wants: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_roles_order_by_trust() {
        assert!(DomainRole::Arbiter > DomainRole::Reviewer);
        assert!(DomainRole::Trusted.at_least(DomainRole::Default));
        assert!(!DomainRole::Banned.at_least(DomainRole::Default));
        assert!(!DomainRole::None.at_least(DomainRole::Banned));
        for role in [
            DomainRole::None,
            DomainRole::Banned,
            DomainRole::Default,
            DomainRole::Trusted,
            DomainRole::Reviewer,
            DomainRole::Arbiter,
        ] {
            assert_eq!(DomainRole::parse(role.as_str()), Some(role));
        }
    }

    #[test]
    fn fresh_page_observes_nothing() {
        let page = PageRecord::new(Id::new("5k"), Requirements::FULL_ITEM);
        assert!(page.observed_facets().is_empty());
    }

    #[test]
    fn observed_facets_track_populated_fields() {
        let mut page = PageRecord::new(Id::new("5k"), Requirements::empty());
        page.text = "body".to_string();
        page.child_ids.push(Id::new("6"));
        page.has_children = true;
        page.my_like_value = 1;
        assert_eq!(
            page.observed_facets(),
            Requirements::TEXT
                | Requirements::CHILDREN
                | Requirements::HAS_CHILDREN
                | Requirements::LIKES
        );
    }

    #[test]
    fn page_type_and_pair_type_names_parse() {
        for page_type in [PageType::Wiki, PageType::Comment, PageType::Question, PageType::Group] {
            assert_eq!(PageType::parse(page_type.as_str()), Some(page_type));
        }
        for pair in [PairType::Parent, PairType::Tag, PairType::Prerequisite, PairType::Subject] {
            assert_eq!(PairType::parse(pair.as_str()), Some(pair));
        }
        assert_eq!(MarkType::parse("typo"), Some(MarkType::Typo));
        assert_eq!(MarkType::parse("praise"), None);
    }

    #[test]
    fn user_display_name_trims_missing_parts() {
        let user = UserRecord {
            id: Id::new("3"),
            first_name: "Ada".to_string(),
            ..UserRecord::default()
        };
        assert_eq!(user.display_name(), "Ada");
    }
}
