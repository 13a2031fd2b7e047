use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::SourceError;
use crate::ids::Id;
use crate::records::{DomainRole, MarkType, PageType};
use crate::visibility::VisibilityFlags;

pub type SourceResult<T> = Result<T, SourceError>;

/// Edges the pipeline can follow from a page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Pages whose parent is the queried page.
    Children,
    Parents,
    /// Pages that tag the queried page.
    Tags,
    /// Pages the queried page is a tag of.
    Related,
    Lenses,
    Prerequisites,
    Subjects,
    /// Comment pages under the queried page.
    Comments,
    /// Question pages under the queried page.
    Questions,
    /// Answer pages attached to the queried question.
    Answers,
    Links,
    /// Pages that name the queried page as a prerequisite.
    PrerequisiteOf,
}

impl RelationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Children => "children",
            Self::Parents => "parents",
            Self::Tags => "tags",
            Self::Related => "related",
            Self::Lenses => "lenses",
            Self::Prerequisites => "prerequisites",
            Self::Subjects => "subjects",
            Self::Comments => "comments",
            Self::Questions => "questions",
            Self::Answers => "answers",
            Self::Links => "links",
            Self::PrerequisiteOf => "prerequisite_of",
        }
    }

    /// Whether a related page of `page_type` belongs to this kind of edge.
    /// Sources may return every page under a parent; the pipeline sorts them
    /// into children, comments and questions here.
    #[must_use]
    pub fn admits(self, page_type: PageType) -> bool {
        match self {
            Self::Children => !matches!(page_type, PageType::Comment | PageType::Question),
            Self::Comments => page_type == PageType::Comment,
            Self::Questions => page_type == PageType::Question,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MarkQuery {
    /// Marks left on the given pages.
    OnPages,
    /// Marks resolved by the given pages.
    ResolvedTo,
    /// Marks with the given ids.
    ById,
}

/// One edge from a queried page to another page, with enough of the other
/// page's lifecycle to apply the visibility predicate.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationRow {
    pub page_id: Id,
    pub other_id: Id,
    pub other_type: PageType,
    pub other: VisibilityFlags,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageRow {
    pub id: Id,
    pub page_type: PageType,
    pub title: String,
    pub clickbait: String,
    pub alias: String,
    pub edit_num: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub flags: VisibilityFlags,
    pub is_autosave: bool,
    pub is_snapshot: bool,
    pub edit_group_id: Option<Id>,
    pub lock_owner_id: Option<Id>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,
    /// Present only for ids passed as `text_ids`.
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SummaryRow {
    pub page_id: Id,
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MarkRow {
    pub id: Id,
    pub page_id: Id,
    pub creator_id: Id,
    pub mark_type: MarkType,
    pub anchor_context: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub resolved_page_id: Option<Id>,
    pub is_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VisitRow {
    pub page_id: Id,
    pub user_id: Id,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LikeRow {
    pub page_id: Id,
    pub user_id: Id,
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteRow {
    pub page_id: Id,
    pub user_id: Id,
    pub value: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubscriptionRow {
    pub to_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EditRow {
    pub page_id: Id,
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
pub struct ChangeLogRow {
    pub page_id: Id,
    pub edit_num: u32,
    pub user_id: Id,
    pub change_type: String,
    pub aux_id: Option<Id>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageDomainRow {
    pub page_id: Id,
    pub domain_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DomainRow {
    pub id: Id,
    pub page_id: Id,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DomainMemberRow {
    pub domain_id: Id,
    pub user_id: Id,
    pub role: DomainRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MasteryRow {
    pub page_id: Id,
    pub user_id: Id,
    pub has: bool,
    pub wants: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRow {
    pub id: Id,
    pub first_name: String,
    pub last_name: String,
}

/// Batched read access to the store.
///
/// Every method receives the complete id batch of one stage and answers it
/// with a single round-trip. Ids with no matching rows are simply absent from
/// the result; only a failure of the store itself is an error. Where a method
/// takes a `user_id`, `None` means "all users".
pub trait GraphSource {
    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn relations(&self, kind: RelationKind, page_ids: &[Id]) -> SourceResult<Vec<RelationRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn pages(&self, page_ids: &[Id], text_ids: &[Id]) -> SourceResult<Vec<PageRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn summaries(&self, page_ids: &[Id]) -> SourceResult<Vec<SummaryRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn marks(&self, query: MarkQuery, ids: &[Id]) -> SourceResult<Vec<MarkRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn visits(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<VisitRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn likes(&self, page_ids: &[Id]) -> SourceResult<Vec<LikeRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn votes(&self, page_ids: &[Id]) -> SourceResult<Vec<VoteRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn subscriptions(
        &self,
        to_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<SubscriptionRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn edits(&self, page_ids: &[Id]) -> SourceResult<Vec<EditRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn change_logs(&self, page_ids: &[Id]) -> SourceResult<Vec<ChangeLogRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn page_domains(&self, page_ids: &[Id]) -> SourceResult<Vec<PageDomainRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn domains(&self, domain_ids: &[Id]) -> SourceResult<Vec<DomainRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn domain_members(
        &self,
        domain_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<DomainMemberRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn masteries(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<MasteryRow>>;

    /// # Errors
    /// Returns [`SourceError`] when the store cannot answer the batch.
    fn users(&self, user_ids: &[Id]) -> SourceResult<Vec<UserRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_edges_split_by_page_type() {
        assert!(RelationKind::Children.admits(PageType::Wiki));
        assert!(RelationKind::Children.admits(PageType::Group));
        assert!(!RelationKind::Children.admits(PageType::Comment));
        assert!(!RelationKind::Children.admits(PageType::Question));
        assert!(RelationKind::Comments.admits(PageType::Comment));
        assert!(!RelationKind::Comments.admits(PageType::Wiki));
        assert!(RelationKind::Questions.admits(PageType::Question));
        assert!(RelationKind::Tags.admits(PageType::Comment));
    }
}
