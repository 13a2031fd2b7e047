//! In-memory [`GraphSource`] for tests, benches and embedding callers that
//! already hold their graph in memory. Every call is logged so callers can
//! check how many round-trips a load made and which ids each one carried.

use std::cell::RefCell;
use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::error::SourceError;
use crate::ids::Id;
use crate::records::{PageType, PairType};
use crate::source::{
    ChangeLogRow, DomainMemberRow, DomainRow, EditRow, GraphSource, LikeRow, MarkQuery, MarkRow,
    MasteryRow, PageDomainRow, PageRow, RelationKind, RelationRow, SourceResult,
    SubscriptionRow, SummaryRow, UserRow, VisitRow, VoteRow,
};
use crate::visibility::VisibilityFlags;

/// One logged source call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SourceCall {
    pub method: String,
    pub ids: Vec<Id>,
}

#[derive(Debug, Default)]
pub struct MemorySource {
    pages: BTreeMap<Id, PageRow>,
    pairs: Vec<(Id, Id, PairType)>,
    lenses: Vec<(Id, Id, u32)>,
    answers: Vec<(Id, Id)>,
    links: Vec<(Id, Id)>,
    summaries: Vec<SummaryRow>,
    marks: Vec<MarkRow>,
    visits: Vec<VisitRow>,
    likes: Vec<LikeRow>,
    votes: Vec<VoteRow>,
    subscriptions: Vec<SubscriptionRow>,
    edits: Vec<EditRow>,
    change_logs: Vec<ChangeLogRow>,
    page_domains: Vec<PageDomainRow>,
    domains: Vec<DomainRow>,
    members: Vec<DomainMemberRow>,
    masteries: Vec<MasteryRow>,
    users: Vec<UserRow>,
    failing_method: Option<String>,
    calls: RefCell<Vec<SourceCall>>,
}

/// A published page row with empty text, created at the Unix epoch.
#[must_use]
pub fn page_row(id: &str, page_type: PageType, title: &str) -> PageRow {
    PageRow {
        id: Id::new(id),
        page_type,
        title: title.to_string(),
        clickbait: String::new(),
        alias: id.to_string(),
        edit_num: 1,
        created_at: OffsetDateTime::UNIX_EPOCH,
        flags: VisibilityFlags::published(),
        is_autosave: false,
        is_snapshot: false,
        edit_group_id: None,
        lock_owner_id: None,
        locked_until: None,
        text: None,
    }
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, row: PageRow) -> &mut Self {
        self.pages.insert(row.id.clone(), row);
        self
    }

    /// Adds a published wiki page whose text is `"<title> body"`.
    pub fn add_wiki(&mut self, id: &str, title: &str) -> &mut Self {
        let mut row = page_row(id, PageType::Wiki, title);
        row.text = Some(format!("{title} body"));
        self.add_page(row)
    }

    pub fn add_pair(&mut self, parent: &str, child: &str, pair: PairType) -> &mut Self {
        self.pairs.push((Id::new(parent), Id::new(child), pair));
        self
    }

    pub fn add_lens(&mut self, page: &str, lens: &str, ordinal: u32) -> &mut Self {
        self.lenses.push((Id::new(page), Id::new(lens), ordinal));
        self
    }

    pub fn add_answer(&mut self, question: &str, answer: &str) -> &mut Self {
        self.answers.push((Id::new(question), Id::new(answer)));
        self
    }

    pub fn add_link(&mut self, from: &str, to: &str) -> &mut Self {
        self.links.push((Id::new(from), Id::new(to)));
        self
    }

    pub fn add_summary(&mut self, page: &str, name: &str, text: &str) -> &mut Self {
        self.summaries.push(SummaryRow {
            page_id: Id::new(page),
            name: name.to_string(),
            text: text.to_string(),
        });
        self
    }

    pub fn add_mark(&mut self, row: MarkRow) -> &mut Self {
        self.marks.push(row);
        self
    }

    pub fn add_visit(&mut self, row: VisitRow) -> &mut Self {
        self.visits.push(row);
        self
    }

    pub fn add_like(&mut self, page: &str, user: &str, value: i32) -> &mut Self {
        self.likes.push(LikeRow {
            page_id: Id::new(page),
            user_id: Id::new(user),
            value,
        });
        self
    }

    pub fn add_vote(&mut self, row: VoteRow) -> &mut Self {
        self.votes.push(row);
        self
    }

    pub fn add_subscription(&mut self, user: &str, to: &str) -> &mut Self {
        self.subscriptions.push(SubscriptionRow {
            to_id: Id::new(to),
            user_id: Id::new(user),
        });
        self
    }

    pub fn add_edit(&mut self, row: EditRow) -> &mut Self {
        self.edits.push(row);
        self
    }

    pub fn add_change_log(&mut self, row: ChangeLogRow) -> &mut Self {
        self.change_logs.push(row);
        self
    }

    pub fn add_page_domain(&mut self, page: &str, domain: &str) -> &mut Self {
        self.page_domains.push(PageDomainRow {
            page_id: Id::new(page),
            domain_id: Id::new(domain),
        });
        self
    }

    pub fn add_domain(&mut self, row: DomainRow) -> &mut Self {
        self.domains.push(row);
        self
    }

    pub fn add_member(&mut self, row: DomainMemberRow) -> &mut Self {
        self.members.push(row);
        self
    }

    pub fn add_mastery(&mut self, row: MasteryRow) -> &mut Self {
        self.masteries.push(row);
        self
    }

    pub fn add_user(&mut self, id: &str, first_name: &str, last_name: &str) -> &mut Self {
        self.users.push(UserRow {
            id: Id::new(id),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        });
        self
    }

    /// Make every call to `method` fail with a backend error.
    pub fn fail_on(&mut self, method: &str) -> &mut Self {
        self.failing_method = Some(method.to_string());
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SourceCall> {
        self.calls.borrow().clone()
    }

    #[must_use]
    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.borrow().iter().filter(|call| call.method == method).count()
    }

    pub fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn record(&self, method: String, ids: &[Id]) -> SourceResult<()> {
        let failing = self.failing_method.as_deref() == Some(method.as_str());
        self.calls.borrow_mut().push(SourceCall {
            method: method.clone(),
            ids: ids.to_vec(),
        });
        if failing {
            return Err(SourceError::Backend(format!("{method} unavailable")));
        }
        Ok(())
    }

    fn relation_row(&self, page_id: &Id, other_id: &Id, ordinal: u32) -> Option<RelationRow> {
        let other = self.pages.get(other_id)?;
        Some(RelationRow {
            page_id: page_id.clone(),
            other_id: other_id.clone(),
            other_type: other.page_type,
            other: other.flags.clone(),
            ordinal,
        })
    }

    /// Edges of `pair` type, read from the child side (`upward`) or the
    /// parent side.
    fn pair_edges(&self, page_ids: &[Id], pair: PairType, upward: bool) -> Vec<RelationRow> {
        let mut rows = Vec::new();
        for (index, (parent, child, pair_type)) in self.pairs.iter().enumerate() {
            if *pair_type != pair {
                continue;
            }
            let (from, to) = if upward { (child, parent) } else { (parent, child) };
            if page_ids.contains(from) {
                let ordinal = u32::try_from(index).unwrap_or(u32::MAX);
                rows.extend(self.relation_row(from, to, ordinal));
            }
        }
        rows
    }

    fn simple_edges<'e>(
        &self,
        page_ids: &[Id],
        edges: impl Iterator<Item = (&'e Id, &'e Id, u32)>,
    ) -> Vec<RelationRow> {
        edges
            .filter(|(from, _, _)| page_ids.contains(from))
            .filter_map(|(from, to, ordinal)| self.relation_row(from, to, ordinal))
            .collect()
    }
}

fn matches_user(row_user: &Id, user_id: Option<&Id>) -> bool {
    match user_id {
        Some(user_id) => row_user == user_id,
        None => true,
    }
}

impl GraphSource for MemorySource {
    fn relations(&self, kind: RelationKind, page_ids: &[Id]) -> SourceResult<Vec<RelationRow>> {
        self.record(format!("relations:{}", kind.as_str()), page_ids)?;
        let rows = match kind {
            RelationKind::Children | RelationKind::Comments | RelationKind::Questions => {
                self.pair_edges(page_ids, PairType::Parent, false)
            }
            RelationKind::Parents => self.pair_edges(page_ids, PairType::Parent, true),
            RelationKind::Tags => self.pair_edges(page_ids, PairType::Tag, true),
            RelationKind::Related => self.pair_edges(page_ids, PairType::Tag, false),
            RelationKind::Prerequisites => self.pair_edges(page_ids, PairType::Prerequisite, true),
            RelationKind::Subjects => self.pair_edges(page_ids, PairType::Subject, true),
            RelationKind::PrerequisiteOf => {
                self.pair_edges(page_ids, PairType::Prerequisite, false)
            }
            RelationKind::Lenses => self.simple_edges(
                page_ids,
                self.lenses.iter().map(|(page, lens, ordinal)| (page, lens, *ordinal)),
            ),
            RelationKind::Answers => self.simple_edges(
                page_ids,
                self.answers.iter().map(|(question, answer)| (question, answer, 0)),
            ),
            RelationKind::Links => self.simple_edges(
                page_ids,
                self.links.iter().map(|(from, to)| (from, to, 0)),
            ),
        };
        Ok(rows)
    }

    fn pages(&self, page_ids: &[Id], text_ids: &[Id]) -> SourceResult<Vec<PageRow>> {
        self.record("pages".to_string(), page_ids)?;
        Ok(page_ids
            .iter()
            .filter_map(|id| self.pages.get(id))
            .map(|row| {
                let mut row = row.clone();
                if !text_ids.contains(&row.id) {
                    row.text = None;
                }
                row
            })
            .collect())
    }

    fn summaries(&self, page_ids: &[Id]) -> SourceResult<Vec<SummaryRow>> {
        self.record("summaries".to_string(), page_ids)?;
        Ok(self
            .summaries
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn marks(&self, query: MarkQuery, ids: &[Id]) -> SourceResult<Vec<MarkRow>> {
        let label = match query {
            MarkQuery::OnPages => "marks:on_pages",
            MarkQuery::ResolvedTo => "marks:resolved_to",
            MarkQuery::ById => "marks:by_id",
        };
        self.record(label.to_string(), ids)?;
        Ok(self
            .marks
            .iter()
            .filter(|row| match query {
                MarkQuery::OnPages => ids.contains(&row.page_id),
                MarkQuery::ResolvedTo => row
                    .resolved_page_id
                    .as_ref()
                    .is_some_and(|resolved| ids.contains(resolved)),
                MarkQuery::ById => ids.contains(&row.id),
            })
            .cloned()
            .collect())
    }

    fn visits(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<VisitRow>> {
        self.record("visits".to_string(), page_ids)?;
        Ok(self
            .visits
            .iter()
            .filter(|row| page_ids.contains(&row.page_id) && matches_user(&row.user_id, user_id))
            .cloned()
            .collect())
    }

    fn likes(&self, page_ids: &[Id]) -> SourceResult<Vec<LikeRow>> {
        self.record("likes".to_string(), page_ids)?;
        Ok(self
            .likes
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn votes(&self, page_ids: &[Id]) -> SourceResult<Vec<VoteRow>> {
        self.record("votes".to_string(), page_ids)?;
        Ok(self
            .votes
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn subscriptions(
        &self,
        to_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<SubscriptionRow>> {
        self.record("subscriptions".to_string(), to_ids)?;
        Ok(self
            .subscriptions
            .iter()
            .filter(|row| to_ids.contains(&row.to_id) && matches_user(&row.user_id, user_id))
            .cloned()
            .collect())
    }

    fn edits(&self, page_ids: &[Id]) -> SourceResult<Vec<EditRow>> {
        self.record("edits".to_string(), page_ids)?;
        Ok(self
            .edits
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn change_logs(&self, page_ids: &[Id]) -> SourceResult<Vec<ChangeLogRow>> {
        self.record("change_logs".to_string(), page_ids)?;
        Ok(self
            .change_logs
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn page_domains(&self, page_ids: &[Id]) -> SourceResult<Vec<PageDomainRow>> {
        self.record("page_domains".to_string(), page_ids)?;
        Ok(self
            .page_domains
            .iter()
            .filter(|row| page_ids.contains(&row.page_id))
            .cloned()
            .collect())
    }

    fn domains(&self, domain_ids: &[Id]) -> SourceResult<Vec<DomainRow>> {
        self.record("domains".to_string(), domain_ids)?;
        Ok(self
            .domains
            .iter()
            .filter(|row| domain_ids.contains(&row.id))
            .cloned()
            .collect())
    }

    fn domain_members(
        &self,
        domain_ids: &[Id],
        user_id: Option<&Id>,
    ) -> SourceResult<Vec<DomainMemberRow>> {
        self.record("domain_members".to_string(), domain_ids)?;
        Ok(self
            .members
            .iter()
            .filter(|row| domain_ids.contains(&row.domain_id) && matches_user(&row.user_id, user_id))
            .cloned()
            .collect())
    }

    fn masteries(&self, page_ids: &[Id], user_id: Option<&Id>) -> SourceResult<Vec<MasteryRow>> {
        self.record("masteries".to_string(), page_ids)?;
        Ok(self
            .masteries
            .iter()
            .filter(|row| page_ids.contains(&row.page_id) && matches_user(&row.user_id, user_id))
            .cloned()
            .collect())
    }

    fn users(&self, user_ids: &[Id]) -> SourceResult<Vec<UserRow>> {
        self.record("users".to_string(), user_ids)?;
        Ok(self
            .users
            .iter()
            .filter(|row| user_ids.contains(&row.id))
            .cloned()
            .collect())
    }
}
