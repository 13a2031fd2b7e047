use std::collections::{BTreeMap, BTreeSet};

use crate::derive::{
    answer_requirements, child_requirements, comment_requirements, lens_requirements,
    link_requirements, mastery_page_requirements, parent_requirements, question_requirements,
    related_requirements, tag_requirements,
};
use crate::error::LoadError;
use crate::facets::{Facet, Requirements};
use crate::ids::Id;
use crate::permissions::compute_permissions;
use crate::pipeline::{LoadConfig, LoadContext, Stage, StageReport};
use crate::records::{ChangeLog, EditSummary, PageRecord, Vote};
use crate::registry::Registry;
use crate::source::{GraphSource, MarkQuery, MarkRow, RelationKind, RelationRow, SourceResult};

type Derive = fn(Requirements) -> Requirements;

fn report(stage: Stage, selected: usize, rows: usize) -> StageReport {
    StageReport {
        stage,
        selected,
        rows,
    }
}

fn id_list(page: &mut PageRecord, kind: RelationKind) -> Option<&mut Vec<Id>> {
    match kind {
        RelationKind::Children => Some(&mut page.child_ids),
        RelationKind::Parents => Some(&mut page.parent_ids),
        RelationKind::Tags => Some(&mut page.tag_ids),
        RelationKind::Related => Some(&mut page.related_ids),
        RelationKind::Lenses => Some(&mut page.lens_ids),
        RelationKind::Prerequisites => Some(&mut page.prerequisite_ids),
        RelationKind::Subjects => Some(&mut page.subject_ids),
        RelationKind::Comments => Some(&mut page.comment_ids),
        RelationKind::Questions => Some(&mut page.question_ids),
        RelationKind::Answers => Some(&mut page.answer_ids),
        RelationKind::Links => Some(&mut page.link_ids),
        RelationKind::PrerequisiteOf => None,
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Mutable state of one run: the registry being filled, which page led to
/// which, and the ids the base stage removed.
pub(crate) struct Loader<'a, S: ?Sized> {
    source: &'a S,
    registry: Registry,
    ctx: &'a LoadContext,
    config: &'a LoadConfig,
    caller_pages: BTreeSet<Id>,
    caller_users: BTreeSet<Id>,
    discovered: BTreeMap<Id, BTreeSet<Id>>,
    dropped: Vec<Id>,
    orphaned: Vec<Id>,
}

/// Ids the base stage took out of the registry.
pub(crate) struct Removed {
    pub(crate) dropped: Vec<Id>,
    pub(crate) orphaned: Vec<Id>,
}

impl<'a, S: GraphSource + ?Sized> Loader<'a, S> {
    pub(crate) fn new(
        source: &'a S,
        registry: Registry,
        ctx: &'a LoadContext,
        config: &'a LoadConfig,
    ) -> Self {
        let caller_pages = registry.all_page_ids().into_iter().collect();
        let caller_users = registry.users().keys().cloned().collect();
        Self {
            source,
            registry,
            ctx,
            config,
            caller_pages,
            caller_users,
            discovered: BTreeMap::new(),
            dropped: Vec::new(),
            orphaned: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> (Registry, Removed) {
        let removed = Removed {
            dropped: self.dropped,
            orphaned: self.orphaned,
        };
        (self.registry, removed)
    }

    fn record_discovery(&mut self, from: &Id, to: &Id) {
        if from != to {
            self.discovered.entry(from.clone()).or_default().insert(to.clone());
        }
    }

    /// Registered pages that no longer trace back to a caller page once
    /// `dropped` is gone.
    fn orphans(&self, dropped: &BTreeSet<Id>) -> Vec<Id> {
        let mut reachable: BTreeSet<Id> = self
            .caller_pages
            .iter()
            .filter(|id| !dropped.contains(*id))
            .cloned()
            .collect();
        let mut queue: Vec<Id> = reachable.iter().cloned().collect();
        while let Some(id) = queue.pop() {
            for next in self.discovered.get(&id).into_iter().flatten() {
                if !dropped.contains(next) && reachable.insert(next.clone()) {
                    queue.push(next.clone());
                }
            }
        }
        self.registry
            .all_page_ids()
            .into_iter()
            .filter(|id| !dropped.contains(id) && !reachable.contains(id))
            .collect()
    }

    pub(crate) fn apply(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        match stage {
            Stage::Children => {
                self.discover(stage, Facet::Children, RelationKind::Children, child_requirements)
            }
            Stage::Parents => {
                self.discover(stage, Facet::Parents, RelationKind::Parents, parent_requirements)
            }
            Stage::Tags => self.discover(stage, Facet::Tags, RelationKind::Tags, tag_requirements),
            Stage::Related => {
                self.discover(stage, Facet::Related, RelationKind::Related, related_requirements)
            }
            Stage::Lenses => {
                self.discover(stage, Facet::Lenses, RelationKind::Lenses, lens_requirements)
            }
            Stage::Prerequisites => self.discover(
                stage,
                Facet::Prerequisites,
                RelationKind::Prerequisites,
                mastery_page_requirements,
            ),
            Stage::Subjects => self.discover(
                stage,
                Facet::Subjects,
                RelationKind::Subjects,
                mastery_page_requirements,
            ),
            Stage::Comments => {
                self.discover(stage, Facet::Comments, RelationKind::Comments, comment_requirements)
            }
            Stage::Questions => self.discover(
                stage,
                Facet::Questions,
                RelationKind::Questions,
                question_requirements,
            ),
            Stage::Answers => {
                self.discover(stage, Facet::Answers, RelationKind::Answers, answer_requirements)
            }
            Stage::Links => self.discover(stage, Facet::Links, RelationKind::Links, link_requirements),
            Stage::Marks => self.marks(stage),
            Stage::MarkRecords => self.mark_records(stage),
            Stage::HasChildren => {
                self.existence(stage, Facet::HasChildren, Facet::Children, RelationKind::Children)
            }
            Stage::HasParents => {
                self.existence(stage, Facet::HasParents, Facet::Parents, RelationKind::Parents)
            }
            Stage::Base => self.base(stage),
            Stage::Summaries => self.summaries(stage),
            Stage::SubpageCounts => self.count_relations(
                stage,
                Facet::SubpageCounts,
                RelationKind::Children,
                |page, n| page.child_count = n,
            ),
            Stage::CommentCounts => self.count_relations(
                stage,
                Facet::CommentCount,
                RelationKind::Comments,
                |page, n| page.comment_count = n,
            ),
            Stage::AnswerCounts => self.count_relations(
                stage,
                Facet::AnswerCount,
                RelationKind::Answers,
                |page, n| page.answer_count = n,
            ),
            Stage::LinkedMarkCounts => self.linked_mark_counts(stage),
            Stage::ViewCounts => self.view_counts(stage),
            Stage::LastVisits => self.last_visits(stage),
            Stage::Likes => self.likes(stage),
            Stage::Votes => self.votes(stage),
            Stage::Subscriptions => self.subscriptions(stage),
            Stage::SubscriberCounts => self.subscriber_counts(stage),
            Stage::Drafts => self.drafts(stage),
            Stage::UsedAsMastery => self.used_as_mastery(stage),
            Stage::Creators => self.creators(stage),
            Stage::EditHistory => self.edit_history(stage),
            Stage::ChangeLogs => self.change_logs(stage),
            Stage::PageDomains => self.page_domains(stage),
            Stage::Domains => self.domains(stage),
            Stage::DomainRoles => self.domain_roles(stage),
            Stage::Masteries => self.masteries(stage),
            Stage::Users => self.users(stage),
            Stage::UserSubscriptions => self.user_subscriptions(stage),
            Stage::Permissions => Ok(self.permissions(stage)),
        }
    }

    /// One source call for the whole batch. A failure carries the stage and
    /// the batch it was serving; cancellation observed once the call returns
    /// discards its rows.
    fn fetch<T>(
        &self,
        stage: Stage,
        ids: &[Id],
        call: impl FnOnce(&S) -> SourceResult<T>,
    ) -> Result<T, LoadError> {
        let rows = call(self.source).map_err(|source| LoadError::Stage {
            stage,
            batch: ids.len(),
            first_id: ids.first().map(ToString::to_string).unwrap_or_default(),
            source,
        })?;
        if self.ctx.cancel.is_cancelled() {
            return Err(LoadError::Cancelled { stage });
        }
        Ok(rows)
    }

    fn for_pages(&mut self, ids: &[Id], mut apply: impl FnMut(&mut PageRecord)) {
        for id in ids {
            if let Some(page) = self.registry.page_mut(id) {
                apply(page);
            }
        }
    }

    /// Groups relation rows by the queried page, keeping only edges of the
    /// requested kind that lead to pages the viewer can see.
    fn visible_relations(
        &self,
        kind: RelationKind,
        rows: Vec<RelationRow>,
    ) -> BTreeMap<Id, Vec<Id>> {
        let mut grouped: BTreeMap<Id, Vec<(u32, Id)>> = BTreeMap::new();
        for row in rows {
            if !row.other_id.is_valid()
                || !kind.admits(row.other_type)
                || !self.ctx.viewer.can_see(&row.other)
            {
                continue;
            }
            grouped
                .entry(row.page_id)
                .or_default()
                .push((row.ordinal, row.other_id));
        }
        grouped
            .into_iter()
            .map(|(page_id, mut edges)| {
                edges.sort();
                let mut ids: Vec<Id> = Vec::with_capacity(edges.len());
                for (_, other_id) in edges {
                    if !ids.contains(&other_id) {
                        ids.push(other_id);
                    }
                }
                (page_id, ids)
            })
            .collect()
    }

    fn discover(
        &mut self,
        stage: Stage,
        facet: Facet,
        kind: RelationKind,
        derive: Derive,
    ) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(facet);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.relations(kind, &ids))?;
        let row_count = rows.len();
        let mut grouped = self.visible_relations(kind, rows);
        let registers_mastery = matches!(kind, RelationKind::Prerequisites | RelationKind::Subjects);

        for id in &ids {
            let Some(owner) = self.registry.page(id).map(|page| page.requirements) else {
                continue;
            };
            let related = grouped.remove(id).unwrap_or_default();
            let derived = derive(owner);
            for other in &related {
                self.registry.add_page(other, derived);
                self.record_discovery(id, other);
                if registers_mastery {
                    self.registry.add_mastery(other);
                }
            }
            if let Some(list) = self.registry.page_mut(id).and_then(|page| id_list(page, kind)) {
                *list = related;
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn mark_visible(&self, row: &MarkRow) -> bool {
        row.is_submitted || self.ctx.viewer.is(Some(&row.creator_id))
    }

    fn store_mark(&mut self, row: MarkRow) {
        self.registry.add_user(&row.creator_id);
        if let Some(resolved) = &row.resolved_page_id {
            self.registry.add_page(resolved, Requirements::TITLE_ONLY);
            self.record_discovery(&row.page_id, resolved);
        }
        if let Some(mark) = self.registry.add_mark(&row.id) {
            mark.page_id = row.page_id;
            mark.creator_id = row.creator_id;
            mark.mark_type = row.mark_type;
            mark.anchor_context = row.anchor_context;
            mark.text = row.text;
            mark.created_at = Some(row.created_at);
            mark.resolved_page_id = row.resolved_page_id;
            mark.is_submitted = row.is_submitted;
            mark.loaded = true;
        }
    }

    fn marks(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::Marks);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.marks(MarkQuery::OnPages, &ids))?;
        let row_count = rows.len();
        let mut by_page: BTreeMap<Id, Vec<Id>> = BTreeMap::new();
        for row in rows {
            if !self.mark_visible(&row) {
                continue;
            }
            by_page.entry(row.page_id.clone()).or_default().push(row.id.clone());
            self.store_mark(row);
        }
        self.for_pages(&ids, |page| {
            page.mark_ids = by_page.remove(&page.id).unwrap_or_default();
        });
        Ok(report(stage, ids.len(), row_count))
    }

    /// Marks registered by the caller rather than found on a page.
    fn mark_records(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.mark_ids(true);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.marks(MarkQuery::ById, &ids))?;
        let row_count = rows.len();
        for row in rows {
            if !self.mark_visible(&row) {
                continue;
            }
            self.registry.add_page(&row.page_id, Requirements::TITLE_ONLY);
            self.caller_pages.insert(row.page_id.clone());
            self.store_mark(row);
        }
        let missing = self.registry.mark_ids(true);
        self.registry.remove_marks(&missing);
        Ok(report(stage, ids.len(), row_count))
    }

    /// Sets a has-children style flag. Pages that also loaded the full list
    /// answer from it without another fetch.
    fn existence(
        &mut self,
        stage: Stage,
        facet: Facet,
        listed: Facet,
        kind: RelationKind,
    ) -> Result<StageReport, LoadError> {
        let set_flag = |page: &mut PageRecord, value: bool| match kind {
            RelationKind::Parents => page.has_parents = value,
            _ => page.has_children = value,
        };

        let mut ids = Vec::new();
        for id in self.registry.pages_requiring(facet) {
            let Some(page) = self.registry.page_mut(&id) else {
                continue;
            };
            if page.requirements.has(listed) {
                let known = id_list(page, kind).is_some_and(|list| !list.is_empty());
                set_flag(page, known);
            } else {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }

        let rows = self.fetch(stage, &ids, |source| source.relations(kind, &ids))?;
        let row_count = rows.len();
        let grouped = self.visible_relations(kind, rows);
        self.for_pages(&ids, |page| {
            let found = grouped.get(&page.id).is_some_and(|related| !related.is_empty());
            set_flag(page, found);
        });
        Ok(report(stage, ids.len(), row_count))
    }

    /// Materializes every registered page. Pages the store does not return,
    /// or that the viewer may not see, leave the registry together with their
    /// marks and with any page that was only reachable through them.
    fn base(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.all_page_ids();
        if ids.is_empty() {
            self.registry.seal_pages();
            return Ok(StageReport::skipped(stage));
        }
        let text_ids = self.registry.pages_requiring(Facet::Text);
        let rows = self.fetch(stage, &ids, |source| source.pages(&ids, &text_ids))?;
        let row_count = rows.len();

        let mut found = BTreeSet::new();
        for row in rows {
            if !self.ctx.viewer.can_see(&row.flags) {
                continue;
            }
            let Some(page) = self.registry.page_mut(&row.id) else {
                continue;
            };
            page.page_type = row.page_type;
            page.title = row.title;
            page.clickbait = row.clickbait;
            page.alias = row.alias;
            page.edit_num = row.edit_num;
            page.created_at = Some(row.created_at);
            page.is_deleted = row.flags.is_deleted;
            page.is_published = row.flags.is_published;
            page.see_group_id = row.flags.see_group_id.filter(Id::is_valid);
            page.creator_id = row.flags.creator_id.filter(Id::is_valid);
            page.is_autosave = row.is_autosave;
            page.is_snapshot = row.is_snapshot;
            page.edit_group_id = row.edit_group_id.filter(Id::is_valid);
            page.lock_owner_id = row.lock_owner_id.filter(Id::is_valid);
            page.locked_until = row.locked_until;
            if page.requirements.has(Facet::Text) {
                page.text = row.text.unwrap_or_default();
            }
            found.insert(row.id);
        }

        let dropped: Vec<Id> = ids.iter().filter(|id| !found.contains(*id)).cloned().collect();
        if !dropped.is_empty() {
            if self.config.warn_on_dropped {
                tracing::warn!(
                    stage = %stage,
                    count = dropped.len(),
                    page_ids = ?dropped,
                    "registered pages not found or not visible; dropping"
                );
            } else {
                tracing::debug!(stage = %stage, count = dropped.len(), "dropping pages");
            }
            self.remove_pages(&dropped);
        }

        let creators: Vec<Id> = self
            .registry
            .pages()
            .values()
            .filter_map(|page| page.creator_id.clone())
            .collect();
        for creator in &creators {
            self.registry.add_user(creator);
        }
        self.registry.seal_pages();
        Ok(report(stage, ids.len(), row_count))
    }

    /// Drops `dropped` and the pages only they led to. Creators of the marks
    /// that leave with them go too, unless the caller registered them or
    /// they still own a remaining mark.
    fn remove_pages(&mut self, dropped: &[Id]) {
        let dropped_set: BTreeSet<Id> = dropped.iter().cloned().collect();
        let orphaned = self.orphans(&dropped_set);
        if !orphaned.is_empty() {
            tracing::debug!(count = orphaned.len(), page_ids = ?orphaned, "dropping orphaned pages");
        }

        let mut removed: Vec<Id> = dropped.to_vec();
        removed.extend(orphaned.iter().cloned());
        let mark_creators = self.registry.drop_pages(&removed);

        let still_marking: BTreeSet<&Id> =
            self.registry.marks().values().map(|mark| &mark.creator_id).collect();
        let stale_users: Vec<Id> = mark_creators
            .into_iter()
            .filter(|id| !self.caller_users.contains(id) && !still_marking.contains(id))
            .collect();
        self.registry.drop_users(&stale_users);

        self.dropped.extend(dropped.iter().cloned());
        self.orphaned.extend(orphaned);
    }

    fn summaries(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::Summaries);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.summaries(&ids))?;
        let row_count = rows.len();
        for row in rows {
            if let Some(page) = self.registry.page_mut(&row.page_id) {
                if page.requirements.has(Facet::Summaries) {
                    page.summaries.insert(row.name, row.text);
                }
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn count_relations(
        &mut self,
        stage: Stage,
        facet: Facet,
        kind: RelationKind,
        assign: fn(&mut PageRecord, u32),
    ) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(facet);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.relations(kind, &ids))?;
        let row_count = rows.len();
        let grouped = self.visible_relations(kind, rows);
        self.for_pages(&ids, |page| {
            let n = grouped.get(&page.id).map_or(0, Vec::len);
            assign(page, count(n));
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn linked_mark_counts(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::LinkedMarkCount);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.marks(MarkQuery::ResolvedTo, &ids))?;
        let row_count = rows.len();
        let mut counts: BTreeMap<Id, usize> = BTreeMap::new();
        for row in &rows {
            if !self.mark_visible(row) {
                continue;
            }
            if let Some(resolved) = &row.resolved_page_id {
                *counts.entry(resolved.clone()).or_default() += 1;
            }
        }
        self.for_pages(&ids, |page| {
            page.linked_mark_count = count(counts.get(&page.id).copied().unwrap_or(0));
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn view_counts(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::ViewCount);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.visits(&ids, None))?;
        let row_count = rows.len();
        let mut viewers: BTreeMap<Id, BTreeSet<Id>> = BTreeMap::new();
        for row in rows {
            viewers.entry(row.page_id).or_default().insert(row.user_id);
        }
        self.for_pages(&ids, |page| {
            page.view_count = count(viewers.get(&page.id).map_or(0, BTreeSet::len));
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn last_visits(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::LastVisit);
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.visits(&ids, Some(viewer_id)))?;
        let row_count = rows.len();
        let mut latest: BTreeMap<Id, time::OffsetDateTime> = BTreeMap::new();
        for row in rows.into_iter().filter(|row| &row.user_id == viewer_id) {
            let entry = latest.entry(row.page_id).or_insert(row.created_at);
            if row.created_at > *entry {
                *entry = row.created_at;
            }
        }
        self.for_pages(&ids, |page| {
            page.last_visit = latest.get(&page.id).copied();
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn likes(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self
            .registry
            .pages_requiring_any(Requirements::LIKES | Requirements::INDIVIDUAL_LIKES);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.likes(&ids))?;
        let row_count = rows.len();
        let viewer = self.ctx.viewer.clone();
        let mut likers = Vec::new();
        let mut by_page: BTreeMap<Id, Vec<(Id, i32)>> = BTreeMap::new();
        for row in rows {
            by_page.entry(row.page_id).or_default().push((row.user_id, row.value));
        }
        self.for_pages(&ids, |page| {
            let likes = by_page.remove(&page.id).unwrap_or_default();
            if page.requirements.has(Facet::Likes) {
                page.like_count = likes.iter().map(|(_, value)| *value).sum();
                page.my_like_value = likes
                    .iter()
                    .find(|(user_id, _)| viewer.is(Some(user_id)))
                    .map_or(0, |(_, value)| *value);
            }
            if page.requirements.has(Facet::IndividualLikes) {
                page.liker_ids = likes
                    .into_iter()
                    .filter(|(_, value)| *value > 0)
                    .map(|(user_id, _)| user_id)
                    .collect();
                likers.extend(page.liker_ids.iter().cloned());
            }
        });
        for user_id in &likers {
            self.registry.add_user(user_id);
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn votes(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::Votes);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.votes(&ids))?;
        let row_count = rows.len();
        let mut by_page: BTreeMap<Id, Vec<Vote>> = BTreeMap::new();
        for row in rows {
            by_page.entry(row.page_id).or_default().push(Vote {
                user_id: row.user_id,
                value: row.value,
                created_at: row.created_at,
            });
        }
        self.for_pages(&ids, |page| {
            page.votes = by_page.remove(&page.id).unwrap_or_default();
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn subscriptions(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::IsSubscribed);
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.subscriptions(&ids, Some(viewer_id)))?;
        let row_count = rows.len();
        let subscribed: BTreeSet<Id> = rows
            .into_iter()
            .filter(|row| &row.user_id == viewer_id)
            .map(|row| row.to_id)
            .collect();
        self.for_pages(&ids, |page| {
            page.is_subscribed = subscribed.contains(&page.id);
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn subscriber_counts(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::SubscriberCount);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.subscriptions(&ids, None))?;
        let row_count = rows.len();
        let mut subscribers: BTreeMap<Id, BTreeSet<Id>> = BTreeMap::new();
        for row in rows {
            subscribers.entry(row.to_id).or_default().insert(row.user_id);
        }
        self.for_pages(&ids, |page| {
            page.subscriber_count = count(subscribers.get(&page.id).map_or(0, BTreeSet::len));
        });
        Ok(report(stage, ids.len(), row_count))
    }

    /// A draft is an autosave by the viewer newer than the live edit.
    fn drafts(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::HasDraft);
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.edits(&ids))?;
        let row_count = rows.len();
        let mut newest_draft: BTreeMap<Id, u32> = BTreeMap::new();
        for row in rows {
            if row.is_autosave && &row.creator_id == viewer_id {
                let entry = newest_draft.entry(row.page_id).or_insert(row.edit_num);
                *entry = (*entry).max(row.edit_num);
            }
        }
        self.for_pages(&ids, |page| {
            page.has_draft = newest_draft
                .get(&page.id)
                .is_some_and(|edit_num| *edit_num > page.edit_num);
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn used_as_mastery(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::UsedAsMastery);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let kind = RelationKind::PrerequisiteOf;
        let rows = self.fetch(stage, &ids, |source| source.relations(kind, &ids))?;
        let row_count = rows.len();
        let grouped = self.visible_relations(kind, rows);
        self.for_pages(&ids, |page| {
            page.used_as_mastery = grouped.get(&page.id).is_some_and(|pages| !pages.is_empty());
        });
        Ok(report(stage, ids.len(), row_count))
    }

    /// Authors of published edits, in order of their first contribution.
    fn creators(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::Creators);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.edits(&ids))?;
        let row_count = rows.len();
        let mut edits: BTreeMap<Id, Vec<(u32, Id)>> = BTreeMap::new();
        for row in rows {
            if row.is_autosave || row.is_snapshot {
                continue;
            }
            edits.entry(row.page_id).or_default().push((row.edit_num, row.creator_id));
        }
        let mut users = Vec::new();
        self.for_pages(&ids, |page| {
            let mut page_edits = edits.remove(&page.id).unwrap_or_default();
            page_edits.sort();
            let mut creators: Vec<Id> = Vec::new();
            for (_, creator_id) in page_edits {
                if !creators.contains(&creator_id) {
                    creators.push(creator_id);
                }
            }
            users.extend(creators.iter().cloned());
            page.creator_ids = creators;
        });
        for user_id in &users {
            self.registry.add_user(user_id);
        }
        Ok(report(stage, ids.len(), row_count))
    }

    /// Every edit except autosaves belonging to someone other than the viewer.
    fn edit_history(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::EditHistory);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.edits(&ids))?;
        let row_count = rows.len();
        let viewer = &self.ctx.viewer;
        let mut history: BTreeMap<Id, Vec<EditSummary>> = BTreeMap::new();
        for row in rows {
            if row.is_autosave && !viewer.is(Some(&row.creator_id)) {
                continue;
            }
            history.entry(row.page_id).or_default().push(EditSummary {
                edit_num: row.edit_num,
                creator_id: row.creator_id,
                created_at: row.created_at,
                edit_summary: row.edit_summary,
                is_live_edit: row.is_live_edit,
                is_autosave: row.is_autosave,
                is_snapshot: row.is_snapshot,
            });
        }
        let mut users = Vec::new();
        self.for_pages(&ids, |page| {
            let mut edits = history.remove(&page.id).unwrap_or_default();
            edits.sort_by_key(|edit| edit.edit_num);
            users.extend(edits.iter().map(|edit| edit.creator_id.clone()));
            page.edit_history = edits;
        });
        for user_id in &users {
            self.registry.add_user(user_id);
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn change_logs(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::ChangeLogs);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.change_logs(&ids))?;
        let row_count = rows.len();
        let mut logs: BTreeMap<Id, Vec<ChangeLog>> = BTreeMap::new();
        for row in rows {
            logs.entry(row.page_id).or_default().push(ChangeLog {
                edit_num: row.edit_num,
                user_id: row.user_id,
                change_type: row.change_type,
                aux_id: row.aux_id.filter(Id::is_valid),
                created_at: row.created_at,
            });
        }
        let mut users = Vec::new();
        self.for_pages(&ids, |page| {
            page.change_logs = logs.remove(&page.id).unwrap_or_default();
            users.extend(page.change_logs.iter().map(|log| log.user_id.clone()));
        });
        for user_id in &users {
            self.registry.add_user(user_id);
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn page_domains(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.pages_requiring(Facet::DomainsAndPermissions);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.page_domains(&ids))?;
        let row_count = rows.len();
        let mut by_page: BTreeMap<Id, Vec<Id>> = BTreeMap::new();
        for row in rows {
            if self.registry.add_domain(&row.domain_id).is_some() {
                let domains = by_page.entry(row.page_id).or_default();
                if !domains.contains(&row.domain_id) {
                    domains.push(row.domain_id);
                }
            }
        }
        self.for_pages(&ids, |page| {
            page.domain_ids = by_page.remove(&page.id).unwrap_or_default();
        });
        Ok(report(stage, ids.len(), row_count))
    }

    fn domains(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.domain_ids(true);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.domains(&ids))?;
        let row_count = rows.len();
        for row in rows {
            if let Some(domain) = self.registry.domain_mut(&row.id) {
                domain.page_id = row.page_id;
                domain.alias = row.alias;
                domain.loaded = true;
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn domain_roles(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.domain_ids(false);
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.domain_members(&ids, Some(viewer_id)))?;
        let row_count = rows.len();
        for row in rows.into_iter().filter(|row| &row.user_id == viewer_id) {
            if let Some(domain) = self.registry.domain_mut(&row.domain_id) {
                domain.viewer_role = domain.viewer_role.max(row.role);
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn masteries(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.mastery_ids();
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.masteries(&ids, Some(viewer_id)))?;
        let row_count = rows.len();
        for row in rows.into_iter().filter(|row| &row.user_id == viewer_id) {
            if let Some(mastery) = self.registry.mastery_mut(&row.page_id) {
                mastery.has = row.has;
                mastery.wants = row.wants;
                mastery.updated_at = Some(row.updated_at);
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn users(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.user_ids(true);
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.users(&ids))?;
        let row_count = rows.len();
        for row in rows {
            if let Some(user) = self.registry.user_mut(&row.id) {
                user.first_name = row.first_name;
                user.last_name = row.last_name;
                user.loaded = true;
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn user_subscriptions(&mut self, stage: Stage) -> Result<StageReport, LoadError> {
        let ids = self.registry.user_ids(false);
        let ctx = self.ctx;
        let Some(viewer_id) = ctx.viewer_id() else {
            return Ok(report(stage, ids.len(), 0));
        };
        if ids.is_empty() {
            return Ok(StageReport::skipped(stage));
        }
        let rows = self.fetch(stage, &ids, |source| source.subscriptions(&ids, Some(viewer_id)))?;
        let row_count = rows.len();
        for row in rows.into_iter().filter(|row| &row.user_id == viewer_id) {
            if let Some(user) = self.registry.user_mut(&row.to_id) {
                user.is_subscribed = true;
            }
        }
        Ok(report(stage, ids.len(), row_count))
    }

    fn permissions(&mut self, stage: Stage) -> StageReport {
        let ids = self.registry.pages_requiring(Facet::DomainsAndPermissions);
        if ids.is_empty() {
            return StageReport::skipped(stage);
        }
        let decisions: Vec<_> = ids
            .iter()
            .filter_map(|id| self.registry.page(id))
            .map(|page| {
                let permissions = compute_permissions(
                    page,
                    &self.ctx.viewer,
                    self.registry.domains(),
                    &self.config.policy,
                    self.ctx.now,
                );
                (page.id.clone(), permissions)
            })
            .collect();
        for (id, permissions) in decisions {
            if let Some(page) = self.registry.page_mut(&id) {
                page.permissions = Some(permissions);
            }
        }
        report(stage, ids.len(), 0)
    }
}
