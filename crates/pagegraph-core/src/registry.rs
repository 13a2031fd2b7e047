use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::facets::{Facet, Requirements};
use crate::ids::Id;
use crate::records::{DomainRecord, MarkRecord, MasteryRecord, PageRecord, UserRecord};

/// The five entity maps of one load. Doubles as the dedup cache: registering
/// an id that is already present merges requirements instead of adding a
/// second record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pages: BTreeMap<Id, PageRecord>,
    users: BTreeMap<Id, UserRecord>,
    marks: BTreeMap<Id, MarkRecord>,
    domains: BTreeMap<Id, DomainRecord>,
    masteries: BTreeMap<Id, MasteryRecord>,
    #[serde(skip)]
    pages_sealed: bool,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with one page.
    #[must_use]
    pub fn with_page(id: &Id, requirements: impl Into<Requirements>) -> Self {
        let mut registry = Self::new();
        registry.add_page(id, requirements.into());
        registry
    }

    /// Register `id` or merge `requirements` into the existing record.
    ///
    /// Returns `None` without touching the registry when `id` is not a valid
    /// id, or when page records have already been materialized for this load.
    pub fn add_page(&mut self, id: &Id, requirements: Requirements) -> Option<&mut PageRecord> {
        if !id.is_valid() {
            return None;
        }
        if self.pages_sealed {
            tracing::debug!(page_id = %id, "page registration after materialization ignored");
            return None;
        }
        let page = self
            .pages
            .entry(id.clone())
            .or_insert_with(|| PageRecord::new(id.clone(), Requirements::empty()));
        page.requirements = page.requirements.merge(requirements);
        Some(page)
    }

    pub fn add_user(&mut self, id: &Id) -> Option<&mut UserRecord> {
        if !id.is_valid() {
            return None;
        }
        Some(self.users.entry(id.clone()).or_insert_with(|| UserRecord {
            id: id.clone(),
            ..UserRecord::default()
        }))
    }

    pub fn add_mark(&mut self, id: &Id) -> Option<&mut MarkRecord> {
        if !id.is_valid() {
            return None;
        }
        Some(self.marks.entry(id.clone()).or_insert_with(|| MarkRecord {
            id: id.clone(),
            ..MarkRecord::default()
        }))
    }

    pub fn add_domain(&mut self, id: &Id) -> Option<&mut DomainRecord> {
        if !id.is_valid() {
            return None;
        }
        Some(self.domains.entry(id.clone()).or_insert_with(|| DomainRecord {
            id: id.clone(),
            ..DomainRecord::default()
        }))
    }

    pub fn add_mastery(&mut self, page_id: &Id) -> Option<&mut MasteryRecord> {
        if !page_id.is_valid() {
            return None;
        }
        Some(self.masteries.entry(page_id.clone()).or_insert_with(|| MasteryRecord {
            page_id: page_id.clone(),
            ..MasteryRecord::default()
        }))
    }

    /// Ids of registered pages whose accumulated requirements demand `facet`.
    #[must_use]
    pub fn pages_requiring(&self, facet: Facet) -> Vec<Id> {
        self.pages_requiring_any(facet.as_set())
    }

    /// Ids of registered pages whose requirements share any facet with `set`.
    #[must_use]
    pub fn pages_requiring_any(&self, set: Requirements) -> Vec<Id> {
        self.pages
            .values()
            .filter(|page| page.requirements.intersects(set))
            .map(|page| page.id.clone())
            .collect()
    }

    #[must_use]
    pub fn page(&self, id: &Id) -> Option<&PageRecord> {
        self.pages.get(id)
    }

    #[must_use]
    pub fn user(&self, id: &Id) -> Option<&UserRecord> {
        self.users.get(id)
    }

    #[must_use]
    pub fn mark(&self, id: &Id) -> Option<&MarkRecord> {
        self.marks.get(id)
    }

    #[must_use]
    pub fn domain(&self, id: &Id) -> Option<&DomainRecord> {
        self.domains.get(id)
    }

    #[must_use]
    pub fn mastery(&self, page_id: &Id) -> Option<&MasteryRecord> {
        self.masteries.get(page_id)
    }

    #[must_use]
    pub fn pages(&self) -> &BTreeMap<Id, PageRecord> {
        &self.pages
    }

    #[must_use]
    pub fn users(&self) -> &BTreeMap<Id, UserRecord> {
        &self.users
    }

    #[must_use]
    pub fn marks(&self) -> &BTreeMap<Id, MarkRecord> {
        &self.marks
    }

    #[must_use]
    pub fn domains(&self) -> &BTreeMap<Id, DomainRecord> {
        &self.domains
    }

    #[must_use]
    pub fn masteries(&self) -> &BTreeMap<Id, MasteryRecord> {
        &self.masteries
    }

    pub(crate) fn page_mut(&mut self, id: &Id) -> Option<&mut PageRecord> {
        self.pages.get_mut(id)
    }

    pub(crate) fn user_mut(&mut self, id: &Id) -> Option<&mut UserRecord> {
        self.users.get_mut(id)
    }

    pub(crate) fn domain_mut(&mut self, id: &Id) -> Option<&mut DomainRecord> {
        self.domains.get_mut(id)
    }

    pub(crate) fn mastery_mut(&mut self, page_id: &Id) -> Option<&mut MasteryRecord> {
        self.masteries.get_mut(page_id)
    }

    pub(crate) fn all_page_ids(&self) -> Vec<Id> {
        self.pages.keys().cloned().collect()
    }

    pub(crate) fn user_ids(&self, only_unloaded: bool) -> Vec<Id> {
        self.users
            .values()
            .filter(|user| !(only_unloaded && user.loaded))
            .map(|user| user.id.clone())
            .collect()
    }

    pub(crate) fn mark_ids(&self, only_unloaded: bool) -> Vec<Id> {
        self.marks
            .values()
            .filter(|mark| !(only_unloaded && mark.loaded))
            .map(|mark| mark.id.clone())
            .collect()
    }

    pub(crate) fn domain_ids(&self, only_unloaded: bool) -> Vec<Id> {
        self.domains
            .values()
            .filter(|domain| !(only_unloaded && domain.loaded))
            .map(|domain| domain.id.clone())
            .collect()
    }

    pub(crate) fn mastery_ids(&self) -> Vec<Id> {
        self.masteries.keys().cloned().collect()
    }

    /// Removes pages that failed to materialize along with every reference
    /// other pages and marks hold to them. Marks anchored on a removed page
    /// leave too; their creators are returned.
    pub(crate) fn drop_pages(&mut self, dropped: &[Id]) -> Vec<Id> {
        if dropped.is_empty() {
            return Vec::new();
        }
        for id in dropped {
            self.pages.remove(id);
        }
        let gone = |id: &Id| dropped.contains(id);
        for page in self.pages.values_mut() {
            for list in [
                &mut page.child_ids,
                &mut page.parent_ids,
                &mut page.tag_ids,
                &mut page.related_ids,
                &mut page.lens_ids,
                &mut page.prerequisite_ids,
                &mut page.subject_ids,
                &mut page.comment_ids,
                &mut page.question_ids,
                &mut page.answer_ids,
                &mut page.link_ids,
            ] {
                list.retain(|id| !gone(id));
            }
        }
        self.masteries.retain(|page_id, _| !gone(page_id));

        let mut mark_creators = Vec::new();
        self.marks.retain(|_, mark| {
            if gone(&mark.page_id) {
                mark_creators.push(mark.creator_id.clone());
                false
            } else {
                true
            }
        });
        for mark in self.marks.values_mut() {
            if mark.resolved_page_id.as_ref().is_some_and(gone) {
                mark.resolved_page_id = None;
            }
        }
        mark_creators
    }

    pub(crate) fn drop_users(&mut self, ids: &[Id]) {
        for id in ids {
            self.users.remove(id);
        }
    }

    pub(crate) fn remove_marks(&mut self, ids: &[Id]) {
        for id in ids {
            self.marks.remove(id);
        }
    }

    pub(crate) fn seal_pages(&mut self) {
        self.pages_sealed = true;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(raw: &str) -> Id {
        Id::new(raw)
    }

    // Test IDs: TREG-001
    #[test]
    fn invalid_ids_are_a_no_op() {
        let mut registry = Registry::new();
        assert!(registry.add_page(&id("0"), Requirements::TEXT).is_none());
        assert!(registry.add_page(&id(""), Requirements::TEXT).is_none());
        assert!(registry.add_user(&id("0")).is_none());
        assert!(registry.add_mark(&id("")).is_none());
        assert!(registry.add_domain(&id("x")).is_none());
        assert!(registry.add_mastery(&id("0")).is_none());
        assert_eq!(registry, Registry::new());
    }

    // Test IDs: TREG-002
    #[test]
    fn second_registration_merges_requirements() {
        let mut registry = Registry::new();
        registry.add_page(&id("2a"), Requirements::COMMENT_COUNT);
        registry.add_page(&id("2a"), Requirements::ANSWER_COUNT);
        assert_eq!(registry.pages().len(), 1);
        assert_eq!(
            registry.page(&id("2a")).map(|page| page.requirements),
            Some(Requirements::COMMENT_COUNT | Requirements::ANSWER_COUNT)
        );
    }

    #[test]
    fn filter_by_facet_selects_demanding_pages() {
        let mut registry = Registry::new();
        registry.add_page(&id("1"), Requirements::TEXT | Requirements::CHILDREN);
        registry.add_page(&id("2"), Requirements::TEXT);
        registry.add_page(&id("3"), Requirements::TITLE_ONLY);
        assert_eq!(registry.pages_requiring(Facet::Text), vec![id("1"), id("2")]);
        assert_eq!(registry.pages_requiring(Facet::Children), vec![id("1")]);
        assert!(registry.pages_requiring(Facet::Votes).is_empty());
    }

    #[test]
    fn sealed_registry_refuses_new_pages() {
        let mut registry = Registry::with_page(&id("5k"), Requirements::TEXT);
        registry.seal_pages();
        assert!(registry.add_page(&id("6"), Requirements::TEXT).is_none());
        assert!(registry.add_page(&id("5k"), Requirements::VOTES).is_none());
        assert_eq!(
            registry.page(&id("5k")).map(|page| page.requirements),
            Some(Requirements::TEXT)
        );
    }

    #[test]
    fn dropping_pages_prunes_references() {
        let mut registry = Registry::with_page(&id("5k"), Requirements::CHILDREN);
        registry.add_page(&id("6"), Requirements::TITLE_ONLY);
        registry.add_mastery(&id("6"));
        if let Some(page) = registry.page_mut(&id("5k")) {
            page.child_ids = vec![id("6"), id("7")];
        }
        let creators = registry.drop_pages(&[id("6")]);
        assert!(creators.is_empty());
        assert!(registry.page(&id("6")).is_none());
        assert!(registry.mastery(&id("6")).is_none());
        assert_eq!(registry.page(&id("5k")).map(|page| page.child_ids.clone()), Some(vec![id("7")]));
    }

    #[test]
    fn dropping_pages_takes_their_marks_along() {
        let mut registry = Registry::with_page(&id("5k"), Requirements::MARKS);
        registry.add_page(&id("6"), Requirements::TITLE_ONLY);
        if let Some(mark) = registry.add_mark(&id("1m")) {
            mark.page_id = id("5k");
            mark.creator_id = id("44");
            mark.loaded = true;
        }
        if let Some(mark) = registry.add_mark(&id("2m")) {
            mark.page_id = id("6");
            mark.creator_id = id("3");
            mark.resolved_page_id = Some(id("5k"));
            mark.loaded = true;
        }

        let creators = registry.drop_pages(&[id("5k")]);
        assert_eq!(creators, vec![id("44")]);
        assert!(registry.mark(&id("1m")).is_none());
        assert_eq!(registry.mark(&id("2m")).map(|mark| mark.resolved_page_id.clone()), Some(None));
    }

    proptest! {
        // Test IDs: TREG-003
        #[test]
        fn registration_order_does_not_change_the_result(
            first in any::<u64>(),
            second in any::<u64>(),
        ) {
            let first = Requirements::from_bits_truncate(first);
            let second = Requirements::from_bits_truncate(second);

            let mut forward = Registry::new();
            forward.add_page(&id("5k"), first);
            forward.add_page(&id("5k"), second);

            let mut backward = Registry::new();
            backward.add_page(&id("5k"), second);
            backward.add_page(&id("5k"), first);

            prop_assert_eq!(&forward, &backward);
            prop_assert_eq!(forward.pages().len(), 1);
            prop_assert_eq!(
                forward.page(&id("5k")).map(|page| page.requirements),
                Some(first.merge(second))
            );
        }
    }
}
