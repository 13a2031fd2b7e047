//! Requirements a stage hands to the pages it discovers, derived from the
//! requirements of the page that led to them.

use crate::facets::{Facet, Requirements};

#[must_use]
pub fn child_requirements(parent: Requirements) -> Requirements {
    let mut derived = Requirements::TITLE_ONLY;
    if parent.has(Facet::DescendantCounts) {
        derived |= Requirements::SUBPAGE_COUNTS | Requirements::HAS_CHILDREN;
    }
    derived
}

/// Parents shown as breadcrumbs need to know whether they have parents of
/// their own.
#[must_use]
pub fn parent_requirements(child: Requirements) -> Requirements {
    let mut derived = Requirements::TITLE_ONLY;
    if child.has(Facet::HasParents) {
        derived |= Requirements::HAS_PARENTS;
    }
    derived
}

#[must_use]
pub fn tag_requirements(_tagged: Requirements) -> Requirements {
    Requirements::TITLE_ONLY
}

#[must_use]
pub fn related_requirements(_owner: Requirements) -> Requirements {
    Requirements::TITLE_PLUS
}

#[must_use]
pub fn lens_requirements(owner: Requirements) -> Requirements {
    let mut derived = Requirements::LENS;
    if owner.has(Facet::LensText) {
        derived |= Requirements::TEXT;
    }
    derived
}

/// Pages named as prerequisites or subjects. Their summaries follow the
/// owner's so requirement badges can show a preview.
#[must_use]
pub fn mastery_page_requirements(owner: Requirements) -> Requirements {
    let mut derived = Requirements::TITLE_ONLY;
    if owner.has(Facet::Summaries) {
        derived |= Requirements::SUMMARIES;
    }
    derived
}

#[must_use]
pub fn comment_requirements(_owner: Requirements) -> Requirements {
    Requirements::SUBPAGE
}

#[must_use]
pub fn question_requirements(_owner: Requirements) -> Requirements {
    Requirements::TITLE_PLUS
}

#[must_use]
pub fn answer_requirements(_question: Requirements) -> Requirements {
    Requirements::ANSWER
}

#[must_use]
pub fn link_requirements(_owner: Requirements) -> Requirements {
    Requirements::TITLE_ONLY
}
