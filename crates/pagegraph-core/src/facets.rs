use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GraphError;

/// One unit of data a caller can request for a page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Text,
    Summaries,
    Children,
    HasChildren,
    Parents,
    HasParents,
    Tags,
    Related,
    Lenses,
    /// Lenses discovered from this page are loaded with their body text.
    LensText,
    Prerequisites,
    Subjects,
    Comments,
    Questions,
    Answers,
    Marks,
    Links,
    SubpageCounts,
    /// Children discovered from this page are loaded with their own counts.
    DescendantCounts,
    CommentCount,
    AnswerCount,
    LinkedMarkCount,
    ViewCount,
    Likes,
    IndividualLikes,
    Votes,
    IsSubscribed,
    SubscriberCount,
    LastVisit,
    HasDraft,
    UsedAsMastery,
    Creators,
    EditHistory,
    ChangeLogs,
    DomainsAndPermissions,
}

impl Facet {
    pub const ALL: [Facet; 35] = [
        Self::Text,
        Self::Summaries,
        Self::Children,
        Self::HasChildren,
        Self::Parents,
        Self::HasParents,
        Self::Tags,
        Self::Related,
        Self::Lenses,
        Self::LensText,
        Self::Prerequisites,
        Self::Subjects,
        Self::Comments,
        Self::Questions,
        Self::Answers,
        Self::Marks,
        Self::Links,
        Self::SubpageCounts,
        Self::DescendantCounts,
        Self::CommentCount,
        Self::AnswerCount,
        Self::LinkedMarkCount,
        Self::ViewCount,
        Self::Likes,
        Self::IndividualLikes,
        Self::Votes,
        Self::IsSubscribed,
        Self::SubscriberCount,
        Self::LastVisit,
        Self::HasDraft,
        Self::UsedAsMastery,
        Self::Creators,
        Self::EditHistory,
        Self::ChangeLogs,
        Self::DomainsAndPermissions,
    ];

    /// Returns the bitflag for this facet.
    #[must_use]
    pub const fn as_set(self) -> Requirements {
        match self {
            Self::Text => Requirements::TEXT,
            Self::Summaries => Requirements::SUMMARIES,
            Self::Children => Requirements::CHILDREN,
            Self::HasChildren => Requirements::HAS_CHILDREN,
            Self::Parents => Requirements::PARENTS,
            Self::HasParents => Requirements::HAS_PARENTS,
            Self::Tags => Requirements::TAGS,
            Self::Related => Requirements::RELATED,
            Self::Lenses => Requirements::LENSES,
            Self::LensText => Requirements::LENS_TEXT,
            Self::Prerequisites => Requirements::PREREQUISITES,
            Self::Subjects => Requirements::SUBJECTS,
            Self::Comments => Requirements::COMMENTS,
            Self::Questions => Requirements::QUESTIONS,
            Self::Answers => Requirements::ANSWERS,
            Self::Marks => Requirements::MARKS,
            Self::Links => Requirements::LINKS,
            Self::SubpageCounts => Requirements::SUBPAGE_COUNTS,
            Self::DescendantCounts => Requirements::DESCENDANT_COUNTS,
            Self::CommentCount => Requirements::COMMENT_COUNT,
            Self::AnswerCount => Requirements::ANSWER_COUNT,
            Self::LinkedMarkCount => Requirements::LINKED_MARK_COUNT,
            Self::ViewCount => Requirements::VIEW_COUNT,
            Self::Likes => Requirements::LIKES,
            Self::IndividualLikes => Requirements::INDIVIDUAL_LIKES,
            Self::Votes => Requirements::VOTES,
            Self::IsSubscribed => Requirements::IS_SUBSCRIBED,
            Self::SubscriberCount => Requirements::SUBSCRIBER_COUNT,
            Self::LastVisit => Requirements::LAST_VISIT,
            Self::HasDraft => Requirements::HAS_DRAFT,
            Self::UsedAsMastery => Requirements::USED_AS_MASTERY,
            Self::Creators => Requirements::CREATORS,
            Self::EditHistory => Requirements::EDIT_HISTORY,
            Self::ChangeLogs => Requirements::CHANGE_LOGS,
            Self::DomainsAndPermissions => Requirements::DOMAINS_AND_PERMISSIONS,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Summaries => "summaries",
            Self::Children => "children",
            Self::HasChildren => "has_children",
            Self::Parents => "parents",
            Self::HasParents => "has_parents",
            Self::Tags => "tags",
            Self::Related => "related",
            Self::Lenses => "lenses",
            Self::LensText => "lens_text",
            Self::Prerequisites => "prerequisites",
            Self::Subjects => "subjects",
            Self::Comments => "comments",
            Self::Questions => "questions",
            Self::Answers => "answers",
            Self::Marks => "marks",
            Self::Links => "links",
            Self::SubpageCounts => "subpage_counts",
            Self::DescendantCounts => "descendant_counts",
            Self::CommentCount => "comment_count",
            Self::AnswerCount => "answer_count",
            Self::LinkedMarkCount => "linked_mark_count",
            Self::ViewCount => "view_count",
            Self::Likes => "likes",
            Self::IndividualLikes => "individual_likes",
            Self::Votes => "votes",
            Self::IsSubscribed => "is_subscribed",
            Self::SubscriberCount => "subscriber_count",
            Self::LastVisit => "last_visit",
            Self::HasDraft => "has_draft",
            Self::UsedAsMastery => "used_as_mastery",
            Self::Creators => "creators",
            Self::EditHistory => "edit_history",
            Self::ChangeLogs => "change_logs",
            Self::DomainsAndPermissions => "domains_and_permissions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|facet| facet.as_str() == value)
    }
}

bitflags::bitflags! {
    /// The set of facets requested for one page. Union is the only way two
    /// sets combine, so merge order never changes the outcome.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Requirements: u64 {
        const TEXT = 1 << 0;
        const SUMMARIES = 1 << 1;
        const CHILDREN = 1 << 2;
        const HAS_CHILDREN = 1 << 3;
        const PARENTS = 1 << 4;
        const HAS_PARENTS = 1 << 5;
        const TAGS = 1 << 6;
        const RELATED = 1 << 7;
        const LENSES = 1 << 8;
        const LENS_TEXT = 1 << 9;
        const PREREQUISITES = 1 << 10;
        const SUBJECTS = 1 << 11;
        const COMMENTS = 1 << 12;
        const QUESTIONS = 1 << 13;
        const ANSWERS = 1 << 14;
        const MARKS = 1 << 15;
        const LINKS = 1 << 16;
        const SUBPAGE_COUNTS = 1 << 17;
        const DESCENDANT_COUNTS = 1 << 18;
        const COMMENT_COUNT = 1 << 19;
        const ANSWER_COUNT = 1 << 20;
        const LINKED_MARK_COUNT = 1 << 21;
        const VIEW_COUNT = 1 << 22;
        const LIKES = 1 << 23;
        const INDIVIDUAL_LIKES = 1 << 24;
        const VOTES = 1 << 25;
        const IS_SUBSCRIBED = 1 << 26;
        const SUBSCRIBER_COUNT = 1 << 27;
        const LAST_VISIT = 1 << 28;
        const HAS_DRAFT = 1 << 29;
        const USED_AS_MASTERY = 1 << 30;
        const CREATORS = 1 << 31;
        const EDIT_HISTORY = 1 << 32;
        const CHANGE_LOGS = 1 << 33;
        const DOMAINS_AND_PERMISSIONS = 1 << 34;
    }
}

impl Requirements {
    /// Base fields only: type, title, lifecycle flags, author.
    pub const TITLE_ONLY: Self = Self::empty();

    pub const TITLE_PLUS: Self = Self::TITLE_ONLY
        .union(Self::HAS_CHILDREN)
        .union(Self::HAS_PARENTS)
        .union(Self::SUBPAGE_COUNTS)
        .union(Self::VIEW_COUNT)
        .union(Self::LIKES);

    /// A comment rendered inline under its page.
    pub const SUBPAGE: Self = Self::TEXT
        .union(Self::LIKES)
        .union(Self::IS_SUBSCRIBED)
        .union(Self::DOMAINS_AND_PERMISSIONS);

    pub const LENS: Self = Self::SUMMARIES
        .union(Self::LIKES)
        .union(Self::VIEW_COUNT)
        .union(Self::IS_SUBSCRIBED)
        .union(Self::COMMENT_COUNT);

    pub const ANSWER: Self = Self::TITLE_PLUS.union(Self::CREATORS).union(Self::SUMMARIES);

    pub const POPOVER: Self = Self::SUMMARIES
        .union(Self::HAS_CHILDREN)
        .union(Self::LIKES)
        .union(Self::VIEW_COUNT)
        .union(Self::COMMENT_COUNT);

    /// Tree views: children plus enough to render their expanders and counts.
    pub const OUTLINE: Self = Self::CHILDREN
        .union(Self::DESCENDANT_COUNTS)
        .union(Self::HAS_PARENTS)
        .union(Self::SUMMARIES);

    pub const FULL_ITEM: Self = Self::TITLE_PLUS
        .union(Self::POPOVER)
        .union(Self::TEXT)
        .union(Self::CHILDREN)
        .union(Self::PARENTS)
        .union(Self::TAGS)
        .union(Self::RELATED)
        .union(Self::LENSES)
        .union(Self::LENS_TEXT)
        .union(Self::PREREQUISITES)
        .union(Self::SUBJECTS)
        .union(Self::COMMENTS)
        .union(Self::QUESTIONS)
        .union(Self::ANSWERS)
        .union(Self::MARKS)
        .union(Self::ANSWER_COUNT)
        .union(Self::LINKED_MARK_COUNT)
        .union(Self::INDIVIDUAL_LIKES)
        .union(Self::VOTES)
        .union(Self::IS_SUBSCRIBED)
        .union(Self::SUBSCRIBER_COUNT)
        .union(Self::LAST_VISIT)
        .union(Self::USED_AS_MASTERY)
        .union(Self::CREATORS)
        .union(Self::DOMAINS_AND_PERMISSIONS);

    pub const EDIT_ITEM: Self = Self::TEXT
        .union(Self::SUMMARIES)
        .union(Self::PARENTS)
        .union(Self::TAGS)
        .union(Self::LENSES)
        .union(Self::PREREQUISITES)
        .union(Self::SUBJECTS)
        .union(Self::LINKS)
        .union(Self::CREATORS)
        .union(Self::EDIT_HISTORY)
        .union(Self::CHANGE_LOGS)
        .union(Self::HAS_DRAFT)
        .union(Self::DOMAINS_AND_PERMISSIONS);

    /// Field-wise OR of two requirement sets.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        self.union(other)
    }

    #[must_use]
    pub const fn has(self, facet: Facet) -> bool {
        self.contains(facet.as_set())
    }

    pub fn facets(self) -> impl Iterator<Item = Facet> {
        Facet::ALL.into_iter().filter(move |facet| self.has(*facet))
    }
}

impl From<Facet> for Requirements {
    fn from(facet: Facet) -> Self {
        facet.as_set()
    }
}

impl FromIterator<Facet> for Requirements {
    fn from_iter<I: IntoIterator<Item = Facet>>(iter: I) -> Self {
        let mut set = Requirements::empty();
        for facet in iter {
            set |= facet.as_set();
        }
        set
    }
}

impl Serialize for Requirements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.facets())
    }
}

impl<'de> Deserialize<'de> for Requirements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut set = Requirements::empty();
        for name in names {
            let facet =
                Facet::parse(&name).ok_or_else(|| D::Error::custom(format!("unknown facet: {name}")))?;
            set |= facet.as_set();
        }
        Ok(set)
    }
}

/// Named requirement sets callers pick by use case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    TitleOnly,
    TitlePlus,
    Subpage,
    Lens,
    Answer,
    Popover,
    Outline,
    FullItem,
    EditItem,
}

impl Template {
    pub const ALL: [Template; 9] = [
        Self::TitleOnly,
        Self::TitlePlus,
        Self::Subpage,
        Self::Lens,
        Self::Answer,
        Self::Popover,
        Self::Outline,
        Self::FullItem,
        Self::EditItem,
    ];

    #[must_use]
    pub const fn requirements(self) -> Requirements {
        match self {
            Self::TitleOnly => Requirements::TITLE_ONLY,
            Self::TitlePlus => Requirements::TITLE_PLUS,
            Self::Subpage => Requirements::SUBPAGE,
            Self::Lens => Requirements::LENS,
            Self::Answer => Requirements::ANSWER,
            Self::Popover => Requirements::POPOVER,
            Self::Outline => Requirements::OUTLINE,
            Self::FullItem => Requirements::FULL_ITEM,
            Self::EditItem => Requirements::EDIT_ITEM,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TitleOnly => "title_only",
            Self::TitlePlus => "title_plus",
            Self::Subpage => "subpage",
            Self::Lens => "lens",
            Self::Answer => "answer",
            Self::Popover => "popover",
            Self::Outline => "outline",
            Self::FullItem => "full_item",
            Self::EditItem => "edit_item",
        }
    }

    /// # Errors
    /// Returns [`GraphError::Validation`] for names that match no template.
    pub fn parse(value: &str) -> Result<Self, GraphError> {
        Self::ALL
            .into_iter()
            .find(|template| template.as_str() == value)
            .ok_or_else(|| GraphError::Validation(format!("unknown requirement template: {value}")))
    }
}

impl From<Template> for Requirements {
    fn from(template: Template) -> Self {
        template.requirements()
    }
}
