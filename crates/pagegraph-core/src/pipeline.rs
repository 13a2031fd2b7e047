use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::LoadError;
use crate::ids::Id;
use crate::permissions::PermissionPolicy;
use crate::registry::Registry;
use crate::source::GraphSource;
use crate::stages::Loader;
use crate::visibility::Viewer;

/// Pipeline stages in execution order. Discovery stages come first, `base`
/// materializes and filters pages, everything after it describes pages that
/// are already known, and `permissions` reads what all of them loaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Children,
    Parents,
    Tags,
    Related,
    Lenses,
    Prerequisites,
    Subjects,
    Comments,
    Questions,
    Answers,
    Links,
    Marks,
    MarkRecords,
    HasChildren,
    HasParents,
    Base,
    Summaries,
    SubpageCounts,
    CommentCounts,
    AnswerCounts,
    LinkedMarkCounts,
    ViewCounts,
    LastVisits,
    Likes,
    Votes,
    Subscriptions,
    SubscriberCounts,
    Drafts,
    UsedAsMastery,
    Creators,
    EditHistory,
    ChangeLogs,
    PageDomains,
    Domains,
    DomainRoles,
    Masteries,
    Users,
    UserSubscriptions,
    Permissions,
}

impl Stage {
    pub const ORDER: [Stage; 39] = [
        Self::Children,
        Self::Parents,
        Self::Tags,
        Self::Related,
        Self::Lenses,
        Self::Prerequisites,
        Self::Subjects,
        Self::Comments,
        Self::Questions,
        Self::Answers,
        Self::Links,
        Self::Marks,
        Self::MarkRecords,
        Self::HasChildren,
        Self::HasParents,
        Self::Base,
        Self::Summaries,
        Self::SubpageCounts,
        Self::CommentCounts,
        Self::AnswerCounts,
        Self::LinkedMarkCounts,
        Self::ViewCounts,
        Self::LastVisits,
        Self::Likes,
        Self::Votes,
        Self::Subscriptions,
        Self::SubscriberCounts,
        Self::Drafts,
        Self::UsedAsMastery,
        Self::Creators,
        Self::EditHistory,
        Self::ChangeLogs,
        Self::PageDomains,
        Self::Domains,
        Self::DomainRoles,
        Self::Masteries,
        Self::Users,
        Self::UserSubscriptions,
        Self::Permissions,
    ];

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
            Self::Marks => "marks",
            Self::MarkRecords => "mark_records",
            Self::HasChildren => "has_children",
            Self::HasParents => "has_parents",
            Self::Base => "base",
            Self::Summaries => "summaries",
            Self::SubpageCounts => "subpage_counts",
            Self::CommentCounts => "comment_counts",
            Self::AnswerCounts => "answer_counts",
            Self::LinkedMarkCounts => "linked_mark_counts",
            Self::ViewCounts => "view_counts",
            Self::LastVisits => "last_visits",
            Self::Likes => "likes",
            Self::Votes => "votes",
            Self::Subscriptions => "subscriptions",
            Self::SubscriberCounts => "subscriber_counts",
            Self::Drafts => "drafts",
            Self::UsedAsMastery => "used_as_mastery",
            Self::Creators => "creators",
            Self::EditHistory => "edit_history",
            Self::ChangeLogs => "change_logs",
            Self::PageDomains => "page_domains",
            Self::Domains => "domains",
            Self::DomainRoles => "domain_roles",
            Self::Masteries => "masteries",
            Self::Users => "users",
            Self::UserSubscriptions => "user_subscriptions",
            Self::Permissions => "permissions",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation flag shared with whoever owns the request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request inputs of a load.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub viewer: Viewer,
    /// Reference time for lock expiry.
    pub now: OffsetDateTime,
    pub cancel: CancelToken,
}

impl LoadContext {
    #[must_use]
    pub fn new(viewer: Viewer) -> Self {
        Self {
            viewer,
            now: OffsetDateTime::now_utc(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn viewer_id(&self) -> Option<&Id> {
        self.viewer.user_id.as_ref()
    }
}

/// Process-level knobs, built once and passed to every load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoadConfig {
    #[serde(default)]
    pub policy: PermissionPolicy,
    #[serde(default = "default_warn_on_dropped")]
    pub warn_on_dropped: bool,
}

fn default_warn_on_dropped() -> bool {
    true
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            policy: PermissionPolicy::default(),
            warn_on_dropped: default_warn_on_dropped(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    /// Entities in the stage's batch.
    pub selected: usize,
    /// Rows the source returned for the batch.
    pub rows: usize,
}

impl StageReport {
    #[must_use]
    pub fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            selected: 0,
            rows: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoadReport {
    pub run_id: Ulid,
    pub stages: Vec<StageReport>,
    /// Registered pages the store did not return or the viewer may not see.
    pub dropped_page_ids: Vec<Id>,
    /// Pages discovered only through a dropped page, removed along with it.
    #[serde(default)]
    pub orphaned_page_ids: Vec<Id>,
}

impl LoadReport {
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Loaded {
    pub registry: Registry,
    pub report: LoadReport,
}

/// Run every stage once, in order, against `registry`.
///
/// # Errors
/// Returns [`LoadError::Stage`] when the source fails a batch, and
/// [`LoadError::Cancelled`] when `ctx.cancel` fires. No registry is returned
/// in either case.
pub fn run<S: GraphSource + ?Sized>(
    source: &S,
    registry: Registry,
    ctx: &LoadContext,
    config: &LoadConfig,
) -> Result<Loaded, LoadError> {
    let run_id = Ulid::new();
    let span = tracing::info_span!(
        "pagegraph.load",
        run_id = %run_id,
        pages = registry.pages().len()
    );
    let _entered = span.enter();

    let mut loader = Loader::new(source, registry, ctx, config);
    let mut stages = Vec::with_capacity(Stage::ORDER.len());
    for stage in Stage::ORDER {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(stage = %stage, "load cancelled");
            return Err(LoadError::Cancelled { stage });
        }
        let report = loader.apply(stage)?;
        if report.selected > 0 {
            tracing::debug!(
                stage = %stage,
                selected = report.selected,
                rows = report.rows,
                "stage applied"
            );
        }
        stages.push(report);
    }

    let (registry, removed) = loader.finish();
    tracing::info!(
        pages = registry.pages().len(),
        users = registry.users().len(),
        dropped = removed.dropped.len(),
        orphaned = removed.orphaned.len(),
        "load complete"
    );
    Ok(Loaded {
        registry,
        report: LoadReport {
            run_id,
            stages,
            dropped_page_ids: removed.dropped,
            orphaned_page_ids: removed.orphaned,
        },
    })
}
