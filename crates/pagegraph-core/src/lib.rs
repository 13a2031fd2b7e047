//! Request-scoped loading of a permission-filtered page graph.
//!
//! A caller seeds a [`Registry`] with one or more entities and the
//! [`Requirements`] it wants for each, then hands it to [`run`]. The pipeline
//! walks a fixed list of stages; each stage batches every registered page that
//! demands its facet into a single [`GraphSource`] call and folds the rows back
//! onto the records, registering newly discovered entities as it goes.

mod derive;
mod error;
mod facets;
mod ids;
pub mod memory;
mod permissions;
mod pipeline;
mod records;
mod registry;
#[cfg(test)]
mod scenarios;
mod source;
mod stages;
mod visibility;

pub use derive::{
    answer_requirements, child_requirements, comment_requirements, lens_requirements,
    link_requirements, mastery_page_requirements, parent_requirements, question_requirements,
    related_requirements, tag_requirements,
};
pub use error::{GraphError, LoadError, SourceError};
pub use facets::{Facet, Requirements, Template};
pub use ids::{compare_ids, next_id, Id, ID_ALPHABET};
pub use permissions::{compute_permissions, Permission, PermissionPolicy, Permissions};
pub use pipeline::{run, CancelToken, LoadConfig, LoadContext, LoadReport, Loaded, Stage, StageReport};
pub use records::{
    ChangeLog, DomainRecord, DomainRole, EditSummary, MarkRecord, MarkType, MasteryRecord,
    PageRecord, PageType, PairType, UserRecord, Vote,
};
pub use registry::Registry;
pub use source::{
    ChangeLogRow, DomainMemberRow, DomainRow, EditRow, GraphSource, LikeRow, MarkQuery, MarkRow,
    MasteryRow, PageDomainRow, PageRow, RelationKind, RelationRow, SourceResult, SubscriptionRow,
    SummaryRow, UserRow, VisitRow, VoteRow,
};
pub use visibility::{Viewer, VisibilityFlags};
