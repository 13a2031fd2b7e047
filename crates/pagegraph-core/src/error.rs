use crate::pipeline::Stage;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GraphError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Failure reported by a [`crate::GraphSource`] for one batch call.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SourceError {
    #[error("store error: {0}")]
    Backend(String),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Fatal pipeline failure. No registry is returned alongside it.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LoadError {
    #[error("stage `{stage}` failed for a batch of {batch} ids (first: {first_id}): {source}")]
    Stage {
        stage: Stage,
        batch: usize,
        first_id: String,
        #[source]
        source: SourceError,
    },
    #[error("load cancelled at stage `{stage}`")]
    Cancelled { stage: Stage },
}
