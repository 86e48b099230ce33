//! Error taxonomy for the rewrite machinery.

/// Result type for single rewrite attempts.
pub type RewriteResult<T> = std::result::Result<T, RewriteError>;

/// What went wrong while attempting one match-and-rewrite.
///
/// `Match` and `Tiling` are non-fatal: the driver logs them and moves on to
/// other candidates. `Graph` signals an inconsistency in the function graph
/// itself and aborts the enclosing pass.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// The candidate is structurally ineligible; no rewrite was attempted.
    #[error("match failed: {0}")]
    Match(String),

    /// The tiling utility declined an operation; this match was abandoned.
    #[error("tiling failed: {0}")]
    Tiling(String),

    /// The function graph is inconsistent. Fatal for the enclosing pass.
    #[error(transparent)]
    Graph(#[from] tessera_core::Error),
}

impl RewriteError {
    /// Build a match failure with a reason.
    pub fn match_failure(reason: impl Into<String>) -> Self {
        RewriteError::Match(reason.into())
    }

    /// Build a tiling failure with a reason.
    pub fn tiling_failure(reason: impl Into<String>) -> Self {
        RewriteError::Tiling(reason.into())
    }

    /// True for errors that must abort the enclosing pass rather than just
    /// this match.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RewriteError::Graph(_))
    }
}
