use std::fmt;

/// Errors a caller is expected to match on by kind, as opposed to the
/// `anyhow::Error` context chains used for everything else in this crate.
#[derive(Debug)]
pub enum PipelineError {
    /// The input file does not look like an MBTiles archive (no `tiles`
    /// table, or not an SQLite database at all).
    NotAnMbtiles,
    /// A run was stopped by the caller's cancellation check.
    Cancelled,
    /// A profile-store operation failed in a way the caller should be able
    /// to branch on (see `ProfileError`).
    Profile(ProfileError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NotAnMbtiles => write!(f, "input is not an MBTiles archive"),
            PipelineError::Cancelled => write!(f, "run was cancelled"),
            PipelineError::Profile(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Profile(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from the profile model (C5).
#[derive(Debug)]
pub enum ProfileError {
    /// Another profile already has this name (case-insensitive).
    NameConflict(String),
    /// No profile exists with the given id.
    NotFound(String),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NameConflict(name) => {
                write!(f, "a profile named '{name}' already exists")
            }
            ProfileError::NotFound(id) => write!(f, "no profile with id '{id}'"),
        }
    }
}

impl std::error::Error for ProfileError {}

impl From<ProfileError> for PipelineError {
    fn from(e: ProfileError) -> Self {
        PipelineError::Profile(e)
    }
}
