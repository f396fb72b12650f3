use rset_core::conditions::reasons;
use rset_inputs::ResolveError;

/// Reconcile failures, split by whether retrying can help.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    InvalidExpression(String),
    #[error("{0}")]
    InvalidConfiguration(String),
    #[error("{0}")]
    InvalidInputs(String),
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("{0}")]
    DependencyNotReady(String),
    #[error("{0}")]
    InputsFetch(String),
    #[error("{0}")]
    Apply(String),
    #[error("{0:#}")]
    Store(anyhow::Error),
}

impl ReconcileError {
    /// Terminal errors stall the object until its spec changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconcileError::InvalidExpression(_)
                | ReconcileError::InvalidConfiguration(_)
                | ReconcileError::InvalidInputs(_)
                | ReconcileError::BuildFailed(_)
        )
    }

    /// Condition reason reported for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::InvalidExpression(_) => reasons::INVALID_EXPRESSION,
            ReconcileError::InvalidConfiguration(_) => reasons::INVALID_CONFIGURATION,
            ReconcileError::InvalidInputs(_) => reasons::INVALID_INPUTS,
            ReconcileError::BuildFailed(_) => reasons::BUILD_FAILED,
            ReconcileError::DependencyNotReady(_) => reasons::DEPENDENCY_NOT_READY,
            ReconcileError::InputsFetch(_) => reasons::INPUTS_FETCH_FAILED,
            ReconcileError::Apply(_) | ReconcileError::Store(_) => reasons::FAILED,
        }
    }
}

impl From<ResolveError> for ReconcileError {
    fn from(err: ResolveError) -> Self {
        match &err {
            ResolveError::NotFound(_) | ResolveError::Fetch { .. } => ReconcileError::InputsFetch(err.to_string()),
            ResolveError::InvalidInputs { .. } => ReconcileError::InvalidInputs(err.to_string()),
            _ => ReconcileError::InvalidConfiguration(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        ReconcileError::Store(err)
    }
}
