use thiserror::Error;

/// Why a coordinator verb failed. None of these are fatal: the coordinator
/// keeps running and the caller may simply try again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// The link never reported itself up.
    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("{action} rejected: {reason}")]
    ActionRejected { action: &'static str, reason: String },

    #[error("offboard transition failed: {0}")]
    OffboardTransitionFailure(String),

    #[error("velocity command not delivered: {0}")]
    CommandSendFailure(String),

    #[error("coordinator stopped")]
    Stopped,
}

impl CoordinatorError {
    pub(crate) fn rejected(action: &'static str, err: &anyhow::Error) -> Self {
        Self::ActionRejected { action, reason: format!("{:#}", err) }
    }
}
