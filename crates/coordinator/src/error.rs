use derive_more::Display;
use error_stack::Report;
use utils::{ShmError, SyncError};

/// Errors reported by the turn coordinator.
#[derive(Debug, Clone, Display)]
pub enum CoordinatorError {
    /// The game region does not exist (yet).
    #[display("game region not found")]
    NotFound,
    /// The game region could not be created or mapped.
    #[display("failed to set up the game region")]
    Allocation,
    /// Caller passed something that can never be valid.
    #[display("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    /// No connected, active, solvent player is left to take a turn.
    #[display("no eligible player to take the turn")]
    NoActivePlayers,
    #[display("player {player} acted out of turn, current player is {current}")]
    NotYourTurn { player: usize, current: usize },
    #[display("game is not in progress")]
    NotPlaying,
    #[display("game is over")]
    GameOver,
    #[display("all {capacity} seats are taken")]
    GameFull { capacity: usize },
    /// A process-shared primitive failed; the shared state is suspect.
    #[display("shared state environment failure")]
    Environment,
    #[display("score persistence failed")]
    Persistence,
}

impl core::error::Error for CoordinatorError {}

impl CoordinatorError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Whether the caller can carry on (retry, pause, report) after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound
            | Self::NoActivePlayers
            | Self::NotYourTurn { .. }
            | Self::NotPlaying
            | Self::GameOver
            | Self::GameFull { .. }
            | Self::Persistence => true,
            Self::Allocation | Self::InvalidArgument { .. } | Self::Environment => false,
        }
    }
}

pub(crate) fn sync_report(err: SyncError) -> Report<CoordinatorError> {
    let context = match &err {
        SyncError::Uninitialised { primitive } => CoordinatorError::invalid_argument(format!(
            "{primitive} is not in an initialised region"
        )),
        SyncError::Os { .. } => CoordinatorError::Environment,
    };
    Report::new(err).change_context(context)
}

pub(crate) fn region_report(err: ShmError) -> Report<CoordinatorError> {
    let context = match &err {
        ShmError::NotFound { .. } | ShmError::NotReady { .. } => CoordinatorError::NotFound,
        ShmError::InvalidName(name) => {
            CoordinatorError::invalid_argument(format!("bad region name {name:?}"))
        }
        ShmError::Sync(SyncError::Os { .. }) => CoordinatorError::Environment,
        _ => CoordinatorError::Allocation,
    };
    Report::new(err).change_context(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_recovery_policy() {
        assert!(CoordinatorError::NotFound.is_recoverable());
        assert!(CoordinatorError::NoActivePlayers.is_recoverable());
        assert!(!CoordinatorError::Environment.is_recoverable());
        assert!(!CoordinatorError::Allocation.is_recoverable());
        let bad_id = CoordinatorError::invalid_argument("player 9");
        assert!(!bad_id.is_recoverable());
    }

    #[test]
    fn missing_region_maps_to_not_found() {
        let report = region_report(ShmError::NotFound {
            name: "nowhere".to_string(),
        });
        assert!(matches!(
            report.current_context(),
            CoordinatorError::NotFound
        ));
    }

    #[test]
    fn os_failure_maps_to_environment() {
        let report = sync_report(SyncError::Os {
            op: "pthread_mutex_lock",
            source: std::io::Error::other("lock failed"),
        });
        assert!(matches!(
            report.current_context(),
            CoordinatorError::Environment
        ));
    }
}
