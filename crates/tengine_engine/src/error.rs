use tengine_plugins::{CapabilityError, PluginError};
use tengine_transfer::TransferId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transfer plugin {0} is not available")]
    PluginUnavailable(String),
    #[error(transparent)]
    Plugin(PluginError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("transfer {transfer_id}: {reason}")]
    InvalidTransition {
        transfer_id: TransferId,
        reason: String,
    },
    #[error("callback unavailable for transfer {transfer_id}: {reason}")]
    CallbackUnavailable {
        transfer_id: TransferId,
        reason: String,
    },
    #[error("transfer {0} not found")]
    NotFound(TransferId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transfer engine has stopped")]
    Stopped,
}

impl EngineError {
    pub(crate) fn transition(transfer_id: TransferId, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            transfer_id,
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<PluginError> for EngineError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Unavailable(plugin_id) => Self::PluginUnavailable(plugin_id),
            other => Self::Plugin(other),
        }
    }
}
