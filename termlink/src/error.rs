use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManagerError {
    #[error("Name and key not defined")]
    NameKey,

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Command error ({0})")]
    Command(String),

    #[error("Sensor error: '{key}' ({details})")]
    Sensor { key: String, details: String },

    #[error("Host {0} is offline")]
    Offline(String),

    #[error("Connection failed ({0})")]
    Connect(String),

    #[error("Authentication failed ({0})")]
    Authentication(String),

    #[error("Execution failed ({0})")]
    Execution(String),

    #[error("Timeout during command")]
    Timeout,

    #[error("Not allowed to turn off")]
    TurnOffForbidden,
}

impl ManagerError {
    pub fn sensor(key: &str, details: impl Into<String>) -> Self {
        ManagerError::Sensor {
            key: key.to_string(),
            details: details.into(),
        }
    }

    /// True for session-establishment failures, authentication included.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            ManagerError::Connect(_) | ManagerError::Authentication(_)
        )
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, ManagerError::Execution(_))
    }

    pub fn is_command(&self) -> bool {
        matches!(self, ManagerError::Command(_))
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
