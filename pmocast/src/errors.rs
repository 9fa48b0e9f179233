use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CastError {
    #[error("Cannot connect to receiver {0}: {1}")]
    Connection(String, String),
    #[error("Cannot launch receiver application {0}: {1}")]
    Launch(String, String),
    #[error("Receiver command '{0}' failed: {1}")]
    Command(String, String),
    #[error("Receiver operation '{0}' timed out")]
    Timeout(String),
    #[error("No receiver session is active")]
    NoSession,
    #[error("Discovery Error: {0}")]
    Discovery(String),
    #[error("Receiver link closed while waiting for '{0}'")]
    Channel(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CastError {
    pub fn connection(address: &str, message: impl ToString) -> Self {
        CastError::Connection(address.to_string(), message.to_string())
    }

    pub fn launch(app_id: &str, message: impl ToString) -> Self {
        CastError::Launch(app_id.to_string(), message.to_string())
    }

    pub fn command(command: &str, message: impl ToString) -> Self {
        CastError::Command(command.to_string(), message.to_string())
    }

    pub fn timeout(operation: &str) -> Self {
        CastError::Timeout(operation.to_string())
    }

    pub fn channel(operation: &str) -> Self {
        CastError::Channel(operation.to_string())
    }
}
