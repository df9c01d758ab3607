use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Malformed volume curve, unusable configuration file, nothing enabled…
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No codec of {0} is accepted by the renderer")]
    NoMatchingFormat(String),
    #[error("Renderer {0} is off or not controlled by the host")]
    DeviceOff(String),
    #[error("Renderer {0} has no current URI to play")]
    NoCurrentUri(String),
    #[error("Unknown or vanished device {0}")]
    UnknownDevice(String),
    #[error("Device table is full ({0} renderers)")]
    TableFull(usize),
    #[error("Renderer {0} does not expose a {1} service")]
    MissingService(String, String),
    #[error("Action {action} failed with UPnP error {code}")]
    Action { action: String, code: i32 },
    #[error("Invalid renderer description: {0}")]
    Description(String),
    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),
    #[error("Renderer {0} ignored: {1}")]
    Ignored(String, String),
    #[error("Host refused renderer {0}: {1}")]
    HostRefused(String, String),
    /// Background threads could not be started.
    #[error("Gateway startup failed: {0}")]
    Startup(String),
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config(message.into())
    }

    pub fn action_failed(action: &str, code: i32) -> Self {
        BridgeError::Action {
            action: action.to_string(),
            code,
        }
    }

    pub fn missing_service(renderer: &str, service: &str) -> Self {
        BridgeError::MissingService(renderer.to_string(), service.to_string())
    }

    /// Errors the host should see as a plain command failure, without any
    /// consequence on the device itself.
    pub fn is_command_rejection(&self) -> bool {
        matches!(
            self,
            BridgeError::NoMatchingFormat(_)
                | BridgeError::DeviceOff(_)
                | BridgeError::NoCurrentUri(_)
        )
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Config(format!("{err:#}"))
    }
}
