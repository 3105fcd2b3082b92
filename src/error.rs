//! Error types for the MinnowVPN tunnel extension

use thiserror::Error;

/// Main error type for the tunnel extension
#[derive(Error, Debug)]
pub enum ExtensionError {
    /// Settings or interface name rejected
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle misuse (turn on twice, reassert while off, ...)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The WireGuard engine refused an operation
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The host packet channel failed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Settings parsing and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid settings format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid interface name {name:?}: {reason}")]
    InvalidInterfaceName { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session already configured on {interface}; turn it off first")]
    AlreadyConfigured { interface: String },

    #[error("No session is configured")]
    NotConfigured,

    #[error("No packet flow has been attached")]
    NoPacketFlow,

    #[error("Controller has been shut down")]
    Terminated,
}

/// Errors reported by the WireGuard engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to create interface {interface}: {reason}")]
    CreateFailed { interface: String, reason: String },

    #[error("Reassert failed: {reason}")]
    ReassertFailed { reason: String },

    #[error("Packet rejected by engine: {reason}")]
    SendFailed { reason: String },

    #[error("Engine interface is closed")]
    Closed,
}

/// Host packet channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to create packet channel: {reason}")]
    CreateFailed { reason: String },

    #[error("Packet read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("Packet write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Packet channel closed by host")]
    Closed,

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Transport message errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Session expired")]
    SessionExpired,
}

impl ExtensionError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Channel(ChannelError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./minnowvpn-extension"
                    .to_string();
                #[cfg(target_os = "macos")]
                return "Insufficient privileges. Run with sudo:\n  \
                        sudo ./minnowvpn-extension -c config.conf"
                    .to_string();
                #[cfg(target_os = "windows")]
                return "Insufficient privileges. Run as Administrator.".to_string();
                #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
                return format!("{}", self);
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Settings file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in settings. Expected a 32-byte key (base64 or hex).",
                    field
                )
            }

            Self::Session(SessionError::AlreadyConfigured { interface }) => {
                format!(
                    "A tunnel is already running on {}.\n  Turn it off before starting another.",
                    interface
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if the caller can recover by retrying with corrected input or state
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(ConfigError::Io(_)) => false,
            Self::Config(_) => true,
            Self::Session(SessionError::Terminated) => false,
            Self::Session(_) => true,

            Self::Engine(EngineError::ReassertFailed { .. }) => true,
            Self::Engine(EngineError::SendFailed { .. }) => true,
            Self::Engine(_) => false,

            // A broken host channel ends the session; the host decides on restart
            Self::Channel(_) => false,

            Self::Protocol(ProtocolError::ReplayDetected { .. }) => true,
            Self::Crypto(CryptoError::Decryption) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Channel(ChannelError::InsufficientPrivileges { .. }) => 2,
            Self::Session(_) => 3,
            Self::Engine(_) => 4,
            Self::Channel(_) => 5,
            Self::Crypto(_) | Self::Protocol(_) => 6,
        }
    }
}

/// Result type alias for extension operations
pub type Result<T> = std::result::Result<T, ExtensionError>;
