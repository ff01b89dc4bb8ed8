use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

const ENOSPC: i32 = 28;
const EDQUOT: i32 = 122;

/// The closed set of failures a client can observe.
///
/// Providers must map every backend failure onto one of these kinds. Anything
/// they cannot classify travels as `Unknown` and is seen by clients as
/// `LocalComms`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    // Transport
    #[error("RemoteCommsError: {0}")]
    RemoteComms(String),

    #[error("LocalCommsError: {0}")]
    LocalComms(String),

    // Items
    #[error("NotExistsError: {message} (key = {key})")]
    NotExists { message: String, key: String },

    #[error("ExistsError: {message} (native_identity = {native_identity}, name = {name})")]
    Exists {
        message: String,
        native_identity: String,
        name: String,
    },

    #[error("ConflictError: {0}")]
    Conflict(String),

    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // Caller misuse
    #[error("LogicError: {0}")]
    Logic(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    // Backend resources
    #[error("ResourceError: {message} (error code = {code})")]
    Resource { message: String, code: i32 },

    #[error("QuotaExceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Provider-side wrapper for failures outside the taxonomy
    #[error("UnknownError: {0}")]
    Unknown(String),

    // Client only
    #[error("RuntimeDestroyed: {0}")]
    RuntimeDestroyed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Discriminant of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RemoteComms,
    LocalComms,
    NotExists,
    Exists,
    Conflict,
    PermissionDenied,
    Cancelled,
    Logic,
    InvalidArgument,
    Resource,
    QuotaExceeded,
    Unauthorized,
    Unknown,
    RuntimeDestroyed,
}

impl ErrorKind {
    /// Name used for this kind in RPC error replies.
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::RemoteComms => "RemoteCommsException",
            ErrorKind::LocalComms => "LocalCommsException",
            ErrorKind::NotExists => "NotExistsException",
            ErrorKind::Exists => "ExistsException",
            ErrorKind::Conflict => "ConflictException",
            ErrorKind::PermissionDenied => "PermissionException",
            ErrorKind::Cancelled => "CancelledException",
            ErrorKind::Logic => "LogicException",
            ErrorKind::InvalidArgument => "InvalidArgumentException",
            ErrorKind::Resource => "ResourceException",
            ErrorKind::QuotaExceeded => "QuotaException",
            ErrorKind::Unauthorized => "UnauthorizedException",
            ErrorKind::Unknown => "UnknownException",
            ErrorKind::RuntimeDestroyed => "RuntimeDestroyedException",
        }
    }

    /// Kinds a provider may legitimately send. `RuntimeDestroyed` never
    /// crosses the wire.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let kind = match name {
            "RemoteCommsException" => ErrorKind::RemoteComms,
            "LocalCommsException" => ErrorKind::LocalComms,
            "NotExistsException" => ErrorKind::NotExists,
            "ExistsException" => ErrorKind::Exists,
            "ConflictException" => ErrorKind::Conflict,
            "PermissionException" => ErrorKind::PermissionDenied,
            "CancelledException" => ErrorKind::Cancelled,
            "LogicException" => ErrorKind::Logic,
            "InvalidArgumentException" => ErrorKind::InvalidArgument,
            "ResourceException" => ErrorKind::Resource,
            "QuotaException" => ErrorKind::QuotaExceeded,
            "UnauthorizedException" => ErrorKind::Unauthorized,
            "UnknownException" => ErrorKind::Unknown,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl StorageError {
    pub fn not_exists(message: impl Into<String>, key: impl Into<String>) -> Self {
        StorageError::NotExists {
            message: message.into(),
            key: key.into(),
        }
    }

    pub fn exists(
        message: impl Into<String>,
        native_identity: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        StorageError::Exists {
            message: message.into(),
            native_identity: native_identity.into(),
            name: name.into(),
        }
    }

    pub fn resource(message: impl Into<String>, code: i32) -> Self {
        StorageError::Resource {
            message: message.into(),
            code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::RemoteComms(_) => ErrorKind::RemoteComms,
            StorageError::LocalComms(_) => ErrorKind::LocalComms,
            StorageError::NotExists { .. } => ErrorKind::NotExists,
            StorageError::Exists { .. } => ErrorKind::Exists,
            StorageError::Conflict(_) => ErrorKind::Conflict,
            StorageError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            StorageError::Cancelled(_) => ErrorKind::Cancelled,
            StorageError::Logic(_) => ErrorKind::Logic,
            StorageError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StorageError::Resource { .. } => ErrorKind::Resource,
            StorageError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            StorageError::Unauthorized(_) => ErrorKind::Unauthorized,
            StorageError::Unknown(_) => ErrorKind::Unknown,
            StorageError::RuntimeDestroyed(_) => ErrorKind::RuntimeDestroyed,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            StorageError::NotExists { message, .. }
            | StorageError::Exists { message, .. }
            | StorageError::Resource { message, .. } => message,
            StorageError::RemoteComms(m)
            | StorageError::LocalComms(m)
            | StorageError::Conflict(m)
            | StorageError::PermissionDenied(m)
            | StorageError::Cancelled(m)
            | StorageError::Logic(m)
            | StorageError::InvalidArgument(m)
            | StorageError::QuotaExceeded(m)
            | StorageError::Unauthorized(m)
            | StorageError::Unknown(m)
            | StorageError::RuntimeDestroyed(m) => m,
        }
    }

    /// Map an OS error raised while operating on `key`.
    pub fn from_io(err: &io::Error, context: &str, key: &str) -> Self {
        let message = format!("{context}: {err}");
        match err.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(message),
            io::ErrorKind::NotFound => StorageError::not_exists(message, key),
            io::ErrorKind::AlreadyExists => {
                let name = key.rsplit('/').next().unwrap_or(key);
                StorageError::exists(message, key, name)
            }
            _ => match err.raw_os_error() {
                Some(ENOSPC) | Some(EDQUOT) => StorageError::QuotaExceeded(message),
                Some(code) => StorageError::resource(message, code),
                None => StorageError::resource(message, -1),
            },
        }
    }
}

/// Serialized form of a [`StorageError`] carried by an RPC error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl WireError {
    fn bare(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            key: None,
            native_identity: None,
            item_name: None,
            code: None,
        }
    }

    /// Decode into the client-visible taxonomy.
    ///
    /// Unrecognized names, `UnknownException` and replies missing their
    /// required arguments all become `LocalComms`.
    pub fn into_storage_error(self) -> StorageError {
        let Some(kind) = ErrorKind::from_wire_name(&self.name) else {
            return StorageError::LocalComms(format!(
                "unknown exception name {}: {}",
                self.name, self.message
            ));
        };
        match kind {
            ErrorKind::RemoteComms => StorageError::RemoteComms(self.message),
            ErrorKind::LocalComms | ErrorKind::Unknown => StorageError::LocalComms(self.message),
            ErrorKind::NotExists => match self.key {
                Some(key) => StorageError::NotExists {
                    message: self.message,
                    key,
                },
                None => malformed(&self.name, &self.message, "key"),
            },
            ErrorKind::Exists => match (self.native_identity, self.item_name) {
                (Some(native_identity), Some(name)) => StorageError::Exists {
                    message: self.message,
                    native_identity,
                    name,
                },
                _ => malformed(&self.name, &self.message, "identity"),
            },
            ErrorKind::Conflict => StorageError::Conflict(self.message),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(self.message),
            ErrorKind::Cancelled => StorageError::Cancelled(self.message),
            ErrorKind::Logic => StorageError::Logic(self.message),
            ErrorKind::InvalidArgument => StorageError::InvalidArgument(self.message),
            ErrorKind::Resource => match self.code {
                Some(code) => StorageError::Resource {
                    message: self.message,
                    code,
                },
                None => malformed(&self.name, &self.message, "error code"),
            },
            ErrorKind::QuotaExceeded => StorageError::QuotaExceeded(self.message),
            ErrorKind::Unauthorized => StorageError::Unauthorized(self.message),
            ErrorKind::RuntimeDestroyed => StorageError::LocalComms(self.message),
        }
    }
}

fn malformed(name: &str, message: &str, what: &str) -> StorageError {
    StorageError::LocalComms(format!(
        "{name} reply is missing its {what} argument: {message}"
    ))
}

impl From<&StorageError> for WireError {
    fn from(err: &StorageError) -> Self {
        let mut wire = WireError::bare(err.kind().wire_name(), err.message());
        match err {
            StorageError::NotExists { key, .. } => wire.key = Some(key.clone()),
            StorageError::Exists {
                native_identity,
                name,
                ..
            } => {
                wire.native_identity = Some(native_identity.clone());
                wire.item_name = Some(name.clone());
            }
            StorageError::Resource { code, .. } => wire.code = Some(*code),
            _ => {}
        }
        wire
    }
}
