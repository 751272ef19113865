//! # Error Envelope
//!
//! The uniform failure representation of the dispatch core. Resolution,
//! lifecycle, and execution failures all end up as an [`Error`] carrying a
//! platform code, the module that raised it, a bounded message, and (for
//! failures in user code) a reconstructed stack trace.
//!
//! Module-local error enums (`registry::Error`, `options::Error`, ...) convert
//! into this type so callers only ever match on one shape.

use serde::Deserialize;
use serde::Serialize;

use crate::exception::StackFrame;

/// Platform error codes.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    /// Malformed input to the core (negative retry counts, cleared handles, ...).
    ParamInvalid,
    /// Invocation against an unknown or terminated instance.
    InstanceNotFound,
    ClassNotFound,
    /// No member matches the requested name and signature.
    NotFound,
    /// An empty signature matched more than one overload.
    AmbiguousOverload,
    /// The invoked user code raised.
    UserFunctionException,
    /// Dispatch, reflection, or platform failure unrelated to user code.
    InternalSystemError,
    IncorrectInvokeUsage,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::ParamInvalid => 1001,
            Self::InstanceNotFound => 1003,
            Self::ClassNotFound => 1101,
            Self::NotFound => 1102,
            Self::AmbiguousOverload => 1103,
            Self::UserFunctionException => 2002,
            Self::InternalSystemError => 3003,
            Self::IncorrectInvokeUsage => 4008,
        }
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        let code = match code {
            0 => Self::Ok,
            1001 => Self::ParamInvalid,
            1003 => Self::InstanceNotFound,
            1101 => Self::ClassNotFound,
            1102 => Self::NotFound,
            1103 => Self::AmbiguousOverload,
            2002 => Self::UserFunctionException,
            3003 => Self::InternalSystemError,
            4008 => Self::IncorrectInvokeUsage,
            _ => return None,
        };
        Some(code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ERR_OK",
            Self::ParamInvalid => "ERR_PARAM_INVALID",
            Self::InstanceNotFound => "ERR_INSTANCE_NOT_FOUND",
            Self::ClassNotFound => "ERR_CLASS_NOT_FOUND",
            Self::NotFound => "ERR_FUNCTION_NOT_FOUND",
            Self::AmbiguousOverload => "ERR_AMBIGUOUS_OVERLOAD",
            Self::UserFunctionException => "ERR_USER_FUNCTION_EXCEPTION",
            Self::InternalSystemError => "ERR_INNER_SYSTEM_ERROR",
            Self::IncorrectInvokeUsage => "ERR_INCORRECT_INVOKE_USAGE",
        };
        write!(f, "{}({})", name, self.as_u32())
    }
}

/// The subsystem that raised an error.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleCode {
    Core,
    Runtime,
    RuntimeCreate,
    RuntimeInvoke,
    RuntimeKill,
    Datasystem,
}

impl ModuleCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Core => 10,
            Self::Runtime => 20,
            Self::RuntimeCreate => 21,
            Self::RuntimeInvoke => 22,
            Self::RuntimeKill => 23,
            Self::Datasystem => 30,
        }
    }
}

impl std::fmt::Display for ModuleCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Core => "core",
            Self::Runtime => "runtime",
            Self::RuntimeCreate => "runtime-create",
            Self::RuntimeInvoke => "runtime-invoke",
            Self::RuntimeKill => "runtime-kill",
            Self::Datasystem => "datasystem",
        };
        write!(f, "{}({})", name, self.as_u32())
    }
}

/// Whether a failure came from the user's code or from the platform.
///
/// Retry policy keys off this: user failures are never retried, internal
/// failures may be retried when the call is idempotent.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Internal,
}

/// Uniform error envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    code: ErrorCode,
    module: ModuleCode,
    message: String,
    stack_trace: Vec<StackFrame>,
}

/// The envelope handed to callers when an invocation fails.
pub type ErrorEnvelope = Error;

impl Error {
    pub fn new(code: ErrorCode, module: ModuleCode, message: impl Into<String>) -> Self {
        Self {
            code,
            module,
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn param_invalid(module: ModuleCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParamInvalid, module, message)
    }

    pub fn internal(module: ModuleCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalSystemError, module, message)
    }

    pub fn instance_not_found(instance_id: &str) -> Self {
        let message = if instance_id.is_empty() {
            "instance handle has been cleared".to_string()
        } else {
            format!("instance '{}' not found", instance_id)
        };
        Self::new(ErrorCode::InstanceNotFound, ModuleCode::RuntimeInvoke, message)
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<StackFrame>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn module(&self) -> ModuleCode {
        self.module
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack_trace
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            ErrorCode::UserFunctionException => ErrorKind::User,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_user(&self) -> bool {
        self.kind() == ErrorKind::User
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in {}: {}", self.code, self.module, self.message)?;
        for frame in &self.stack_trace {
            write!(f, "\n\tat {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Cuts `text` to at most `max` bytes without splitting a character.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
