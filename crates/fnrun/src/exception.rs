//! # Exception Translation
//!
//! Classifies a failure raised while dispatching a call as originating in
//! user code or in the platform, and turns it into the uniform [`Error`]
//! envelope.
//!
//! ## Failure shapes
//!
//! A member body reports failures as [`Thrown`]: either an ordinary
//! [`Exception`] (the user's own error type, with frames) or a platform
//! [`Error`] it re-raised, typically one it received from a downstream call.
//! The dispatch machinery wraps that in [`Failure::Target`]. Anything that
//! goes wrong *before* the body runs (bad arguments, wrong receiver type)
//! arrives as [`Failure::Dispatch`].
//!
//! ## Translation rules
//!
//! 1. `Dispatch` is a platform failure: `InternalSystemError`, trace kept.
//! 2. `Target(Exception)` is a user failure: `UserFunctionException` with
//!    dispatch frames filtered out of the trace.
//! 3. `Target(Platform)` carrying `UserFunctionException` is a user failure
//!    re-raised across a hop: the earlier chain is kept and this hop's frames
//!    are appended after it.
//! 4. `Target(Platform)` with any other code is a platform failure.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::error::Error;
use crate::error::ErrorCode;
use crate::error::ModuleCode;
use crate::error::truncate;

/// Default cap on translated error messages, in bytes.
pub const MAX_MESSAGE_LEN: usize = 10000;

/// Default cap on frames carried by a translated error.
pub const MAX_STACK_FRAMES: usize = 64;

/// One frame of a call stack.
///
/// `line_number` is negative when unknown.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: String,
    pub line_number: i64,
}

static FRAME_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*at\s+(?:(?P<class>[^\s()]+)\.)?(?P<method>[^\s.()]+)\((?P<location>[^()]*)\)\s*$")
        .expect("frame pattern compiles")
});

impl StackFrame {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        file_name: impl Into<String>,
        line_number: i64,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: file_name.into(),
            line_number,
        }
    }

    /// Frame naming a class member when no source position is known.
    pub fn synthetic(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self::new(class_name, method_name, "", -1)
    }

    /// Parses one `at pkg.Class.method(File.java:12)` line.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = FRAME_LINE.captures(line)?;
        let class_name = caps.name("class").map(|m| m.as_str()).unwrap_or_default();
        let method_name = caps.name("method")?.as_str();
        let location = caps.name("location")?.as_str();

        let (file, line_number) = match location.rsplit_once(':') {
            Some((file, number)) => match number.parse::<i64>() {
                Ok(number) => (file, number),
                Err(_) => (location, -1),
            },
            None => (location, -1),
        };
        let file = match file {
            "Unknown Source" | "Native Method" => "",
            other => other.strip_prefix("./").unwrap_or(other),
        };
        Some(Self::new(class_name, method_name, file, line_number))
    }
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.class_name.is_empty() {
            write!(f, "{}", self.method_name)?;
        } else {
            write!(f, "{}.{}", self.class_name, self.method_name)?;
        }
        match (self.file_name.is_empty(), self.line_number >= 0) {
            (true, _) => write!(f, "(Unknown Source)"),
            (false, true) => write!(f, "({}:{})", self.file_name, self.line_number),
            (false, false) => write!(f, "({})", self.file_name),
        }
    }
}

/// Parses a printed stack trace into frames.
///
/// Header lines, `Caused by:` sections and `... N more` markers are skipped;
/// frames of every section are returned in the order they appear.
pub fn parse_printed_trace(text: &str) -> Vec<StackFrame> {
    text.lines().filter_map(StackFrame::parse).collect()
}

/// Drops frames without a class name and repeated frames, keeping order.
pub fn dedup_frames(frames: impl IntoIterator<Item = StackFrame>) -> Vec<StackFrame> {
    let mut seen = HashSet::new();
    frames
        .into_iter()
        .filter(|frame| !frame.class_name.is_empty())
        .filter(|frame| seen.insert(frame.clone()))
        .collect()
}

/// A user-level exception raised by a member body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    class_name: String,
    message: String,
    frames: Vec<StackFrame>,
    cause: Option<Box<Exception>>,
}

impl Exception {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn at(mut self, frame: StackFrame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn with_frames(mut self, frames: impl IntoIterator<Item = StackFrame>) -> Self {
        self.frames.extend(frames);
        self
    }

    pub fn caused_by(mut self, cause: Exception) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Rebuilds an exception from its printed form.
    ///
    /// The first line is `type: message`; `Caused by:` sections become the
    /// cause chain.
    pub fn from_printed(text: &str) -> Option<Self> {
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(header) = trimmed.strip_prefix("Caused by:") {
                sections.push((header.trim().to_string(), Vec::new()));
            } else if sections.is_empty() {
                sections.push((trimmed.to_string(), Vec::new()));
            } else if let Some((_, lines)) = sections.last_mut() {
                lines.push(line.to_string());
            }
        }

        let mut exception: Option<Exception> = None;
        for (header, lines) in sections.into_iter().rev() {
            let (class_name, message) = match header.split_once(':') {
                Some((class_name, message)) => (class_name.trim(), message.trim()),
                None => (header.as_str(), ""),
            };
            let mut current =
                Exception::new(class_name, message).with_frames(lines.iter().filter_map(|l| StackFrame::parse(l)));
            if let Some(cause) = exception.take() {
                current = current.caused_by(cause);
            }
            exception = Some(current);
        }
        exception
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }

    /// Frames of this exception followed by those of its causes.
    pub fn all_frames(&self) -> Vec<StackFrame> {
        let mut frames = self.frames.clone();
        let mut cause = self.cause.as_deref();
        while let Some(next) = cause {
            frames.extend(next.frames.iter().cloned());
            cause = next.cause.as_deref();
        }
        frames
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.class_name)
        } else {
            write!(f, "{}: {}", self.class_name, self.message)
        }
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// What a member body raises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Thrown {
    Exception(Exception),
    /// A platform error re-raised by user code, plus the frames of the
    /// current hop that it passed through.
    Platform { error: Error, frames: Vec<StackFrame> },
}

impl Thrown {
    pub fn platform(error: Error) -> Self {
        Self::Platform {
            error,
            frames: Vec::new(),
        }
    }

    /// Records that the failure propagated through `frame`.
    pub fn at(self, frame: StackFrame) -> Self {
        match self {
            Self::Exception(exception) => Self::Exception(exception.at(frame)),
            Self::Platform { error, mut frames } => {
                frames.push(frame);
                Self::Platform { error, frames }
            }
        }
    }
}

impl From<Exception> for Thrown {
    fn from(exception: Exception) -> Self {
        Self::Exception(exception)
    }
}

impl From<Error> for Thrown {
    fn from(error: Error) -> Self {
        Self::platform(error)
    }
}

/// A failure observed by the dispatch machinery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Dispatch failed before or around the body; the body never ran or its
    /// outcome is unknown.
    Dispatch(Error),
    /// The body ran and raised.
    Target(Thrown),
}

impl From<Thrown> for Failure {
    fn from(thrown: Thrown) -> Self {
        Self::Target(thrown)
    }
}

/// Exception type recorded for a member body that panicked.
pub const PANIC_EXCEPTION: &str = "panic";

/// Runs a member body, turning a panic into a raised [`Exception`].
///
/// A panicking body is a user failure like any other throw.
pub(crate) fn catch_panic<R>(body: impl FnOnce() -> Result<R, Failure>) -> Result<R, Failure> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::warn!(%message, "member body panicked");
        Err(Failure::Target(Thrown::Exception(Exception::new(PANIC_EXCEPTION, message))))
    })
}

/// Turns dispatch failures into error envelopes.
#[derive(Clone, Debug)]
pub struct ExceptionTranslator {
    runtime_id: String,
    dispatch_prefixes: Vec<String>,
    max_message_len: usize,
    max_frames: usize,
}

impl ExceptionTranslator {
    pub fn new(runtime_id: impl Into<String>) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            dispatch_prefixes: vec![format!("{}::", env!("CARGO_PKG_NAME"))],
            max_message_len: MAX_MESSAGE_LEN,
            max_frames: MAX_STACK_FRAMES,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            runtime_id: config.runtime_id.clone(),
            dispatch_prefixes: config.dispatch_frame_prefixes.clone(),
            max_message_len: config.max_message_len,
            max_frames: config.max_stack_frames,
        }
    }

    pub fn with_dispatch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dispatch_prefixes.push(prefix.into());
        self
    }

    pub fn with_limits(mut self, max_message_len: usize, max_frames: usize) -> Self {
        self.max_message_len = max_message_len;
        self.max_frames = max_frames;
        self
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Translates a failure of `class_name.function_name` during invocation.
    pub fn translate(&self, failure: &Failure, class_name: &str, function_name: &str) -> Error {
        self.translate_in(ModuleCode::RuntimeInvoke, failure, class_name, function_name)
    }

    pub fn translate_in(
        &self,
        module: ModuleCode,
        failure: &Failure,
        class_name: &str,
        function_name: &str,
    ) -> Error {
        let error = match failure {
            Failure::Dispatch(error) => self.platform(module, error),
            Failure::Target(Thrown::Exception(exception)) => {
                let frames = self.user_frames(exception.all_frames(), class_name, function_name);
                self.user(module, &exception.to_string(), frames)
            }
            Failure::Target(Thrown::Platform { error, frames })
                if error.code() == ErrorCode::UserFunctionException =>
            {
                let mut merged = error.stack_trace().to_vec();
                merged.extend(self.user_frames(frames.clone(), class_name, function_name));
                self.user(module, error.message(), merged)
            }
            Failure::Target(Thrown::Platform { error, .. }) => self.platform(module, error),
        };
        tracing::debug!(
            class = class_name,
            function = function_name,
            code = %error.code(),
            kind = ?error.kind(),
            "translated dispatch failure"
        );
        error
    }

    fn user(&self, module: ModuleCode, throwable: &str, frames: Vec<StackFrame>) -> Error {
        let message = format!(
            "exception occurred when processing user code, runtimeId: {}, throwable: {}",
            self.runtime_id, throwable
        );
        Error::new(
            ErrorCode::UserFunctionException,
            module,
            truncate(&message, self.max_message_len),
        )
        .with_stack_trace(self.bound(frames))
    }

    fn platform(&self, module: ModuleCode, error: &Error) -> Error {
        let message = match error.code() {
            ErrorCode::InternalSystemError => error.message().to_string(),
            code => format!("{}: {}", code, error.message()),
        };
        Error::internal(module, truncate(&message, self.max_message_len))
            .with_stack_trace(self.bound(error.stack_trace().to_vec()))
    }

    /// Keeps the frames of the user's call chain.
    ///
    /// Frames belonging to the dispatch machinery are removed. When the user
    /// entry point itself is missing from the chain a synthetic frame for it is
    /// appended so the trace always names the declaring class and function.
    fn user_frames(&self, frames: Vec<StackFrame>, class_name: &str, function_name: &str) -> Vec<StackFrame> {
        let mut kept: Vec<StackFrame> = dedup_frames(frames)
            .into_iter()
            .filter(|frame| !self.is_dispatch_frame(frame))
            .collect();
        let has_entry = kept
            .iter()
            .any(|frame| frame.class_name == class_name && frame.method_name == function_name);
        if !has_entry && !class_name.is_empty() {
            kept.push(StackFrame::synthetic(class_name, function_name));
        }
        kept
    }

    fn is_dispatch_frame(&self, frame: &StackFrame) -> bool {
        self.dispatch_prefixes
            .iter()
            .any(|prefix| frame.class_name.starts_with(prefix.as_str()))
    }

    fn bound(&self, mut frames: Vec<StackFrame>) -> Vec<StackFrame> {
        frames.truncate(self.max_frames);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
java.lang.IllegalStateException: outer
\tat com.acme.Service.handle(Service.java:42)
\tat fnrun::lifecycle.dispatch(lifecycle.rs:10)
Caused by: java.lang.IndexOutOfBoundsException: Index 5 out of bounds for length 2
\tat com.acme.Store.get(Store.java:7)
\tat main.run(./main.go:19)
\tat com.acme.Native.call(Native Method)
\t... 3 more
";

    #[test]
    fn test_parse_frame_line() {
        let frame = StackFrame::parse("\tat com.acme.Store.get(Store.java:7)").expect("frame");
        assert_eq!(frame, StackFrame::new("com.acme.Store", "get", "Store.java", 7));

        let frame = StackFrame::parse("at com.acme.Store.<init>(Unknown Source)").expect("frame");
        assert_eq!(frame.method_name, "<init>");
        assert_eq!(frame.file_name, "");
        assert_eq!(frame.line_number, -1);

        assert!(StackFrame::parse("java.lang.RuntimeException: boom").is_none());
        assert!(StackFrame::parse("\t... 3 more").is_none());
    }

    #[test]
    fn test_parse_printed_trace_strips_relative_prefix() {
        let frames = parse_printed_trace(TRACE);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[3], StackFrame::new("main", "run", "main.go", 19));
    }

    #[test]
    fn test_dedup_frames_keeps_order() {
        let a = StackFrame::new("A", "f", "A.java", 1);
        let b = StackFrame::new("B", "g", "B.java", 2);
        let anonymous = StackFrame::new("", "h", "", -1);
        let frames = dedup_frames(vec![a.clone(), anonymous, b.clone(), a.clone()]);
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn test_exception_from_printed() {
        let exception = Exception::from_printed(TRACE).expect("exception");
        assert_eq!(exception.class_name(), "java.lang.IllegalStateException");
        assert_eq!(exception.message(), "outer");
        assert_eq!(exception.frames().len(), 2);

        let cause = exception.cause().expect("cause");
        assert_eq!(cause.class_name(), "java.lang.IndexOutOfBoundsException");
        assert_eq!(cause.frames().len(), 3);
        assert_eq!(exception.all_frames().len(), 5);
    }

    #[test]
    fn test_user_exception_classification() {
        let translator = ExceptionTranslator::new("rt-1");
        let thrown = Exception::new("java.lang.IndexOutOfBoundsException", "Index 5")
            .at(StackFrame::new("com.acme.Store", "get", "Store.java", 7))
            .at(StackFrame::new("fnrun::lifecycle", "dispatch", "lifecycle.rs", 1));

        let error = translator.translate(&Failure::Target(thrown.into()), "com.acme.Store", "get");
        assert_eq!(error.code(), ErrorCode::UserFunctionException);
        assert!(error.message().contains("runtimeId: rt-1"));
        assert!(error.message().contains("IndexOutOfBoundsException"));
        assert_eq!(
            error.stack_trace(),
            &[StackFrame::new("com.acme.Store", "get", "Store.java", 7)]
        );
    }

    #[test]
    fn test_missing_entry_frame_is_synthesized() {
        let translator = ExceptionTranslator::new("rt-1");
        let thrown = Exception::new("Boom", "");
        let error = translator.translate(&Failure::Target(thrown.into()), "com.acme.A", "run");
        assert_eq!(error.stack_trace(), &[StackFrame::synthetic("com.acme.A", "run")]);
    }

    #[test]
    fn test_dispatch_failure_is_internal() {
        let translator = ExceptionTranslator::new("rt-1");
        let cause = Error::param_invalid(ModuleCode::RuntimeInvoke, "expected 2 arguments, got 1");
        let error = translator.translate(&Failure::Dispatch(cause), "A", "f");
        assert_eq!(error.code(), ErrorCode::InternalSystemError);
        assert!(error.message().contains("ERR_PARAM_INVALID"));
        assert!(!error.is_user());
    }

    #[test]
    fn test_reraised_platform_error_passes_through_as_internal() {
        let translator = ExceptionTranslator::new("rt-1");
        let downstream = Error::instance_not_found("abc");
        let error = translator.translate(&Failure::Target(Thrown::platform(downstream)), "A", "f");
        assert_eq!(error.code(), ErrorCode::InternalSystemError);
    }

    #[test]
    fn test_multi_hop_merge_is_chronological() {
        let translator = ExceptionTranslator::new("rt-1");
        let c_frame = StackFrame::new("C", "leaf", "C.java", 3);
        let b_frame = StackFrame::new("B", "middle", "B.java", 2);
        let a_frame = StackFrame::new("A", "top", "A.java", 1);

        let at_c = translator.translate(
            &Failure::Target(Exception::new("Boom", "leaf failed").at(c_frame.clone()).into()),
            "C",
            "leaf",
        );
        let at_b = translator.translate(
            &Failure::Target(Thrown::platform(at_c).at(b_frame.clone())),
            "B",
            "middle",
        );
        let at_a = translator.translate(
            &Failure::Target(Thrown::platform(at_b).at(a_frame.clone())),
            "A",
            "top",
        );

        assert_eq!(at_a.code(), ErrorCode::UserFunctionException);
        assert_eq!(at_a.stack_trace(), &[c_frame, b_frame, a_frame]);
        assert!(at_a.message().contains("leaf failed"));
    }

    #[test]
    fn test_limits_bound_message_and_frames() {
        let translator = ExceptionTranslator::new("rt-1").with_limits(64, 2);
        let thrown = Exception::new("Boom", "x".repeat(500))
            .at(StackFrame::new("A", "a", "A.java", 1))
            .at(StackFrame::new("B", "b", "B.java", 2))
            .at(StackFrame::new("C", "c", "C.java", 3));
        let error = translator.translate(&Failure::Target(thrown.into()), "A", "a");
        assert!(error.message().len() <= 64);
        assert_eq!(error.stack_trace().len(), 2);
    }
}
