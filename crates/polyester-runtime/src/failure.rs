// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Converts raised signals, panics and startup failures into reportable
//! [`ExecutionResult`]s.
//!
//! Every failure carries three renderings:
//! - a single-line summary such as `Exception("Failure!")` or `ProcessExit(1)`
//! - a textual traceback starting with `Traceback:`
//! - a JSON [`RemoteError`] that a caller can decode back into a typed error

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::function::{Raised, UserException};
use crate::registry::StartupError;
use crate::types::{ExecutionResult, FunctionDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised by user code while handling an input
    User,
    /// User code asked the process to exit
    ProcessExit,
    /// Target module could not be loaded
    Import,
    /// Target reference or module layout is unusable
    Invalid,
    Internal,
}

/// Serialized form of a failure, reconstructable by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RemoteError {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// `TypeName(arg, ...)` with arguments rendered as JSON.
    pub fn summary(&self) -> String {
        let args: Vec<String> = self.args.iter().map(Value::to_string).collect();
        format!("{}({})", self.type_name, args.join(", "))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Where user code was running when it raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub qualname: String,
    pub input_id: Option<String>,
}

impl CallSite {
    pub fn new(qualname: impl Into<String>, input_id: Option<&str>) -> Self {
        Self {
            qualname: qualname.into(),
            input_id: input_id.map(str::to_string),
        }
    }

    fn frame(&self) -> String {
        match &self.input_id {
            Some(id) => format!("  at {} (input {id})", self.qualname),
            None => format!("  at {}", self.qualname),
        }
    }
}

fn traceback(head: &[String], exc_line: &str) -> String {
    let mut out = String::from("Traceback:\n");
    for line in head {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(exc_line);
    out
}

fn report(error: RemoteError, frames: Vec<String>) -> Result<ExecutionResult> {
    let tb = traceback(&frames, &error.to_string());
    Ok(ExecutionResult::failure(
        error.summary(),
        tb,
        error.to_bytes()?,
    ))
}

fn user_frames(site: &CallSite, exc: &UserException) -> Vec<String> {
    std::iter::once(site.frame())
        .chain(exc.frames.iter().map(|f| format!("  at {f}")))
        .collect()
}

/// Classify a raised signal into a FAILURE result.
///
/// [`Raised::Interrupt`] is never captured: it comes back as
/// [`RuntimeError::Interrupted`] so the caller's `?` carries it out of the
/// runtime.
pub fn classify(raised: Raised, site: &CallSite) -> Result<ExecutionResult> {
    match raised {
        Raised::Interrupt => Err(RuntimeError::Interrupted),
        Raised::Exit(code) => report(
            RemoteError {
                kind: ErrorKind::ProcessExit,
                type_name: "ProcessExit".to_string(),
                message: format!("process exited with code {code}"),
                args: vec![Value::from(code)],
            },
            vec![site.frame()],
        ),
        Raised::Exception(exc) => {
            let frames = user_frames(site, &exc);
            report(
                RemoteError {
                    kind: ErrorKind::User,
                    message: exc.message(),
                    type_name: exc.type_name,
                    args: exc.args,
                },
                frames,
            )
        }
    }
}

/// Classify a failure that happened before any input was fetched.
///
/// Load failures keep the raised exception's own type under the `Import`
/// kind; failures while constructing or entering a class instance are user
/// failures. Everything else is `Invalid`.
pub fn classify_startup(err: &StartupError, def: &FunctionDefinition) -> Result<ExecutionResult> {
    let mut frames = vec![format!("  while loading {}", def.qualified_name())];
    let error = match err {
        StartupError::LoadFailed { raised, .. } | StartupError::Lifecycle { raised, .. } => {
            let kind = match err {
                StartupError::LoadFailed { .. } => ErrorKind::Import,
                _ => ErrorKind::User,
            };
            match raised {
                Raised::Interrupt => return Err(RuntimeError::Interrupted),
                Raised::Exit(code) => RemoteError {
                    kind: ErrorKind::ProcessExit,
                    type_name: "ProcessExit".to_string(),
                    message: format!("process exited with code {code}"),
                    args: vec![Value::from(*code)],
                },
                Raised::Exception(exc) => {
                    frames.push(format!("  {err}"));
                    frames.extend(exc.frames.iter().map(|f| format!("  at {f}")));
                    RemoteError {
                        kind,
                        type_name: exc.type_name.clone(),
                        message: exc.message(),
                        args: exc.args.clone(),
                    }
                }
            }
        }
        StartupError::ModuleNotFound(_) => RemoteError {
            kind: ErrorKind::Import,
            type_name: "ImportError".to_string(),
            message: err.to_string(),
            args: vec![Value::String(err.to_string())],
        },
        _ => RemoteError {
            kind: ErrorKind::Invalid,
            type_name: "InvalidError".to_string(),
            message: err.to_string(),
            args: vec![Value::String(err.to_string())],
        },
    };
    if let Some(hint) = err.hint() {
        frames.push(format!("  hint: {hint}"));
    }
    report(error, frames)
}

/// Turn a caught panic payload into a user exception of type `panic`.
pub(crate) fn panic_to_raised(payload: Box<dyn Any + Send>) -> Raised {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    };
    Raised::exception("panic", message)
}
