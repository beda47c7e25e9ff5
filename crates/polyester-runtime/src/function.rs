// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User-supplied callables and the values they exchange with the runtime.
//!
//! A callable takes [`FunctionArgs`] (the decoded `[args, kwargs]` payload)
//! and either returns a value, resolves a future, or yields a stream of
//! values, depending on its [`ExecutionShape`]. Anything other than a value is
//! reported through [`Raised`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use polyester_protocol::api_proto::FunctionType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;

/// How a callable produces its result for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionShape {
    /// Synchronous call, one result
    Plain,
    /// Awaited call, one result
    Async,
    /// Ordered, finite sequence of results
    Generator,
}

impl fmt::Display for ExecutionShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionShape::Plain => "plain",
            ExecutionShape::Async => "async",
            ExecutionShape::Generator => "generator",
        })
    }
}

impl TryFrom<FunctionType> for ExecutionShape {
    type Error = RuntimeError;

    fn try_from(value: FunctionType) -> Result<Self, RuntimeError> {
        match value {
            FunctionType::Function => Ok(ExecutionShape::Plain),
            FunctionType::Async => Ok(ExecutionShape::Async),
            FunctionType::Generator => Ok(ExecutionShape::Generator),
            FunctionType::Unspecified => Err(RuntimeError::Invalid(
                "function type is unspecified".to_string(),
            )),
        }
    }
}

impl From<ExecutionShape> for FunctionType {
    fn from(shape: ExecutionShape) -> Self {
        match shape {
            ExecutionShape::Plain => FunctionType::Function,
            ExecutionShape::Async => FunctionType::Async,
            ExecutionShape::Generator => FunctionType::Generator,
        }
    }
}

/// Positional and keyword arguments for one input.
///
/// On the wire this is the JSON pair `[args, kwargs]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Vec<Value>, Map<String, Value>)", into = "(Vec<Value>, Map<String, Value>)")]
pub struct FunctionArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl From<(Vec<Value>, Map<String, Value>)> for FunctionArgs {
    fn from((args, kwargs): (Vec<Value>, Map<String, Value>)) -> Self {
        Self { args, kwargs }
    }
}

impl From<FunctionArgs> for (Vec<Value>, Map<String, Value>) {
    fn from(value: FunctionArgs) -> Self {
        (value.args, value.kwargs)
    }
}

impl FunctionArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Positional argument `index`, decoded as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, Raised> {
        let value = self.args.get(index).ok_or_else(|| {
            Raised::exception(
                "TypeError",
                format!("missing required positional argument {index}"),
            )
        })?;
        T::deserialize(value)
            .map_err(|e| Raised::exception("TypeError", format!("argument {index}: {e}")))
    }

    /// Keyword argument `name`, decoded as `T`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Raised> {
        self.kwargs
            .get(name)
            .map(|value| {
                T::deserialize(value)
                    .map_err(|e| Raised::exception("TypeError", format!("argument '{name}': {e}")))
            })
            .transpose()
    }
}

/// An exception raised by user code.
#[derive(Debug, Clone, PartialEq)]
pub struct UserException {
    pub type_name: String,
    pub args: Vec<Value>,
    /// Innermost-last call frames, as recorded by the raiser.
    pub frames: Vec<String>,
}

impl UserException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_args(type_name, vec![Value::String(message.into())])
    }

    pub fn with_args(type_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            type_name: type_name.into(),
            args,
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Human-readable message: a lone string argument verbatim, otherwise
    /// the JSON rendering of the arguments.
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [Value::String(s)] => s.clone(),
            [single] => single.to_string(),
            many => Value::Array(many.to_vec()).to_string(),
        }
    }
}

/// Everything a callable can do instead of returning a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    /// Ordinary failure; reported and execution continues
    Exception(UserException),
    /// Deliberate process exit; reported with its code, execution continues
    Exit(i32),
    /// Operator abort; never reported, ends the container
    Interrupt,
}

impl Raised {
    pub fn exception(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Raised::Exception(UserException::new(type_name, message))
    }
}

impl From<UserException> for Raised {
    fn from(exc: UserException) -> Self {
        Raised::Exception(exc)
    }
}

impl<E: std::error::Error> From<E> for Raised {
    fn from(err: E) -> Self {
        let full = std::any::type_name::<E>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Raised::exception(short, err.to_string())
    }
}

/// Stream of values produced by a generator callable.
pub type ValueStream = BoxStream<'static, Result<Value, Raised>>;

type PlainFn = dyn Fn(FunctionArgs) -> Result<Value, Raised> + Send + Sync;
type AsyncFn = dyn Fn(FunctionArgs) -> BoxFuture<'static, Result<Value, Raised>> + Send + Sync;
type GeneratorFn = dyn Fn(FunctionArgs) -> ValueStream + Send + Sync;

/// A user callable with its execution shape.
#[derive(Clone)]
pub enum Callable {
    Plain(Arc<PlainFn>),
    Async(Arc<AsyncFn>),
    Generator(Arc<GeneratorFn>),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable::{}", self.shape())
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, Raised> {
    serde_json::to_value(value)
        .map_err(|e| Raised::exception("SerializationError", e.to_string()))
}

impl Callable {
    pub fn plain<F, T>(f: F) -> Self
    where
        F: Fn(FunctionArgs) -> Result<T, Raised> + Send + Sync + 'static,
        T: Serialize,
    {
        Callable::Plain(Arc::new(move |args| f(args).and_then(to_value)))
    }

    pub fn asynchronous<F, Fut, T>(f: F) -> Self
    where
        F: Fn(FunctionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Raised>> + Send + 'static,
        T: Serialize,
    {
        Callable::Async(Arc::new(move |args| {
            f(args).map(|r| r.and_then(to_value)).boxed()
        }))
    }

    pub fn generator<F, S, T>(f: F) -> Self
    where
        F: Fn(FunctionArgs) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, Raised>> + Send + 'static,
        T: Serialize,
    {
        Callable::Generator(Arc::new(move |args| {
            f(args).map(|r| r.and_then(to_value)).boxed()
        }))
    }

    /// Generator over a synchronous iterator.
    pub fn generator_iter<F, I, T>(f: F) -> Self
    where
        F: Fn(FunctionArgs) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Result<T, Raised>>,
        I::IntoIter: Send + 'static,
        T: Serialize,
    {
        Self::generator(move |args| futures::stream::iter(f(args)))
    }

    pub fn shape(&self) -> ExecutionShape {
        match self {
            Callable::Plain(_) => ExecutionShape::Plain,
            Callable::Async(_) => ExecutionShape::Async,
            Callable::Generator(_) => ExecutionShape::Generator,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_args_wire_format_is_pair() {
        let args = FunctionArgs::positional(vec![json!(42)]).with_kwarg("scale", json!(2));
        let bytes = args.to_bytes().unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap(),
            json!([[42], {"scale": 2}])
        );
        assert_eq!(FunctionArgs::from_bytes(&bytes).unwrap(), args);
    }

    #[test]
    fn test_arg_type_mismatch_raises_type_error() {
        let args = FunctionArgs::positional(vec![json!("x")]);
        let Err(Raised::Exception(exc)) = args.arg::<i64>(0) else {
            panic!("expected exception");
        };
        assert_eq!(exc.type_name, "TypeError");
        assert!(args.arg::<i64>(3).is_err());
    }

    #[test]
    fn test_kwarg_absent_is_none() {
        let args = FunctionArgs::default().with_kwarg("n", json!(3));
        assert_eq!(args.kwarg::<u32>("n").unwrap(), Some(3));
        assert_eq!(args.kwarg::<u32>("m").unwrap(), None);
    }

    #[test]
    fn test_exception_message_rendering() {
        assert_eq!(UserException::new("Exception", "bad").message(), "bad");
        let exc = UserException::with_args("ValueError", vec![json!(1), json!("two")]);
        assert_eq!(exc.message(), r#"[1,"two"]"#);
    }

    #[test]
    fn test_std_errors_convert_with_short_type_name() {
        let err = "abc".parse::<i32>().unwrap_err();
        let Raised::Exception(exc) = Raised::from(err) else {
            panic!("expected exception");
        };
        assert_eq!(exc.type_name, "ParseIntError");
    }

    #[test]
    fn test_shapes() {
        assert_eq!(
            Callable::plain(|_| Ok(1)).shape(),
            ExecutionShape::Plain
        );
        assert_eq!(
            Callable::asynchronous(|_| async { Ok(1) }).shape(),
            ExecutionShape::Async
        );
        assert_eq!(
            Callable::generator_iter(|_| vec![Ok(1)]).shape(),
            ExecutionShape::Generator
        );
        assert!(ExecutionShape::try_from(FunctionType::Unspecified).is_err());
    }
}
