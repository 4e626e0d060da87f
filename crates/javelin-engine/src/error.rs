//! Error taxonomy for the engine
//!
//! Two families of failure exist side by side: engine-level errors
//! ([`JitError`], [`VmError`]) that surface to the embedder as `Result`s, and
//! Java-visible throwables ([`JavaThrowable`]) that are dispatched through the
//! exception runtime like any user `throw`.

use std::sync::Arc;

/// The Java-visible exception classes the core engine can raise itself.
///
/// User code can of course throw anything; these are the kinds that inline
/// checks, the patcher, and the runtime builtins construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JavaKind {
    NullPointerException,
    ArithmeticException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    ClassCastException,
    NegativeArraySizeException,
    IllegalMonitorStateException,
    InterruptedException,
    NoSuchFieldError,
    NoSuchMethodError,
    NoClassDefFoundError,
    IncompatibleClassChangeError,
    AbstractMethodError,
    UnsatisfiedLinkError,
    StackOverflowError,
    OutOfMemoryError,
    InternalError,
}

impl JavaKind {
    /// Binary class name of the exception, in constant-pool form.
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::IllegalMonitorStateException => "java/lang/IllegalMonitorStateException",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::NoSuchFieldError => "java/lang/NoSuchFieldError",
            Self::NoSuchMethodError => "java/lang/NoSuchMethodError",
            Self::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            Self::IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError",
            Self::AbstractMethodError => "java/lang/AbstractMethodError",
            Self::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
            Self::StackOverflowError => "java/lang/StackOverflowError",
            Self::OutOfMemoryError => "java/lang/OutOfMemoryError",
            Self::InternalError => "java/lang/InternalError",
        }
    }
}

/// A throwable constructed by the engine itself.
///
/// The runtime materializes these as heap objects before dispatch; until then
/// they travel as plain data.
#[derive(Debug, Clone)]
pub struct JavaThrowable {
    /// Which exception class to instantiate.
    pub kind: JavaKind,
    /// Optional detail message.
    pub message: Option<Arc<str>>,
}

impl JavaThrowable {
    /// A throwable with no detail message.
    pub fn new(kind: JavaKind) -> Self {
        JavaThrowable { kind, message: None }
    }

    /// A throwable carrying a detail message.
    pub fn with_message(kind: JavaKind, message: impl Into<Arc<str>>) -> Self {
        JavaThrowable {
            kind,
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for JavaThrowable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.kind.class_name(), msg),
            None => write!(f, "{}", self.kind.class_name()),
        }
    }
}

/// Errors from the compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("Parse error at pc {pc}: {reason}")]
    Parse { pc: u32, reason: String },
    #[error("Stack analysis error at pc {pc}: {reason}")]
    Analysis { pc: u32, reason: String },
    #[error("Codegen error: {0}")]
    Codegen(String),
    #[error("Code heap exhausted requesting {0} bytes")]
    CodeHeapExhausted(usize),
    #[error("Method has no bytecode and no native binding")]
    NoCode,
    #[error("Linkage failure during compilation: {0}")]
    Linkage(JavaThrowable),
}

impl JitError {
    /// Map a compile failure onto the Java throwable the caller must raise.
    pub fn to_throwable(&self) -> JavaThrowable {
        match self {
            JitError::CodeHeapExhausted(_) => JavaThrowable::new(JavaKind::OutOfMemoryError),
            JitError::Linkage(t) => t.clone(),
            other => JavaThrowable::with_message(JavaKind::InternalError, other.to_string()),
        }
    }
}

/// Errors from VM bring-up and teardown
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM already initialized")]
    AlreadyInitialized,
    #[error("Code heap reservation failed: {0}")]
    CodeHeap(String),
    #[error("JIT error: {0}")]
    Jit(#[from] JitError),
}
