//! Javelin JVM core engine
//!
//! This crate provides the hard-engineering heart of the VM:
//! - **Classfile model**: the loaded classes, methods, and constant pools
//!   the out-of-scope parser delivers (`classfile` module)
//! - **JIT**: the method-at-a-time compilation pipeline from bytecode to
//!   published native code (`jit` module)
//! - **Runtime**: monitors, exception dispatch, thread suspension, and the
//!   builtins compiled code calls back into (`runtime` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use javelin_engine::{ClassBuilder, CallArgs, Vm, VmOptions};
//!
//! let vm = Vm::init(VmOptions::default()).unwrap();
//! let class = vm.define_class(
//!     ClassBuilder::new("Demo").method(add_method), // bytecode from the loader
//! );
//! let add = class.lookup_method("add", "(II)I").unwrap();
//! let result = vm.run(&add, &CallArgs::new().int(2).int(3)).unwrap();
//! assert_eq!(result.as_i32(), 5);
//! ```

#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Loaded-class data model: classes, methods, descriptors, constant pools
pub mod classfile;

/// Error taxonomy: engine errors and Java-visible throwables
pub mod error;

/// The JIT compilation pipeline
pub mod jit;

/// Process-wide options
pub mod options;

/// Runtime support: monitors, threads, exceptions, builtins
pub mod runtime;

// ============================================================================
// Re-exports
// ============================================================================

pub use classfile::{
    Class, ClassBuilder, ClassFlags, ClassRegistry, Constant, ConstantPool, ExceptionTableEntry,
    FieldFlags, JavaType, LineNumberEntry, Method, MethodDescriptor, MethodFlags, ValueType,
};
pub use error::{JavaKind, JavaThrowable, JitError, VmError};
pub use jit::stats::StatsSnapshot;
pub use options::VmOptions;
pub use runtime::{CallArgs, CallResult, Vm};
