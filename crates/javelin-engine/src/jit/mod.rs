//! Method-at-a-time JIT compiler
//!
//! The pipeline turns a verified method's bytecode into published native
//! code:
//! - Bytecode decoding and basic-block splitting (`parser`)
//! - Typed IR over pseudo-variable slots (`ir`)
//! - Stack analysis: abstract stack simulation and interface slots (`stack`)
//! - Register allocation over per-class pools (`regalloc`)
//! - Per-target lowering behind a backend trait (`target`)
//! - Code artifacts with binary method headers (`code`), the PC -> code
//!   range tree (`codemap`), first-use patching (`patcher`), and the stub
//!   factory (`stubs`)
//! - The driver sequencing all of it under the compiler lock (`driver`)

pub mod code;
pub mod codemap;
pub mod driver;
pub mod ir;
pub mod opcode;
pub mod parser;
pub mod patcher;
pub mod regalloc;
pub mod stack;
pub mod stats;
pub mod stubs;
pub mod target;
