//! Process-wide VM options
//!
//! The core has no command-line surface; the embedder fills this structure
//! and hands it to [`crate::runtime::Vm::init`].

/// Configuration for the VM core
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Upper bound on total machine-code bytes the code heap may hand out.
    pub code_heap_limit: usize,
    /// Initial capacity of the growable machine-code buffer per compile.
    pub initial_mcode_capacity: usize,
    /// Size of the stack guard zone assumed when classifying faults in a
    /// prologue range as StackOverflowError.
    pub stack_guard_size: usize,
    /// Log each compiled method at debug level (name, code size).
    pub verbose_compile: bool,
    /// Suspend signal number used by signal-driven stop-the-world builds.
    /// Retained for configuration compatibility; the cooperative checkpoint
    /// protocol does not deliver it.
    pub suspend_signal: i32,
    /// Resume signal number, see `suspend_signal`.
    pub resume_signal: i32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            code_heap_limit: 64 * 1024 * 1024,
            initial_mcode_capacity: 1024,
            stack_guard_size: 16 * 1024,
            verbose_compile: false,
            suspend_signal: libc_signals::SUSPEND,
            resume_signal: libc_signals::RESUME,
        }
    }
}

#[cfg(unix)]
mod libc_signals {
    pub const SUSPEND: i32 = libc::SIGUSR1;
    pub const RESUME: i32 = libc::SIGUSR2;
}

#[cfg(not(unix))]
mod libc_signals {
    pub const SUSPEND: i32 = 10;
    pub const RESUME: i32 = 12;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = VmOptions::default();
        assert!(opts.code_heap_limit > 0);
        assert!(opts.initial_mcode_capacity >= 64);
        assert_ne!(opts.suspend_signal, opts.resume_signal);
    }
}
