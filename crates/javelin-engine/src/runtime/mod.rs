//! Runtime support for compiled code
//!
//! The single VM handle owns the class registry, the code map, the heap
//! interface, the thread list, and the generated runtime stubs. Everything
//! else in this module is the machinery compiled code leans on at run time:
//! monitors, exception dispatch, the builtin table, and thread suspension.

pub mod builtins;
pub mod exceptions;
pub mod monitor;
pub mod object;
pub mod sync;
pub mod threads;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::classfile::class::{Class, ClassBuilder};
use crate::classfile::method::Method;
use crate::classfile::registry::ClassRegistry;
use crate::error::{JavaKind, JavaThrowable, JitError, VmError};
use crate::jit::codemap::CodeMap;
use crate::jit::stubs::{self, Stubs};
use crate::jit::target::x86_64::Backend;
use crate::jit::target::RuntimeAnchors;
use crate::jit::stats::CompileStats;
use crate::options::VmOptions;
use builtins::BuiltinTable;
use object::{Heap, ObjectHeader};
use threads::ThreadList;

/// The JNI environment pointer handed to native-call stubs.
#[repr(C)]
pub struct JniEnv {
    pub vm: std::sync::atomic::AtomicPtr<Vm>,
}

unsafe impl Send for JniEnv {}
unsafe impl Sync for JniEnv {}

/// The VM singleton.
pub struct Vm {
    options: VmOptions,
    registry: ClassRegistry,
    code_map: CodeMap,
    compiler_lock: ReentrantMutex<()>,
    heap: Heap,
    threads: Arc<ThreadList>,
    backend: Backend,
    builtins: BuiltinTable,
    stubs: Stubs,
    anchors: OnceCell<RuntimeAnchors>,
    stats: CompileStats,
    /// Bytes handed out from the code heap, against the configured limit.
    code_bytes: AtomicUsize,
    /// Exception objects back to their construction data, for diagnostics.
    exception_info: DashMap<usize, JavaThrowable>,
    /// Interned string literals.
    interned: DashMap<String, usize>,
    /// Code objects owned by stubs without a method (compile stubs).
    stub_codes: parking_lot::Mutex<Vec<Arc<crate::jit::code::Code>>>,
    jni_env: Box<JniEnv>,
}

unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

static VM: OnceCell<Vm> = OnceCell::new();

impl Vm {
    /// Bring the VM up. Fails if called twice.
    pub fn init(options: VmOptions) -> Result<&'static Vm, VmError> {
        let code_map = CodeMap::new();
        let stubs = Stubs::generate(
            &code_map,
            exceptions::handle_exception as usize,
            crate::jit::patcher::patcher_entry as usize,
            builtins_take_pending_addr(),
            set_pending_uncaught as usize,
        )?;

        let vm = Vm {
            heap: Heap::new(usize::MAX / 2),
            registry: ClassRegistry::new(),
            compiler_lock: ReentrantMutex::new(()),
            threads: Arc::new(ThreadList::new()),
            backend: Backend::new(),
            builtins: BuiltinTable::new(),
            anchors: OnceCell::new(),
            stats: CompileStats::new(),
            code_bytes: AtomicUsize::new(0),
            exception_info: DashMap::new(),
            interned: DashMap::new(),
            stub_codes: parking_lot::Mutex::new(Vec::new()),
            jni_env: Box::new(JniEnv {
                vm: std::sync::atomic::AtomicPtr::new(std::ptr::null_mut()),
            }),
            code_map,
            stubs,
            options,
        };

        VM.set(vm).map_err(|_| VmError::AlreadyInitialized)?;
        let vm = VM.get().expect("just set");

        let anchors = RuntimeAnchors {
            throw_builtin: builtins::bi_throw as usize,
            exception_trampoline: vm.stubs.exception_trampoline,
            patcher_wrapper: vm.stubs.patcher_wrapper,
            builtins: vm.builtins,
        };
        let _ = vm.anchors.set(anchors);
        vm.jni_env
            .vm
            .store(vm as *const Vm as *mut Vm, Ordering::Release);

        vm.bootstrap_classes();
        debug!("VM initialized");
        Ok(vm)
    }

    /// The singleton. Panics before `init`.
    pub fn get() -> &'static Vm {
        VM.get().expect("VM not initialized")
    }

    /// `init` for tests and embedders that share one process-wide VM.
    pub fn get_or_init() -> &'static Vm {
        match VM.get() {
            Some(vm) => vm,
            None => match Vm::init(VmOptions::default()) {
                Ok(vm) => vm,
                Err(VmError::AlreadyInitialized) => Vm::get(),
                Err(e) => panic!("VM init failed: {}", e),
            },
        }
    }

    fn bootstrap_classes(&self) {
        let object = self.registry.define(ClassBuilder::new("java/lang/Object"));
        let throwable = self
            .registry
            .define(ClassBuilder::new("java/lang/Throwable").super_class(object.clone()));
        for kind in [
            JavaKind::NullPointerException,
            JavaKind::ArithmeticException,
            JavaKind::ArrayIndexOutOfBoundsException,
            JavaKind::ArrayStoreException,
            JavaKind::ClassCastException,
            JavaKind::NegativeArraySizeException,
            JavaKind::IllegalMonitorStateException,
            JavaKind::InterruptedException,
            JavaKind::NoSuchFieldError,
            JavaKind::NoSuchMethodError,
            JavaKind::NoClassDefFoundError,
            JavaKind::IncompatibleClassChangeError,
            JavaKind::AbstractMethodError,
            JavaKind::UnsatisfiedLinkError,
            JavaKind::StackOverflowError,
            JavaKind::OutOfMemoryError,
            JavaKind::InternalError,
        ] {
            self.registry.define(
                ClassBuilder::new(kind.class_name()).super_class(throwable.clone()),
            );
        }
        self.registry
            .define(ClassBuilder::new("java/lang/String").super_class(object));
    }

    // ===== Accessors =====

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn code_map(&self) -> &CodeMap {
        &self.code_map
    }

    pub fn compiler_lock(&self) -> &ReentrantMutex<()> {
        &self.compiler_lock
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn threads(&self) -> &Arc<ThreadList> {
        &self.threads
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn stubs(&self) -> &Stubs {
        &self.stubs
    }

    pub fn anchors(&self) -> &RuntimeAnchors {
        self.anchors.get().expect("anchors set at init")
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    pub fn jni_env_addr(&self) -> usize {
        &*self.jni_env as *const JniEnv as usize
    }

    // ===== Class lifecycle =====

    /// Loader entry: define a class and prepare its dispatch machinery.
    pub fn define_class(&self, builder: ClassBuilder) -> Arc<Class> {
        let class = self.registry.define(builder);
        self.prepare_class(&class);
        class
    }

    /// Create the class mirror and the lazy-compile stubs for its methods.
    /// Idempotent.
    pub fn ensure_prepared(&self, class: &Arc<Class>) {
        self.prepare_class(class);
    }

    fn prepare_class(&self, class: &Arc<Class>) {
        if class.mirror() == 0 {
            if let Ok(mirror) = self.heap.alloc_object(class) {
                class.set_mirror(mirror as usize);
            }
        }
        for method in &class.methods {
            if method.is_abstract() || method.stubroutine() != 0 {
                continue;
            }
            match stubs::make_compile_stub(
                method,
                crate::jit::driver::compile_request as usize,
                &self.threads.critical_sections,
            ) {
                Ok((entry, code)) => {
                    method.set_stubroutine(entry);
                    self.stub_codes.lock().push(code);
                    class.update_dispatch_entries(method, method.callable_address().unwrap_or(0));
                }
                Err(e) => debug!(method = %method.name, error = %e, "stub creation failed"),
            }
        }
    }

    /// Unload a class: retire its compiled code and drop it from the
    /// registry.
    pub fn unload_class(&self, name: &str) -> bool {
        let Some(class) = self.registry.remove(name) else {
            return false;
        };
        for method in &class.methods {
            if let Some(code) = method.code() {
                self.code_map.remove(&code);
            }
            method.clear_code();
        }
        true
    }

    // ===== Compilation =====

    /// Compile a method (idempotent) and return its entry point.
    pub fn compile(&self, method: &Arc<Method>) -> Result<usize, JitError> {
        crate::jit::driver::compile(self, method)
    }

    pub(crate) fn charge_code_heap(&self, bytes: usize) -> Result<(), JitError> {
        let prior = self.code_bytes.fetch_add(bytes, Ordering::Relaxed);
        if prior + bytes > self.options.code_heap_limit {
            self.code_bytes.fetch_sub(bytes, Ordering::Relaxed);
            return Err(JitError::CodeHeapExhausted(bytes));
        }
        Ok(())
    }

    // ===== Calling in =====

    /// Call a compiled entry point through the call-in stub.
    pub fn call(&self, entry: usize, args: &CallArgs) -> Result<CallResult, JavaThrowable> {
        let t = self.threads.attach();
        debug_assert!(!t.has_pending());
        let f: extern "C" fn(usize, *const u64, *const f64, *mut u64) =
            unsafe { std::mem::transmute(self.stubs.vm_call) };
        let mut out = [0u64; 2];
        f(entry, args.ints.as_ptr(), args.floats.as_ptr(), out.as_mut_ptr());
        if let Some((xptr, _)) = t.take_pending() {
            return Err(self.describe_exception(xptr));
        }
        Ok(CallResult {
            int: out[0],
            float_bits: out[1],
        })
    }

    /// Compile a method and call it in one step.
    pub fn run(&self, method: &Arc<Method>, args: &CallArgs) -> Result<CallResult, JavaThrowable> {
        let entry = self.compile(method).map_err(|e| e.to_throwable())?;
        self.call(entry, args)
    }

    // ===== Exceptions & strings =====

    /// Materialize an engine throwable as a heap object.
    pub fn throwable_object(
        &self,
        throwable: &JavaThrowable,
    ) -> Result<*mut ObjectHeader, JavaThrowable> {
        let class = self
            .registry
            .lookup(throwable.kind.class_name())
            .or_else(|| self.registry.lookup("java/lang/Object"))
            .ok_or_else(|| JavaThrowable::new(JavaKind::InternalError))?;
        let obj = self.heap.alloc_object(&class)?;
        self.exception_info.insert(obj as usize, throwable.clone());
        Ok(obj)
    }

    /// Park a throwable on the current thread for the rethrow path.
    pub fn set_pending_throwable(&self, throwable: JavaThrowable, xpc: usize) {
        let t = self.threads.attach();
        match self.throwable_object(&throwable) {
            Ok(obj) => t.set_pending(obj as usize, xpc),
            Err(oom) => {
                // Allocation failed while raising; raise the OOM instead.
                if let Ok(obj) = self.throwable_object(&oom) {
                    t.set_pending(obj as usize, xpc);
                } else {
                    eprintln!("out of memory raising {}", throwable);
                    std::process::abort();
                }
            }
        }
    }

    /// The construction data of an engine-thrown exception object.
    pub fn describe_exception(&self, xptr: usize) -> JavaThrowable {
        self.exception_info
            .get(&xptr)
            .map(|e| e.clone())
            .unwrap_or_else(|| {
                let class = unsafe { (*(xptr as *const ObjectHeader)).class() };
                JavaThrowable::with_message(JavaKind::InternalError, class.name.to_string())
            })
    }

    /// Interned string object for a literal.
    pub fn intern_string(&self, s: &str) -> Result<*mut ObjectHeader, JavaThrowable> {
        if let Some(obj) = self.interned.get(s) {
            return Ok(*obj as *mut ObjectHeader);
        }
        let class = self
            .registry
            .lookup("java/lang/String")
            .ok_or_else(|| JavaThrowable::new(JavaKind::InternalError))?;
        let obj = self.heap.alloc_object(&class)?;
        self.interned.insert(s.to_string(), obj as usize);
        Ok(obj)
    }
}

fn builtins_take_pending_addr() -> usize {
    BuiltinTable::new().take_pending
}

/// Handler target of the call-in stub's catch-all row: record the exception
/// and resume the stub's epilogue with a zero result.
pub extern "C" fn set_pending_uncaught(xptr: usize) -> usize {
    let vm = Vm::get();
    let t = vm.threads().attach();
    t.set_pending(xptr, 0);
    0
}

/// Argument pack for [`Vm::call`], laid out the way the call-in stub loads
/// registers.
#[derive(Debug, Clone)]
pub struct CallArgs {
    ints: [u64; 6],
    floats: [f64; 8],
    ni: usize,
    nf: usize,
}

impl CallArgs {
    pub fn new() -> Self {
        CallArgs {
            ints: [0; 6],
            floats: [0.0; 8],
            ni: 0,
            nf: 0,
        }
    }

    pub fn int(mut self, v: i32) -> Self {
        self.ints[self.ni] = v as i64 as u64;
        self.ni += 1;
        self
    }

    pub fn long(mut self, v: i64) -> Self {
        self.ints[self.ni] = v as u64;
        self.ni += 1;
        self
    }

    pub fn obj(mut self, ptr: usize) -> Self {
        self.ints[self.ni] = ptr as u64;
        self.ni += 1;
        self
    }

    pub fn float(mut self, v: f32) -> Self {
        // The callee reads the low 32 bits of the register.
        self.floats[self.nf] = f64::from_bits(v.to_bits() as u64);
        self.nf += 1;
        self
    }

    pub fn double(mut self, v: f64) -> Self {
        self.floats[self.nf] = v;
        self.nf += 1;
        self
    }
}

impl Default for CallArgs {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw return values of a call; interpret by the method's descriptor.
#[derive(Debug, Clone, Copy)]
pub struct CallResult {
    int: u64,
    float_bits: u64,
}

impl CallResult {
    pub fn as_i32(&self) -> i32 {
        self.int as i32
    }

    pub fn as_i64(&self) -> i64 {
        self.int as i64
    }

    pub fn as_obj(&self) -> usize {
        self.int as usize
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.float_bits as u32)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.float_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_args_layout() {
        let args = CallArgs::new().int(-1).long(7).float(1.5).double(2.5);
        assert_eq!(args.ints[0], u64::MAX);
        assert_eq!(args.ints[1], 7);
        assert_eq!(args.floats[0].to_bits() as u32, 1.5f32.to_bits());
        assert_eq!(args.floats[1], 2.5);
    }

    #[test]
    fn test_call_result_views() {
        let r = CallResult {
            int: (-5i64) as u64,
            float_bits: 2.5f64.to_bits(),
        };
        assert_eq!(r.as_i32(), -5);
        assert_eq!(r.as_i64(), -5);
        assert_eq!(r.as_f64(), 2.5);
    }
}
