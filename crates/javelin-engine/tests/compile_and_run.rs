//! End-to-end: compile bytecode and execute the generated code.
//!
//! All tests share the process-wide VM; class names are unique per test.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::Arc;

use javelin_engine::classfile::constant_pool::{Constant, ConstantPool, FieldRef, MethodRef};
use javelin_engine::classfile::class::ClassBuilder;
use javelin_engine::classfile::constant_pool::ClassRef;
use javelin_engine::runtime::object::array_data;
use javelin_engine::{
    CallArgs, ExceptionTableEntry, JavaKind, JavaType, Method, MethodDescriptor, MethodFlags, Vm,
};

fn vm() -> &'static Vm {
    let _ = tracing_subscriber::fmt::try_init();
    Vm::get_or_init()
}

fn static_method(name: &str, desc: &str, code: Vec<u8>, pool: ConstantPool) -> Method {
    static_method_ex(name, desc, code, pool, vec![], MethodFlags::STATIC)
}

fn static_method_ex(
    name: &str,
    desc: &str,
    code: Vec<u8>,
    pool: ConstantPool,
    ex: Vec<ExceptionTableEntry>,
    flags: MethodFlags,
) -> Method {
    Method::new(
        name,
        desc,
        MethodDescriptor::parse(desc).unwrap(),
        flags | MethodFlags::PUBLIC,
        16,
        16,
        code.into_boxed_slice(),
        ex,
        vec![],
        Arc::new(pool),
    )
}

/// Define a single-method class and return the method.
fn define(class: &str, method: Method) -> Arc<Method> {
    let name = method.name.clone();
    let desc = method.desc.clone();
    let c = vm().define_class(ClassBuilder::new(class).method(method));
    c.lookup_method(&name, &desc).unwrap()
}

#[test]
fn test_static_add() {
    let m = define(
        "t/Add",
        static_method("add", "(II)I", vec![0x1a, 0x1b, 0x60, 0xac], ConstantPool::new()),
    );
    let r = vm().run(&m, &CallArgs::new().int(2).int(3)).unwrap();
    assert_eq!(r.as_i32(), 5);
    // Wrapping add, per JVM int semantics.
    let r = vm()
        .run(&m, &CallArgs::new().int(2147483646).int(3))
        .unwrap();
    assert_eq!(r.as_i32(), -2147483647);
}

#[test]
fn test_compile_idempotent() {
    let m = define(
        "t/Idem",
        static_method("f", "(I)I", vec![0x1a, 0x04, 0x60, 0xac], ConstantPool::new()),
    );
    let e1 = vm().compile(&m).unwrap();
    let e2 = vm().compile(&m).unwrap();
    assert_eq!(e1, e2);
}

#[test]
fn test_deterministic_code_bytes() {
    // Two identical methods compile to identical machine code.
    let make = |cls: &str| {
        define(
            cls,
            static_method(
                "f",
                "(II)I",
                vec![0x1a, 0x1b, 0x64, 0x05, 0x68, 0xac], // (a-b)*2
                ConstantPool::new(),
            ),
        )
    };
    let m1 = make("t/DetA");
    let m2 = make("t/DetB");
    vm().compile(&m1).unwrap();
    vm().compile(&m2).unwrap();
    let c1 = m1.code().unwrap();
    let c2 = m2.code().unwrap();
    let (s1, e1) = c1.code_range();
    let (s2, e2) = c2.code_range();
    assert_eq!(e1 - s1, e2 - s2);
    let b1 = unsafe { std::slice::from_raw_parts(s1 as *const u8, e1 - s1) };
    let b2 = unsafe { std::slice::from_raw_parts(s2 as *const u8, e2 - s2) };
    assert_eq!(b1, b2);
}

#[test]
fn test_loop_sum() {
    // int s = 0; for (int i = 1; i <= n; i++) s += i; return s;
    let code = vec![
        0x03, // 0: iconst_0
        0x3c, // 1: istore_1     (s)
        0x04, // 2: iconst_1
        0x3d, // 3: istore_2     (i)
        0x1c, // 4: iload_2      loop:
        0x1a, // 5: iload_0
        0xa3, 0x00, 0x0d, // 6: if_icmpgt +13 -> 19
        0x1b, // 9: iload_1
        0x1c, // 10: iload_2
        0x60, // 11: iadd
        0x3c, // 12: istore_1
        0x84, 0x02, 0x01, // 13: iinc 2, 1
        0xa7, 0xff, 0xf4, // 16: goto -12 -> 4
        0x1b, // 19: iload_1
        0xac, // 20: ireturn
    ];
    let m = define("t/Sum", static_method("sum", "(I)I", code, ConstantPool::new()));
    let r = vm().run(&m, &CallArgs::new().int(10)).unwrap();
    assert_eq!(r.as_i32(), 55);
    let r = vm().run(&m, &CallArgs::new().int(0)).unwrap();
    assert_eq!(r.as_i32(), 0);
    let r = vm().run(&m, &CallArgs::new().int(1000)).unwrap();
    assert_eq!(r.as_i32(), 500500);
}

#[test]
fn test_idiv_semantics() {
    let m = define(
        "t/Div",
        static_method("div", "(II)I", vec![0x1a, 0x1b, 0x6c, 0xac], ConstantPool::new()),
    );
    let r = vm().run(&m, &CallArgs::new().int(7).int(2)).unwrap();
    assert_eq!(r.as_i32(), 3);
    let r = vm().run(&m, &CallArgs::new().int(-7).int(2)).unwrap();
    assert_eq!(r.as_i32(), -3);
    // MIN / -1 is MIN, not a trap.
    let r = vm()
        .run(&m, &CallArgs::new().int(i32::MIN).int(-1))
        .unwrap();
    assert_eq!(r.as_i32(), i32::MIN);
    // Division by zero raises ArithmeticException.
    let err = vm().run(&m, &CallArgs::new().int(1).int(0)).unwrap_err();
    assert_eq!(err.kind, JavaKind::ArithmeticException);
}

#[test]
fn test_irem_semantics() {
    let m = define(
        "t/Rem",
        static_method("rem", "(II)I", vec![0x1a, 0x1b, 0x70, 0xac], ConstantPool::new()),
    );
    assert_eq!(vm().run(&m, &CallArgs::new().int(7).int(3)).unwrap().as_i32(), 1);
    assert_eq!(vm().run(&m, &CallArgs::new().int(-7).int(3)).unwrap().as_i32(), -1);
    assert_eq!(
        vm().run(&m, &CallArgs::new().int(i32::MIN).int(-1)).unwrap().as_i32(),
        0
    );
    let err = vm().run(&m, &CallArgs::new().int(1).int(0)).unwrap_err();
    assert_eq!(err.kind, JavaKind::ArithmeticException);
}

#[test]
fn test_long_arithmetic() {
    // return (a + b) * 3
    let mut pool = ConstantPool::new();
    let three = pool.push(Constant::Long(3));
    let code = vec![
        0x1e, // lload_0
        0x20, // lload_2
        0x61, // ladd
        0x14, 0x00, three as u8, // ldc2_w 3
        0x69, // lmul
        0xad, // lreturn
    ];
    let m = define("t/Long", static_method("f", "(JJ)J", code, pool));
    let r = vm()
        .run(&m, &CallArgs::new().long(1 << 40).long(7))
        .unwrap();
    assert_eq!(r.as_i64(), ((1i64 << 40) + 7) * 3);
}

#[test]
fn test_shifts() {
    // return (a << b) ^ (a >>> b) ^ (a >> b)
    let code = vec![
        0x1a, 0x1b, 0x78, // ishl
        0x1a, 0x1b, 0x7c, // iushr
        0x82, // ixor
        0x1a, 0x1b, 0x7a, // ishr
        0x82, // ixor
        0xac,
    ];
    let m = define("t/Shift", static_method("f", "(II)I", code, ConstantPool::new()));
    let a = -0x1234_5678i32;
    for b in [0, 1, 5, 31, 33] {
        let expect = (a << (b & 31)) ^ (((a as u32) >> (b & 31)) as i32) ^ (a >> (b & 31));
        let r = vm().run(&m, &CallArgs::new().int(a).int(b)).unwrap();
        assert_eq!(r.as_i32(), expect, "b={}", b);
    }
}

#[test]
fn test_f2i_clamping() {
    let m = define(
        "t/F2i",
        static_method("f", "(F)I", vec![0x22, 0x8b, 0xac], ConstantPool::new()),
    );
    let run = |v: f32| vm().run(&m, &CallArgs::new().float(v)).unwrap().as_i32();
    assert_eq!(run(12.9), 12);
    assert_eq!(run(-12.9), -12);
    assert_eq!(run(f32::NAN), 0);
    assert_eq!(run(f32::INFINITY), i32::MAX);
    assert_eq!(run(f32::NEG_INFINITY), i32::MIN);
    assert_eq!(run(1e20), i32::MAX);
}

#[test]
fn test_double_arithmetic_and_cmp() {
    // return a < b ? 1 : 0  via dcmpg
    let code = vec![
        0x26, // dload_0
        0x28, // dload_2
        0x98, // dcmpg
        0x9b, 0x00, 0x05, // iflt +5 -> 8
        0x03, // iconst_0
        0xac, // ireturn
        0x04, // 8: iconst_1
        0xac,
    ];
    let m = define("t/Dcmp", static_method("lt", "(DD)I", code, ConstantPool::new()));
    let run = |a: f64, b: f64| {
        vm().run(&m, &CallArgs::new().double(a).double(b))
            .unwrap()
            .as_i32()
    };
    assert_eq!(run(1.0, 2.0), 1);
    assert_eq!(run(2.0, 1.0), 0);
    assert_eq!(run(1.0, 1.0), 0);
    // dcmpg pushes +1 on NaN, so NaN is never "less".
    assert_eq!(run(f64::NAN, 1.0), 0);
}

#[test]
fn test_frem_builtin() {
    let m = define(
        "t/Frem",
        static_method("f", "(FF)F", vec![0x22, 0x23, 0x72, 0xae], ConstantPool::new()),
    );
    let r = vm()
        .run(&m, &CallArgs::new().float(5.5).float(2.0))
        .unwrap();
    assert_eq!(r.as_f32(), 1.5);
}

#[test]
fn test_array_load() {
    // static int f(int[] a, int i) { return a[i]; }
    let code = vec![0x2a, 0x1b, 0x2e, 0xac];
    let m = define("t/Arr", static_method("f", "([II)I", code, ConstantPool::new()));

    // Null array: NullPointerException.
    let err = vm().run(&m, &CallArgs::new().obj(0).int(0)).unwrap_err();
    assert_eq!(err.kind, JavaKind::NullPointerException);

    let arr_class = vm().registry().array_class("I");
    let arr = vm().heap().alloc_array(&arr_class, 4, 3).unwrap();
    unsafe {
        let data = array_data(arr) as *mut i32;
        *data.add(0) = 10;
        *data.add(1) = 20;
        *data.add(2) = 30;
    }

    let r = vm()
        .run(&m, &CallArgs::new().obj(arr as usize).int(1))
        .unwrap();
    assert_eq!(r.as_i32(), 20);

    // Out of range, including negative.
    for idx in [5, -1] {
        let err = vm()
            .run(&m, &CallArgs::new().obj(arr as usize).int(idx))
            .unwrap_err();
        assert_eq!(err.kind, JavaKind::ArrayIndexOutOfBoundsException, "idx={}", idx);
    }
}

#[test]
fn test_newarray_and_store() {
    // static int f(int n) { int[] a = new int[n]; a[0] = 42; return a[0] + a.length; }
    let code = vec![
        0x1a, // iload_0
        0xbc, 0x0a, // newarray int
        0x4c, // astore_1
        0x2b, // aload_1
        0x03, // iconst_0
        0x10, 0x2a, // bipush 42
        0x4f, // iastore
        0x2b, // aload_1
        0x03, // iconst_0
        0x2e, // iaload
        0x2b, // aload_1
        0xbe, // arraylength
        0x60, // iadd
        0xac, // ireturn
    ];
    let m = define("t/NewArr", static_method("f", "(I)I", code, ConstantPool::new()));
    let r = vm().run(&m, &CallArgs::new().int(5)).unwrap();
    assert_eq!(r.as_i32(), 47);

    // Negative size raises before any heap write.
    let err = vm().run(&m, &CallArgs::new().int(-1)).unwrap_err();
    assert_eq!(err.kind, JavaKind::NegativeArraySizeException);
}

#[test]
fn test_tableswitch() {
    // switch (x) { case 1: return 11; case 2: return 22; default: return -1; }
    // tableswitch at pc 1, operands 4-aligned from pc 4.
    let base = 1i32;
    let mut c = vec![0x1a, 0xaa, 0x00, 0x00]; // iload_0, tableswitch, 2 pad bytes
    c.extend_from_slice(&(30 - base).to_be_bytes()); // default -> 30
    c.extend_from_slice(&1i32.to_be_bytes()); // low
    c.extend_from_slice(&2i32.to_be_bytes()); // high
    c.extend_from_slice(&(24 - base).to_be_bytes()); // case 1 -> 24
    c.extend_from_slice(&(27 - base).to_be_bytes()); // case 2 -> 27
    assert_eq!(c.len(), 24);
    c.extend_from_slice(&[0x10, 0x0b, 0xac]); // 24: bipush 11, 26: ireturn
    c.extend_from_slice(&[0x10, 0x16, 0xac]); // 27: bipush 22, 29: ireturn
    c.extend_from_slice(&[0x02, 0xac]); // 30: iconst_m1, 31: ireturn
    let m = define("t/Switch", static_method("f", "(I)I", c, ConstantPool::new()));
    assert_eq!(vm().run(&m, &CallArgs::new().int(1)).unwrap().as_i32(), 11);
    assert_eq!(vm().run(&m, &CallArgs::new().int(2)).unwrap().as_i32(), 22);
    assert_eq!(vm().run(&m, &CallArgs::new().int(9)).unwrap().as_i32(), -1);
    assert_eq!(vm().run(&m, &CallArgs::new().int(0)).unwrap().as_i32(), -1);
}

#[test]
fn test_lookupswitch() {
    // switch (x) { case 100: return 1; default: return 0; }
    let base = 1i32;
    let mut c = vec![0x1a, 0xab, 0x00, 0x00]; // iload_0, lookupswitch, pad
    let default = 24 - base;
    let t = 21 - base;
    c.extend_from_slice(&default.to_be_bytes());
    c.extend_from_slice(&1i32.to_be_bytes()); // npairs
    c.extend_from_slice(&100i32.to_be_bytes());
    c.extend_from_slice(&t.to_be_bytes());
    assert_eq!(c.len(), 20);
    c.push(0x00); // 20: nop
    c.extend_from_slice(&[0x04, 0xac]); // 21: iconst_1, ireturn
    c.push(0x00); // 23: nop
    c.extend_from_slice(&[0x03, 0xac]); // 24: iconst_0, ireturn
    let m = define("t/Lookup", static_method("f", "(I)I", c, ConstantPool::new()));
    assert_eq!(vm().run(&m, &CallArgs::new().int(100)).unwrap().as_i32(), 1);
    assert_eq!(vm().run(&m, &CallArgs::new().int(5)).unwrap().as_i32(), 0);
}

#[test]
fn test_fields() {
    // class t/Point { int x; }  static int get(Point p) { return p.x; }
    // static void set(Point p, int v) { p.x = v; }
    let mut pool = ConstantPool::new();
    let x_ref = Arc::new(FieldRef::new("t/Point", "x", JavaType::Int));
    let x_idx = pool.push(Constant::Field(x_ref));
    let pool = Arc::new(pool);

    let get = Method::new(
        "get",
        "(Lt/Point;)I",
        MethodDescriptor::parse("(Lt/Point;)I").unwrap(),
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        4,
        4,
        vec![0x2a, 0xb4, 0x00, x_idx as u8, 0xac].into_boxed_slice(),
        vec![],
        vec![],
        pool.clone(),
    );
    let set = Method::new(
        "set",
        "(Lt/Point;I)V",
        MethodDescriptor::parse("(Lt/Point;I)V").unwrap(),
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        4,
        4,
        vec![0x2a, 0x1b, 0xb5, 0x00, x_idx as u8, 0xb1].into_boxed_slice(),
        vec![],
        vec![],
        pool,
    );

    let point = vm().define_class(
        ClassBuilder::new("t/Point")
            .field("x", JavaType::Int)
            .method(get)
            .method(set),
    );
    let get = point.lookup_method("get", "(Lt/Point;)I").unwrap();
    let set = point.lookup_method("set", "(Lt/Point;I)V").unwrap();

    let obj = vm().heap().alloc_object(&point).unwrap();
    vm().run(&set, &CallArgs::new().obj(obj as usize).int(77))
        .unwrap();
    let r = vm()
        .run(&get, &CallArgs::new().obj(obj as usize))
        .unwrap();
    assert_eq!(r.as_i32(), 77);

    // Null receiver raises.
    let err = vm().run(&get, &CallArgs::new().obj(0)).unwrap_err();
    assert_eq!(err.kind, JavaKind::NullPointerException);
}

#[test]
fn test_static_fields() {
    let mut pool = ConstantPool::new();
    let s_ref = Arc::new(FieldRef::new("t/Counter", "s", JavaType::Int));
    let s_idx = pool.push(Constant::Field(s_ref));
    let pool = Arc::new(pool);

    // static int bump() { s = s + 5; return s; }
    let bump = Method::new(
        "bump",
        "()I",
        MethodDescriptor::parse("()I").unwrap(),
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        4,
        4,
        vec![
            0xb2, 0x00, s_idx as u8, // getstatic
            0x08, // iconst_5
            0x60, // iadd
            0xb3, 0x00, s_idx as u8, // putstatic
            0xb2, 0x00, s_idx as u8, // getstatic
            0xac,
        ]
        .into_boxed_slice(),
        vec![],
        vec![],
        pool,
    );
    let class = vm().define_class(
        ClassBuilder::new("t/Counter")
            .static_field("s", JavaType::Int)
            .method(bump),
    );
    let bump = class.lookup_method("bump", "()I").unwrap();
    assert_eq!(vm().run(&bump, &CallArgs::new()).unwrap().as_i32(), 5);
    assert_eq!(vm().run(&bump, &CallArgs::new()).unwrap().as_i32(), 10);
}

#[test]
fn test_invokestatic_lazy_compile() {
    // t/Callee.inc(I)I { return a + 1; }   t/Caller.twice(I)I { return inc(inc(a)); }
    let callee = define(
        "t/Callee",
        static_method("inc", "(I)I", vec![0x1a, 0x04, 0x60, 0xac], ConstantPool::new()),
    );

    let mut pool = ConstantPool::new();
    let mref = Arc::new(MethodRef::new("t/Callee", "inc", "(I)I").unwrap());
    let m_idx = pool.push(Constant::Method(mref));
    let caller = define(
        "t/Caller",
        static_method(
            "twice",
            "(I)I",
            vec![
                0x1a, // iload_0
                0xb8, 0x00, m_idx as u8, // invokestatic inc
                0xb8, 0x00, m_idx as u8, // invokestatic inc
                0xac,
            ],
            pool,
        ),
    );

    // The callee is not compiled yet; the first call goes through the
    // lazy-compile stub.
    assert!(callee.entry_point().is_none());
    let r = vm().run(&caller, &CallArgs::new().int(40)).unwrap();
    assert_eq!(r.as_i32(), 42);
    assert!(callee.entry_point().is_some());
    // And again, now through the patched call site.
    let r = vm().run(&caller, &CallArgs::new().int(-1)).unwrap();
    assert_eq!(r.as_i32(), 1);
}

#[test]
fn test_invokevirtual_dispatch() {
    // class t/Base { int id() { return 1; } }
    // class t/Derived extends Base { int id() { return 2; } }
    // static int call(Base o) { return o.id(); }
    let id1 = static_method_ex(
        "id",
        "()I",
        vec![0x04, 0xac],
        ConstantPool::new(),
        vec![],
        MethodFlags::empty(),
    );
    let base = vm().define_class(ClassBuilder::new("t/Base").method(id1));

    let id2 = static_method_ex(
        "id",
        "()I",
        vec![0x05, 0xac],
        ConstantPool::new(),
        vec![],
        MethodFlags::empty(),
    );
    let derived = vm().define_class(
        ClassBuilder::new("t/Derived")
            .super_class(base.clone())
            .method(id2),
    );

    let mut pool = ConstantPool::new();
    let mref = Arc::new(MethodRef::new("t/Base", "id", "()I").unwrap());
    let m_idx = pool.push(Constant::Method(mref));
    let call = define(
        "t/VCall",
        static_method(
            "call",
            "(Lt/Base;)I",
            vec![0x2a, 0xb6, 0x00, m_idx as u8, 0xac],
            pool,
        ),
    );

    let b = vm().heap().alloc_object(&base).unwrap();
    let d = vm().heap().alloc_object(&derived).unwrap();
    assert_eq!(
        vm().run(&call, &CallArgs::new().obj(b as usize)).unwrap().as_i32(),
        1
    );
    assert_eq!(
        vm().run(&call, &CallArgs::new().obj(d as usize)).unwrap().as_i32(),
        2
    );
    let err = vm().run(&call, &CallArgs::new().obj(0)).unwrap_err();
    assert_eq!(err.kind, JavaKind::NullPointerException);
}

#[test]
fn test_catch_in_same_frame() {
    // static int f(int a, int b) { try { return a / b; } catch (ArithmeticException e) { return -1; } }
    let mut pool = ConstantPool::new();
    let arith = Arc::new(ClassRef::new("java/lang/ArithmeticException"));
    let c_idx = pool.push(Constant::Class(arith));
    let code = vec![
        0x1a, 0x1b, 0x6c, // 0-2: iload_0, iload_1, idiv
        0xac, // 3: ireturn
        0x57, // 4: pop (exception)
        0x02, // 5: iconst_m1
        0xac, // 6: ireturn
    ];
    let ex = vec![ExceptionTableEntry {
        start_pc: 0,
        end_pc: 4,
        handler_pc: 4,
        catch_type: c_idx,
    }];
    let m = define(
        "t/Catch",
        static_method_ex("f", "(II)I", code, pool, ex, MethodFlags::STATIC),
    );
    assert_eq!(vm().run(&m, &CallArgs::new().int(6).int(2)).unwrap().as_i32(), 3);
    assert_eq!(vm().run(&m, &CallArgs::new().int(6).int(0)).unwrap().as_i32(), -1);
}

#[test]
fn test_handler_order_innermost_first() {
    // try { throw arg; } catch (t/E e) { return 1; } catch (Throwable t) { return 2; }
    let e_class = vm().define_class(
        ClassBuilder::new("t/E")
            .super_class(vm().registry().lookup("java/lang/Throwable").unwrap()),
    );

    let mut pool = ConstantPool::new();
    let e_idx = pool.push(Constant::Class(Arc::new(ClassRef::new("t/E"))));
    let t_idx = pool.push(Constant::Class(Arc::new(ClassRef::new(
        "java/lang/Throwable",
    ))));
    let code = vec![
        0x2a, // 0: aload_0
        0xbf, // 1: athrow
        0x57, 0x04, 0xac, // 2: pop, iconst_1, ireturn
        0x57, 0x05, 0xac, // 5: pop, iconst_2, ireturn
    ];
    let ex = vec![
        ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: e_idx,
        },
        ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 5,
            catch_type: t_idx,
        },
    ];
    let m = define(
        "t/Handlers",
        static_method_ex(
            "f",
            "(Ljava/lang/Throwable;)I",
            code,
            pool,
            ex,
            MethodFlags::STATIC,
        ),
    );

    let e_obj = vm().heap().alloc_object(&e_class).unwrap();
    let t_obj = vm()
        .heap()
        .alloc_object(&vm().registry().lookup("java/lang/Throwable").unwrap())
        .unwrap();
    assert_eq!(
        vm().run(&m, &CallArgs::new().obj(e_obj as usize)).unwrap().as_i32(),
        1
    );
    assert_eq!(
        vm().run(&m, &CallArgs::new().obj(t_obj as usize)).unwrap().as_i32(),
        2
    );
}

#[test]
fn test_exception_unwinds_callee_frame() {
    // t/Thrower.boom(I)I { return 100 / a; }
    // t/Catcher.f(I)I { try { return boom(a); } catch (Throwable t) { return -7; } }
    let boom = define(
        "t/Thrower",
        static_method(
            "boom",
            "(I)I",
            vec![0x10, 0x64, 0x1a, 0x6c, 0xac],
            ConstantPool::new(),
        ),
    );
    let _ = boom;

    let mut pool = ConstantPool::new();
    let mref = Arc::new(MethodRef::new("t/Thrower", "boom", "(I)I").unwrap());
    let m_idx = pool.push(Constant::Method(mref));
    let t_idx = pool.push(Constant::Class(Arc::new(ClassRef::new(
        "java/lang/Throwable",
    ))));
    let code = vec![
        0x1a, // 0: iload_0
        0xb8, 0x00, m_idx as u8, // 1: invokestatic boom
        0xac, // 4: ireturn
        0x57, // 5: pop
        0x10, 0xf9, // 6: bipush -7
        0xac, // 8: ireturn
    ];
    let ex = vec![ExceptionTableEntry {
        start_pc: 0,
        end_pc: 5,
        handler_pc: 5,
        catch_type: t_idx,
    }];
    let m = define(
        "t/Catcher",
        static_method_ex("f", "(I)I", code, pool, ex, MethodFlags::STATIC),
    );

    assert_eq!(vm().run(&m, &CallArgs::new().int(4)).unwrap().as_i32(), 25);
    // The divide in the callee unwinds into our handler.
    assert_eq!(vm().run(&m, &CallArgs::new().int(0)).unwrap().as_i32(), -7);
}

#[test]
fn test_uncaught_exception_reaches_embedder() {
    let m = define(
        "t/Uncaught",
        static_method("f", "()I", vec![0x04, 0x03, 0x6c, 0xac], ConstantPool::new()),
    );
    let err = vm().run(&m, &CallArgs::new()).unwrap_err();
    assert_eq!(err.kind, JavaKind::ArithmeticException);
}

#[test]
fn test_instanceof_and_checkcast() {
    // static int f(Object o) { return o instanceof t/Shape ? 1 : 0; }
    let shape = vm().define_class(ClassBuilder::new("t/Shape"));
    let circle = vm().define_class(ClassBuilder::new("t/Circle").super_class(shape.clone()));

    let mut pool = ConstantPool::new();
    let s_idx = pool.push(Constant::Class(Arc::new(ClassRef::new("t/Shape"))));
    let m = define(
        "t/InstOf",
        static_method(
            "f",
            "(Ljava/lang/Object;)I",
            vec![0x2a, 0xc1, 0x00, s_idx as u8, 0xac],
            pool,
        ),
    );
    let c_obj = vm().heap().alloc_object(&circle).unwrap();
    let o_obj = vm()
        .heap()
        .alloc_object(&vm().registry().lookup("java/lang/Object").unwrap())
        .unwrap();
    assert_eq!(
        vm().run(&m, &CallArgs::new().obj(c_obj as usize)).unwrap().as_i32(),
        1
    );
    assert_eq!(
        vm().run(&m, &CallArgs::new().obj(o_obj as usize)).unwrap().as_i32(),
        0
    );
    assert_eq!(vm().run(&m, &CallArgs::new().obj(0)).unwrap().as_i32(), 0);

    // checkcast on a mismatch raises ClassCastException.
    let mut pool = ConstantPool::new();
    let s_idx = pool.push(Constant::Class(Arc::new(ClassRef::new("t/Shape"))));
    let cast = define(
        "t/Cast",
        static_method(
            "f",
            "(Ljava/lang/Object;)I",
            vec![0x2a, 0xc0, 0x00, s_idx as u8, 0x57, 0x04, 0xac],
            pool,
        ),
    );
    assert_eq!(
        vm().run(&cast, &CallArgs::new().obj(c_obj as usize)).unwrap().as_i32(),
        1
    );
    let err = vm()
        .run(&cast, &CallArgs::new().obj(o_obj as usize))
        .unwrap_err();
    assert_eq!(err.kind, JavaKind::ClassCastException);
    // Null passes checkcast.
    assert_eq!(vm().run(&cast, &CallArgs::new().obj(0)).unwrap().as_i32(), 1);
}

#[test]
fn test_patcher_resolves_field_on_first_use() {
    // Compile a method against t/LazyHost.v before the class exists; the
    // first execution traps into the patcher, resolves, and resumes.
    let mut pool = ConstantPool::new();
    let f_ref = Arc::new(FieldRef::new("t/LazyHost", "v", JavaType::Int));
    let f_idx = pool.push(Constant::Field(f_ref.clone()));
    let m = define(
        "t/LazyUser",
        static_method(
            "get",
            "(Lt/LazyHost;)I",
            vec![0x2a, 0xb4, 0x00, f_idx as u8, 0xac],
            pool,
        ),
    );
    let entry = vm().compile(&m).unwrap();
    assert!(f_ref.get().is_none(), "field must still be symbolic");
    let code = m.code().unwrap();
    assert!(!code.patch_refs.is_empty());

    // Now load the class and call.
    let host = vm().define_class(ClassBuilder::new("t/LazyHost").field("v", JavaType::Int));
    let obj = vm().heap().alloc_object(&host).unwrap();
    unsafe {
        // First instance field sits right after the header.
        *((obj as usize + 16) as *mut i32) = 1234;
    }
    let r = vm()
        .call(entry, &CallArgs::new().obj(obj as usize))
        .unwrap();
    assert_eq!(r.as_i32(), 1234);
    assert!(code.patch_refs.iter().all(|p| p.is_done()));
    // Second call runs straight through.
    let r = vm()
        .call(entry, &CallArgs::new().obj(obj as usize))
        .unwrap();
    assert_eq!(r.as_i32(), 1234);
}

#[test]
fn test_patcher_missing_class_raises_linkage_error() {
    let mut pool = ConstantPool::new();
    let f_ref = Arc::new(FieldRef::new("t/Nowhere", "v", JavaType::Int));
    let f_idx = pool.push(Constant::Field(f_ref));
    let m = define(
        "t/LinkFail",
        static_method(
            "get",
            "(Ljava/lang/Object;)I",
            vec![0x2a, 0xb4, 0x00, f_idx as u8, 0xac],
            pool,
        ),
    );
    let obj = vm()
        .heap()
        .alloc_object(&vm().registry().lookup("java/lang/Object").unwrap())
        .unwrap();
    let err = vm()
        .run(&m, &CallArgs::new().obj(obj as usize))
        .unwrap_err();
    assert_eq!(err.kind, JavaKind::NoClassDefFoundError);
}

#[test]
fn test_synchronized_counter_two_threads() {
    // static synchronized int bump() { c = c + 1; return c; }
    let mut pool = ConstantPool::new();
    let c_ref = Arc::new(FieldRef::new("t/SyncCounter", "c", JavaType::Int));
    let c_idx = pool.push(Constant::Field(c_ref));
    let bump = static_method_ex(
        "bump",
        "()I",
        vec![
            0xb2, 0x00, c_idx as u8, // getstatic
            0x04, // iconst_1
            0x60, // iadd
            0xb3, 0x00, c_idx as u8, // putstatic
            0xb2, 0x00, c_idx as u8, // getstatic
            0xac,
        ],
        pool,
        vec![],
        MethodFlags::STATIC | MethodFlags::SYNCHRONIZED,
    );
    let class = vm().define_class(
        ClassBuilder::new("t/SyncCounter")
            .static_field("c", JavaType::Int)
            .method(bump),
    );
    let bump = class.lookup_method("bump", "()I").unwrap();
    let entry = vm().compile(&bump).unwrap();

    const PER_THREAD: usize = 10_000;
    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(std::thread::spawn(move || {
            let vm = Vm::get();
            for _ in 0..PER_THREAD {
                vm.call(entry, &CallArgs::new()).unwrap();
            }
            vm.threads().detach();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let r = vm().call(entry, &CallArgs::new()).unwrap();
    assert_eq!(r.as_i32() as usize, 2 * PER_THREAD + 1);
}

#[test]
fn test_stats_grow() {
    let before = vm().stats().snapshot();
    let m = define(
        "t/Stats",
        static_method("f", "()I", vec![0x03, 0xac], ConstantPool::new()),
    );
    vm().compile(&m).unwrap();
    let after = vm().stats().snapshot();
    assert!(after.methods_compiled > before.methods_compiled);
    assert!(after.mcode_bytes > before.mcode_bytes);
}

#[test]
fn test_code_map_covers_compiled_method() {
    let m = define(
        "t/MapCov",
        static_method("f", "()I", vec![0x03, 0xac], ConstantPool::new()),
    );
    vm().compile(&m).unwrap();
    let code = m.code().unwrap();
    let (start, end) = code.code_range();
    for pc in [start, (start + end) / 2, end - 1] {
        let found = vm().code_map().lookup(pc).expect("in range");
        assert!(Arc::ptr_eq(&found, &code));
    }
}

#[test]
fn test_unload_removes_ranges() {
    let m = define(
        "t/Unload",
        static_method("f", "()I", vec![0x03, 0xac], ConstantPool::new()),
    );
    vm().compile(&m).unwrap();
    let code = m.code().unwrap();
    let (start, _) = code.code_range();
    assert!(vm().unload_class("t/Unload"));
    assert!(vm().code_map().lookup(start).is_none());
    assert!(m.entry_point().is_none());
}

#[test]
fn test_dup2_x2_pop2_stack_law() {
    // Push 1,2,3,4; dup2_x2; pop2 leaves the original minus the bottom two
    // of the top four: [3,4] with 4 on top.
    let code = vec![
        0x04, 0x05, 0x06, 0x07, // iconst_1..4
        0x5e, // dup2_x2 -> [3,4,1,2,3,4]
        0x58, // pop2    -> [3,4,1,2]
        0x58, // pop2    -> [3,4]
        0xac, // ireturn -> 4
    ];
    let m = define("t/DupLaw", static_method("f", "()I", code, ConstantPool::new()));
    assert_eq!(vm().run(&m, &CallArgs::new()).unwrap().as_i32(), 4);
}
