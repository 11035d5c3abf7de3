// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
#![cfg(target_arch = "x86_64")]

mod common;

use common::{TestModule, sig};
use template_jit::{EntryFn, TrapKind, VMContext};
use wasm_decode::test_utils::FuncBody;
use wasm_decode::{BlockType, Opcode, ValType};

fn binary() -> wasm_decode::FuncType {
    sig(&[ValType::I32, ValType::I32], &[ValType::I32])
}

fn arith(op: Opcode) -> FuncBody {
    FuncBody::new().local_get(0).local_get(1).op(op).end()
}

#[test_log::test]
fn direct_call() {
    let ty = binary();
    let mut instance = TestModule::new()
        .func("sub", &ty, arith(Opcode::I32Sub))
        .func(
            "twice",
            &sig(&[ValType::I32], &[ValType::I32]),
            FuncBody::new()
                .i32_const(100)
                .local_get(0)
                .index(Opcode::Call, 0)
                .local_get(0)
                .op(Opcode::I32Add)
                .end(),
        )
        .instantiate();

    assert_eq!(instance.invoke_i32("twice", &[30]), Ok(100));
    assert_eq!(instance.invoke_i32("sub", &[30, 100]), Ok(-70));
}

#[test_log::test]
fn call_with_odd_operand_stack() {
    // the extra value below the arguments shifts the stack by one slot
    let square = FuncBody::new().local_get(0).local_get(0).op(Opcode::I64Mul).end();
    let caller = FuncBody::new()
        .i64_const(1)
        .local_get(0)
        .index(Opcode::Call, 0)
        .op(Opcode::I64Add)
        .end();
    let ty = sig(&[ValType::I64], &[ValType::I64]);
    let mut instance = TestModule::new()
        .func("square", &ty, square)
        .func("f", &ty, caller)
        .instantiate();

    assert_eq!(instance.invoke_i64("f", &[12]), Ok(145));
}

#[test_log::test]
fn recursive_fib() {
    let body = FuncBody::new()
        .local_get(0)
        .i32_const(2)
        .op(Opcode::I32LtU)
        .block(Opcode::If, BlockType::Value(ValType::I32))
        .local_get(0)
        .op(Opcode::Else)
        .local_get(0)
        .i32_const(1)
        .op(Opcode::I32Sub)
        .index(Opcode::Call, 0)
        .local_get(0)
        .i32_const(2)
        .op(Opcode::I32Sub)
        .index(Opcode::Call, 0)
        .op(Opcode::I32Add)
        .end()
        .end();
    let mut instance = TestModule::new()
        .func("fib", &sig(&[ValType::I32], &[ValType::I32]), body)
        .instantiate();

    assert_eq!(instance.invoke_i32("fib", &[1]), Ok(1));
    assert_eq!(instance.invoke_i32("fib", &[20]), Ok(6765));
}

#[test_log::test]
fn many_arguments_keep_their_order() {
    // a - b + c - d + e - f + g
    let params = [ValType::I64; 7];
    let mut body = FuncBody::new().local_get(0);
    for i in 1..7 {
        let op = if i % 2 == 1 { Opcode::I64Sub } else { Opcode::I64Add };
        body = body.local_get(i).op(op);
    }
    let mut caller = FuncBody::new();
    for i in 1..=7 {
        caller = caller.i64_const(i * 10);
    }
    let mut instance = TestModule::new()
        .func("sum", &sig(&params, &[ValType::I64]), body.end())
        .func(
            "f",
            &sig(&[], &[ValType::I64]),
            caller.index(Opcode::Call, 0).end(),
        )
        .instantiate();

    assert_eq!(instance.invoke_i64("f", &[]), Ok(10 - 20 + 30 - 40 + 50 - 60 + 70));
}

unsafe extern "sysv64" fn host_scale(_vmctx: *mut VMContext, args: *const u64) -> u64 {
    // Safety: compiled code passes one slot per parameter
    let (a, b) = unsafe { (*args, *args.add(1)) };
    (a * 10 + b) & u64::from(u32::MAX)
}

#[test_log::test]
fn imported_host_function() {
    let ty = binary();
    let mut instance = TestModule::new()
        .import("scale", &ty)
        .func(
            "f",
            &sig(&[ValType::I32], &[ValType::I32]),
            FuncBody::new()
                .local_get(0)
                .i32_const(7)
                .index(Opcode::Call, 0)
                .end(),
        )
        .instantiate_with(&[host_scale as EntryFn]);

    assert_eq!(instance.invoke_i32("f", &[4]), Ok(47));
}

fn dispatch_module() -> TestModule {
    let ty = binary();
    let mut module = TestModule::new()
        .func("add", &ty, arith(Opcode::I32Add))
        .func("sub", &ty, arith(Opcode::I32Sub));
    let binary_ty = module.type_index(&ty);
    let nullary_ty = module.type_index(&sig(&[], &[ValType::I32]));
    module
        .func(
            "dispatch",
            &sig(&[ValType::I32, ValType::I32, ValType::I32], &[ValType::I32]),
            FuncBody::new()
                .local_get(0)
                .local_get(1)
                .local_get(2)
                .call_indirect(binary_ty)
                .end(),
        )
        .func(
            "wrong_type",
            &sig(&[ValType::I32], &[ValType::I32]),
            FuncBody::new()
                .local_get(0)
                .call_indirect(nullary_ty)
                .end(),
        )
        .table(3)
        .elements(0, &[0, 1])
}

#[test_log::test]
fn indirect_calls() {
    let mut instance = dispatch_module().instantiate();

    assert_eq!(instance.invoke_i32("dispatch", &[8, 5, 0]), Ok(13));
    assert_eq!(instance.invoke_i32("dispatch", &[8, 5, 1]), Ok(3));

    instance.set_table(2, Some(0));
    assert_eq!(instance.invoke_i32("dispatch", &[8, 5, 2]), Ok(13));
    assert_eq!(instance.traps_handled(), 0);
}

#[test_log::test]
fn indirect_call_failures() {
    let mut instance = dispatch_module().instantiate();

    assert_eq!(
        instance.invoke_i32("dispatch", &[1, 2, 2]),
        Err(TrapKind::IndirectCallToNull)
    );
    assert_eq!(
        instance.invoke_i32("dispatch", &[1, 2, 3]),
        Err(TrapKind::TableOutOfBounds)
    );
    assert_eq!(
        instance.invoke_i32("dispatch", &[1, 2, -1]),
        Err(TrapKind::TableOutOfBounds)
    );
    assert_eq!(instance.invoke_i32("wrong_type", &[0]), Err(TrapKind::BadSignature));
    assert_eq!(instance.traps_handled(), 4);

    // the instance is still usable afterwards
    assert_eq!(instance.invoke_i32("dispatch", &[1, 2, 0]), Ok(3));
}

#[test_log::test]
fn traps_unwind_through_callers() {
    let ty = sig(&[], &[ValType::I32]);
    let mut instance = TestModule::new()
        .func("boom", &ty, FuncBody::new().op(Opcode::Unreachable).end())
        .func(
            "middle",
            &ty,
            FuncBody::new()
                .i32_const(1)
                .index(Opcode::Call, 0)
                .op(Opcode::I32Add)
                .end(),
        )
        .func(
            "outer",
            &ty,
            FuncBody::new()
                .index(Opcode::Call, 1)
                .op(Opcode::Drop)
                .i32_const(5)
                .end(),
        )
        .instantiate();

    assert_eq!(instance.invoke("outer", &[]), Err(TrapKind::UnreachableCodeReached));
    // only the trapping function raises, its callers just unwind
    assert_eq!(instance.traps_handled(), 1);
}
