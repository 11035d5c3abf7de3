// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{TestModule, run, sig};
use template_jit::{Function, TemplateCompiler};
use wasm_decode::test_utils::FuncBody;
use wasm_decode::{DefinedFuncIdx, Opcode, ValType};

#[test_log::test]
fn add_constants() {
    let body = FuncBody::new()
        .i32_const(2)
        .i32_const(3)
        .op(Opcode::I32Add)
        .end();
    assert_eq!(run(&sig(&[], &[ValType::I32]), body, &[]), Ok(5));
}

#[test_log::test]
fn no_result() {
    let body = FuncBody::new().i32_const(1).op(Opcode::Drop).end();
    assert_eq!(run(&sig(&[], &[]), body, &[]), Ok(0));
}

#[test_log::test]
fn params_and_locals() {
    // (a, b) -> { let t = a - b; t * t }
    let body = FuncBody::with_locals(&[(1, ValType::I64)])
        .local_get(0)
        .local_get(1)
        .op(Opcode::I64Sub)
        .index(Opcode::LocalTee, 2)
        .local_get(2)
        .op(Opcode::I64Mul)
        .end();
    let ty = sig(&[ValType::I64, ValType::I64], &[ValType::I64]);
    let mut instance = TestModule::new().func("f", &ty, body).instantiate();

    assert_eq!(instance.invoke_i64("f", &[7, 3]), Ok(16));
    assert_eq!(instance.invoke_i64("f", &[-2, 3]), Ok(25));
}

#[test_log::test]
fn declared_locals_start_at_zero() {
    let body = FuncBody::with_locals(&[(3, ValType::I32), (4, ValType::I64)])
        .local_get(0)
        .local_set(3)
        .local_get(1)
        .local_get(2)
        .op(Opcode::I32Add)
        .local_get(3)
        .op(Opcode::I32Add)
        .local_get(7)
        .op(Opcode::I32WrapI64)
        .op(Opcode::I32Add)
        .end();
    let ty = sig(&[ValType::I32], &[ValType::I32]);
    let mut instance = TestModule::new().func("f", &ty, body).instantiate();

    // locals are zeroed on every call, not just the first
    assert_eq!(instance.invoke_i32("f", &[9]), Ok(9));
    assert_eq!(instance.invoke_i32("f", &[4]), Ok(4));
}

#[test_log::test]
fn host_compiler() {
    let ty = sig(&[], &[ValType::I32]);
    let bytes = TestModule::new()
        .func("f", &ty, FuncBody::new().i32_const(1).end())
        .encode();
    let module = wasm_decode::decode(&bytes).unwrap();
    let func = Function::new(&module, DefinedFuncIdx::from_u32(0)).unwrap();
    assert_eq!(func.instruction_count(), 2);

    let compiler = template_jit::host_compiler().expect("x86-64 has a backend");
    let arena = code_memory::CodeArena::new();
    let blob = compiler.compile(&func, &arena).unwrap();
    assert!(arena.is_live(&blob));
    arena.free(blob);
    assert_eq!(arena.live_regions(), 0);
}
