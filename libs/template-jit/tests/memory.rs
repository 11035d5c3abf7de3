// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
#![cfg(target_arch = "x86_64")]

mod common;

use common::{TestModule, sig};
use template_jit::TrapKind;
use wasm_decode::test_utils::FuncBody;
use wasm_decode::{Mutability, Opcode, ValType};

/// `load(addr)` and `store(addr, value)` accessors using `load_op` and
/// `store_op` with the given static offset.
fn accessors(load_op: Opcode, store_op: Opcode, ty: ValType, offset: u32) -> TestModule {
    TestModule::new()
        .func(
            "load",
            &sig(&[ValType::I32], &[ty]),
            FuncBody::new().local_get(0).memarg(load_op, 0, offset).end(),
        )
        .func(
            "store",
            &sig(&[ValType::I32, ty], &[]),
            FuncBody::new()
                .local_get(0)
                .local_get(1)
                .memarg(store_op, 0, offset)
                .end(),
        )
        .memory(1, Some(3))
}

#[test_log::test]
fn store_then_load() {
    let mut instance = accessors(Opcode::I32Load, Opcode::I32Store, ValType::I32, 0).instantiate();

    instance.invoke("store", &[8, 0xDEAD_BEEF]).unwrap();
    assert_eq!(instance.invoke("load", &[8]), Ok(0xDEAD_BEEF));
    assert_eq!(instance.memory()[8..12], 0xDEAD_BEEFu32.to_le_bytes());
}

#[test_log::test]
fn static_offset_is_added() {
    let mut instance = accessors(Opcode::I64Load, Opcode::I64Store, ValType::I64, 100).instantiate();

    instance.invoke("store", &[4, u64::MAX - 1]).unwrap();
    assert_eq!(instance.memory()[104..112], (u64::MAX - 1).to_le_bytes());
    assert_eq!(instance.invoke("load", &[4]), Ok(u64::MAX - 1));
}

#[test_log::test]
fn narrow_loads_extend() {
    let ty = sig(&[ValType::I32], &[ValType::I64]);
    let load = |op| FuncBody::new().local_get(0).memarg(op, 0, 0);
    let widened = |op| load(op).op(Opcode::I64ExtendI32U).end();
    let mut instance = TestModule::new()
        .func("i32.load8_s", &ty, widened(Opcode::I32Load8S))
        .func("i32.load8_u", &ty, widened(Opcode::I32Load8U))
        .func("i32.load16_s", &ty, widened(Opcode::I32Load16S))
        .func("i64.load8_s", &ty, load(Opcode::I64Load8S).end())
        .func("i64.load16_u", &ty, load(Opcode::I64Load16U).end())
        .func("i64.load32_s", &ty, load(Opcode::I64Load32S).end())
        .func("i64.load32_u", &ty, load(Opcode::I64Load32U).end())
        .memory(1, None)
        .data(0, &[0xFF, 0xFF, 0xFF, 0xFF, 0x7F])
        .instantiate();

    assert_eq!(instance.invoke("i32.load8_s", &[0]), Ok(0xFFFF_FFFF));
    assert_eq!(instance.invoke("i32.load8_u", &[0]), Ok(0xFF));
    assert_eq!(instance.invoke("i32.load16_s", &[0]), Ok(0xFFFF_FFFF));
    assert_eq!(instance.invoke("i64.load8_s", &[0]), Ok(u64::MAX));
    assert_eq!(instance.invoke("i64.load8_s", &[4]), Ok(0x7F));
    assert_eq!(instance.invoke("i64.load16_u", &[0]), Ok(0xFFFF));
    assert_eq!(instance.invoke("i64.load32_s", &[0]), Ok(u64::MAX));
    assert_eq!(instance.invoke("i64.load32_s", &[1]), Ok(0x7FFF_FFFF));
    assert_eq!(instance.invoke("i64.load32_u", &[0]), Ok(0xFFFF_FFFF));
}

#[test_log::test]
fn narrow_stores_truncate() {
    // the i64 accessor stores only the low 16 bits
    let mut instance = accessors(Opcode::I64Load, Opcode::I64Store16, ValType::I64, 0)
        .func(
            "store8",
            &sig(&[ValType::I32, ValType::I32], &[]),
            FuncBody::new()
                .local_get(0)
                .local_get(1)
                .memarg(Opcode::I32Store8, 0, 0)
                .end(),
        )
        .instantiate();
    instance.memory_mut()[..8].fill(0xAA);

    instance.invoke("store", &[0, 0x1234_5678_9ABC_DEF0]).unwrap();
    instance.invoke("store8", &[4, 0x1FF]).unwrap();
    assert_eq!(instance.memory()[..8], [0xF0, 0xDE, 0xAA, 0xAA, 0xFF, 0xAA, 0xAA, 0xAA]);
}

#[test_log::test]
fn data_segments() {
    let mut instance = accessors(Opcode::I32Load8U, Opcode::I32Store8, ValType::I32, 0)
        .data(16, b"hello")
        .instantiate();

    assert_eq!(instance.invoke("load", &[17]), Ok(u64::from(b'e')));
}

#[test_log::test]
fn out_of_bounds() {
    let mut instance = accessors(Opcode::I32Load, Opcode::I32Store, ValType::I32, 0).instantiate();

    assert_eq!(instance.invoke("load", &[65532]), Ok(0));
    assert_eq!(instance.invoke("load", &[65533]), Err(TrapKind::MemoryOutOfBounds));
    assert_eq!(
        instance.invoke("store", &[65536, 1]),
        Err(TrapKind::MemoryOutOfBounds)
    );
    assert_eq!(
        instance.invoke("load", &[u64::from(u32::MAX)]),
        Err(TrapKind::MemoryOutOfBounds)
    );
    assert_eq!(instance.traps_handled(), 3);
}

#[test_log::test]
fn offset_does_not_wrap() {
    let mut instance =
        accessors(Opcode::I32Load8U, Opcode::I32Store8, ValType::I32, u32::MAX).instantiate();

    assert_eq!(instance.invoke("load", &[1]), Err(TrapKind::MemoryOutOfBounds));
}

#[test_log::test]
fn size_and_grow() {
    let mut instance = TestModule::new()
        .func(
            "size",
            &sig(&[], &[ValType::I32]),
            FuncBody::new().memory_op(Opcode::MemorySize).end(),
        )
        .func(
            "grow",
            &sig(&[ValType::I32], &[ValType::I32]),
            FuncBody::new().local_get(0).memory_op(Opcode::MemoryGrow).end(),
        )
        .func(
            "poke",
            &sig(&[ValType::I32], &[]),
            FuncBody::new()
                .local_get(0)
                .i32_const(99)
                .memarg(Opcode::I32Store8, 0, 0)
                .end(),
        )
        .memory(1, Some(3))
        .instantiate();

    assert_eq!(instance.invoke_i32("size", &[]), Ok(1));
    assert_eq!(instance.invoke_i32("poke", &[70_000]), Err(TrapKind::MemoryOutOfBounds));

    assert_eq!(instance.invoke_i32("grow", &[2]), Ok(1));
    assert_eq!(instance.invoke_i32("size", &[]), Ok(3));
    instance.invoke_i32("poke", &[70_000]).unwrap();
    assert_eq!(instance.memory()[70_000], 99);

    assert_eq!(instance.invoke_i32("grow", &[1]), Ok(-1));
    assert_eq!(instance.invoke_i32("grow", &[0]), Ok(3));
    assert_eq!(instance.invoke_i32("size", &[]), Ok(3));
}

#[test_log::test]
fn globals() {
    let mut instance = TestModule::new()
        .func(
            "bump",
            &sig(&[ValType::I64], &[ValType::I64]),
            FuncBody::new()
                .index(Opcode::GlobalGet, 1)
                .local_get(0)
                .op(Opcode::I64Add)
                .index(Opcode::GlobalSet, 1)
                .index(Opcode::GlobalGet, 1)
                .index(Opcode::GlobalGet, 0)
                .op(Opcode::I64ExtendI32S)
                .op(Opcode::I64Add)
                .end(),
        )
        .global(ValType::I32, Mutability::Const, -1)
        .global(ValType::I64, Mutability::Var, 40)
        .instantiate();

    assert_eq!(instance.invoke_i64("bump", &[2]), Ok(41));
    assert_eq!(instance.invoke_i64("bump", &[10]), Ok(51));
    assert_eq!(instance.global(1), 52);
}
