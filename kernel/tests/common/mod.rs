//! Shared helpers for the end-to-end tests.
//!
//! User programs are not real machine code here: the scripted processor
//! decides what to do by reading a program id from the first code word.

#![allow(dead_code)]

use std::sync::Arc;

use simos_kernel::Kernel;
use simos_kernel::fs::noff::{NOFF_HEADER_SIZE, NoffHeader, Segment};
use simos_kernel::machine::{ARG_REG_BASE, RESULT_REG};
use simos_kernel::memory::VirtAddr;
use simos_kernel::syscall::{Flow, handle_syscall};

pub fn init_logging() {
    klog::init_with_level(log::LevelFilter::Warn);
}

/// A NOFF image whose code starts with `id` and is `code_len` bytes long.
pub fn program(id: i32, code_len: usize) -> Vec<u8> {
    assert!(code_len >= 4);
    let header = NoffHeader::new(
        Segment::new(0, NOFF_HEADER_SIZE as u32, code_len as u32),
        Segment::default(),
        Segment::default(),
        Segment::new(code_len as u32, 0, 64),
    );
    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(&id.to_le_bytes());
    image.resize(NOFF_HEADER_SIZE + code_len, 0);
    image
}

/// Id of the program running on this context.
pub fn program_id(k: &Arc<Kernel>) -> i32 {
    k.machine().read_mem(VirtAddr::new(0), 4).unwrap()
}

/// Trap into the kernel with `code` and `args`; returns the flow and
/// register 2 afterwards.
pub fn trap(k: &Arc<Kernel>, code: i32, args: &[i32]) -> (Flow, i32) {
    let m = k.machine();
    m.write_register(RESULT_REG, code);
    for (i, &a) in args.iter().enumerate() {
        m.write_register(ARG_REG_BASE + i, a);
    }
    let flow = handle_syscall(k);
    (flow, m.read_register(RESULT_REG))
}
