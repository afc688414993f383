//! Minimal host fixtures for exercising the IC/JIT/GC subsystems from
//! integration tests, without a real host engine.

use aerojs_core::{HostObject, HostValue, ObjectLayout};

/// Fake value used only in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestValue {
    Int(i64),
    Function(u64),
    Null,
}

impl HostValue for TestValue {
    fn is_function(&self) -> bool {
        matches!(self, TestValue::Function(_))
    }
    fn is_object(&self) -> bool {
        false
    }
    fn as_function_id(&self) -> Option<u64> {
        match self {
            TestValue::Function(id) => Some(*id),
            _ => None,
        }
    }
}

/// Fake object: a shape id plus a flat slot vector split into inline vs.
/// out-of-line storage.
#[derive(Debug, Clone)]
pub struct TestObject {
    pub shape_id: u64,
    pub inline_slots: Vec<u64>,
    pub out_of_line_slots: Vec<u64>,
}

impl TestObject {
    pub fn new(shape_id: u64, inline_slots: Vec<u64>) -> Self {
        TestObject { shape_id, inline_slots, out_of_line_slots: Vec::new() }
    }
}

impl HostObject for TestObject {
    fn shape_id(&self) -> u64 {
        self.shape_id
    }
    fn slots_ptr(&self) -> *mut u8 {
        if self.out_of_line_slots.is_empty() {
            std::ptr::null_mut()
        } else {
            self.out_of_line_slots.as_ptr() as *mut u8
        }
    }
    fn inline_slot(&self, byte_offset: u32) -> u64 {
        let index = (byte_offset / ObjectLayout::SLOT_WIDTH) as usize;
        self.inline_slots[index]
    }
    fn out_of_line_slot(&self, byte_offset: u32) -> u64 {
        let index = (byte_offset / ObjectLayout::SLOT_WIDTH) as usize;
        self.out_of_line_slots[index]
    }
}
