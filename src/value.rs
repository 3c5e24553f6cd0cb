// # Value Buffer
//
// The mutable value side of an Exchange: bytes going into a store, bytes
// coming out of a fetch. Deliberately dumb; typed encodings live with the
// caller.

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Value {
    bytes: Vec<u8>,
}

impl Value {
    pub fn new() -> Value {
        Value::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn set(&mut self, bytes: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    pub fn set_from(&mut self, bytes: Bytes) {
        self.bytes.clear();
        self.bytes.extend_from_slice(&bytes);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}
