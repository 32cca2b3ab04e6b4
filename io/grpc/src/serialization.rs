//! Serialization context handed to message marshallers.
//!
//! A marshaller produces the payload either in one shot through
//! [`SerializationContext::complete_with`] or incrementally by writing into
//! [`SerializationContext::buffer_writer`] and then calling
//! [`SerializationContext::complete`]. Using the context out of sequence is a
//! programming error and panics.

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationState {
    Initialized,
    CompleteArray,
    IncompleteBufferWriter,
    CompleteBufferWriter,
}

#[derive(Debug)]
pub struct SerializationContext {
    state: SerializationState,
    /// Backing buffer for the buffer-writer path; reused across resets.
    buffer: BytesMut,
    payload: Option<Bytes>,
    length_hint: Option<usize>,
}

impl Default for SerializationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializationContext {
    pub fn new() -> Self {
        Self {
            state: SerializationState::Initialized,
            buffer: BytesMut::new(),
            payload: None,
            length_hint: None,
        }
    }

    pub fn state(&self) -> SerializationState {
        self.state
    }

    /// Return to `Initialized`, keeping the backing buffer's capacity.
    pub fn reset(&mut self) {
        self.state = SerializationState::Initialized;
        self.buffer.clear();
        self.payload = None;
        self.length_hint = None;
    }

    /// Hint the size of the payload about to be written.
    pub fn set_payload_length(&mut self, len: usize) {
        self.expect_state(SerializationState::Initialized, "set_payload_length");
        self.length_hint = Some(len);
    }

    /// Complete serialization with an already encoded payload.
    pub fn complete_with(&mut self, payload: impl Into<Bytes>) {
        self.expect_state(SerializationState::Initialized, "complete_with");
        self.payload = Some(payload.into());
        self.state = SerializationState::CompleteArray;
    }

    /// Get the buffer to serialize into.
    ///
    /// May be called repeatedly until [`complete`](Self::complete).
    pub fn buffer_writer(&mut self) -> &mut BytesMut {
        match self.state {
            SerializationState::Initialized => {
                if let Some(hint) = self.length_hint {
                    self.buffer.reserve(hint);
                }
                self.state = SerializationState::IncompleteBufferWriter;
            }
            SerializationState::IncompleteBufferWriter => {}
            state => panic!("buffer_writer() is not valid in the {state:?} state"),
        }
        &mut self.buffer
    }

    /// Finish a payload written through [`buffer_writer`](Self::buffer_writer).
    pub fn complete(&mut self) {
        self.expect_state(SerializationState::IncompleteBufferWriter, "complete");
        self.payload = Some(self.buffer.split().freeze());
        self.state = SerializationState::CompleteBufferWriter;
    }

    /// Get the completed payload.
    pub fn payload(&self) -> Bytes {
        match (self.state, &self.payload) {
            (
                SerializationState::CompleteArray | SerializationState::CompleteBufferWriter,
                Some(payload),
            ) => payload.clone(),
            (state, _) => panic!("payload is not available in the {state:?} state"),
        }
    }

    /// True once the marshaller has completed the payload.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            SerializationState::CompleteArray | SerializationState::CompleteBufferWriter
        )
    }

    fn expect_state(&self, expected: SerializationState, op: &str) {
        if self.state != expected {
            panic!(
                "{op}() requires the {expected:?} state but the context is {:?}",
                self.state
            );
        }
    }
}
