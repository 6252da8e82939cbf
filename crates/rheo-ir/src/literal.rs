//! Constant tensor payloads.

use crate::shape::{ElementType, Shape};

/// A constant tensor: shape plus raw little-endian bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Literal {
    shape: Shape,
    bytes: Vec<u8>,
}

impl Literal {
    /// Creates a literal from a shape and its packed byte payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload length does not match the shape.
    pub fn new(shape: Shape, bytes: Vec<u8>) -> Self {
        assert_eq!(
            bytes.len(),
            shape.bytes(),
            "literal payload is {} bytes but {shape} needs {}",
            bytes.len(),
            shape.bytes(),
        );
        Self { shape, bytes }
    }

    /// Creates an f32 literal from a dimension vector and values.
    pub fn from_f32s(dims: &[usize], values: &[f32]) -> Self {
        let shape = Shape::new(ElementType::F32, dims.to_vec());
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, bytes)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the payload as f32 values.
    ///
    /// # Panics
    ///
    /// Panics if the element type is not [`ElementType::F32`].
    pub fn as_f32s(&self) -> Vec<f32> {
        assert_eq!(self.shape.elem, ElementType::F32);
        self.bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
