//! Byte-exact GPU block layout encoders.
//!
//! GPU buffer blocks follow one of two fixed alignment rule-sets: the
//! uniform-block rules ([`Std140Block`], vectors of length 3 padded to four
//! components and aligned to 16 bytes) and the storage-block rules
//! ([`Std430Block`], same vector padding plus 3×3 matrix support). Both
//! encoders append primitives to a growable byte buffer, advancing the write
//! cursor to the next multiple of each value's required alignment before
//! writing.
//!
//! The encoders know nothing about GPU resources; they only produce a byte
//! sequence. [`Std140Block`] additionally records named offsets so a caller
//! can patch locations after the fact.

use std::collections::HashMap;

use glam::{Mat3, UVec3, UVec4, Vec2, Vec3, Vec4};

/// Rounds `offset` up to the next multiple of `align`.
pub(crate) fn align_to(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// Encoder for uniform blocks (rule-set A).
///
/// `vec3`/`uvec3` values occupy a full 16-byte slot with an implicit trailing
/// zero component. Matrices are not supported under this rule-set.
#[derive(Default)]
pub struct Std140Block {
    buf: Vec<u8>,
    offset: usize,
    named: HashMap<String, usize>,
}

impl Std140Block {
    pub fn new() -> Self {
        Self::with_capacity(4)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; initial.max(4)],
            offset: 0,
            named: HashMap::new(),
        }
    }

    fn ensure(&mut self, want: usize) {
        let target = self.offset + want;
        if target > self.buf.len() {
            let grown = (self.buf.len() * 2).max(target);
            self.buf.resize(grown, 0);
        }
    }

    fn put_word(&mut self, word: [u8; 4]) {
        self.buf[self.offset..self.offset + 4].copy_from_slice(&word);
        self.offset += 4;
    }

    /// Appends a `uint`. The cursor is always 4-byte aligned, so no padding
    /// is inserted.
    pub fn add_u32(&mut self, v: u32) {
        self.ensure(4);
        self.put_word(v.to_le_bytes());
    }

    /// Appends a `uint` and records its byte offset under `name` for
    /// [`location`](Self::location) lookups.
    pub fn add_u32_named(&mut self, v: u32, name: &str) {
        self.named.insert(name.to_owned(), self.offset);
        self.add_u32(v);
    }

    pub fn add_vec2(&mut self, v: Vec2) {
        self.offset = align_to(self.offset, 8);
        self.ensure(8);
        self.put_word(v.x.to_le_bytes());
        self.put_word(v.y.to_le_bytes());
    }

    /// Appends a `vec3`, stored as a full 16-byte slot with a zero fourth
    /// component.
    pub fn add_vec3(&mut self, v: Vec3) {
        self.add_vec4(v.extend(0.0));
    }

    pub fn add_vec4(&mut self, v: Vec4) {
        self.offset = align_to(self.offset, 16);
        self.ensure(16);
        for f in v.to_array() {
            self.put_word(f.to_le_bytes());
        }
    }

    /// Appends a `uvec3`, stored as a full 16-byte slot with a zero fourth
    /// component.
    pub fn add_uvec3(&mut self, v: UVec3) {
        self.add_uvec4(v.extend(0));
    }

    pub fn add_uvec4(&mut self, v: UVec4) {
        self.offset = align_to(self.offset, 16);
        self.ensure(16);
        for u in v.to_array() {
            self.put_word(u.to_le_bytes());
        }
    }

    /// Returns the byte offset previously recorded under `name`, or `None`
    /// if no value was added under that name.
    pub fn location(&self, name: &str) -> Option<usize> {
        self.named.get(name).copied()
    }

    /// The encoded bytes, trimmed to the write cursor.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

/// Encoder for storage blocks (rule-set B).
///
/// Identical vector rules to [`Std140Block`], plus column-major `mat3`
/// support: three columns, each padded to a 16-byte slot.
#[derive(Default)]
pub struct Std430Block {
    buf: Vec<u8>,
    offset: usize,
}

impl Std430Block {
    pub fn new() -> Self {
        Self {
            buf: vec![0; 4],
            offset: 0,
        }
    }

    fn ensure(&mut self, want: usize) {
        let target = self.offset + want;
        if target > self.buf.len() {
            let grown = (self.buf.len() * 2).max(target);
            self.buf.resize(grown, 0);
        }
    }

    fn put_word(&mut self, word: [u8; 4]) {
        self.buf[self.offset..self.offset + 4].copy_from_slice(&word);
        self.offset += 4;
    }

    pub fn add_u32(&mut self, v: u32) {
        self.ensure(4);
        self.put_word(v.to_le_bytes());
    }

    pub fn add_vec2(&mut self, v: Vec2) {
        self.offset = align_to(self.offset, 8);
        self.ensure(8);
        self.put_word(v.x.to_le_bytes());
        self.put_word(v.y.to_le_bytes());
    }

    pub fn add_vec3(&mut self, v: Vec3) {
        self.add_vec4(v.extend(0.0));
    }

    pub fn add_vec4(&mut self, v: Vec4) {
        self.offset = align_to(self.offset, 16);
        self.ensure(16);
        for f in v.to_array() {
            self.put_word(f.to_le_bytes());
        }
    }

    pub fn add_uvec3(&mut self, v: UVec3) {
        self.add_uvec4(v.extend(0));
    }

    pub fn add_uvec4(&mut self, v: UVec4) {
        self.offset = align_to(self.offset, 16);
        self.ensure(16);
        for u in v.to_array() {
            self.put_word(u.to_le_bytes());
        }
    }

    /// Appends a column-major `mat3`: three columns, each a `vec3` padded to
    /// a 16-byte, 16-byte-aligned slot.
    pub fn add_mat3(&mut self, m: Mat3) {
        self.offset = align_to(self.offset, 16);
        self.ensure(48);
        for col in [m.x_axis, m.y_axis, m.z_axis] {
            for f in col.extend(0.0).to_array() {
                self.put_word(f.to_le_bytes());
            }
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}
