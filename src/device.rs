//! Host GPU device adapter.
//!
//! The emulation layer never talks to a concrete graphics API. Instead the
//! caller injects an adapter implementing [`HostDevice`], a deliberately
//! small capability surface: buffer creation with optional
//! mapped-at-creation writes, bind group creation, compute pipeline creation
//! from a compiled kernel module, and compute pass encoding. Everything else
//! the emulation needs is built on top of these.
//!
//! Resource handles are opaque integers minted by the adapter. Handle
//! equality is identity: the geometry dedup map and the acceleration-
//! container pairing checks rely on it.

use bitflags::bitflags;

use crate::shader::KernelModule;

/// Opaque handle to a device buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Buffer(u64);

impl Buffer {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to a bind group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BindGroup(u64);

impl BindGroup {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to a bind group layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BindGroupLayout(u64);

impl BindGroupLayout {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to a compute pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ComputePipeline(u64);

impl ComputePipeline {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

bitflags! {
    /// Buffer usage flags.
    ///
    /// The two high bits are extension usages understood only by
    /// [`RtxDevice`](crate::rtx::RtxDevice); they are rewritten to `STORAGE`
    /// before a descriptor reaches the adapter.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;

        /// The buffer feeds acceleration-structure builds. Implies a
        /// host-side staging mirror maintained by the extension device.
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 1 << 16;
        /// The buffer holds a shader binding table.
        const SHADER_BINDING_TABLE = 1 << 17;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

/// One entry of a device-level bind group. At this layer every resource is a
/// buffer; acceleration containers are resolved to buffers before getting
/// here.
#[derive(Clone, Copy, Debug)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub buffer: Buffer,
}

/// A recording compute pass.
///
/// Commands are encoded onto a single ordered stream; the adapter decides
/// when they actually execute. Nothing in the emulation layer waits for
/// completion.
pub trait ComputePass {
    fn set_pipeline(&mut self, pipeline: ComputePipeline);
    fn set_bind_group(&mut self, index: u32, bind_group: BindGroup);
    fn dispatch_workgroups(&mut self, x: u32, y: u32, z: u32);
    fn end(&mut self);
}

/// Capability surface the emulation layer requires from the host GPU API.
pub trait HostDevice: Send + Sync {
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Buffer;

    /// Writes into a buffer created with `mapped_at_creation`.
    fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]);

    fn unmap_buffer(&self, buffer: Buffer);

    fn create_bind_group(&self, layout: BindGroupLayout, entries: &[BindGroupEntry]) -> BindGroup;

    /// Creates a compute pipeline from a compiled kernel module, deriving
    /// bind group layouts from the module.
    fn create_compute_pipeline(&self, module: &KernelModule) -> ComputePipeline;

    /// Returns the layout the pipeline derived for bind set `index`.
    fn pipeline_bind_group_layout(&self, pipeline: ComputePipeline, index: u32) -> BindGroupLayout;

    fn begin_compute_pass(&self) -> Box<dyn ComputePass + '_>;
}
