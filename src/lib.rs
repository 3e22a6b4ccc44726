//! # Scoria
//!
//! Ray tracing pipeline emulation on top of compute-only GPU APIs.
//!
//! Hardware ray tracing gives you multi-stage shader dispatch, a shader
//! binding table and on-device acceleration structures. Scoria rebuilds that
//! surface on an API that only runs compute kernels: independently authored
//! stage sources are stitched into one combined kernel with an internal
//! dispatch table, acceleration structures are built on the host and
//! uploaded as plain storage buffers, and every `trace_rays` call becomes a
//! compute dispatch with a byte-exact internal binding set.
//!
//! ## Quick Start
//!
//! ```ignore
//! use scoria::prelude::*;
//!
//! // the adapter wraps your GPU API; the toolchain bundles the external
//! // transpiler, backend compiler and tree builder
//! let rtx = RtxDevice::new(device, toolchain);
//!
//! let bottom = BottomLevel::new(vec![GeometryDescriptor::Triangles {
//!     vertex: BufferBinding { buffer: vertices, offset: 0, size: 108 },
//!     vertex_stride: 12,
//!     index: None,
//! }]);
//! let tlas = rtx.create_acceleration_container(vec![Instance::new(bottom, 0)]);
//! rtx.build_acceleration_container(&tlas)?;
//!
//! let pipeline = rtx.create_ray_tracing_pipeline(descriptor, &tlas)?;
//! let scene = rtx.create_bind_group(pipeline.bind_group_layout(0), &[
//!     RtxBindGroupEntry {
//!         binding: 0,
//!         resource: BindingResource::AccelerationContainer(tlas.clone()),
//!     },
//! ])?;
//!
//! let mut pass = rtx.begin_ray_tracing_pass();
//! pass.set_pipeline(&pipeline);
//! pass.set_bind_group(0, &scene)?;
//! pass.trace_rays(&sbt, 1920, 1080, 1)?;
//! pass.end();
//! ```
//!
//! ## Overview
//!
//! - [`device`]: the [`HostDevice`](device::HostDevice) adapter trait the
//!   caller implements over its GPU API, plus opaque resource handles.
//! - [`toolchain`]: the caller-owned bundle of external collaborators (the
//!   stage transpiler, the backend kernel compiler and the tree builder).
//! - [`layout`]: byte-exact uniform/storage block encoders.
//! - [`accel`]: bottom- and top-level acceleration containers, geometry
//!   buffer deduplication and host-side tree builds.
//! - [`shader`]: stage and group descriptors, and the aggregation of stage
//!   sources into one combined kernel.
//! - [`pipeline`]: compiled ray tracing pipelines and shader group handles.
//! - [`rtx`]: the extension device tying everything together, and the
//!   shader binding table types.
//! - [`pass`]: ray tracing pass encoding and dispatch assembly.

pub mod accel;
pub mod device;
pub mod error;
pub mod layout;
pub mod pass;
pub mod pipeline;
pub mod rtx;
pub mod shader;
pub mod toolchain;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ConfigurationError, Error, Result, StateError, ValidationError};
pub use rtx::RtxDevice;
pub use toolchain::Toolchain;

pub mod prelude {
    pub use crate::accel::{
        BottomLevel, BufferBinding, GeometryDescriptor, GeometryKind, Instance, TopLevelContainer,
    };
    pub use crate::device::{BufferDescriptor, BufferUsages, HostDevice};
    pub use crate::error::{Error, Result};
    pub use crate::pass::RayTracingPass;
    pub use crate::pipeline::RayTracingPipeline;
    pub use crate::rtx::{
        BindingResource, BufferRegion, RtxBindGroup, RtxBindGroupEntry, RtxDevice, SbtLayout,
        ShaderBindingTable,
    };
    pub use crate::shader::{
        RayTracingPipelineDescriptor, ShaderGroupDescriptor, ShaderStageDescriptor, StageKind,
    };
    pub use crate::toolchain::Toolchain;
}
