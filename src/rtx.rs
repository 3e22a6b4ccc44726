//! Ray tracing extension surface over a compute-only device.
//!
//! [`RtxDevice`] plays the role hardware ray tracing extensions play on
//! richer APIs: it owns the injected [`HostDevice`] adapter and the
//! caller-owned [`Toolchain`], and exposes the extension entry points:
//! buffer creation with extension usages, acceleration container creation
//! and host builds, ray tracing pipeline creation, bind groups that may
//! carry an acceleration container, and ray tracing passes.
//!
//! # Shader binding table
//!
//! The binding table is caller-owned and read-only to this layer: one
//! buffer plus four regions. A table entry is a 4-byte shader group handle
//! followed by inline record parameters; [`SbtLayout`] computes the aligned
//! entry layouts.

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::accel::{Instance, TopLevelContainer};
use crate::device::{
    BindGroup, BindGroupEntry, BindGroupLayout, Buffer, BufferDescriptor, BufferUsages, HostDevice,
};
use crate::error::{ConfigurationError, Result};
use crate::pass::RayTracingPass;
use crate::pipeline::{validate_groups, RayTracingPipeline};
use crate::shader::{aggregate_and_compile, RayTracingPipelineDescriptor};
use crate::toolchain::Toolchain;

/// Size in bytes of a shader group handle inside a binding table record.
pub const SHADER_GROUP_HANDLE_SIZE: u32 = 4;
/// Required alignment of each region start within the binding table buffer.
pub const SHADER_GROUP_BASE_ALIGNMENT: u32 = 64;
/// Required alignment of each record within a region.
pub const SHADER_GROUP_HANDLE_ALIGNMENT: u32 = 32;
/// Maximum allowed record stride.
pub const SHADER_GROUP_RECORD_MAX_STRIDE: u32 = 4096;

/// A region of the binding table buffer. Strides are meaningful for the
/// miss, hit and callable regions; the generation region uses only `start`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BufferRegion {
    pub start: u32,
    pub stride: u32,
    pub size: u32,
}

/// The caller-owned shader binding table.
#[derive(Clone, Copy, Debug)]
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub ray_gen: BufferRegion,
    pub ray_miss: BufferRegion,
    pub ray_hit: BufferRegion,
    pub callable: BufferRegion,
}

/// Alignment parameters for laying out binding table records.
#[derive(Clone, Copy, Debug)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub base_alignment: u32,
    pub entry_alignment: u32,
}

impl Default for SbtLayout {
    fn default() -> Self {
        Self {
            handle_size: SHADER_GROUP_HANDLE_SIZE,
            base_alignment: SHADER_GROUP_BASE_ALIGNMENT,
            entry_alignment: SHADER_GROUP_HANDLE_ALIGNMENT,
        }
    }
}

impl SbtLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory layout of a generation record with `param_size` bytes of
    /// inline parameters. Generation records use the base alignment because
    /// their start is handed to the dispatch directly.
    pub fn raygen_layout(&self, param_size: u32) -> Layout {
        layout(self.handle_size + param_size, self.base_alignment)
    }

    /// Memory layout of a miss record with `param_size` bytes of inline
    /// parameters.
    pub fn miss_layout(&self, param_size: u32) -> Layout {
        layout(self.handle_size + param_size, self.entry_alignment)
    }

    /// Memory layout of a callable record with `param_size` bytes of inline
    /// parameters.
    pub fn callable_layout(&self, param_size: u32) -> Layout {
        layout(self.handle_size + param_size, self.entry_alignment)
    }

    /// Memory layout of a hit group record with `param_size` bytes of
    /// inline parameters.
    pub fn hitgroup_layout(&self, param_size: u32) -> Layout {
        layout(self.handle_size + param_size, self.entry_alignment)
    }
}

fn layout(size: u32, align: u32) -> Layout {
    Layout::from_size_align(size as usize, align as usize)
        .expect("shader group alignments are nonzero powers of two")
}

/// A bind group resource, as accepted by
/// [`RtxDevice::create_bind_group`].
#[derive(Clone)]
pub enum BindingResource {
    Buffer(Buffer),
    /// Bound in place of a buffer; substituted with an internal placeholder
    /// uniform and recorded as the group's acceleration container tag.
    AccelerationContainer(Arc<TopLevelContainer>),
}

#[derive(Clone)]
pub struct RtxBindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

/// A bind group that may carry an acceleration container tag the pass
/// encoder inspects.
#[derive(Clone)]
pub struct RtxBindGroup {
    raw: BindGroup,
    container: Option<Arc<TopLevelContainer>>,
}

impl RtxBindGroup {
    pub fn raw(&self) -> BindGroup {
        self.raw
    }

    pub(crate) fn container(&self) -> Option<&Arc<TopLevelContainer>> {
        self.container.as_ref()
    }
}

/// The ray tracing extension device.
pub struct RtxDevice {
    device: Arc<dyn HostDevice>,
    toolchain: Toolchain,
    /// Host mirrors of buffers created with
    /// `ACCELERATION_STRUCTURE_BUILD_INPUT`; the tree builder reads these.
    staging: Mutex<HashMap<Buffer, Vec<u8>>>,
    placeholder_container_uniform: OnceLock<Buffer>,
}

impl RtxDevice {
    pub fn new(device: Arc<dyn HostDevice>, toolchain: Toolchain) -> Self {
        Self {
            device,
            toolchain,
            staging: Mutex::new(HashMap::new()),
            placeholder_container_uniform: OnceLock::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn HostDevice> {
        &self.device
    }

    pub(crate) fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub(crate) fn staging(&self) -> &Mutex<HashMap<Buffer, Vec<u8>>> {
        &self.staging
    }

    /// Creates a buffer, rewriting extension usages to plain storage. A
    /// buffer created with `ACCELERATION_STRUCTURE_BUILD_INPUT` keeps a
    /// host-side staging mirror that [`write_buffer`](Self::write_buffer)
    /// updates and acceleration builds read.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Buffer {
        let mut usage = descriptor.usage;
        let staged = usage.contains(BufferUsages::ACCELERATION_STRUCTURE_BUILD_INPUT);
        if staged {
            usage.remove(BufferUsages::ACCELERATION_STRUCTURE_BUILD_INPUT);
            usage.insert(BufferUsages::STORAGE);
        }
        if usage.contains(BufferUsages::SHADER_BINDING_TABLE) {
            usage.remove(BufferUsages::SHADER_BINDING_TABLE);
            usage.insert(BufferUsages::STORAGE);
        }
        let buffer = self.device.create_buffer(&BufferDescriptor {
            usage,
            ..*descriptor
        });
        if staged {
            self.staging
                .lock()
                .insert(buffer, vec![0; descriptor.size as usize]);
        }
        buffer
    }

    /// Writes buffer contents, keeping the staging mirror in sync.
    pub fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]) {
        self.device.write_buffer(buffer, offset, data);
        if let Some(staged) = self.staging.lock().get_mut(&buffer) {
            let end = offset as usize + data.len();
            if staged.len() < end {
                staged.resize(end, 0);
            }
            staged[offset as usize..end].copy_from_slice(data);
        }
    }

    pub fn unmap_buffer(&self, buffer: Buffer) {
        self.device.unmap_buffer(buffer);
    }

    /// Creates a top-level acceleration container. Bottom-level containers
    /// are not device objects of their own; they exist as part of the
    /// top-level description.
    pub fn create_acceleration_container(&self, instances: Vec<Instance>) -> Arc<TopLevelContainer> {
        TopLevelContainer::new(instances)
    }

    /// Builds the container's trees on the host and uploads them. Idempotent.
    pub fn build_acceleration_container(&self, container: &TopLevelContainer) -> Result<()> {
        container.build(self)
    }

    /// Compiles the stage list into one combined kernel sized for
    /// `container` and wraps it in a compute pipeline.
    ///
    /// The container does not need to be built yet, but dispatches of the
    /// returned pipeline must bind exactly this container.
    pub fn create_ray_tracing_pipeline(
        &self,
        descriptor: RayTracingPipelineDescriptor,
        container: &Arc<TopLevelContainer>,
    ) -> Result<RayTracingPipeline> {
        validate_groups(&descriptor)?;
        let (records, dedup) = container.collect_unique_geometry();
        let aggregated =
            aggregate_and_compile(&self.toolchain, &descriptor.stages, &records, dedup.len())?;
        let compute = self.device.create_compute_pipeline(&aggregated.module);
        Ok(RayTracingPipeline::new(
            self.device.clone(),
            descriptor,
            compute,
            aggregated.next_unused_bind_set,
            container.id(),
        ))
    }

    /// Creates a bind group. At most one entry may be an acceleration
    /// container; it is substituted with a placeholder uniform buffer and
    /// recorded as the group's container tag.
    pub fn create_bind_group(
        &self,
        layout: BindGroupLayout,
        entries: &[RtxBindGroupEntry],
    ) -> Result<RtxBindGroup> {
        let mut container = None;
        let mut raw: SmallVec<[BindGroupEntry; 8]> = SmallVec::new();
        for entry in entries {
            match &entry.resource {
                BindingResource::Buffer(buffer) => raw.push(BindGroupEntry {
                    binding: entry.binding,
                    buffer: *buffer,
                }),
                BindingResource::AccelerationContainer(tagged) => {
                    if container.is_some() {
                        return Err(ConfigurationError::MultipleAccelerationContainers.into());
                    }
                    container = Some(tagged.clone());
                    raw.push(BindGroupEntry {
                        binding: entry.binding,
                        buffer: self.placeholder_uniform(),
                    });
                }
            }
        }
        Ok(RtxBindGroup {
            raw: self.device.create_bind_group(layout, &raw),
            container,
        })
    }

    pub fn begin_ray_tracing_pass(&self) -> RayTracingPass<'_> {
        RayTracingPass::new(self, self.device.begin_compute_pass())
    }

    fn placeholder_uniform(&self) -> Buffer {
        *self.placeholder_container_uniform.get_or_init(|| {
            let buffer = self.device.create_buffer(&BufferDescriptor {
                size: 8,
                usage: BufferUsages::UNIFORM,
                mapped_at_creation: true,
            });
            self.device.write_buffer(buffer, 0, &[0u8; 8]);
            self.device.unmap_buffer(buffer);
            buffer
        })
    }
}
