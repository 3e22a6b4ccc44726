//! Ray tracing pipelines.
//!
//! A [`RayTracingPipeline`] wraps the compute pipeline compiled from the
//! combined kernel. It remembers the acceleration container it was compiled
//! against: the kernel bakes in that container's geometry-buffer count and
//! bind-set numbering, so dispatching it against any other container is an
//! error the pass encoder enforces.
//!
//! Shader groups resolve to packed handles the caller writes into its
//! binding table: hit groups pack the per-kind handles of their any-hit,
//! closest-hit and intersection stages into one word, one byte each, with
//! [`SHADER_UNUSED`] marking absent stages; general groups resolve to the
//! referenced stage's per-kind handle directly.

use std::sync::Arc;

use crate::device::{BindGroupLayout, ComputePipeline, HostDevice};
use crate::error::{ConfigurationError, Result};
use crate::shader::{
    per_kind_handles, RayTracingPipelineDescriptor, ShaderGroupDescriptor, StageKind,
};

/// A resolved shader group handle, as written into binding table records.
pub type ShaderGroupHandle = u32;

/// Per-byte sentinel for an absent stage in a packed hit group handle.
pub const SHADER_UNUSED: u32 = 0xff;

/// Handle of a hit group with no stages at all.
pub const HIT_GROUP_ALL_SHADERS_UNUSED_HANDLE: u32 = 0x00ff_ffff;

pub struct RayTracingPipeline {
    device: Arc<dyn HostDevice>,
    descriptor: RayTracingPipelineDescriptor,
    pipeline: ComputePipeline,
    /// Bind set number of the emulation layer's internal resources; one
    /// past the highest set the user stages declare.
    internal_bind_set: u32,
    /// Identity of the acceleration container the kernel was compiled
    /// against.
    container_id: u64,
}

impl RayTracingPipeline {
    pub(crate) fn new(
        device: Arc<dyn HostDevice>,
        descriptor: RayTracingPipelineDescriptor,
        pipeline: ComputePipeline,
        internal_bind_set: u32,
        container_id: u64,
    ) -> Self {
        Self {
            device,
            descriptor,
            pipeline,
            internal_bind_set,
            container_id,
        }
    }

    pub fn compute_pipeline(&self) -> ComputePipeline {
        self.pipeline
    }

    /// The bind set number reserved for the emulation layer's internal
    /// resources.
    pub fn internal_bind_set(&self) -> u32 {
        self.internal_bind_set
    }

    pub fn bind_group_layout(&self, index: u32) -> BindGroupLayout {
        self.device.pipeline_bind_group_layout(self.pipeline, index)
    }

    pub(crate) fn container_id(&self) -> u64 {
        self.container_id
    }

    /// Resolves `count` consecutive shader groups starting at `first` to
    /// packed handles.
    pub fn shader_group_handles(
        &self,
        first: usize,
        count: usize,
    ) -> Result<Vec<ShaderGroupHandle>> {
        let groups = &self.descriptor.groups;
        let end = first
            .checked_add(count)
            .filter(|&end| end <= groups.len())
            .ok_or(ConfigurationError::GroupRangeOutOfBounds {
                first,
                end: first.saturating_add(count),
                count: groups.len(),
            })?;

        let handles = per_kind_handles(&self.descriptor.stages);
        groups[first..end]
            .iter()
            .map(|group| resolve_group(&self.descriptor, &handles, group))
            .collect()
    }
}

/// Validates every group's stage references. Run at pipeline creation, before
/// any external toolchain call.
pub(crate) fn validate_groups(descriptor: &RayTracingPipelineDescriptor) -> Result<()> {
    let handles = per_kind_handles(&descriptor.stages);
    for group in &descriptor.groups {
        resolve_group(descriptor, &handles, group)?;
    }
    Ok(())
}

fn stage_kind(descriptor: &RayTracingPipelineDescriptor, index: usize) -> Result<StageKind> {
    descriptor
        .stages
        .get(index)
        .map(|stage| stage.kind)
        .ok_or_else(|| {
            ConfigurationError::StageIndexOutOfRange {
                index,
                count: descriptor.stages.len(),
            }
            .into()
        })
}

fn hit_component(
    descriptor: &RayTracingPipelineDescriptor,
    handles: &[u32],
    index: Option<usize>,
    expected: StageKind,
) -> Result<u32> {
    let Some(index) = index else {
        return Ok(SHADER_UNUSED);
    };
    let actual = stage_kind(descriptor, index)?;
    if actual != expected {
        return Err(ConfigurationError::StageKindMismatch {
            index,
            expected,
            actual,
        }
        .into());
    }
    Ok(handles[index] & 0xff)
}

fn resolve_group(
    descriptor: &RayTracingPipelineDescriptor,
    handles: &[u32],
    group: &ShaderGroupDescriptor,
) -> Result<ShaderGroupHandle> {
    match *group {
        ShaderGroupDescriptor::General { stage } => {
            let actual = stage_kind(descriptor, stage)?;
            if !matches!(actual, StageKind::Generation | StageKind::Miss) {
                return Err(ConfigurationError::GeneralGroupStageInvalid {
                    index: stage,
                    actual,
                }
                .into());
            }
            Ok(handles[stage] & 0xff)
        }
        ShaderGroupDescriptor::TrianglesHitGroup {
            closest_hit,
            any_hit,
        } => {
            let ahit = hit_component(descriptor, handles, any_hit, StageKind::AnyHit)?;
            let chit = hit_component(descriptor, handles, closest_hit, StageKind::ClosestHit)?;
            Ok((ahit << 16) | (chit << 8) | SHADER_UNUSED)
        }
        ShaderGroupDescriptor::ProceduralHitGroup {
            intersection,
            closest_hit,
            any_hit,
        } => {
            let rint = hit_component(
                descriptor,
                handles,
                Some(intersection),
                StageKind::Intersection,
            )?;
            let ahit = hit_component(descriptor, handles, any_hit, StageKind::AnyHit)?;
            let chit = hit_component(descriptor, handles, closest_hit, StageKind::ClosestHit)?;
            Ok((ahit << 16) | (chit << 8) | rint)
        }
    }
}
