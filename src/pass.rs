//! Ray tracing pass encoding.
//!
//! A [`RayTracingPass`] wraps a compute pass and assembles the pieces a
//! dispatch needs: the pipeline's compute kernel, the user's bind groups,
//! and, at trace time, the internal binding set carrying the dispatch
//! parameters, the binding table and the acceleration buffers.
//!
//! Binding a group that carries an acceleration container tag records that
//! container; only one may be bound at a time, and it must be the exact
//! container the pipeline was compiled against.

use std::sync::Arc;

use glam::UVec3;

use crate::accel::TopLevelContainer;
use crate::device::ComputePass;
use crate::error::{Result, StateError, ValidationError};
use crate::pipeline::RayTracingPipeline;
use crate::rtx::{RtxBindGroup, RtxDevice, ShaderBindingTable};

/// Workgroup shape of every combined kernel. Trace dimensions must divide
/// evenly by it.
pub const WORKGROUP_SIZE: [u32; 3] = [8, 8, 1];

pub struct RayTracingPass<'a> {
    rtx: &'a RtxDevice,
    pass: Box<dyn ComputePass + 'a>,
    pipeline: Option<&'a RayTracingPipeline>,
    container: Option<Arc<TopLevelContainer>>,
}

impl<'a> RayTracingPass<'a> {
    pub(crate) fn new(rtx: &'a RtxDevice, pass: Box<dyn ComputePass + 'a>) -> Self {
        Self {
            rtx,
            pass,
            pipeline: None,
            container: None,
        }
    }

    pub fn set_pipeline(&mut self, pipeline: &'a RayTracingPipeline) {
        self.pipeline = Some(pipeline);
        self.pass.set_pipeline(pipeline.compute_pipeline());
    }

    /// Binds a user bind group. A group tagged with an acceleration
    /// container binds that container to the pass; binding a second,
    /// different container is an error.
    pub fn set_bind_group(&mut self, index: u32, bind_group: &RtxBindGroup) -> Result<()> {
        if let Some(container) = bind_group.container() {
            match &self.container {
                Some(bound) if Arc::ptr_eq(bound, container) => {}
                Some(_) => return Err(StateError::ContainerAlreadyBound.into()),
                None => self.container = Some(container.clone()),
            }
        }
        self.pass.set_bind_group(index, bind_group.raw());
        Ok(())
    }

    /// Issues one ray tracing dispatch over a `width` × `height` × `depth`
    /// grid of rays.
    pub fn trace_rays(
        &mut self,
        sbt: &ShaderBindingTable,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let container = self
            .container
            .as_ref()
            .ok_or(StateError::MissingContainer)?;
        let pipeline = self.pipeline.ok_or(StateError::MissingPipeline)?;
        // the kernel bakes in the container's geometry count and bind-set
        // numbering; structural equality is not enough
        if pipeline.container_id() != container.id() {
            return Err(StateError::ContainerMismatch.into());
        }

        let [wx, wy, wz] = WORKGROUP_SIZE;
        if width % wx != 0 || height % wy != 0 || depth % wz != 0 {
            return Err(ValidationError::DimensionsNotDivisible {
                width,
                height,
                depth,
            }
            .into());
        }
        let workgroups = UVec3::new(width / wx, height / wy, depth / wz);

        let internal = container.final_bind_group(self.rtx, pipeline, sbt, workgroups)?;
        self.pass
            .set_bind_group(pipeline.internal_bind_set(), internal);
        self.pass
            .dispatch_workgroups(workgroups.x, workgroups.y, workgroups.z);
        Ok(())
    }

    pub fn end(mut self) {
        self.pass.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{
        BottomLevel, BufferBinding, GeometryDescriptor, Instance, BINDING_BOTTOM_LEVEL_NODES,
        BINDING_GEOMETRY_BUFFERS_START, BINDING_SHADER_BINDING_TABLE, BINDING_TOP_LEVEL_NODES,
        BINDING_UNIFORM_PARAMS,
    };
    use crate::device::{BufferDescriptor, BufferUsages};
    use crate::error::Error;
    use crate::rtx::{BindingResource, BufferRegion, RtxBindGroupEntry};
    use crate::shader::{
        RayTracingPipelineDescriptor, ShaderGroupDescriptor, ShaderStageDescriptor, StageKind,
    };
    use crate::testing::{rtx_harness, stage, PassCommand, RtxHarness};

    fn stages() -> Vec<ShaderStageDescriptor> {
        vec![
            stage(StageKind::Generation, "gen"),
            stage(StageKind::Miss, "miss"),
        ]
    }

    fn build_container(h: &RtxHarness) -> Arc<TopLevelContainer> {
        let vertices = h.rtx.create_buffer(&BufferDescriptor {
            size: 108,
            usage: BufferUsages::ACCELERATION_STRUCTURE_BUILD_INPUT,
            mapped_at_creation: false,
        });
        let bottom = BottomLevel::new(vec![GeometryDescriptor::Triangles {
            vertex: BufferBinding {
                buffer: vertices,
                offset: 0,
                size: 108,
            },
            vertex_stride: 12,
            index: None,
        }]);
        let container = h
            .rtx
            .create_acceleration_container(vec![Instance::new(bottom, 0)]);
        h.rtx.build_acceleration_container(&container).unwrap();
        container
    }

    fn make_sbt(h: &RtxHarness) -> ShaderBindingTable {
        let buffer = h.rtx.create_buffer(&BufferDescriptor {
            size: 256,
            usage: BufferUsages::SHADER_BINDING_TABLE,
            mapped_at_creation: false,
        });
        ShaderBindingTable {
            buffer,
            ray_gen: BufferRegion {
                start: 0,
                stride: 0,
                size: 64,
            },
            ray_miss: BufferRegion {
                start: 64,
                stride: 32,
                size: 64,
            },
            ray_hit: BufferRegion {
                start: 128,
                stride: 32,
                size: 64,
            },
            callable: BufferRegion::default(),
        }
    }

    struct Setup {
        h: RtxHarness,
        container: Arc<TopLevelContainer>,
        pipeline: crate::pipeline::RayTracingPipeline,
        sbt: ShaderBindingTable,
        bind_group: crate::rtx::RtxBindGroup,
    }

    fn setup() -> Setup {
        let h = rtx_harness();
        let container = build_container(&h);
        let pipeline = h
            .rtx
            .create_ray_tracing_pipeline(
                RayTracingPipelineDescriptor {
                    stages: stages(),
                    groups: vec![
                        ShaderGroupDescriptor::General { stage: 0 },
                        ShaderGroupDescriptor::General { stage: 1 },
                    ],
                },
                &container,
            )
            .unwrap();
        let sbt = make_sbt(&h);
        let bind_group = h
            .rtx
            .create_bind_group(
                pipeline.bind_group_layout(0),
                &[RtxBindGroupEntry {
                    binding: 0,
                    resource: BindingResource::AccelerationContainer(container.clone()),
                }],
            )
            .unwrap();
        Setup {
            h,
            container,
            pipeline,
            sbt,
            bind_group,
        }
    }

    #[test]
    fn trace_requires_a_bound_container() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        assert!(matches!(
            pass.trace_rays(&s.sbt, 16, 16, 1),
            Err(Error::State(StateError::MissingContainer))
        ));
    }

    #[test]
    fn trace_requires_a_pipeline() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_bind_group(0, &s.bind_group).unwrap();
        assert!(matches!(
            pass.trace_rays(&s.sbt, 16, 16, 1),
            Err(Error::State(StateError::MissingPipeline))
        ));
    }

    #[test]
    fn second_container_cannot_be_bound() {
        let s = setup();
        let other = build_container(&s.h);
        let other_group = s
            .h
            .rtx
            .create_bind_group(
                s.pipeline.bind_group_layout(0),
                &[RtxBindGroupEntry {
                    binding: 0,
                    resource: BindingResource::AccelerationContainer(other),
                }],
            )
            .unwrap();

        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_bind_group(0, &s.bind_group).unwrap();
        assert!(matches!(
            pass.set_bind_group(1, &other_group),
            Err(Error::State(StateError::ContainerAlreadyBound))
        ));
    }

    #[test]
    fn rebinding_the_same_group_is_not_a_new_container() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_bind_group(0, &s.bind_group).unwrap();
        pass.set_bind_group(0, &s.bind_group).unwrap();
    }

    #[test]
    fn pipeline_and_container_must_be_paired() {
        let s = setup();
        // structurally identical but a distinct object
        let other = build_container(&s.h);
        let other_group = s
            .h
            .rtx
            .create_bind_group(
                s.pipeline.bind_group_layout(0),
                &[RtxBindGroupEntry {
                    binding: 0,
                    resource: BindingResource::AccelerationContainer(other),
                }],
            )
            .unwrap();

        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        pass.set_bind_group(0, &other_group).unwrap();
        assert!(matches!(
            pass.trace_rays(&s.sbt, 16, 16, 1),
            Err(Error::State(StateError::ContainerMismatch))
        ));
    }

    #[test]
    fn dimensions_must_divide_by_the_workgroup_size() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        pass.set_bind_group(0, &s.bind_group).unwrap();
        assert!(matches!(
            pass.trace_rays(&s.sbt, 15, 16, 1),
            Err(Error::Validation(
                ValidationError::DimensionsNotDivisible { width: 15, .. }
            ))
        ));
    }

    #[test]
    fn trace_dispatches_quotient_workgroups() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        pass.set_bind_group(0, &s.bind_group).unwrap();
        pass.trace_rays(&s.sbt, 16, 16, 1).unwrap();
        pass.end();

        let state = s.h.device.state.lock();
        assert!(state
            .pass_log
            .contains(&PassCommand::Dispatch(2, 2, 1)));
        assert_eq!(state.pass_log.last(), Some(&PassCommand::End));
    }

    #[test]
    fn internal_binding_set_follows_the_fixed_slot_layout() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        pass.set_bind_group(0, &s.bind_group).unwrap();
        pass.trace_rays(&s.sbt, 16, 16, 1).unwrap();

        // the internal set binds one past the highest user set the test
        // transpiler reports
        assert_eq!(s.pipeline.internal_bind_set(), 3);
        let state = s.h.device.state.lock();
        let internal = state
            .pass_log
            .iter()
            .find_map(|command| match command {
                PassCommand::SetBindGroup(3, group) => Some(*group),
                _ => None,
            })
            .expect("internal bind group was not set");

        let (_, entries) = &state.bind_groups[&internal];
        let (top_nodes, bottom_nodes) = s.container.tree_buffers().unwrap();
        assert_eq!(entries[0].binding, BINDING_UNIFORM_PARAMS);
        assert_eq!(entries[1].binding, BINDING_SHADER_BINDING_TABLE);
        assert_eq!(entries[1].buffer, s.sbt.buffer);
        assert_eq!(entries[2].binding, BINDING_TOP_LEVEL_NODES);
        assert_eq!(entries[2].buffer, top_nodes);
        assert_eq!(entries[3].binding, BINDING_BOTTOM_LEVEL_NODES);
        assert_eq!(entries[3].buffer, bottom_nodes);
        assert_eq!(entries[4].binding, BINDING_GEOMETRY_BUFFERS_START);
        assert_eq!(entries[4].buffer, s.container.geometry_buffers().unwrap()[0]);

        // uniform block: seven table words then the workgroup counts in a
        // 16-byte aligned uvec3 slot
        let uniform = &state.buffers[&entries[0].buffer];
        assert!(!uniform.mapped, "uniform block was left mapped");
        assert_eq!(uniform.data.len(), 48);
        let words: Vec<u32> = uniform
            .data
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(&words[0..7], &[0, 64, 32, 128, 32, 0, 0]);
        assert_eq!(&words[8..12], &[2, 2, 1, 0]);
    }

    #[test]
    fn internal_binding_set_is_cached_across_traces() {
        let s = setup();
        let mut pass = s.h.rtx.begin_ray_tracing_pass();
        pass.set_pipeline(&s.pipeline);
        pass.set_bind_group(0, &s.bind_group).unwrap();
        pass.trace_rays(&s.sbt, 16, 16, 1).unwrap();
        pass.trace_rays(&s.sbt, 16, 16, 1).unwrap();

        let state = s.h.device.state.lock();
        let internal_groups: Vec<_> = state
            .pass_log
            .iter()
            .filter_map(|command| match command {
                PassCommand::SetBindGroup(3, group) => Some(*group),
                _ => None,
            })
            .collect();
        assert_eq!(internal_groups.len(), 2);
        assert_eq!(internal_groups[0], internal_groups[1]);
    }
}
