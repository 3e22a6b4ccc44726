//! Acceleration container assembly.
//!
//! The target API has no on-device acceleration structures, so they are
//! built on the host: every unique bottom-level container is handed to the
//! external tree builder, the serialized trees are concatenated into one
//! device buffer, and a second buffer holds the top-level tree over the
//! instances. Geometry buffers referenced by more than one geometry or
//! container are deduplicated into a single ordered list shared by the
//! combined kernel and the dispatch-time binding set.
//!
//! Bottom-level containers are deduplicated by identity, not by structural
//! equality: two containers with identical contents are distinct unless they
//! are the same object. Identity is an explicit handle minted at creation.
//!
//! [`TopLevelContainer::build`] runs at most once; the two device buffers,
//! once produced, never change for the lifetime of the container.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use glam::{Affine3A, Mat3, UVec3, Vec3};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::device::{BindGroup, BindGroupEntry, Buffer, BufferDescriptor, BufferUsages};
use crate::error::{ConfigurationError, Error, Result, StateError};
use crate::layout::Std140Block;
use crate::pipeline::RayTracingPipeline;
use crate::rtx::{RtxDevice, ShaderBindingTable};
use crate::toolchain::{GeometryBuildRecord, InstanceRecord};

/// Binding slots of the internal resource set the combined kernel expects.
/// The dispatch assembler reproduces exactly this layout.
pub const BINDING_UNIFORM_PARAMS: u32 = 0;
pub const BINDING_SHADER_BINDING_TABLE: u32 = 1;
pub const BINDING_TOP_LEVEL_NODES: u32 = 2;
pub const BINDING_BOTTOM_LEVEL_NODES: u32 = 3;
pub const BINDING_GEOMETRY_BUFFERS_START: u32 = 4;

/// Byte distance between the min and max corner of a serialized node; the
/// min corner starts at byte 0 of the blob (storage-block vec3 padding).
const NODE_MAX_CORNER_OFFSET: usize = 16;

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug)]
pub struct BufferBinding {
    pub buffer: Buffer,
    pub offset: u64,
    pub size: u64,
}

/// Geometry type tag shared with the combined kernel and the tree builder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum GeometryKind {
    Triangles = 0,
    AxisAlignedBoxes = 1,
}

#[derive(Clone, Debug)]
pub enum GeometryDescriptor {
    Triangles {
        vertex: BufferBinding,
        /// Byte stride between vertices. Positions are three consecutive
        /// 32-bit floats at the start of each element.
        vertex_stride: u64,
        /// Optional 32-bit index data; three indices per triangle.
        index: Option<BufferBinding>,
    },
    AxisAlignedBoxes {
        data: BufferBinding,
        /// Byte stride between boxes; each box is six 32-bit floats.
        stride: u64,
    },
}

/// One per-geometry record of the combined kernel's descriptor table,
/// emitted as an eight-integer initializer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GeometryRecord {
    pub vertex_buffer: i32,
    /// Dedup index of the index buffer, or -1.
    pub index_buffer: i32,
    pub vertex_offset: u32,
    pub vertex_stride: u32,
    pub index_offset: u32,
    pub index_stride: u32,
    pub kind: GeometryKind,
    pub flags: u32,
}

/// A bottom-level container: one object's raw geometry.
///
/// Containers are compared by identity. Sharing geometry between two
/// containers does not merge them; share the container itself across
/// instances instead.
pub struct BottomLevel {
    id: u64,
    geometries: Vec<GeometryDescriptor>,
}

impl BottomLevel {
    pub fn new(geometries: Vec<GeometryDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
            geometries,
        })
    }

    pub fn geometries(&self) -> &[GeometryDescriptor] {
        &self.geometries
    }
}

/// One placement of a bottom-level container in the scene.
#[derive(Clone)]
pub struct Instance {
    pub bottom_level: Arc<BottomLevel>,
    /// 24-bit offset into the hit region of the binding table.
    pub sbt_record_offset: u32,
    /// 24-bit user value surfaced to shaders, serialized as -1 when absent.
    pub custom_index: Option<u32>,
    /// Object-to-world transform; identity when absent.
    pub transform: Option<Affine3A>,
    /// 8-bit visibility mask. Currently a placeholder.
    pub mask: u8,
    /// Currently a placeholder.
    pub flags: u32,
}

impl Instance {
    pub fn new(bottom_level: Arc<BottomLevel>, sbt_record_offset: u32) -> Self {
        Self {
            bottom_level,
            sbt_record_offset,
            custom_index: None,
            transform: None,
            mask: 0xff,
            flags: 0,
        }
    }
}

/// Assigns each referenced data buffer a stable index in first-encountered
/// order. One map is shared across a whole top-level container.
#[derive(Default)]
pub struct GeometryBufferDedupMap {
    index: HashMap<Buffer, u32>,
    ordered: Vec<Buffer>,
}

impl GeometryBufferDedupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer's index, assigning the next sequential one on
    /// first encounter.
    pub fn assign(&mut self, buffer: Buffer) -> u32 {
        if let Some(&index) = self.index.get(&buffer) {
            return index;
        }
        let index = self.ordered.len() as u32;
        self.index.insert(buffer, index);
        self.ordered.push(buffer);
        index
    }

    pub fn get(&self, buffer: Buffer) -> Option<u32> {
        self.index.get(&buffer).copied()
    }

    /// Unique buffers ordered by their assigned index.
    pub fn buffers(&self) -> &[Buffer] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

struct BottomInfo {
    node_start: u32,
    geometry_id_offset: u32,
    aabb_min: Vec3,
    aabb_max: Vec3,
}

pub(crate) struct BuiltContainer {
    pub top_nodes: Buffer,
    pub bottom_nodes: Buffer,
    /// Unique geometry buffers in dedup-index order.
    pub geometry_buffers: Vec<Buffer>,
    pub geometry_records: Vec<GeometryRecord>,
}

/// A top-level acceleration container: an ordered set of instances and,
/// once built, the two device-resident tree buffers.
///
/// Dropping the container releases everything it owns on the host; the
/// device buffers are not freed by this layer.
pub struct TopLevelContainer {
    id: u64,
    instances: Vec<Instance>,
    built: OnceLock<BuiltContainer>,
    // dispatch-time binding set, assembled once and reused
    final_bind_group: Mutex<Option<BindGroup>>,
}

impl TopLevelContainer {
    pub(crate) fn new(instances: Vec<Instance>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
            instances,
            built: OnceLock::new(),
            final_bind_group: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn built(&self) -> bool {
        self.built.get().is_some()
    }

    /// The top-level and concatenated bottom-level node buffers.
    pub fn tree_buffers(&self) -> Result<(Buffer, Buffer)> {
        let built = self.built.get().ok_or(StateError::ContainerNotBuilt)?;
        Ok((built.top_nodes, built.bottom_nodes))
    }

    /// Unique geometry buffers in dedup-index order.
    pub fn geometry_buffers(&self) -> Result<&[Buffer]> {
        let built = self.built.get().ok_or(StateError::ContainerNotBuilt)?;
        Ok(&built.geometry_buffers)
    }

    pub fn geometry_records(&self) -> Result<&[GeometryRecord]> {
        let built = self.built.get().ok_or(StateError::ContainerNotBuilt)?;
        Ok(&built.geometry_records)
    }

    /// Walks the instances and produces the kernel-side geometry records
    /// together with the dedup map. Works on unbuilt containers; pipeline
    /// creation uses it to size the combined kernel.
    pub(crate) fn collect_unique_geometry(&self) -> (Vec<GeometryRecord>, GeometryBufferDedupMap) {
        let mut dedup = GeometryBufferDedupMap::new();
        let mut records = Vec::new();
        let mut visited = HashSet::new();
        for instance in &self.instances {
            let bottom = &instance.bottom_level;
            if !visited.insert(bottom.id) {
                continue;
            }
            for geometry in &bottom.geometries {
                records.push(match geometry {
                    GeometryDescriptor::Triangles {
                        vertex,
                        vertex_stride,
                        index,
                    } => {
                        let vertex_index = dedup.assign(vertex.buffer) as i32;
                        let index_index = index
                            .as_ref()
                            .map(|binding| dedup.assign(binding.buffer) as i32)
                            .unwrap_or(-1);
                        GeometryRecord {
                            vertex_buffer: vertex_index,
                            index_buffer: index_index,
                            vertex_offset: vertex.offset as u32,
                            vertex_stride: *vertex_stride as u32,
                            index_offset: index.as_ref().map(|b| b.offset as u32).unwrap_or(0),
                            index_stride: 12,
                            kind: GeometryKind::Triangles,
                            flags: 0,
                        }
                    }
                    GeometryDescriptor::AxisAlignedBoxes { data, stride } => GeometryRecord {
                        vertex_buffer: dedup.assign(data.buffer) as i32,
                        index_buffer: -1,
                        vertex_offset: data.offset as u32,
                        vertex_stride: *stride as u32,
                        index_offset: 0,
                        index_stride: 0,
                        kind: GeometryKind::AxisAlignedBoxes,
                        flags: 0,
                    },
                });
            }
        }
        (records, dedup)
    }

    /// Builds the container on the host. Idempotent: a second call after a
    /// successful build returns immediately.
    pub(crate) fn build(&self, rtx: &RtxDevice) -> Result<()> {
        if self.built.get().is_some() {
            return Ok(());
        }
        let (geometry_records, dedup) = self.collect_unique_geometry();

        let mut infos: HashMap<u64, BottomInfo> = HashMap::new();
        let mut concatenated = Vec::new();
        let mut node_start = 0u32;
        let mut geometry_id_offset = 0u32;
        {
            let staging = rtx.staging().lock();
            let mut views = Vec::with_capacity(dedup.len());
            for &buffer in dedup.buffers() {
                let bytes = staging
                    .get(&buffer)
                    .ok_or(ConfigurationError::MissingBufferData { buffer })?;
                views.push(bytes.as_slice());
            }

            for instance in &self.instances {
                let bottom = &instance.bottom_level;
                if infos.contains_key(&bottom.id) {
                    continue;
                }
                let records: Vec<GeometryBuildRecord> = bottom
                    .geometries
                    .iter()
                    .map(|geometry| bottom_build_record(geometry, &dedup))
                    .collect();
                let tree = rtx.toolchain().tree_builder.build_bottom(&records, &views)?;
                let (aabb_min, aabb_max) = root_bounds(&tree.nodes)?;
                debug!(
                    container = bottom.id,
                    nodes = tree.node_count,
                    node_start,
                    "built bottom-level tree"
                );
                infos.insert(
                    bottom.id,
                    BottomInfo {
                        node_start,
                        geometry_id_offset,
                        aabb_min,
                        aabb_max,
                    },
                );
                node_start += tree.node_count;
                geometry_id_offset += bottom.geometries.len() as u32;
                concatenated.extend_from_slice(&tree.nodes);
            }
        }

        let bottom_nodes = upload_storage(rtx, &concatenated);

        let instance_records: Vec<InstanceRecord> = self
            .instances
            .iter()
            .enumerate()
            .map(|(index, instance)| {
                // the bottom build loop above visited every referenced container
                let info = &infos[&instance.bottom_level.id];
                InstanceRecord {
                    mask: instance.mask as u32,
                    flags: instance.flags,
                    instance_index: index as u32,
                    sbt_record_offset: instance.sbt_record_offset,
                    custom_index: instance.custom_index.map(|c| c as i32).unwrap_or(-1),
                    node_start: info.node_start,
                    geometry_id_offset: info.geometry_id_offset,
                    aabb_min: info.aabb_min.to_array(),
                    aabb_max: info.aabb_max.to_array(),
                    transform: transform_rows(instance.transform),
                }
            })
            .collect();

        let top = rtx.toolchain().tree_builder.build_top(&instance_records)?;
        let top_nodes = upload_storage(rtx, &top.nodes);

        info!(
            container = self.id,
            instances = self.instances.len(),
            unique_bottom_levels = infos.len(),
            unique_geometry_buffers = dedup.len(),
            bottom_nodes = node_start,
            "built acceleration container"
        );

        let _ = self.built.set(BuiltContainer {
            top_nodes,
            bottom_nodes,
            geometry_buffers: dedup.buffers().to_vec(),
            geometry_records,
        });
        Ok(())
    }

    /// Assembles (or returns the cached) binding set the dispatch uses for
    /// the internal resources: uniform parameters, the binding table, the
    /// two tree buffers, then every geometry buffer in dedup order.
    pub(crate) fn final_bind_group(
        &self,
        rtx: &RtxDevice,
        pipeline: &RayTracingPipeline,
        sbt: &ShaderBindingTable,
        workgroups: UVec3,
    ) -> Result<BindGroup> {
        let built = self.built.get().ok_or(StateError::ContainerNotBuilt)?;
        let mut cache = self.final_bind_group.lock();
        if let Some(bind_group) = *cache {
            return Ok(bind_group);
        }

        let mut block = Std140Block::new();
        for word in [
            sbt.ray_gen.start,
            sbt.ray_miss.start,
            sbt.ray_miss.stride,
            sbt.ray_hit.start,
            sbt.ray_hit.stride,
            sbt.callable.start,
            sbt.callable.stride,
        ] {
            block.add_u32(word);
        }
        block.add_uvec3(workgroups);

        let device = rtx.device();
        let uniform = device.create_buffer(&BufferDescriptor {
            size: block.len() as u64,
            usage: BufferUsages::UNIFORM,
            mapped_at_creation: true,
        });
        device.write_buffer(uniform, 0, block.bytes());
        device.unmap_buffer(uniform);

        let mut entries: SmallVec<[BindGroupEntry; 8]> = SmallVec::new();
        entries.push(BindGroupEntry {
            binding: BINDING_UNIFORM_PARAMS,
            buffer: uniform,
        });
        entries.push(BindGroupEntry {
            binding: BINDING_SHADER_BINDING_TABLE,
            buffer: sbt.buffer,
        });
        entries.push(BindGroupEntry {
            binding: BINDING_TOP_LEVEL_NODES,
            buffer: built.top_nodes,
        });
        entries.push(BindGroupEntry {
            binding: BINDING_BOTTOM_LEVEL_NODES,
            buffer: built.bottom_nodes,
        });
        for (index, &buffer) in built.geometry_buffers.iter().enumerate() {
            entries.push(BindGroupEntry {
                binding: BINDING_GEOMETRY_BUFFERS_START + index as u32,
                buffer,
            });
        }

        let layout = pipeline.bind_group_layout(pipeline.internal_bind_set());
        let bind_group = device.create_bind_group(layout, &entries);
        *cache = Some(bind_group);
        Ok(bind_group)
    }
}

fn bottom_build_record(
    geometry: &GeometryDescriptor,
    dedup: &GeometryBufferDedupMap,
) -> GeometryBuildRecord {
    match geometry {
        GeometryDescriptor::Triangles {
            vertex,
            vertex_stride,
            index,
        } => {
            let primitive_count = match index {
                // three 32-bit indices per triangle
                Some(binding) => binding.size / 12,
                None => vertex.size / (3 * vertex_stride),
            };
            GeometryBuildRecord {
                kind: GeometryKind::Triangles as i32,
                primitive_count: primitive_count as i32,
                // the dedup map was produced by the same walk
                vertex_buffer: dedup.get(vertex.buffer).expect("buffer not deduped") as i32,
                vertex_offset: vertex.offset as i32,
                index_buffer: index
                    .as_ref()
                    .map(|b| dedup.get(b.buffer).expect("buffer not deduped") as i32)
                    .unwrap_or(-1),
                index_offset: index.as_ref().map(|b| b.offset as i32).unwrap_or(0),
            }
        }
        GeometryDescriptor::AxisAlignedBoxes { data, stride } => GeometryBuildRecord {
            kind: GeometryKind::AxisAlignedBoxes as i32,
            primitive_count: (data.size / stride) as i32,
            vertex_buffer: dedup.get(data.buffer).expect("buffer not deduped") as i32,
            vertex_offset: data.offset as i32,
            index_buffer: -1,
            index_offset: 0,
        },
    }
}

/// Reads the documented bounds off a serialized tree's first node.
fn root_bounds(nodes: &[u8]) -> Result<(Vec3, Vec3)> {
    if nodes.len() < NODE_MAX_CORNER_OFFSET + 12 {
        return Err(Error::Toolchain(format!(
            "serialized tree too short for a root node: {} bytes",
            nodes.len()
        )));
    }
    let min: [f32; 3] = bytemuck::pod_read_unaligned(&nodes[0..12]);
    let max: [f32; 3] =
        bytemuck::pod_read_unaligned(&nodes[NODE_MAX_CORNER_OFFSET..NODE_MAX_CORNER_OFFSET + 12]);
    Ok((Vec3::from(min), Vec3::from(max)))
}

fn upload_storage(rtx: &RtxDevice, bytes: &[u8]) -> Buffer {
    let device = rtx.device();
    let buffer = device.create_buffer(&BufferDescriptor {
        size: bytes.len() as u64,
        usage: BufferUsages::STORAGE,
        mapped_at_creation: true,
    });
    device.write_buffer(buffer, 0, bytes);
    device.unmap_buffer(buffer);
    buffer
}

/// Serializes an object-to-world transform as a row-major 3×4 matrix.
fn transform_rows(transform: Option<Affine3A>) -> [f32; 12] {
    let affine = transform.unwrap_or(Affine3A::IDENTITY);
    let m = Mat3::from(affine.matrix3);
    let t = affine.translation;
    [
        m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
        m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
        m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
    ]
}
