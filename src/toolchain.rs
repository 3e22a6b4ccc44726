//! Caller-owned toolchain context.
//!
//! The heavy lifting this crate orchestrates (lowering a shader stage into
//! reusable fragments, compiling the combined kernel text, and building
//! bounding-volume trees from primitive buffers) is done by external
//! collaborators. The caller constructs them once at process start, bundles
//! them into a [`Toolchain`], and passes that into the extension device.
//! There are no global module caches; the toolchain's lifetime is the
//! caller's business.
//!
//! All collaborator calls are synchronous and blocking. The emulation layer
//! neither retries nor times them out.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::shader::StageKind;

/// Fragments produced by lowering one shader stage source.
///
/// The aggregator stitches these into the combined kernel: declarations
/// first, then one invocation block (`unpack_code`, `invoke_code`,
/// `pack_code` concatenated) per stage inside the per-kind dispatch tables,
/// then the processed function bodies.
#[derive(Clone, Debug, Default)]
pub struct ProcessedStage {
    pub forward_declarations: String,
    pub prototype: String,
    pub body: String,
    pub unpack_code: String,
    pub invoke_code: String,
    pub pack_code: String,
    /// Highest bind set number the stage's source declares, or -1.
    pub max_bind_set: i32,
    /// Number of 32-bit words of hit attribute storage the stage needs.
    pub hit_attribute_words: u32,
}

/// Lowers one independently authored shader-stage source into fragments the
/// aggregator can stitch into a combined compute kernel.
pub trait StageTranspiler: Send + Sync {
    fn process(
        &self,
        source: &str,
        kind: StageKind,
        entry_point: &str,
        new_symbol: &str,
    ) -> Result<ProcessedStage>;
}

/// Opaque handle to an intermediate-representation module held by the
/// backend compiler between [`compile`](KernelCompiler::compile) and
/// [`emit`](KernelCompiler::emit).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IntermediateModule(pub u64);

/// Backend compiler turning combined kernel text into a loadable module.
pub trait KernelCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<IntermediateModule>;
    fn emit(&self, module: IntermediateModule) -> Result<Vec<u8>>;
}

/// One geometry of a bottom-level build submission.
///
/// Buffer references are dedup indices into the byte views passed alongside
/// the records. `primitive_count` is authoritative for triangle geometry;
/// for axis-aligned boxes the builder derives the count from the buffer
/// framing.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
pub struct GeometryBuildRecord {
    pub kind: i32,
    pub primitive_count: i32,
    pub vertex_buffer: i32,
    pub vertex_offset: i32,
    pub index_buffer: i32,
    pub index_offset: i32,
}

/// One instance of a top-level build submission. Fixed-width, 25 words.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
pub struct InstanceRecord {
    pub mask: u32,
    pub flags: u32,
    pub instance_index: u32,
    pub sbt_record_offset: u32,
    /// Caller-supplied custom index, or -1.
    pub custom_index: i32,
    /// Starting node index of the referenced bottom-level tree within the
    /// concatenated node buffer.
    pub node_start: u32,
    /// Sum of geometry counts of all bottom-level trees serialized before
    /// the referenced one.
    pub geometry_id_offset: u32,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
    /// Row-major 3×4 object-to-world transform.
    pub transform: [f32; 12],
}

/// A serialized bounding-volume tree.
///
/// The node byte layout is opaque to this crate except for the first node's
/// bounds: a 3-float min corner at byte 0 and a 3-float max corner at byte
/// 16 (storage-block vector padding, see
/// [`Std430Block`](crate::layout::Std430Block)).
#[derive(Clone, Debug)]
pub struct BuiltTree {
    pub nodes: Vec<u8>,
    pub node_count: u32,
}

/// Builds bounding-volume trees on the host.
pub trait TreeBuilder: Send + Sync {
    /// Builds one bottom-level tree. `buffers` holds the staged contents of
    /// every deduplicated geometry buffer, indexed by the dedup indices the
    /// records reference.
    fn build_bottom(
        &self,
        records: &[GeometryBuildRecord],
        buffers: &[&[u8]],
    ) -> Result<BuiltTree>;

    /// Builds the top-level tree over instance records.
    fn build_top(&self, instances: &[InstanceRecord]) -> Result<BuiltTree>;
}

/// The bundle of external collaborators, constructed once by the caller.
#[derive(Clone)]
pub struct Toolchain {
    pub transpiler: Arc<dyn StageTranspiler>,
    pub compiler: Arc<dyn KernelCompiler>,
    pub tree_builder: Arc<dyn TreeBuilder>,
    /// The fixed engine body every combined kernel links against. It ships
    /// with the transpiler targeting it, so it travels in the toolchain
    /// rather than being baked into this crate.
    pub engine_source: String,
}
