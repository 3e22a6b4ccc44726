//! Shader stage aggregation.
//!
//! A ray tracing pipeline is authored as independent per-stage sources
//! (generation, any-hit, closest-hit, miss, intersection). The target API
//! only runs compute kernels, so the stages are stitched into one combined
//! kernel: every stage is lowered by the external transpiler into a renamed
//! function plus an invocation block, and a per-kind dispatch table selects
//! the right block from the stage's handle at runtime.
//!
//! The combined text is assembled in a fixed order (prelude, generated
//! constants, forward declarations, the five dispatch tables, the shared
//! engine body, then the processed function bodies) and handed to the
//! backend compiler.

use tracing::debug;

use crate::accel::GeometryRecord;
use crate::error::{ConfigurationError, Result};
use crate::toolchain::Toolchain;

/// Entry symbol of every combined kernel module.
pub const KERNEL_ENTRY_POINT: &str = "main";

/// Hit attribute storage never shrinks below what the engine itself needs
/// for barycentrics and a geometric normal.
pub(crate) const MIN_HIT_ATTRIBUTE_WORDS: u32 = 5;

const KERNEL_PRELUDE: &str = "#version 450\n#pragma shader_stage(compute)\n";

/// The five ray tracing shader stage kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StageKind {
    Generation,
    AnyHit,
    ClosestHit,
    Miss,
    Intersection,
}

impl StageKind {
    /// Fixed order in which dispatch tables are emitted.
    pub(crate) const ALL: [StageKind; 5] = [
        StageKind::Generation,
        StageKind::AnyHit,
        StageKind::ClosestHit,
        StageKind::Miss,
        StageKind::Intersection,
    ];

    /// Prefix for the canonical entry symbol of a stage of this kind; the
    /// stage's per-kind handle is appended.
    fn symbol_prefix(self) -> &'static str {
        match self {
            StageKind::Generation => "_rtx_user_rgen_",
            StageKind::AnyHit => "_rtx_user_rahit_",
            StageKind::ClosestHit => "_rtx_user_rchit_",
            StageKind::Miss => "_rtx_user_rmiss_",
            StageKind::Intersection => "_rtx_user_rint_",
        }
    }

    /// Name of the dispatch-table macro the engine body expands for this
    /// kind.
    fn table_macro(self) -> &'static str {
        match self {
            StageKind::Generation => "_RTX_USER_RGEN_TABLE",
            StageKind::AnyHit => "_RTX_USER_RAHIT_TABLE",
            StageKind::ClosestHit => "_RTX_USER_RCHIT_TABLE",
            StageKind::Miss => "_RTX_USER_RMISS_TABLE",
            StageKind::Intersection => "_RTX_USER_RINT_TABLE",
        }
    }

    /// Name of the per-kind local variable the dispatch table switches on.
    /// Part of the contract with the engine body.
    fn dispatch_var(self) -> &'static str {
        match self {
            StageKind::Generation => "rgen",
            StageKind::AnyHit => "rahit",
            StageKind::ClosestHit => "rchit",
            StageKind::Miss => "rmiss",
            StageKind::Intersection => "rint",
        }
    }
}

/// One independently authored shader stage. Immutable once submitted to a
/// pipeline; a stage's position in the list determines its per-kind handle.
#[derive(Clone, Debug)]
pub struct ShaderStageDescriptor {
    pub kind: StageKind,
    pub source: String,
    pub entry_point: String,
}

/// One shader group, resolved to a packed handle by
/// [`RayTracingPipeline::shader_group_handles`](crate::pipeline::RayTracingPipeline::shader_group_handles).
#[derive(Clone, Debug)]
pub enum ShaderGroupDescriptor {
    /// References one generation or miss stage by its index in the stage
    /// list.
    General { stage: usize },
    TrianglesHitGroup {
        closest_hit: Option<usize>,
        any_hit: Option<usize>,
    },
    ProceduralHitGroup {
        intersection: usize,
        closest_hit: Option<usize>,
        any_hit: Option<usize>,
    },
}

#[derive(Clone, Debug)]
pub struct RayTracingPipelineDescriptor {
    pub stages: Vec<ShaderStageDescriptor>,
    pub groups: Vec<ShaderGroupDescriptor>,
}

/// A compiled combined kernel, ready for compute pipeline creation.
#[derive(Clone, Debug)]
pub struct KernelModule {
    pub code: Vec<u8>,
}

impl KernelModule {
    pub fn entry_point(&self) -> &'static str {
        KERNEL_ENTRY_POINT
    }
}

/// For each stage, its 0-based handle within its own kind, in input order.
pub(crate) fn per_kind_handles(stages: &[ShaderStageDescriptor]) -> Vec<u32> {
    let mut counts = std::collections::HashMap::new();
    stages
        .iter()
        .map(|stage| {
            let count = counts.entry(stage.kind).or_insert(0u32);
            let handle = *count;
            *count += 1;
            handle
        })
        .collect()
}

pub(crate) struct CombinedKernelSource {
    pub text: String,
    /// First bind set number not used by any stage source; the emulation
    /// layer's internal resources bind there.
    pub next_unused_bind_set: u32,
}

/// Stitches the lowered stages into one kernel source.
pub(crate) fn combine_stages(
    toolchain: &Toolchain,
    stages: &[ShaderStageDescriptor],
    geometry_records: &[GeometryRecord],
    geometry_buffer_count: usize,
) -> Result<CombinedKernelSource> {
    if stages.is_empty() {
        return Err(ConfigurationError::EmptyStageList.into());
    }

    let handles = per_kind_handles(stages);
    let mut by_kind: std::collections::HashMap<StageKind, Vec<usize>> =
        std::collections::HashMap::new();

    let mut max_bind_set = -1i32;
    let mut hit_attribute_words = MIN_HIT_ATTRIBUTE_WORDS;
    let mut declarations = Vec::with_capacity(stages.len());
    let mut bodies = Vec::with_capacity(stages.len());
    // (per-kind handle, braced invocation block) per stage, in input order
    let mut invocations = Vec::with_capacity(stages.len());

    for (index, stage) in stages.iter().enumerate() {
        let handle = handles[index];
        let symbol = format!("{}{}", stage.kind.symbol_prefix(), handle);
        debug!(kind = ?stage.kind, index, handle, symbol = %symbol, "processing shader stage");
        let processed =
            toolchain
                .transpiler
                .process(&stage.source, stage.kind, &stage.entry_point, &symbol)?;

        max_bind_set = max_bind_set.max(processed.max_bind_set);
        hit_attribute_words = hit_attribute_words.max(processed.hit_attribute_words);
        declarations.push(format!(
            "{}{};",
            processed.forward_declarations, processed.prototype
        ));
        bodies.push(processed.body);
        invocations.push((
            handle,
            format!(
                "{{{} {} {}}}",
                processed.unpack_code, processed.invoke_code, processed.pack_code
            ),
        ));
        by_kind.entry(stage.kind).or_default().push(index);
    }

    let next_unused_bind_set = (max_bind_set + 1) as u32;

    let geometry_initializers = geometry_records
        .iter()
        .map(|r| {
            format!(
                "{{{},{},{},{},{},{},{},{}}}",
                r.vertex_buffer,
                r.index_buffer,
                r.vertex_offset,
                r.vertex_stride,
                r.index_offset,
                r.index_stride,
                r.kind as i32,
                r.flags,
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    let constants = format!(
        "const uint _RTX_USER_NEXT_UNUSED_BIND_SET = {next_unused_bind_set};\n\
         const uint _RTX_HIT_ATTRIBUTES_MAX_WORDS = {hit_attribute_words};\n\
         #define _RTX_USER_BVH_GEOM_BUFFERS_INITIALIZER_LIST {{{geometry_initializers}}}\n\
         #define _RTX_USER_DEFINE_GEO_BUFFERS DEFINE_GEO_BUFFER_x{geometry_buffer_count}\n\
         #define _RTX_USER_GEO_BUFFERS_ACCESSOR_CASES(wordIndex) _GET_FROM_BUFFER_CASE_x{geometry_buffer_count}(wordIndex)\n"
    );

    let mut tables = String::new();
    for kind in StageKind::ALL {
        let of_kind = by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        if let [only] = of_kind {
            tables.push_str(&format!(
                "#define {} {{{}}}\n",
                kind.table_macro(),
                invocations[*only].1
            ));
        } else {
            // zero or several stages: a switch over the per-kind handle; an
            // absent kind leaves an empty switch, and invoking it is a
            // configuration error the engine body reports
            let cases = of_kind
                .iter()
                .map(|&index| {
                    let (handle, block) = &invocations[index];
                    format!("case {handle}: {{{block}}} break;")
                })
                .collect::<Vec<_>>()
                .join(" ");
            tables.push_str(&format!(
                "#define {} switch ({}) {{ {} }}\n",
                kind.table_macro(),
                kind.dispatch_var(),
                cases
            ));
        }
    }

    let text = [
        KERNEL_PRELUDE,
        &constants,
        &declarations.join("\n"),
        &tables,
        &toolchain.engine_source,
        &bodies.join("\n"),
    ]
    .join("\n");

    Ok(CombinedKernelSource {
        text,
        next_unused_bind_set,
    })
}

pub(crate) struct AggregatedKernel {
    pub module: KernelModule,
    pub next_unused_bind_set: u32,
}

/// Combines the stage list into one kernel source and runs it through the
/// backend compiler.
pub(crate) fn aggregate_and_compile(
    toolchain: &Toolchain,
    stages: &[ShaderStageDescriptor],
    geometry_records: &[GeometryRecord],
    geometry_buffer_count: usize,
) -> Result<AggregatedKernel> {
    let combined = combine_stages(toolchain, stages, geometry_records, geometry_buffer_count)?;
    debug!(
        bytes = combined.text.len(),
        next_unused_bind_set = combined.next_unused_bind_set,
        "compiling combined kernel"
    );
    let intermediate = toolchain.compiler.compile(&combined.text)?;
    let code = toolchain.compiler.emit(intermediate)?;
    Ok(AggregatedKernel {
        module: KernelModule { code },
        next_unused_bind_set: combined.next_unused_bind_set,
    })
}
