//! Test doubles for the device adapter and the external toolchain.
//!
//! The orchestration logic is exercised entirely against these: a recording
//! [`HostDevice`], a transpiler that emits tagged fragments, a compiler that
//! passes text through, and a tree builder that serializes recognizable node
//! blobs with the documented corner layout.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;

use crate::device::{
    BindGroup, BindGroupEntry, BindGroupLayout, Buffer, BufferDescriptor, ComputePass,
    ComputePipeline, HostDevice,
};
use crate::error::Result;
use crate::layout::Std430Block;
use crate::rtx::RtxDevice;
use crate::shader::{KernelModule, ShaderStageDescriptor, StageKind};
use crate::toolchain::{
    BuiltTree, GeometryBuildRecord, InstanceRecord, IntermediateModule, KernelCompiler,
    ProcessedStage, StageTranspiler, Toolchain, TreeBuilder,
};

pub(crate) fn stage(kind: StageKind, name: &str) -> ShaderStageDescriptor {
    ShaderStageDescriptor {
        kind,
        source: format!("source of {name}"),
        entry_point: name.to_owned(),
    }
}

#[derive(Default)]
pub(crate) struct TestTranspiler {
    pub symbols: Mutex<Vec<String>>,
    pub max_bind_set: i32,
    pub hit_attribute_words: u32,
}

impl TestTranspiler {
    fn new() -> Self {
        Self {
            symbols: Mutex::new(Vec::new()),
            max_bind_set: 2,
            hit_attribute_words: 3,
        }
    }

    pub fn recorded_symbols(&self) -> Vec<String> {
        self.symbols.lock().clone()
    }
}

impl StageTranspiler for TestTranspiler {
    fn process(
        &self,
        _source: &str,
        _kind: StageKind,
        entry_point: &str,
        new_symbol: &str,
    ) -> Result<ProcessedStage> {
        self.symbols.lock().push(new_symbol.to_owned());
        Ok(ProcessedStage {
            forward_declarations: format!("decl({entry_point}) "),
            prototype: format!("void {new_symbol}()"),
            body: format!("body({entry_point})"),
            unpack_code: format!("unpack_{entry_point};"),
            invoke_code: format!("{new_symbol}();"),
            pack_code: format!("pack_{entry_point};"),
            max_bind_set: self.max_bind_set,
            hit_attribute_words: self.hit_attribute_words,
        })
    }
}

#[derive(Default)]
pub(crate) struct TestCompiler {
    pub compiled: Mutex<Vec<String>>,
}

impl KernelCompiler for TestCompiler {
    fn compile(&self, source: &str) -> Result<IntermediateModule> {
        let mut compiled = self.compiled.lock();
        compiled.push(source.to_owned());
        Ok(IntermediateModule(compiled.len() as u64 - 1))
    }

    fn emit(&self, module: IntermediateModule) -> Result<Vec<u8>> {
        Ok(self.compiled.lock()[module.0 as usize].clone().into_bytes())
    }
}

/// Serializes `count` nodes of a recognizable tree blob. The first node's
/// corners are `splat(seed)` and `splat(seed + 1)`.
pub(crate) fn test_tree_blob(seed: f32, count: u32) -> Vec<u8> {
    let mut block = Std430Block::new();
    for node in 0..count {
        block.add_vec3(Vec3::splat(seed + node as f32));
        block.add_vec3(Vec3::splat(seed + node as f32 + 1.0));
        block.add_u32(node); // entry index
        block.add_u32(node + 1); // exit index
        block.add_u32(u32::MAX); // geometry id
        block.add_u32(0); // padding to the node stride
    }
    block.bytes().to_vec()
}

#[derive(Default)]
pub(crate) struct TestTreeBuilder {
    pub bottom_calls: Mutex<Vec<(Vec<GeometryBuildRecord>, Vec<Vec<u8>>)>>,
    pub top_calls: Mutex<Vec<Vec<InstanceRecord>>>,
}

impl TestTreeBuilder {
    pub fn bottom_call_count(&self) -> usize {
        self.bottom_calls.lock().len()
    }
}

impl TreeBuilder for TestTreeBuilder {
    fn build_bottom(
        &self,
        records: &[GeometryBuildRecord],
        buffers: &[&[u8]],
    ) -> Result<BuiltTree> {
        let mut calls = self.bottom_calls.lock();
        let seed = calls.len() as f32;
        calls.push((
            records.to_vec(),
            buffers.iter().map(|b| b.to_vec()).collect(),
        ));
        // two nodes per bottom-level tree keeps node offsets interesting
        Ok(BuiltTree {
            nodes: test_tree_blob(seed, 2),
            node_count: 2,
        })
    }

    fn build_top(&self, instances: &[InstanceRecord]) -> Result<BuiltTree> {
        self.top_calls.lock().push(instances.to_vec());
        Ok(BuiltTree {
            nodes: test_tree_blob(100.0, 1),
            node_count: 1,
        })
    }
}

pub(crate) struct ToolchainHarness {
    pub transpiler: Arc<TestTranspiler>,
    pub compiler: Arc<TestCompiler>,
    pub tree_builder: Arc<TestTreeBuilder>,
    pub toolchain: Toolchain,
}

pub(crate) fn harness() -> ToolchainHarness {
    let transpiler = Arc::new(TestTranspiler::new());
    let compiler = Arc::new(TestCompiler::default());
    let tree_builder = Arc::new(TestTreeBuilder::default());
    let toolchain = Toolchain {
        transpiler: transpiler.clone(),
        compiler: compiler.clone(),
        tree_builder: tree_builder.clone(),
        engine_source: "void main() { /* engine body */ }".to_owned(),
    };
    ToolchainHarness {
        transpiler,
        compiler,
        tree_builder,
        toolchain,
    }
}

pub(crate) struct CreatedBuffer {
    pub descriptor: BufferDescriptor,
    pub data: Vec<u8>,
    pub mapped: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PassCommand {
    SetPipeline(ComputePipeline),
    SetBindGroup(u32, BindGroup),
    Dispatch(u32, u32, u32),
    End,
}

#[derive(Default)]
pub(crate) struct TestDeviceState {
    next_id: u64,
    pub buffers: HashMap<Buffer, CreatedBuffer>,
    pub bind_groups: HashMap<BindGroup, (BindGroupLayout, Vec<BindGroupEntry>)>,
    pub pipeline_modules: HashMap<ComputePipeline, Vec<u8>>,
    pub pass_log: Vec<PassCommand>,
}

#[derive(Default)]
pub(crate) struct TestDevice {
    pub state: Mutex<TestDeviceState>,
}

struct TestPass<'a> {
    device: &'a TestDevice,
}

impl ComputePass for TestPass<'_> {
    fn set_pipeline(&mut self, pipeline: ComputePipeline) {
        self.device
            .state
            .lock()
            .pass_log
            .push(PassCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroup) {
        self.device
            .state
            .lock()
            .pass_log
            .push(PassCommand::SetBindGroup(index, bind_group));
    }

    fn dispatch_workgroups(&mut self, x: u32, y: u32, z: u32) {
        self.device
            .state
            .lock()
            .pass_log
            .push(PassCommand::Dispatch(x, y, z));
    }

    fn end(&mut self) {
        self.device.state.lock().pass_log.push(PassCommand::End);
    }
}

impl HostDevice for TestDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Buffer {
        let mut state = self.state.lock();
        state.next_id += 1;
        let buffer = Buffer::from_raw(state.next_id);
        state.buffers.insert(
            buffer,
            CreatedBuffer {
                descriptor: *descriptor,
                data: vec![0; descriptor.size as usize],
                mapped: descriptor.mapped_at_creation,
            },
        );
        buffer
    }

    fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let created = state.buffers.get_mut(&buffer).expect("unknown buffer");
        let end = offset as usize + data.len();
        if created.data.len() < end {
            created.data.resize(end, 0);
        }
        created.data[offset as usize..end].copy_from_slice(data);
    }

    fn unmap_buffer(&self, buffer: Buffer) {
        let mut state = self.state.lock();
        state.buffers.get_mut(&buffer).expect("unknown buffer").mapped = false;
    }

    fn create_bind_group(&self, layout: BindGroupLayout, entries: &[BindGroupEntry]) -> BindGroup {
        let mut state = self.state.lock();
        state.next_id += 1;
        let bind_group = BindGroup::from_raw(state.next_id);
        state
            .bind_groups
            .insert(bind_group, (layout, entries.to_vec()));
        bind_group
    }

    fn create_compute_pipeline(&self, module: &KernelModule) -> ComputePipeline {
        let mut state = self.state.lock();
        state.next_id += 1;
        let pipeline = ComputePipeline::from_raw(state.next_id);
        state.pipeline_modules.insert(pipeline, module.code.clone());
        pipeline
    }

    fn pipeline_bind_group_layout(&self, pipeline: ComputePipeline, index: u32) -> BindGroupLayout {
        BindGroupLayout::from_raw(pipeline.to_raw() << 8 | index as u64)
    }

    fn begin_compute_pass(&self) -> Box<dyn ComputePass + '_> {
        Box::new(TestPass { device: self })
    }
}

pub(crate) struct RtxHarness {
    pub device: Arc<TestDevice>,
    pub transpiler: Arc<TestTranspiler>,
    pub compiler: Arc<TestCompiler>,
    pub tree_builder: Arc<TestTreeBuilder>,
    pub rtx: RtxDevice,
}

pub(crate) fn rtx_harness() -> RtxHarness {
    let device = Arc::new(TestDevice::default());
    let ToolchainHarness {
        transpiler,
        compiler,
        tree_builder,
        toolchain,
    } = harness();
    let rtx = RtxDevice::new(device.clone(), toolchain);
    RtxHarness {
        device,
        transpiler,
        compiler,
        tree_builder,
        rtx,
    }
}
