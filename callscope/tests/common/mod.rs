//! Shared fixtures: one image with a fixed symbol table and a builder for
//! samples with stacks.

#![allow(dead_code)]

use callscope::analysis::ProfileData;
use callscope::domain::{
    ContextHandle, CpuId, Duration, FunctionId, Pid, SymbolError, Tid, Timestamp,
};
use callscope::model::{Context, Image, RawProfileData, Sample};
use callscope::symbolization::{
    BinaryDescriptor, DebugInfo, FunctionDebugInfo, LoadedDebugInfo, NativeDebugInfo, SymbolSource,
};

pub const IMAGE_BASE: u64 = 0x40_0000;
const FUNCTION_SIZE: u32 = 0x100;

/// Name and RVA of every function in the fixture image.
pub const FUNCTIONS: &[(&str, u64)] = &[
    ("main", 0x1000),
    ("foo", 0x2000),
    ("bar", 0x3000),
    ("baz", 0x4000),
    ("a", 0x5000),
    ("b", 0x6000),
    ("c", 0x7000),
    ("f", 0x8000),
];

/// Address 0x10 bytes into `name`.
pub fn ip(name: &str) -> u64 {
    let (_, rva) = FUNCTIONS.iter().find(|(known, _)| *known == name).expect("fixture function");
    IMAGE_BASE + rva + 0x10
}

/// An address inside the image that no function covers.
pub const UNKNOWN_IP: u64 = IMAGE_BASE + 0xF000;

#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureSymbols;

impl SymbolSource for FixtureSymbols {
    fn load(
        &self,
        _image: &Image,
        _binary: &BinaryDescriptor,
    ) -> Result<LoadedDebugInfo, SymbolError> {
        let functions = FUNCTIONS
            .iter()
            .map(|(name, rva)| FunctionDebugInfo::new(*name, *rva, FUNCTION_SIZE))
            .collect();
        Ok(LoadedDebugInfo {
            debug_info: DebugInfo::Native(NativeDebugInfo::from_functions(functions)),
            binary_path: None,
        })
    }
}

pub struct TraceBuilder {
    pub raw: RawProfileData,
    context: ContextHandle,
    time: u64,
}

impl TraceBuilder {
    pub fn new(pid: u32) -> Self {
        let mut raw = RawProfileData::new();
        raw.add_image_to_process(Pid(pid), Image {
            base_address: IMAGE_BASE,
            size: 0x1_0000,
            default_base_address: 0,
            file_path: "/usr/bin/app".to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        });
        let context = raw.add_context(Context::new(Pid(pid), Tid(pid), CpuId(0)));
        Self { raw, context, time: 0 }
    }

    /// A sample whose stack is `names`, innermost first.
    pub fn sample(&mut self, names: &[&str], weight: Duration) -> &mut Self {
        let ips: Vec<u64> = names.iter().map(|name| ip(name)).collect();
        self.sample_ips(&ips, weight)
    }

    pub fn sample_ips(&mut self, ips: &[u64], weight: Duration) -> &mut Self {
        self.time += 1;
        let sample = Sample::new(ips[0], Timestamp(self.time), weight, self.context, false);
        let sample = self.raw.add_sample(sample);
        let stack = self.raw.add_stack(ips, self.context);
        assert!(self.raw.try_set_sample_stack(sample, stack, self.context));
        self
    }

    pub fn build(self) -> RawProfileData {
        self.raw
    }
}

pub fn function(profile: &ProfileData, name: &str) -> FunctionId {
    profile
        .functions()
        .find(|(_, data)| data.name() == name)
        .map(|(id, _)| id)
        .unwrap_or_else(|| panic!("no profile for {name}"))
}

/// The main/foo/bar/baz scenario: 10ms in foo, 5ms in bar under foo, 7ms
/// in baz, all called from main.
pub fn scenario() -> RawProfileData {
    let mut builder = TraceBuilder::new(100);
    builder
        .sample(&["foo", "main"], Duration::from_millis(10))
        .sample(&["bar", "foo", "main"], Duration::from_millis(5))
        .sample(&["baz", "main"], Duration::from_millis(7));
    builder.build()
}
