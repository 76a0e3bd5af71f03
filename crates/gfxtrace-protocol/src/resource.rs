use serde::{Deserialize, Serialize};

/// A driver-side handle as seen by the process issuing API calls.
/// Only meaningful inside one process lifetime; never serialized into chunks.
pub type RawHandle = u64;

/// Stable, portable identifier for a graphics resource.
/// Assigned when a resource-creating call is intercepted and valid across
/// capture and replay even though the underlying driver handle differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
         Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// The null ID. Callers must treat it as "not tracked".
    pub const NULL: ResourceId = ResourceId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// Type tag for debugging and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceType {
    None,

    Buffer,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorSet,
    Fence,
    Semaphore,
    CommandBuffer,
    Memory,
    Device,
    Queue,
}
