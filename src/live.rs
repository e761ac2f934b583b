//! Typed descriptors exchanged with the live allocator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allocation create flags as recorded
pub mod alloc_flags {
    pub const DEDICATED_MEMORY: u32 = 0x1;
    pub const NEVER_ALLOCATE: u32 = 0x2;
    pub const MAPPED: u32 = 0x4;
    pub const CAN_BECOME_LOST: u32 = 0x8;
    pub const CAN_MAKE_OTHER_LOST: u32 = 0x10;
    pub const USER_DATA_COPY_STRING: u32 = 0x20;
    pub const UPPER_ADDRESS: u32 = 0x40;
}

/// Memory property flags
pub mod memory_property {
    pub const DEVICE_LOCAL: u32 = 0x1;
    pub const HOST_VISIBLE: u32 = 0x2;
    pub const HOST_COHERENT: u32 = 0x4;
    pub const HOST_CACHED: u32 = 0x8;
}

/// Memory usage hints as recorded
pub mod memory_usage {
    pub const UNKNOWN: u32 = 0;
    pub const GPU_ONLY: u32 = 1;
    pub const CPU_ONLY: u32 = 2;
    pub const CPU_TO_GPU: u32 = 3;
    pub const GPU_TO_CPU: u32 = 4;
}

macro_rules! live_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            pub struct $name(pub u64);
        )*
    };
}

live_handle!(
    /// Live custom pool
    PoolHandle,
    /// Live memory allocation
    AllocationHandle,
    /// Live buffer bound to an allocation
    BufferHandle,
    /// Live image bound to an allocation
    ImageHandle,
    /// Live defragmentation context
    DefragContextHandle,
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCreateInfo {
    pub memory_type_index: u32,
    pub flags: u32,
    pub block_size: u64,
    pub min_block_count: u64,
    pub max_block_count: u64,
    pub frame_in_use_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCreateInfo {
    pub flags: u32,
    pub usage: u32,
    pub required_flags: u32,
    pub preferred_flags: u32,
    pub memory_type_bits: u32,
    pub pool: Option<PoolHandle>,
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Dedicated-allocation hints reported for a buffer or image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedHint {
    pub requires: bool,
    pub prefers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCreateInfo {
    pub flags: u32,
    pub size: u64,
    pub usage: u32,
    pub sharing_mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCreateInfo {
    pub flags: u32,
    pub image_type: u32,
    pub format: u32,
    pub extent: Extent3d,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: u32,
    pub usage: u32,
    pub sharing_mode: u32,
    pub initial_layout: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragmentationInfo {
    pub flags: u32,
    pub allocations: Vec<AllocationHandle>,
    pub pools: Vec<PoolHandle>,
    pub max_cpu_bytes_to_move: u64,
    pub max_cpu_allocations_to_move: u32,
    pub max_gpu_bytes_to_move: u64,
    pub max_gpu_allocations_to_move: u32,
    /// The recording passed a command buffer for GPU-side moves
    pub use_command_buffer: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragmentationReport {
    pub bytes_moved: u64,
    pub allocations_moved: u32,
    pub bytes_freed: u64,
    pub device_memory_blocks_freed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub memory_type: u32,
    pub offset: u64,
    pub size: u64,
    pub mapped: bool,
    pub user_data: Option<String>,
}

/// Optional capability extensions of the live device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionToggles {
    pub dedicated_allocation: bool,
    pub bind_memory2: bool,
    pub memory_budget: bool,
}

impl Default for ExtensionToggles {
    fn default() -> Self {
        Self {
            dedicated_allocation: true,
            bind_memory2: true,
            memory_budget: true,
        }
    }
}

impl ExtensionToggles {
    /// Look an extension up by its recorded name
    pub fn by_name(&self, name: &str) -> Option<bool> {
        match name {
            "VK_KHR_dedicated_allocation" => Some(self.dedicated_allocation),
            "VK_KHR_bind_memory2" => Some(self.bind_memory2),
            "VK_EXT_memory_budget" => Some(self.memory_budget),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_memory_allocation_count: u32,
    pub buffer_image_granularity: u64,
    pub non_coherent_atom_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    pub heap_index: u32,
    pub property_flags: u32,
}

/// Description of the device the live allocator runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEnvironment {
    pub api_version: u32,
    pub driver_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: u32,
    pub device_name: String,
    pub limits: DeviceLimits,
    pub memory_heaps: Vec<MemoryHeap>,
    pub memory_types: Vec<MemoryType>,
    pub extensions: ExtensionToggles,
}

/// Usage totals for one heap, memory type or the whole allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub block_count: u32,
    pub allocation_count: u32,
    pub used_bytes: u64,
    pub unused_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool: PoolHandle,
    pub name: Option<String>,
    pub memory_type_index: u32,
    pub stats: StatInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation: AllocationHandle,
    pub memory_type: u32,
    pub offset: u64,
    pub size: u64,
    pub pool: Option<PoolHandle>,
    pub lost: bool,
    pub user_data: Option<String>,
}

/// Allocator-internal statistics captured for a snapshot artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub captured_at: DateTime<Utc>,
    pub total: StatInfo,
    pub memory_heaps: Vec<StatInfo>,
    pub memory_types: Vec<StatInfo>,
    pub pools: Vec<PoolStats>,
    /// Per-allocation listing, present only for detailed snapshots
    pub allocations: Option<Vec<AllocationRecord>>,
}
