//! The live allocator seam

use crate::error::LiveError;
use crate::live::{
    AllocationCreateInfo, AllocationHandle, AllocationInfo, AllocatorStats, BufferCreateInfo,
    BufferHandle, DedicatedHint, DefragContextHandle, DefragmentationInfo, DefragmentationReport,
    ImageCreateInfo, ImageHandle, LiveEnvironment, MemoryRequirements, PoolCreateInfo, PoolHandle,
};

pub type LiveResult<T> = Result<T, LiveError>;

/// A live instance of the allocation API that recorded calls are re-issued
/// against.
///
/// Destruction calls are infallible, matching the underlying API. Any
/// method may return [`LiveError::DeviceLost`], which aborts the replay.
pub trait LiveAllocator {
    /// Device and memory layout, compared against the recorded configuration
    fn environment(&self) -> LiveEnvironment;

    fn set_current_frame_index(&mut self, frame_index: u32);

    fn create_pool(&mut self, info: &PoolCreateInfo) -> LiveResult<PoolHandle>;

    fn destroy_pool(&mut self, pool: PoolHandle);

    fn set_pool_name(&mut self, pool: PoolHandle, name: Option<&str>);

    /// Returns how many allocations became lost
    fn make_pool_allocations_lost(&mut self, pool: PoolHandle) -> usize;

    /// Allocate raw memory. `dedicated` carries the hints recorded for
    /// buffer/image-specific allocation calls.
    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        dedicated: Option<DedicatedHint>,
        info: &AllocationCreateInfo,
    ) -> LiveResult<AllocationHandle>;

    /// Allocate `count` allocations in one call. Element `i` of the result is
    /// the outcome of the `i`-th page.
    fn allocate_memory_pages(
        &mut self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        count: usize,
    ) -> LiveResult<Vec<Option<AllocationHandle>>>;

    fn create_buffer(
        &mut self,
        buffer: &BufferCreateInfo,
        info: &AllocationCreateInfo,
    ) -> LiveResult<(BufferHandle, AllocationHandle)>;

    fn create_image(
        &mut self,
        image: &ImageCreateInfo,
        info: &AllocationCreateInfo,
    ) -> LiveResult<(ImageHandle, AllocationHandle)>;

    fn create_lost_allocation(&mut self) -> LiveResult<AllocationHandle>;

    fn free_memory(&mut self, allocation: AllocationHandle);

    fn free_memory_pages(&mut self, allocations: &[AllocationHandle]);

    fn destroy_buffer(&mut self, buffer: BufferHandle, allocation: AllocationHandle);

    fn destroy_image(&mut self, image: ImageHandle, allocation: AllocationHandle);

    fn set_allocation_user_data(&mut self, allocation: AllocationHandle, user_data: Option<&str>);

    fn map_memory(&mut self, allocation: AllocationHandle) -> LiveResult<()>;

    fn unmap_memory(&mut self, allocation: AllocationHandle);

    fn flush_allocation(
        &mut self,
        allocation: AllocationHandle,
        offset: u64,
        size: u64,
    ) -> LiveResult<()>;

    fn invalidate_allocation(
        &mut self,
        allocation: AllocationHandle,
        offset: u64,
        size: u64,
    ) -> LiveResult<()>;

    /// Returns `false` if the allocation is lost
    fn touch_allocation(&mut self, allocation: AllocationHandle) -> bool;

    fn allocation_info(&self, allocation: AllocationHandle) -> Option<AllocationInfo>;

    fn resize_allocation(&mut self, allocation: AllocationHandle, new_size: u64) -> LiveResult<()>;

    fn defragmentation_begin(
        &mut self,
        info: &DefragmentationInfo,
    ) -> LiveResult<DefragContextHandle>;

    fn defragmentation_end(
        &mut self,
        context: DefragContextHandle,
    ) -> LiveResult<DefragmentationReport>;

    /// Capture internal statistics; `detailed` adds per-allocation records
    fn stats(&self, detailed: bool) -> AllocatorStats;

    /// Out-of-band defragmentation pass over `allocations`
    fn defragment(
        &mut self,
        allocations: &[AllocationHandle],
        flags: u32,
    ) -> LiveResult<DefragmentationReport>;

    /// Block until all device-side work has finished
    fn wait_idle(&mut self) -> LiveResult<()>;
}
