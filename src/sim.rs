//! Deterministic in-process allocator
//!
//! `SimulatedAllocator` implements [`LiveAllocator`] with simple bump
//! placement per memory type, heap and pool capacity accounting, lost
//! allocations and compaction-style defragmentation. Failures can be
//! injected from a seeded generator, at fixed call ordinals, or as a device
//! loss after a number of calls, so every reconciliation path can be
//! reproduced.

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use crate::error::{CommandLineError, LiveError};
use crate::live::{
    alloc_flags, memory_property, memory_usage, AllocationCreateInfo, AllocationHandle,
    AllocationInfo, AllocationRecord, AllocatorStats, BufferCreateInfo, BufferHandle,
    DedicatedHint, DefragContextHandle, DefragmentationInfo, DefragmentationReport, DeviceLimits,
    ExtensionToggles, ImageCreateInfo, ImageHandle, LiveEnvironment, MemoryHeap,
    MemoryRequirements, MemoryType, PoolCreateInfo, PoolHandle, PoolStats, StatInfo,
};
use crate::traits::{LiveAllocator, LiveResult};

/// Heap flag marking device-local heaps
const HEAP_DEVICE_LOCAL: u32 = 0x1;
const GIB: u64 = 1 << 30;
const FIRST_HANDLE: u64 = 0x1000;
const BUFFER_ALIGNMENT: u64 = 256;
const TEXEL_BYTES: u64 = 4;

/// Number of selectable simulated devices
pub const DEVICE_COUNT: usize = 2;

fn limits() -> DeviceLimits {
    DeviceLimits {
        max_memory_allocation_count: 4096,
        buffer_image_granularity: 1024,
        non_coherent_atom_size: 64,
    }
}

const HOST_VISIBLE_COHERENT: u32 = memory_property::HOST_VISIBLE | memory_property::HOST_COHERENT;

/// Discrete GPU: device-local VRAM heap plus a larger system heap
fn discrete_profile() -> LiveEnvironment {
    LiveEnvironment {
        api_version: 4198400,
        driver_version: 1,
        vendor_id: 0x10DE,
        device_id: 0x1B80,
        device_type: 2,
        device_name: "Simulated Discrete GPU".to_string(),
        limits: limits(),
        memory_heaps: vec![
            MemoryHeap { size: 8 * GIB, flags: HEAP_DEVICE_LOCAL },
            MemoryHeap { size: 16 * GIB, flags: 0 },
        ],
        memory_types: vec![
            MemoryType { heap_index: 1, property_flags: 0 },
            MemoryType { heap_index: 0, property_flags: memory_property::DEVICE_LOCAL },
            MemoryType { heap_index: 1, property_flags: HOST_VISIBLE_COHERENT },
            MemoryType {
                heap_index: 1,
                property_flags: HOST_VISIBLE_COHERENT | memory_property::HOST_CACHED,
            },
        ],
        extensions: ExtensionToggles::default(),
    }
}

/// Integrated GPU: one shared heap, every type host visible
fn integrated_profile() -> LiveEnvironment {
    LiveEnvironment {
        api_version: 4198400,
        driver_version: 1,
        vendor_id: 0x8086,
        device_id: 0x3E92,
        device_type: 1,
        device_name: "Simulated Integrated GPU".to_string(),
        limits: DeviceLimits {
            buffer_image_granularity: 1,
            ..limits()
        },
        memory_heaps: vec![MemoryHeap { size: 4 * GIB, flags: HEAP_DEVICE_LOCAL }],
        memory_types: vec![
            MemoryType {
                heap_index: 0,
                property_flags: memory_property::DEVICE_LOCAL | HOST_VISIBLE_COHERENT,
            },
            MemoryType {
                heap_index: 0,
                property_flags: memory_property::DEVICE_LOCAL
                    | HOST_VISIBLE_COHERENT
                    | memory_property::HOST_CACHED,
            },
        ],
        extensions: ExtensionToggles::default(),
    }
}

/// Device profile for `index`: 0 is a discrete GPU, 1 an integrated one
pub fn device_profile(index: usize) -> Option<LiveEnvironment> {
    match index {
        0 => Some(discrete_profile()),
        1 => Some(integrated_profile()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct SimPool {
    info: PoolCreateInfo,
    name: Option<String>,
    used: u64,
}

#[derive(Debug, Clone)]
struct SimAllocation {
    memory_type: u32,
    offset: u64,
    size: u64,
    alignment: u64,
    pool: Option<PoolHandle>,
    can_become_lost: bool,
    lost: bool,
    last_use_frame: u32,
    map_count: u32,
    user_data: Option<String>,
}

/// Seeded reference implementation of the live allocator
#[derive(Debug, Clone)]
pub struct SimulatedAllocator {
    environment: LiveEnvironment,
    rng: ChaCha8Rng,
    fail_rate: f64,
    forced_failures: BTreeSet<u64>,
    device_lost_after: Option<u64>,
    device_lost: bool,
    call_ordinal: u64,
    next_handle: u64,
    frame_index: u32,
    heap_usage: Vec<u64>,
    type_tops: Vec<u64>,
    pools: BTreeMap<PoolHandle, SimPool>,
    allocations: BTreeMap<AllocationHandle, SimAllocation>,
    buffers: BTreeMap<BufferHandle, AllocationHandle>,
    images: BTreeMap<ImageHandle, AllocationHandle>,
    defragmentation_contexts: BTreeMap<DefragContextHandle, DefragmentationReport>,
}

impl SimulatedAllocator {
    /// Discrete device profile, seed 0, no failure injection
    pub fn new() -> Self {
        Self::with_environment(discrete_profile())
    }

    /// Select one of the simulated physical devices
    pub fn for_device(index: usize) -> Result<Self, CommandLineError> {
        device_profile(index)
            .map(Self::with_environment)
            .ok_or_else(|| CommandLineError::InvalidValue {
                option: "physical-device".to_string(),
                value: format!("{} (available: 0..{})", index, DEVICE_COUNT),
            })
    }

    pub fn with_environment(environment: LiveEnvironment) -> Self {
        let heaps = environment.memory_heaps.len();
        let types = environment.memory_types.len();
        Self {
            environment,
            rng: ChaCha8Rng::seed_from_u64(0),
            fail_rate: 0.0,
            forced_failures: BTreeSet::new(),
            device_lost_after: None,
            device_lost: false,
            call_ordinal: 0,
            next_handle: FIRST_HANDLE,
            frame_index: 0,
            heap_usage: vec![0; heaps],
            type_tops: vec![0; types],
            pools: BTreeMap::new(),
            allocations: BTreeMap::new(),
            buffers: BTreeMap::new(),
            images: BTreeMap::new(),
            defragmentation_contexts: BTreeMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Probability in `[0, 1]` that a creating call fails with out-of-memory
    pub fn with_fail_rate(mut self, rate: f64) -> Self {
        self.fail_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Fail the creating calls with these 1-based ordinals
    pub fn with_forced_failures(mut self, ordinals: impl IntoIterator<Item = u64>) -> Self {
        self.forced_failures.extend(ordinals);
        self
    }

    /// Report the device lost on every creating call after the first `calls`
    pub fn with_device_lost_after(mut self, calls: u64) -> Self {
        self.device_lost_after = Some(calls);
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionToggles) -> Self {
        self.environment.extensions = extensions;
        self
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocations alive, lost ones included
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn live_object_count(&self) -> usize {
        self.pools.len() + self.allocations.len() + self.defragmentation_contexts.len()
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn pool_name(&self, pool: PoolHandle) -> Option<&str> {
        self.pools.get(&pool)?.name.as_deref()
    }

    pub fn heap_usage(&self) -> &[u64] {
        &self.heap_usage
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Failure injection point for every creating call
    fn begin_call(&mut self) -> LiveResult<()> {
        if self.device_lost {
            return Err(device_lost());
        }
        self.call_ordinal += 1;
        if self.device_lost_after.is_some_and(|after| self.call_ordinal > after) {
            self.device_lost = true;
            return Err(device_lost());
        }
        if self.forced_failures.contains(&self.call_ordinal) {
            return Err(LiveError::OutOfDeviceMemory);
        }
        if self.fail_rate > 0.0 && self.rng.gen_bool(self.fail_rate) {
            return Err(LiveError::OutOfDeviceMemory);
        }
        Ok(())
    }

    fn heap_of(&self, memory_type: u32) -> usize {
        self.environment.memory_types[memory_type as usize].heap_index as usize
    }

    fn choose_memory_type(
        &self,
        allowed_bits: u32,
        info: &AllocationCreateInfo,
    ) -> LiveResult<u32> {
        if let Some(pool) = info.pool {
            return self
                .pools
                .get(&pool)
                .map(|p| p.info.memory_type_index)
                .ok_or_else(|| invalid(format!("unknown pool {:#x}", pool.0)));
        }

        let mut required = info.required_flags;
        let mut preferred = info.preferred_flags;
        match info.usage {
            memory_usage::GPU_ONLY => preferred |= memory_property::DEVICE_LOCAL,
            memory_usage::CPU_ONLY => required |= HOST_VISIBLE_COHERENT,
            memory_usage::CPU_TO_GPU => {
                required |= memory_property::HOST_VISIBLE;
                preferred |= memory_property::DEVICE_LOCAL;
            }
            memory_usage::GPU_TO_CPU => {
                required |= memory_property::HOST_VISIBLE;
                preferred |= memory_property::HOST_CACHED;
            }
            _ => {}
        }
        let mut allowed = allowed_bits;
        if info.memory_type_bits != 0 {
            allowed &= info.memory_type_bits;
        }

        self.environment
            .memory_types
            .iter()
            .enumerate()
            .filter(|&(index, ty)| {
                index < 32
                    && allowed & (1 << index) != 0
                    && ty.property_flags & required == required
            })
            .max_by_key(|&(index, ty)| {
                let score = (ty.property_flags & preferred).count_ones();
                (score, std::cmp::Reverse(index))
            })
            .map(|(index, _)| index as u32)
            .ok_or(LiveError::FeatureNotPresent)
    }

    fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        allowed_bits: u32,
        info: &AllocationCreateInfo,
    ) -> LiveResult<AllocationHandle> {
        if size == 0 {
            return Err(invalid("allocation size is zero"));
        }
        let memory_type = self.choose_memory_type(allowed_bits, info)?;
        let heap_index = self.heap_of(memory_type);
        let heap_size = self.environment.memory_heaps.get(heap_index).map_or(0, |heap| heap.size);

        if self.heap_usage[heap_index].saturating_add(size) > heap_size {
            return Err(LiveError::OutOfDeviceMemory);
        }
        if let Some(pool) = info.pool.and_then(|handle| self.pools.get(&handle)) {
            if pool.used.saturating_add(size) > pool_capacity(&pool.info) {
                return Err(LiveError::OutOfDeviceMemory);
            }
        } else if info.flags & alloc_flags::NEVER_ALLOCATE != 0 {
            return Err(LiveError::OutOfDeviceMemory);
        }

        let alignment = alignment.max(1);
        let offset = align_up(self.type_tops[memory_type as usize], alignment)
            .ok_or(LiveError::OutOfDeviceMemory)?;
        self.type_tops[memory_type as usize] =
            offset.checked_add(size).ok_or(LiveError::OutOfDeviceMemory)?;
        self.heap_usage[heap_index] += size;
        if let Some(pool) = info.pool.and_then(|handle| self.pools.get_mut(&handle)) {
            pool.used += size;
        }

        let handle = AllocationHandle(self.next_handle());
        self.allocations.insert(
            handle,
            SimAllocation {
                memory_type,
                offset,
                size,
                alignment,
                pool: info.pool,
                can_become_lost: info.flags & alloc_flags::CAN_BECOME_LOST != 0,
                lost: false,
                last_use_frame: self.frame_index,
                map_count: u32::from(info.flags & alloc_flags::MAPPED != 0),
                user_data: info.user_data.clone(),
            },
        );
        Ok(handle)
    }

    fn release(&mut self, allocation: &SimAllocation) {
        if allocation.lost {
            return;
        }
        let heap_index = self.heap_of(allocation.memory_type);
        self.heap_usage[heap_index] = self.heap_usage[heap_index].saturating_sub(allocation.size);
        if let Some(pool) = allocation.pool.and_then(|handle| self.pools.get_mut(&handle)) {
            pool.used = pool.used.saturating_sub(allocation.size);
        }
    }

    fn live_allocation(&self, handle: AllocationHandle) -> LiveResult<&SimAllocation> {
        match self.allocations.get(&handle) {
            Some(allocation) if !allocation.lost => Ok(allocation),
            Some(_) => Err(invalid("allocation is lost")),
            None => Err(invalid(format!("unknown allocation {:#x}", handle.0))),
        }
    }

    /// Slide movable allocations down into gaps, one memory type at a time
    fn compact(
        &mut self,
        movable: &BTreeSet<AllocationHandle>,
        max_bytes: u64,
        max_moves: u64,
    ) -> DefragmentationReport {
        let mut report = DefragmentationReport::default();
        let mut bytes_budget = max_bytes;
        let mut moves_budget = max_moves;

        for memory_type in 0..self.type_tops.len() as u32 {
            let mut placed: Vec<(AllocationHandle, u64, u64, u64)> = self
                .allocations
                .iter()
                .filter(|(_, a)| a.memory_type == memory_type && !a.lost)
                .map(|(&handle, a)| (handle, a.offset, a.size, a.alignment))
                .collect();
            placed.sort_by_key(|&(handle, offset, _, _)| (offset, handle));

            let mut cursor = 0;
            for (handle, offset, size, alignment) in placed {
                let target = align_up(cursor, alignment).unwrap_or(offset);
                let can_move =
                    movable.contains(&handle) && bytes_budget >= size && moves_budget > 0;
                let new_offset = if target < offset && can_move {
                    bytes_budget -= size;
                    moves_budget -= 1;
                    report.bytes_moved += size;
                    report.allocations_moved += 1;
                    target
                } else {
                    offset
                };
                if let Some(allocation) = self.allocations.get_mut(&handle) {
                    allocation.offset = new_offset;
                }
                cursor = new_offset.saturating_add(size);
            }

            let top = &mut self.type_tops[memory_type as usize];
            if cursor < *top {
                report.bytes_freed += *top - cursor;
                *top = cursor;
            }
        }
        report
    }
}

impl Default for SimulatedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn device_lost() -> LiveError {
    LiveError::DeviceLost {
        reason: "simulated device loss".to_string(),
    }
}

fn invalid(reason: impl Into<String>) -> LiveError {
    LiveError::InvalidArgument { reason: reason.into() }
}

/// `None` when the aligned offset does not fit in the address space
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.div_ceil(alignment).checked_mul(alignment)
}

fn pool_capacity(info: &PoolCreateInfo) -> u64 {
    if info.max_block_count == 0 {
        u64::MAX
    } else {
        info.block_size.saturating_mul(info.max_block_count)
    }
}

fn image_size(image: &ImageCreateInfo) -> Option<u64> {
    let extent = &image.extent;
    let base = [extent.height, extent.depth, image.array_layers, image.samples]
        .into_iter()
        .try_fold(u64::from(extent.width.max(1)), |size, factor| {
            size.checked_mul(u64::from(factor.max(1)))
        })?
        .checked_mul(TEXEL_BYTES)?;
    if image.mip_levels > 1 {
        base.checked_add(base / 3)
    } else {
        Some(base)
    }
}

impl LiveAllocator for SimulatedAllocator {
    fn environment(&self) -> LiveEnvironment {
        self.environment.clone()
    }

    fn set_current_frame_index(&mut self, frame_index: u32) {
        self.frame_index = frame_index;
    }

    fn create_pool(&mut self, info: &PoolCreateInfo) -> LiveResult<PoolHandle> {
        self.begin_call()?;
        if info.memory_type_index as usize >= self.environment.memory_types.len() {
            return Err(invalid(format!("memory type {} out of range", info.memory_type_index)));
        }
        if info.max_block_count != 0 && info.min_block_count > info.max_block_count {
            return Err(invalid("minBlockCount exceeds maxBlockCount"));
        }
        let handle = PoolHandle(self.next_handle());
        self.pools.insert(
            handle,
            SimPool {
                info: info.clone(),
                name: None,
                used: 0,
            },
        );
        Ok(handle)
    }

    fn destroy_pool(&mut self, pool: PoolHandle) {
        if self.pools.remove(&pool).is_none() {
            tracing::debug!("destroy_pool on unknown pool {:#x}", pool.0);
        }
    }

    fn set_pool_name(&mut self, pool: PoolHandle, name: Option<&str>) {
        if let Some(entry) = self.pools.get_mut(&pool) {
            entry.name = name.map(str::to_string);
        }
    }

    fn make_pool_allocations_lost(&mut self, pool: PoolHandle) -> usize {
        let Some(frames_in_use) = self.pools.get(&pool).map(|p| p.info.frame_in_use_count) else {
            return 0;
        };
        let frame_index = self.frame_index;
        let lost: Vec<AllocationHandle> = self
            .allocations
            .iter()
            .filter(|(_, a)| {
                a.pool == Some(pool)
                    && a.can_become_lost
                    && !a.lost
                    && a.last_use_frame.saturating_add(frames_in_use) < frame_index
            })
            .map(|(&handle, _)| handle)
            .collect();

        for handle in &lost {
            if let Some(allocation) = self.allocations.get(handle).cloned() {
                self.release(&allocation);
            }
            if let Some(allocation) = self.allocations.get_mut(handle) {
                allocation.lost = true;
            }
        }
        lost.len()
    }

    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        dedicated: Option<DedicatedHint>,
        info: &AllocationCreateInfo,
    ) -> LiveResult<AllocationHandle> {
        self.begin_call()?;
        let requires_dedicated = dedicated.is_some_and(|hint| hint.requires);
        if requires_dedicated && info.pool.is_some() {
            return Err(invalid("dedicated allocation required but a custom pool was given"));
        }
        self.allocate(
            requirements.size,
            requirements.alignment,
            requirements.memory_type_bits,
            info,
        )
    }

    fn allocate_memory_pages(
        &mut self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        count: usize,
    ) -> LiveResult<Vec<Option<AllocationHandle>>> {
        self.begin_call()?;
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let page = self.allocate(
                requirements.size,
                requirements.alignment,
                requirements.memory_type_bits,
                info,
            );
            match page {
                Ok(handle) => pages.push(handle),
                Err(error) => {
                    self.free_memory_pages(&pages);
                    return Err(error);
                }
            }
        }
        Ok(pages.into_iter().map(Some).collect())
    }

    fn create_buffer(
        &mut self,
        buffer: &BufferCreateInfo,
        info: &AllocationCreateInfo,
    ) -> LiveResult<(BufferHandle, AllocationHandle)> {
        self.begin_call()?;
        let allocation = self.allocate(buffer.size, BUFFER_ALIGNMENT, u32::MAX, info)?;
        let handle = BufferHandle(self.next_handle());
        self.buffers.insert(handle, allocation);
        Ok((handle, allocation))
    }

    fn create_image(
        &mut self,
        image: &ImageCreateInfo,
        info: &AllocationCreateInfo,
    ) -> LiveResult<(ImageHandle, AllocationHandle)> {
        self.begin_call()?;
        let alignment = self.environment.limits.buffer_image_granularity;
        let size = image_size(image).ok_or(LiveError::OutOfDeviceMemory)?;
        let allocation = self.allocate(size, alignment, u32::MAX, info)?;
        let handle = ImageHandle(self.next_handle());
        self.images.insert(handle, allocation);
        Ok((handle, allocation))
    }

    fn create_lost_allocation(&mut self) -> LiveResult<AllocationHandle> {
        self.begin_call()?;
        let handle = AllocationHandle(self.next_handle());
        self.allocations.insert(
            handle,
            SimAllocation {
                memory_type: 0,
                offset: 0,
                size: 0,
                alignment: 1,
                pool: None,
                can_become_lost: true,
                lost: true,
                last_use_frame: self.frame_index,
                map_count: 0,
                user_data: None,
            },
        );
        Ok(handle)
    }

    fn free_memory(&mut self, allocation: AllocationHandle) {
        match self.allocations.remove(&allocation) {
            Some(removed) => self.release(&removed),
            None => tracing::debug!("free_memory on unknown allocation {:#x}", allocation.0),
        }
    }

    fn free_memory_pages(&mut self, allocations: &[AllocationHandle]) {
        for &allocation in allocations {
            self.free_memory(allocation);
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle, allocation: AllocationHandle) {
        self.buffers.remove(&buffer);
        self.free_memory(allocation);
    }

    fn destroy_image(&mut self, image: ImageHandle, allocation: AllocationHandle) {
        self.images.remove(&image);
        self.free_memory(allocation);
    }

    fn set_allocation_user_data(&mut self, allocation: AllocationHandle, user_data: Option<&str>) {
        if let Some(entry) = self.allocations.get_mut(&allocation) {
            entry.user_data = user_data.map(str::to_string);
        }
    }

    fn map_memory(&mut self, allocation: AllocationHandle) -> LiveResult<()> {
        let memory_type = self.live_allocation(allocation)?.memory_type;
        let flags = self.environment.memory_types[memory_type as usize].property_flags;
        if flags & memory_property::HOST_VISIBLE == 0 {
            return Err(invalid("memory type is not host visible"));
        }
        if let Some(entry) = self.allocations.get_mut(&allocation) {
            entry.map_count += 1;
        }
        Ok(())
    }

    fn unmap_memory(&mut self, allocation: AllocationHandle) {
        if let Some(entry) = self.allocations.get_mut(&allocation) {
            entry.map_count = entry.map_count.saturating_sub(1);
        }
    }

    fn flush_allocation(
        &mut self,
        allocation: AllocationHandle,
        offset: u64,
        _size: u64,
    ) -> LiveResult<()> {
        let entry = self.live_allocation(allocation)?;
        if offset > entry.size {
            return Err(invalid("flush offset beyond allocation"));
        }
        Ok(())
    }

    fn invalidate_allocation(
        &mut self,
        allocation: AllocationHandle,
        offset: u64,
        _size: u64,
    ) -> LiveResult<()> {
        let entry = self.live_allocation(allocation)?;
        if offset > entry.size {
            return Err(invalid("invalidate offset beyond allocation"));
        }
        Ok(())
    }

    fn touch_allocation(&mut self, allocation: AllocationHandle) -> bool {
        let frame_index = self.frame_index;
        match self.allocations.get_mut(&allocation) {
            Some(entry) if !entry.lost => {
                entry.last_use_frame = frame_index;
                true
            }
            _ => false,
        }
    }

    fn allocation_info(&self, allocation: AllocationHandle) -> Option<AllocationInfo> {
        self.allocations.get(&allocation).map(|entry| AllocationInfo {
            memory_type: entry.memory_type,
            offset: entry.offset,
            size: if entry.lost { 0 } else { entry.size },
            mapped: entry.map_count > 0,
            user_data: entry.user_data.clone(),
        })
    }

    fn resize_allocation(&mut self, allocation: AllocationHandle, new_size: u64) -> LiveResult<()> {
        if new_size == 0 {
            return Err(invalid("new size is zero"));
        }
        let entry = self.live_allocation(allocation)?.clone();
        let heap_index = self.heap_of(entry.memory_type);

        if new_size > entry.size {
            let grow = new_size - entry.size;
            let top = self.type_tops[entry.memory_type as usize];
            let at_top = entry.offset.checked_add(entry.size) == Some(top);
            let heap_size = self.environment.memory_heaps[heap_index].size;
            if !at_top || self.heap_usage[heap_index].saturating_add(grow) > heap_size {
                return Err(LiveError::OutOfDeviceMemory);
            }
            self.type_tops[entry.memory_type as usize] =
                top.checked_add(grow).ok_or(LiveError::OutOfDeviceMemory)?;
            self.heap_usage[heap_index] += grow;
        } else {
            self.heap_usage[heap_index] -= entry.size - new_size;
        }

        if let Some(pool) = entry.pool.and_then(|handle| self.pools.get_mut(&handle)) {
            pool.used = pool.used.saturating_sub(entry.size).saturating_add(new_size);
        }
        if let Some(entry) = self.allocations.get_mut(&allocation) {
            entry.size = new_size;
        }
        Ok(())
    }

    fn defragmentation_begin(
        &mut self,
        info: &DefragmentationInfo,
    ) -> LiveResult<DefragContextHandle> {
        self.begin_call()?;
        let mut movable: BTreeSet<AllocationHandle> = info.allocations.iter().copied().collect();
        movable.extend(
            self.allocations
                .iter()
                .filter(|(_, a)| a.pool.is_some_and(|pool| info.pools.contains(&pool)))
                .map(|(&handle, _)| handle),
        );

        let mut max_bytes = info.max_cpu_bytes_to_move;
        let mut max_moves = u64::from(info.max_cpu_allocations_to_move);
        if info.use_command_buffer {
            max_bytes = max_bytes.saturating_add(info.max_gpu_bytes_to_move);
            max_moves = max_moves.saturating_add(u64::from(info.max_gpu_allocations_to_move));
        }
        let report = self.compact(&movable, max_bytes, max_moves);

        let handle = DefragContextHandle(self.next_handle());
        self.defragmentation_contexts.insert(handle, report);
        Ok(handle)
    }

    fn defragmentation_end(
        &mut self,
        context: DefragContextHandle,
    ) -> LiveResult<DefragmentationReport> {
        if self.device_lost {
            return Err(device_lost());
        }
        self.defragmentation_contexts
            .remove(&context)
            .ok_or_else(|| invalid(format!("unknown defragmentation context {:#x}", context.0)))
    }

    fn stats(&self, detailed: bool) -> AllocatorStats {
        let mut total = StatInfo::default();
        let mut memory_heaps = vec![StatInfo::default(); self.environment.memory_heaps.len()];
        let mut memory_types = vec![StatInfo::default(); self.environment.memory_types.len()];
        let mut pools: BTreeMap<PoolHandle, StatInfo> = BTreeMap::new();

        for allocation in self.allocations.values().filter(|a| !a.lost) {
            let heap_index = self.heap_of(allocation.memory_type);
            let targets = [
                Some(&mut total),
                memory_heaps.get_mut(heap_index),
                memory_types.get_mut(allocation.memory_type as usize),
            ];
            for stat in targets.into_iter().flatten() {
                stat.allocation_count += 1;
                stat.used_bytes += allocation.size;
            }
            if let Some(pool) = allocation.pool {
                let stat = pools.entry(pool).or_default();
                stat.allocation_count += 1;
                stat.used_bytes += allocation.size;
            }
        }

        for (index, stat) in memory_types.iter_mut().enumerate() {
            let top = self.type_tops[index];
            if top > 0 {
                stat.block_count = 1;
                stat.unused_bytes = top.saturating_sub(stat.used_bytes);
                let heap_index = self.environment.memory_types[index].heap_index as usize;
                if let Some(heap) = memory_heaps.get_mut(heap_index) {
                    heap.block_count += 1;
                    heap.unused_bytes += stat.unused_bytes;
                }
                total.block_count += 1;
                total.unused_bytes += stat.unused_bytes;
            }
        }

        AllocatorStats {
            captured_at: Utc::now(),
            total,
            memory_heaps,
            memory_types,
            pools: self
                .pools
                .iter()
                .map(|(&handle, pool)| PoolStats {
                    pool: handle,
                    name: pool.name.clone(),
                    memory_type_index: pool.info.memory_type_index,
                    stats: pools.get(&handle).copied().unwrap_or_default(),
                })
                .collect(),
            allocations: detailed.then(|| {
                self.allocations
                    .iter()
                    .map(|(&handle, a)| AllocationRecord {
                        allocation: handle,
                        memory_type: a.memory_type,
                        offset: a.offset,
                        size: a.size,
                        pool: a.pool,
                        lost: a.lost,
                        user_data: a.user_data.clone(),
                    })
                    .collect()
            }),
        }
    }

    fn defragment(
        &mut self,
        allocations: &[AllocationHandle],
        flags: u32,
    ) -> LiveResult<DefragmentationReport> {
        if self.device_lost {
            return Err(device_lost());
        }
        tracing::debug!("defragment {} allocations, flags {:#x}", allocations.len(), flags);
        let movable: BTreeSet<AllocationHandle> = allocations.iter().copied().collect();
        Ok(self.compact(&movable, u64::MAX, u64::MAX))
    }

    fn wait_idle(&mut self) -> LiveResult<()> {
        if self.device_lost {
            return Err(device_lost());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::Extent3d;

    fn requirements(size: u64) -> MemoryRequirements {
        MemoryRequirements { size, alignment: 256, memory_type_bits: u32::MAX }
    }

    fn pool_info(max_blocks: u64) -> PoolCreateInfo {
        PoolCreateInfo {
            memory_type_index: 1,
            flags: 0,
            block_size: 1024,
            min_block_count: 0,
            max_block_count: max_blocks,
            frame_in_use_count: 1,
        }
    }

    #[test]
    fn test_device_selection() {
        assert!(SimulatedAllocator::for_device(0).is_ok());
        let integrated = SimulatedAllocator::for_device(1).unwrap();
        assert_eq!(integrated.environment().memory_heaps.len(), 1);
        assert!(matches!(
            SimulatedAllocator::for_device(DEVICE_COUNT),
            Err(CommandLineError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_memory_type_selection_follows_usage() {
        let mut sim = SimulatedAllocator::new();
        let gpu = AllocationCreateInfo { usage: memory_usage::GPU_ONLY, ..Default::default() };
        let cpu = AllocationCreateInfo { usage: memory_usage::CPU_ONLY, ..Default::default() };
        let readback = AllocationCreateInfo {
            usage: memory_usage::GPU_TO_CPU,
            ..Default::default()
        };

        let a = sim.allocate_memory(&requirements(64), None, &gpu).unwrap();
        let b = sim.allocate_memory(&requirements(64), None, &cpu).unwrap();
        let c = sim.allocate_memory(&requirements(64), None, &readback).unwrap();

        assert_eq!(sim.allocation_info(a).unwrap().memory_type, 1);
        assert_eq!(sim.allocation_info(b).unwrap().memory_type, 2);
        assert_eq!(sim.allocation_info(c).unwrap().memory_type, 3);
        assert!(sim.map_memory(b).is_ok());
        assert!(sim.map_memory(a).is_err());
    }

    #[test]
    fn test_pool_capacity_is_enforced() {
        let mut sim = SimulatedAllocator::new();
        let pool = sim.create_pool(&pool_info(2)).unwrap();
        let info = AllocationCreateInfo { pool: Some(pool), ..Default::default() };

        sim.allocate_memory(&requirements(1024), None, &info).unwrap();
        let second = sim.allocate_memory(&requirements(1024), None, &info).unwrap();
        assert_eq!(
            sim.allocate_memory(&requirements(1), None, &info),
            Err(LiveError::OutOfDeviceMemory)
        );

        sim.free_memory(second);
        assert!(sim.allocate_memory(&requirements(512), None, &info).is_ok());
    }

    #[test]
    fn test_forced_failures_and_device_loss() {
        let mut sim = SimulatedAllocator::new().with_forced_failures([2]).with_device_lost_after(3);
        assert!(sim.create_pool(&pool_info(0)).is_ok());
        assert_eq!(sim.create_pool(&pool_info(0)), Err(LiveError::OutOfDeviceMemory));
        assert!(sim.create_pool(&pool_info(0)).is_ok());
        let lost = sim.create_pool(&pool_info(0)).unwrap_err();
        assert!(lost.is_fatal());
        assert!(sim.wait_idle().unwrap_err().is_fatal());
    }

    #[test]
    fn test_seeded_failures_are_reproducible() {
        let outcomes = |seed| {
            let mut sim = SimulatedAllocator::new().with_seed(seed).with_fail_rate(0.5);
            (0..32).map(|_| sim.create_lost_allocation().is_ok()).collect::<Vec<_>>()
        };
        assert_eq!(outcomes(7), outcomes(7));
        assert!(outcomes(7).contains(&false));
    }

    #[test]
    fn test_lost_allocations() {
        let mut sim = SimulatedAllocator::new();
        let pool = sim.create_pool(&pool_info(0)).unwrap();
        let info = AllocationCreateInfo {
            pool: Some(pool),
            flags: alloc_flags::CAN_BECOME_LOST,
            ..Default::default()
        };
        let allocation = sim.allocate_memory(&requirements(128), None, &info).unwrap();

        sim.set_current_frame_index(1);
        assert_eq!(sim.make_pool_allocations_lost(pool), 0);
        sim.set_current_frame_index(5);
        assert_eq!(sim.make_pool_allocations_lost(pool), 1);
        assert!(!sim.touch_allocation(allocation));
        assert_eq!(sim.allocation_info(allocation).unwrap().size, 0);

        let lost = sim.create_lost_allocation().unwrap();
        assert!(!sim.touch_allocation(lost));
    }

    #[test]
    fn test_defragment_closes_gaps() {
        let mut sim = SimulatedAllocator::new();
        let info = AllocationCreateInfo { usage: memory_usage::GPU_ONLY, ..Default::default() };
        let a = sim.allocate_memory(&requirements(256), None, &info).unwrap();
        let b = sim.allocate_memory(&requirements(256), None, &info).unwrap();
        let c = sim.allocate_memory(&requirements(256), None, &info).unwrap();
        sim.free_memory(a);

        let report = sim.defragment(&[b, c], 0).unwrap();
        assert_eq!(report.allocations_moved, 2);
        assert_eq!(report.bytes_moved, 512);
        assert_eq!(report.bytes_freed, 256);
        assert_eq!(sim.allocation_info(b).unwrap().offset, 0);
        assert_eq!(sim.allocation_info(c).unwrap().offset, 256);
    }

    #[test]
    fn test_resize_in_place() {
        let mut sim = SimulatedAllocator::new();
        let info = AllocationCreateInfo::default();
        let first = sim.allocate_memory(&requirements(256), None, &info).unwrap();
        let last = sim.allocate_memory(&requirements(256), None, &info).unwrap();

        assert_eq!(sim.resize_allocation(first, 1024), Err(LiveError::OutOfDeviceMemory));
        assert!(sim.resize_allocation(first, 128).is_ok());
        assert!(sim.resize_allocation(last, 1024).is_ok());
        assert_eq!(sim.allocation_info(last).unwrap().size, 1024);
    }

    #[test]
    fn test_oversized_requests_fail_instead_of_overflowing() {
        let mut sim = SimulatedAllocator::new();
        let image = ImageCreateInfo {
            flags: 0,
            image_type: 1,
            format: 37,
            extent: Extent3d { width: u32::MAX, height: u32::MAX, depth: u32::MAX },
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            tiling: 0,
            usage: 6,
            sharing_mode: 0,
            initial_layout: 0,
        };
        let info = AllocationCreateInfo::default();
        assert_eq!(sim.create_image(&image, &info), Err(LiveError::OutOfDeviceMemory));
        assert_eq!(sim.image_count(), 0);

        let huge_alignment = MemoryRequirements {
            size: 64,
            alignment: 1 << 63,
            memory_type_bits: u32::MAX,
        };
        assert!(sim.allocate_memory(&huge_alignment, None, &info).is_ok());
        assert!(sim.allocate_memory(&huge_alignment, None, &info).is_ok());
        assert_eq!(
            sim.allocate_memory(&huge_alignment, None, &info),
            Err(LiveError::OutOfDeviceMemory)
        );
        assert_eq!(sim.allocation_count(), 2);
    }

    #[test]
    fn test_detailed_stats_list_allocations() {
        let mut sim = SimulatedAllocator::new();
        let (_, allocation) = sim
            .create_buffer(
                &BufferCreateInfo { flags: 0, size: 4096, usage: 0x80, sharing_mode: 0 },
                &AllocationCreateInfo { usage: memory_usage::GPU_ONLY, ..Default::default() },
            )
            .unwrap();

        let plain = sim.stats(false);
        assert!(plain.allocations.is_none());
        assert_eq!(plain.total.used_bytes, 4096);

        let detailed = sim.stats(true);
        let records = detailed.allocations.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].allocation, allocation);
    }
}
