//! Call counters and creation-parameter accumulators

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::live::{
    alloc_flags, AllocationCreateInfo, BufferCreateInfo, DefragmentationReport, ImageCreateInfo,
    MemoryRequirements, PoolCreateInfo,
};
use crate::operation::Operation;

/// Running count/min/max/sum over one parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accumulator {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub sum: u64,
}

impl Accumulator {
    pub fn add(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.count as f64)
        }
    }
}

/// Occurrence count per discrete value
pub type Distribution = BTreeMap<u32, u64>;

fn bump(distribution: &mut Distribution, key: u32) {
    *distribution.entry(key).or_insert(0) += 1;
}

/// Count each set bit of `mask` under its bit index
fn bump_bits(distribution: &mut Distribution, mask: u32) {
    (0..u32::BITS)
        .filter(|bit| mask & (1 << bit) != 0)
        .for_each(|bit| bump(distribution, bit));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub count: u64,
    pub block_size: Accumulator,
    pub min_block_count: Accumulator,
    pub max_block_count: Accumulator,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatistics {
    pub count: u64,
    pub size: Accumulator,
    /// Keyed by usage bit index
    pub usage_bits: Distribution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatistics {
    pub count: u64,
    pub width: Accumulator,
    pub height: Accumulator,
    pub depth: Accumulator,
    pub mip_levels: Accumulator,
    pub array_layers: Accumulator,
    pub image_type: Distribution,
    pub tiling: Distribution,
    pub usage_bits: Distribution,
}

/// Raw memory allocations (single, paged, buffer/image-specific)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStatistics {
    pub count: u64,
    pub page_calls: u64,
    pub size: Accumulator,
    pub alignment: Accumulator,
}

/// Allocation-create parameters shared by every allocating call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInfoStatistics {
    pub memory_usage: Distribution,
    pub dedicated: u64,
    pub mapped: u64,
    pub custom_pool: u64,
    pub can_become_lost: u64,
    pub user_data: u64,
}

impl CreateInfoStatistics {
    fn add(&mut self, info: &AllocationCreateInfo, weight: u64) {
        *self.memory_usage.entry(info.usage).or_insert(0) += weight;
        if info.flags & alloc_flags::DEDICATED_MEMORY != 0 {
            self.dedicated += weight;
        }
        if info.flags & alloc_flags::MAPPED != 0 {
            self.mapped += weight;
        }
        if info.flags & alloc_flags::CAN_BECOME_LOST != 0 {
            self.can_become_lost += weight;
        }
        if info.pool.is_some() {
            self.custom_pool += weight;
        }
        if info.user_data.is_some() {
            self.user_data += weight;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragmentationStatistics {
    /// Recorded begin/end pairs plus scheduled passes
    pub passes: u64,
    pub scheduled_passes: u64,
    pub bytes_moved: u64,
    pub allocations_moved: u64,
    pub bytes_freed: u64,
    pub blocks_freed: u64,
}

impl DefragmentationStatistics {
    pub fn record(&mut self, report: &DefragmentationReport, scheduled: bool) {
        self.passes += 1;
        if scheduled {
            self.scheduled_passes += 1;
        }
        self.bytes_moved += report.bytes_moved;
        self.allocations_moved += u64::from(report.allocations_moved);
        self.bytes_freed += report.bytes_freed;
        self.blocks_freed += u64::from(report.device_memory_blocks_freed);
    }
}

/// Everything counted during one replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub calls: BTreeMap<Operation, u64>,
    pub calls_by_thread: BTreeMap<u32, u64>,
    pub pools: PoolStatistics,
    pub buffers: BufferStatistics,
    pub images: ImageStatistics,
    pub allocations: AllocationStatistics,
    pub create_info: CreateInfoStatistics,
    pub defragmentation: DefragmentationStatistics,
    pub lines_dispatched: u64,
    pub lines_skipped: u64,
    pub actions_executed: u64,
    pub snapshots_written: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&mut self, operation: Operation, thread_id: u32) {
        *self.calls.entry(operation).or_insert(0) += 1;
        *self.calls_by_thread.entry(thread_id).or_insert(0) += 1;
    }

    pub fn record_pool(&mut self, info: &PoolCreateInfo) {
        self.pools.count += 1;
        self.pools.block_size.add(info.block_size);
        self.pools.min_block_count.add(info.min_block_count);
        self.pools.max_block_count.add(info.max_block_count);
    }

    pub fn record_buffer(&mut self, buffer: &BufferCreateInfo, info: &AllocationCreateInfo) {
        self.buffers.count += 1;
        self.buffers.size.add(buffer.size);
        bump_bits(&mut self.buffers.usage_bits, buffer.usage);
        self.create_info.add(info, 1);
    }

    pub fn record_image(&mut self, image: &ImageCreateInfo, info: &AllocationCreateInfo) {
        let images = &mut self.images;
        images.count += 1;
        images.width.add(u64::from(image.extent.width));
        images.height.add(u64::from(image.extent.height));
        images.depth.add(u64::from(image.extent.depth));
        images.mip_levels.add(u64::from(image.mip_levels));
        images.array_layers.add(u64::from(image.array_layers));
        bump(&mut images.image_type, image.image_type);
        bump(&mut images.tiling, image.tiling);
        bump_bits(&mut images.usage_bits, image.usage);
        self.create_info.add(info, 1);
    }

    /// Record `pages` allocations made with the same requirements
    pub fn record_allocation(
        &mut self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        pages: usize,
    ) {
        let pages = pages as u64;
        self.allocations.count += pages;
        if pages > 1 {
            self.allocations.page_calls += 1;
        }
        for _ in 0..pages {
            self.allocations.size.add(requirements.size);
            self.allocations.alignment.add(requirements.alignment);
        }
        self.create_info.add(info, pages);
    }

    pub fn record_line_dispatched(&mut self) {
        self.lines_dispatched += 1;
    }

    pub fn record_line_skipped(&mut self) {
        self.lines_skipped += 1;
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.values().sum()
    }

    pub fn call_count(&self, operation: Operation) -> u64 {
        self.calls.get(&operation).copied().unwrap_or(0)
    }
}
