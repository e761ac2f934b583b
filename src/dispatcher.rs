//! Per-line decoding and dispatch of recorded calls
//!
//! A data line is `threadId,time,frameIndex,operation,args...`. The
//! dispatcher validates the header columns, resolves the operation, checks
//! the argument count, decodes the arguments, translates recorded ids to
//! live handles and issues the live call. Every problem along the way is a
//! counted warning; only a fatal live error is returned as `Err`.

use crate::context::ReplayContext;
use crate::error::ReplayError;
use crate::identity_map::{BoundResource, IdentityMap, LiveObject};
use crate::lexer::{split_fields, FieldList, TraceLine};
use crate::live::{
    AllocationCreateInfo, AllocationHandle, BufferCreateInfo, DedicatedHint, DefragmentationInfo,
    Extent3d, ImageCreateInfo, MemoryRequirements, PoolCreateInfo, PoolHandle,
};
use crate::operation::{Operation, HEADER_COLUMNS};
use crate::reconciler::{CallSite, Reconciler};
use crate::traits::{LiveAllocator, LiveResult};
use crate::types::{Category, HandleId};

/// One decoded data line
#[derive(Debug, Clone)]
pub struct RecordedCall<'a> {
    pub line: usize,
    pub thread_id: u32,
    /// Seconds since the recording started
    pub time: f64,
    pub frame_index: u32,
    pub operation: Operation,
    pub args: FieldList<'a>,
}

impl RecordedCall<'_> {
    fn site(&self) -> CallSite {
        CallSite::new(self.line, self.operation)
    }
}

type Dispatched = Result<DispatchStatus, ReplayError>;

/// What happened to a dispatched line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The live call was issued (or the operation needs none)
    Executed,
    /// The line was malformed and nothing was issued
    Rejected,
}

/// Allocation-create columns shared by every allocating operation
struct CreateColumns {
    info: AllocationCreateInfo,
    pool: HandleId,
}

/// `flags, usage, requiredFlags, preferredFlags, memoryTypeBits, pool` at `at`
fn create_columns(args: &FieldList<'_>, at: usize) -> Option<CreateColumns> {
    Some(CreateColumns {
        info: AllocationCreateInfo {
            flags: args.u32_at(at)?,
            usage: args.u32_at(at + 1)?,
            required_flags: args.u32_at(at + 2)?,
            preferred_flags: args.u32_at(at + 3)?,
            memory_type_bits: args.u32_at(at + 4)?,
            pool: None,
            user_data: None,
        },
        pool: HandleId(args.pointer_at(at + 5)?),
    })
}

fn requirements(args: &FieldList<'_>) -> Option<MemoryRequirements> {
    Some(MemoryRequirements {
        size: args.u64_at(0)?,
        alignment: args.u64_at(1)?,
        memory_type_bits: args.u32_at(2)?,
    })
}

fn handle_at(args: &FieldList<'_>, index: usize) -> Option<HandleId> {
    args.pointer_at(index).map(HandleId)
}

fn handle_list_at(args: &FieldList<'_>, index: usize) -> Option<Vec<HandleId>> {
    Some(args.pointer_list_at(index)?.into_iter().map(HandleId).collect())
}

/// Dispatches data lines against the live allocator
pub struct Dispatcher<'d, A: LiveAllocator + ?Sized> {
    live: &'d mut A,
    identity: &'d mut IdentityMap,
    context: &'d mut ReplayContext,
}

impl<'d, A: LiveAllocator + ?Sized> Dispatcher<'d, A> {
    pub fn new(
        live: &'d mut A,
        identity: &'d mut IdentityMap,
        context: &'d mut ReplayContext,
    ) -> Self {
        Self {
            live,
            identity,
            context,
        }
    }

    /// Decode and execute one non-blank data line
    pub fn dispatch(&mut self, line: &TraceLine<'_>) -> Dispatched {
        let columns = split_fields(line.bytes, HEADER_COLUMNS + 1);
        if columns.len() < HEADER_COLUMNS {
            self.context.logger.warn(line.number, None, "Too few columns.");
            return Ok(DispatchStatus::Rejected);
        }

        let name = columns.str_at(3).unwrap_or_default();
        let Some(operation) = Operation::from_name(name) else {
            self.context
                .logger
                .warn(line.number, None, format!("Unknown operation: {}", line.text()));
            return Ok(DispatchStatus::Rejected);
        };

        let header = (
            columns.u32_at(0),
            columns.get(1).and_then(|field| field.as_f64()),
            columns.u32_at(2),
        );
        let (Some(thread_id), Some(time), Some(frame_index)) = header else {
            self.context
                .logger
                .warn(line.number, Some(operation), "Invalid thread, time or frame column.");
            return Ok(DispatchStatus::Rejected);
        };
        self.context.statistics.record_call(operation, thread_id);

        let arity = operation.arity();
        let args = match columns.get(HEADER_COLUMNS) {
            Some(rest) => split_fields(rest.bytes(), arity.split_limit()),
            None => FieldList::empty(),
        };
        if !arity.accepts(args.len()) {
            self.context.logger.warn(
                line.number,
                Some(operation),
                format!("Invalid number of parameters: expected {}, found {}.", arity, args.len()),
            );
            return Ok(DispatchStatus::Rejected);
        }

        let call = RecordedCall {
            line: line.number,
            thread_id,
            time,
            frame_index,
            operation,
            args,
        };
        self.execute(&call)
    }

    fn execute(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        match call.operation {
            Operation::CreateAllocator | Operation::DestroyAllocator => {
                Ok(DispatchStatus::Executed)
            }
            Operation::SetCurrentFrameIndex => self.set_current_frame_index(call),
            Operation::CreatePool => self.create_pool(call),
            Operation::DestroyPool => self.destroy(call, Category::Pool),
            Operation::SetPoolName => self.set_pool_name(call),
            Operation::MakePoolAllocationsLost => self.make_pool_allocations_lost(call),
            Operation::AllocateMemory => self.allocate_memory(call),
            Operation::AllocateMemoryPages => self.allocate_memory_pages(call),
            Operation::AllocateMemoryForBuffer | Operation::AllocateMemoryForImage => {
                self.allocate_memory_for_resource(call)
            }
            Operation::CreateBuffer => self.create_buffer(call),
            Operation::CreateImage => self.create_image(call),
            Operation::CreateLostAllocation => self.create_lost_allocation(call),
            Operation::FreeMemory | Operation::DestroyBuffer | Operation::DestroyImage => {
                self.destroy(call, Category::Allocation)
            }
            Operation::FreeMemoryPages => self.free_memory_pages(call),
            Operation::SetAllocationUserData => self.set_allocation_user_data(call),
            Operation::MapMemory => {
                self.with_allocation(call, |live, allocation| live.map_memory(allocation))
            }
            Operation::UnmapMemory => self.with_allocation(call, |live, allocation| {
                live.unmap_memory(allocation);
                Ok(())
            }),
            Operation::FlushAllocation => self.flush_or_invalidate(call),
            Operation::InvalidateAllocation => self.flush_or_invalidate(call),
            Operation::TouchAllocation => self.touch_allocation(call),
            Operation::GetAllocationInfo => self.get_allocation_info(call),
            Operation::ResizeAllocation => self.resize_allocation(call),
            Operation::DefragmentationBegin => self.defragmentation_begin(call),
            Operation::DefragmentationEnd => self.defragmentation_end(call),
        }
    }

    fn reconciler(&mut self) -> Reconciler<'_, A> {
        Reconciler::new(&mut *self.live, &mut *self.identity, &mut self.context.logger)
    }

    /// Pass a decoded value through, warning when decoding failed
    fn decoded<T>(&mut self, call: &RecordedCall<'_>, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.context
                .logger
                .warn(call.line, Some(call.operation), "Invalid parameters.");
        }
        value
    }

    fn not_found(&mut self, call: &RecordedCall<'_>, category: Category, id: HandleId) {
        self.context
            .logger
            .warn(call.line, Some(call.operation), format!("{} {} not found.", category, id));
    }

    /// Resolve a recorded pool id; a null id is no pool
    fn resolve_pool(&mut self, call: &RecordedCall<'_>, id: HandleId) -> Option<PoolHandle> {
        if id.is_null() {
            return None;
        }
        let pool = self.identity.resolve_pool(id);
        if pool.is_none() {
            self.not_found(call, Category::Pool, id);
        }
        pool
    }

    fn resolve_allocation(
        &mut self,
        call: &RecordedCall<'_>,
        id: HandleId,
    ) -> Option<AllocationHandle> {
        if id.is_null() {
            return None;
        }
        let allocation = self.identity.resolve_allocation(id);
        if allocation.is_none() {
            self.not_found(call, Category::Allocation, id);
        }
        allocation
    }

    /// Complete the shared create columns with the live pool and user data
    fn create_info(
        &mut self,
        call: &RecordedCall<'_>,
        columns: CreateColumns,
        user_data: Option<&str>,
    ) -> AllocationCreateInfo {
        let mut info = columns.info;
        info.pool = self.resolve_pool(call, columns.pool);
        if self.context.forwards_user_data() {
            info.user_data = user_data.map(str::to_string);
        }
        info
    }

    /// Turn a non-fatal live failure into a warning
    fn live_outcome(&mut self, call: &RecordedCall<'_>, result: LiveResult<()>) -> Dispatched {
        match result {
            Ok(()) => Ok(DispatchStatus::Executed),
            Err(error) if error.is_fatal() => Err(call.site().fatal(error)),
            Err(error) => {
                self.context.logger.warn(
                    call.line,
                    Some(call.operation),
                    format!("{} failed ({}).", call.operation, error),
                );
                Ok(DispatchStatus::Executed)
            }
        }
    }

    fn set_current_frame_index(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(frame_index) = self.decoded(call, call.args.u32_at(0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        self.live.set_current_frame_index(frame_index);
        Ok(DispatchStatus::Executed)
    }

    fn create_pool(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            let info = PoolCreateInfo {
                memory_type_index: args.u32_at(0)?,
                flags: args.u32_at(1)?,
                block_size: args.u64_at(2)?,
                min_block_count: args.u64_at(3)?,
                max_block_count: args.u64_at(4)?,
                frame_in_use_count: args.u32_at(5)?,
            };
            Some((info, handle_at(args, 6)?))
        })();
        let Some((info, id)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        self.context.statistics.record_pool(&info);
        let result = self.live.create_pool(&info).map(LiveObject::Pool);
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn destroy(&mut self, call: &RecordedCall<'_>, category: Category) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        self.reconciler().destroy_recorded(call.site(), category, id)?;
        Ok(DispatchStatus::Executed)
    }

    fn set_pool_name(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let decoded = handle_at(&call.args, 0).zip(call.args.optional_str_at(1));
        let Some((id, name)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };
        if let Some(pool) = self.resolve_pool(call, id) {
            self.live.set_pool_name(pool, name);
        }
        Ok(DispatchStatus::Executed)
    }

    fn make_pool_allocations_lost(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        if let Some(pool) = self.resolve_pool(call, id) {
            let lost = self.live.make_pool_allocations_lost(pool);
            self.context.logger.note(
                call.line,
                Some(call.operation),
                format!("{} allocations of pool {} became lost.", lost, id),
            );
        }
        Ok(DispatchStatus::Executed)
    }

    fn allocate_memory(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            Some((
                requirements(args)?,
                create_columns(args, 3)?,
                handle_at(args, 9)?,
                args.optional_str_at(10)?,
            ))
        })();
        let Some((requirements, columns, id, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        let info = self.create_info(call, columns, user_data);
        self.context.statistics.record_allocation(&requirements, &info, 1);
        let result = self
            .live
            .allocate_memory(&requirements, None, &info)
            .map(LiveObject::allocation);
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn allocate_memory_pages(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            Some((
                requirements(args)?,
                create_columns(args, 3)?,
                handle_list_at(args, 9)?,
                args.optional_str_at(10)?,
            ))
        })();
        let Some((requirements, columns, ids, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };
        if ids.is_empty() {
            self.context
                .logger
                .note(call.line, Some(call.operation), "No pages recorded.");
            return Ok(DispatchStatus::Executed);
        }

        let info = self.create_info(call, columns, user_data);
        self.context.statistics.record_allocation(&requirements, &info, ids.len());
        let result = self
            .live
            .allocate_memory_pages(&requirements, &info, ids.len())
            .map(|pages| {
                pages
                    .into_iter()
                    .map(|page| page.map(LiveObject::allocation))
                    .collect()
            });
        self.reconciler().batch(call.site(), &ids, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn allocate_memory_for_resource(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            let hint = DedicatedHint {
                requires: args.bool_at(3)?,
                prefers: args.bool_at(4)?,
            };
            Some((
                requirements(args)?,
                hint,
                create_columns(args, 5)?,
                handle_at(args, 11)?,
                args.optional_str_at(12)?,
            ))
        })();
        let Some((requirements, hint, columns, id, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        let info = self.create_info(call, columns, user_data);
        self.context.statistics.record_allocation(&requirements, &info, 1);
        let result = self
            .live
            .allocate_memory(&requirements, Some(hint), &info)
            .map(LiveObject::allocation);
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn create_buffer(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            let buffer = BufferCreateInfo {
                flags: args.u32_at(0)?,
                size: args.u64_at(1)?,
                usage: args.u32_at(2)?,
                sharing_mode: args.u32_at(3)?,
            };
            let columns = create_columns(args, 4)?;
            Some((buffer, columns, handle_at(args, 10)?, args.optional_str_at(11)?))
        })();
        let Some((buffer, columns, id, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        let info = self.create_info(call, columns, user_data);
        self.context.statistics.record_buffer(&buffer, &info);
        let result = self
            .live
            .create_buffer(&buffer, &info)
            .map(|(buffer, allocation)| LiveObject::Allocation {
                allocation,
                resource: Some(BoundResource::Buffer(buffer)),
            });
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn create_image(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            let image = ImageCreateInfo {
                flags: args.u32_at(0)?,
                image_type: args.u32_at(1)?,
                format: args.u32_at(2)?,
                extent: Extent3d {
                    width: args.u32_at(3)?,
                    height: args.u32_at(4)?,
                    depth: args.u32_at(5)?,
                },
                mip_levels: args.u32_at(6)?,
                array_layers: args.u32_at(7)?,
                samples: args.u32_at(8)?,
                tiling: args.u32_at(9)?,
                usage: args.u32_at(10)?,
                sharing_mode: args.u32_at(11)?,
                initial_layout: args.u32_at(12)?,
            };
            let columns = create_columns(args, 13)?;
            Some((image, columns, handle_at(args, 19)?, args.optional_str_at(20)?))
        })();
        let Some((image, columns, id, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        let info = self.create_info(call, columns, user_data);
        self.context.statistics.record_image(&image, &info);
        let result = self
            .live
            .create_image(&image, &info)
            .map(|(image, allocation)| LiveObject::Allocation {
                allocation,
                resource: Some(BoundResource::Image(image)),
            });
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn create_lost_allocation(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        let result = self.live.create_lost_allocation().map(LiveObject::allocation);
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn free_memory_pages(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(ids) = self.decoded(call, handle_list_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };

        let site = call.site();
        let mut reconciler = self.reconciler();
        let mut plain = Vec::with_capacity(ids.len());
        for id in ids {
            match reconciler.take(site, Category::Allocation, id) {
                Some(LiveObject::Allocation {
                    allocation,
                    resource: None,
                }) => plain.push(allocation),
                Some(object) => reconciler.destroy(site, object)?,
                None => {}
            }
        }
        if !plain.is_empty() {
            self.live.free_memory_pages(&plain);
        }
        Ok(DispatchStatus::Executed)
    }

    fn set_allocation_user_data(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        if !self.context.forwards_user_data() {
            return Ok(DispatchStatus::Executed);
        }
        let decoded = handle_at(&call.args, 0).zip(call.args.optional_str_at(1));
        let Some((id, user_data)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };
        if let Some(allocation) = self.resolve_allocation(call, id) {
            self.live.set_allocation_user_data(allocation, user_data);
        }
        Ok(DispatchStatus::Executed)
    }

    /// Decode the allocation argument and run `f` on its live handle
    fn with_allocation<F>(&mut self, call: &RecordedCall<'_>, f: F) -> Dispatched
    where
        F: FnOnce(&mut A, AllocationHandle) -> LiveResult<()>,
    {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        match self.resolve_allocation(call, id) {
            Some(allocation) => {
                let result = f(&mut *self.live, allocation);
                self.live_outcome(call, result)
            }
            None => Ok(DispatchStatus::Executed),
        }
    }

    fn flush_or_invalidate(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let range = call.args.u64_at(1).zip(call.args.u64_at(2));
        let Some((offset, size)) = self.decoded(call, range) else {
            return Ok(DispatchStatus::Rejected);
        };
        let invalidate = call.operation == Operation::InvalidateAllocation;
        self.with_allocation(call, |live, allocation| {
            if invalidate {
                live.invalidate_allocation(allocation, offset, size)
            } else {
                live.flush_allocation(allocation, offset, size)
            }
        })
    }

    fn touch_allocation(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        if let Some(allocation) = self.resolve_allocation(call, id) {
            if !self.live.touch_allocation(allocation) {
                self.context
                    .logger
                    .note(call.line, Some(call.operation), format!("Allocation {} is lost.", id));
            }
        }
        Ok(DispatchStatus::Executed)
    }

    fn get_allocation_info(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        if let Some(allocation) = self.resolve_allocation(call, id) {
            if self.live.allocation_info(allocation).is_none() {
                self.context.logger.warn(
                    call.line,
                    Some(call.operation),
                    format!("No information for allocation {}.", id),
                );
            }
        }
        Ok(DispatchStatus::Executed)
    }

    fn resize_allocation(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(new_size) = self.decoded(call, call.args.u64_at(1)) else {
            return Ok(DispatchStatus::Rejected);
        };
        self.with_allocation(call, |live, allocation| live.resize_allocation(allocation, new_size))
    }

    fn defragmentation_begin(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let args = &call.args;
        let decoded = (|| {
            let info = DefragmentationInfo {
                flags: args.u32_at(0)?,
                allocations: Vec::new(),
                pools: Vec::new(),
                max_cpu_bytes_to_move: args.u64_at(3)?,
                max_cpu_allocations_to_move: args.u32_at(4)?,
                max_gpu_bytes_to_move: args.u64_at(5)?,
                max_gpu_allocations_to_move: args.u32_at(6)?,
                use_command_buffer: args.pointer_at(7)? != 0,
            };
            let lists = (handle_list_at(args, 1)?, handle_list_at(args, 2)?);
            Some((info, lists, handle_at(args, 8)?))
        })();
        let Some((mut info, (allocation_ids, pool_ids), id)) = self.decoded(call, decoded) else {
            return Ok(DispatchStatus::Rejected);
        };

        for allocation_id in allocation_ids {
            if let Some(allocation) = self.resolve_allocation(call, allocation_id) {
                info.allocations.push(allocation);
            }
        }
        for pool_id in pool_ids {
            if let Some(pool) = self.resolve_pool(call, pool_id) {
                info.pools.push(pool);
            }
        }

        let result = self
            .live
            .defragmentation_begin(&info)
            .map(LiveObject::DefragmentationContext);
        self.reconciler().create(call.site(), id, result)?;
        Ok(DispatchStatus::Executed)
    }

    fn defragmentation_end(&mut self, call: &RecordedCall<'_>) -> Dispatched {
        let Some(id) = self.decoded(call, handle_at(&call.args, 0)) else {
            return Ok(DispatchStatus::Rejected);
        };
        let Some(LiveObject::DefragmentationContext(context)) =
            self.reconciler().take(call.site(), Category::DefragmentationContext, id)
        else {
            return Ok(DispatchStatus::Executed);
        };

        match self.live.defragmentation_end(context) {
            Ok(report) => {
                self.context.statistics.defragmentation.record(&report, false);
                Ok(DispatchStatus::Executed)
            }
            Err(error) => self.live_outcome(call, Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use crate::options::ReplayOptions;
    use crate::sim::SimulatedAllocator;

    struct Harness {
        live: SimulatedAllocator,
        identity: IdentityMap,
        context: ReplayContext,
    }

    impl Harness {
        fn new(options: ReplayOptions) -> Self {
            Self {
                live: SimulatedAllocator::new(),
                identity: IdentityMap::new(),
                context: ReplayContext::new(options),
            }
        }

        fn run(&mut self, number: usize, text: &str) -> DispatchStatus {
            let line = TraceLine { number, bytes: text.as_bytes() };
            Dispatcher::new(&mut self.live, &mut self.identity, &mut self.context)
                .dispatch(&line)
                .unwrap()
        }

        fn warnings(&self) -> usize {
            self.context.logger.warning_count()
        }
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        let mut h = Harness::new(ReplayOptions::default());
        assert_eq!(h.run(3, "1,0.0"), DispatchStatus::Rejected);
        assert_eq!(h.run(4, "1,0.0,0,Frobnicate"), DispatchStatus::Rejected);
        assert_eq!(h.run(5, "1,0.0,0,DestroyPool"), DispatchStatus::Rejected);
        assert_eq!(h.run(6, "1,0.0,0,DestroyPool,zz"), DispatchStatus::Rejected);
        assert_eq!(h.warnings(), 4);

        // Only lines with a known operation are counted as calls.
        assert_eq!(h.context.statistics.total_calls(), 2);
    }

    #[test]
    fn test_surplus_columns_fail_the_arity_check() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,CreatePool,1,0,65536,0,4,0,0xA");

        assert_eq!(h.run(4, "1,0.2,0,DestroyPool,0xA,0xB"), DispatchStatus::Rejected);
        assert_eq!(h.run(5, "1,0.2,0,CreateAllocator,1"), DispatchStatus::Rejected);
        assert_eq!(h.warnings(), 2);
        let warnings = h.context.logger.filter_by_level(LogLevel::Warn);
        assert!(warnings
            .iter()
            .all(|entry| entry.message.starts_with("Invalid number of parameters")));
        assert_eq!(h.live.pool_count(), 1);
    }

    #[test]
    fn test_create_and_destroy_pool() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,CreatePool,1,0,65536,0,4,0,0xA");
        assert_eq!(h.live.pool_count(), 1);
        assert!(h.identity.contains(Category::Pool, HandleId(0xA)));

        h.run(4, "1,0.2,0,vmaDestroyPool,0xA");
        assert_eq!(h.live.pool_count(), 0);
        assert!(h.identity.is_empty());
        assert_eq!(h.warnings(), 0);
    }

    #[test]
    fn test_unknown_pool_reference_allocates_without_pool() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,AllocateMemory,1024,256,15,0,1,0,0,0,0xDEAD,0xB1,");
        assert_eq!(h.warnings(), 1);
        assert_eq!(h.context.logger.entries()[0].message, "Pool 0xDEAD not found.");
        assert!(h.identity.contains(Category::Allocation, HandleId(0xB1)));
    }

    #[test]
    fn test_buffer_with_user_data_text() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,CreateBuffer,0,4096,130,0,32,1,0,0,0,0,0xC1,name, with comma");
        let allocation = h.identity.resolve_allocation(HandleId(0xC1)).unwrap();
        assert_eq!(
            h.live.allocation_info(allocation).unwrap().user_data.as_deref(),
            Some("name, with comma")
        );
        assert_eq!(h.live.buffer_count(), 1);

        h.run(4, "1,0.2,0,DestroyBuffer,0xC1");
        assert_eq!(h.live.buffer_count(), 0);
        assert_eq!(h.live.allocation_count(), 0);
    }

    #[test]
    fn test_user_data_toggle() {
        let options = ReplayOptions::builder().with_user_data(false).build().unwrap();
        let mut h = Harness::new(options);
        h.run(3, "1,0.1,0,AllocateMemory,64,16,15,32,1,0,0,0,0,0xB1,secret");
        h.run(4, "1,0.2,0,SetAllocationUserData,0xB1,other");
        let allocation = h.identity.resolve_allocation(HandleId(0xB1)).unwrap();
        assert_eq!(h.live.allocation_info(allocation).unwrap().user_data, None);
    }

    #[test]
    fn test_free_memory_pages_mixed() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,AllocateMemoryPages,64,16,15,0,1,0,0,0,0,0x1 0x2 0x3");
        assert_eq!(h.live.allocation_count(), 3);
        h.run(4, "1,0.2,0,FreeMemoryPages,0x1 0x3 0x9 0x0");
        assert_eq!(h.live.allocation_count(), 1);
        assert_eq!(h.warnings(), 1);
        assert!(h.identity.contains(Category::Allocation, HandleId(0x2)));
    }

    #[test]
    fn test_map_failure_is_a_warning() {
        let mut h = Harness::new(ReplayOptions::default());
        // GPU-only memory is not host visible on the discrete profile.
        h.run(3, "1,0.1,0,AllocateMemory,64,16,15,0,1,0,0,0,0,0xB1");
        h.run(4, "1,0.2,0,MapMemory,0xB1");
        assert_eq!(h.warnings(), 1);
        h.run(5, "1,0.3,0,MapMemory,0x0");
        assert_eq!(h.warnings(), 1);
    }

    #[test]
    fn test_defragmentation_context_lifecycle() {
        let mut h = Harness::new(ReplayOptions::default());
        h.run(3, "1,0.1,0,AllocateMemory,256,256,15,0,1,0,0,0,0,0xA1");
        h.run(4, "1,0.1,0,AllocateMemory,256,256,15,0,1,0,0,0,0,0xA2");
        h.run(5, "1,0.1,0,FreeMemory,0xA1");
        h.run(6, "1,0.2,0,DefragmentationBegin,0,0xA2 0xFF,,1048576,100,0,0,0,0xD1");
        assert!(h.identity.contains(Category::DefragmentationContext, HandleId(0xD1)));
        assert_eq!(h.warnings(), 1);

        h.run(7, "1,0.3,0,DefragmentationEnd,0xD1");
        assert!(!h.identity.contains(Category::DefragmentationContext, HandleId(0xD1)));
        assert_eq!(h.context.statistics.defragmentation.passes, 1);
        assert_eq!(h.context.statistics.defragmentation.allocations_moved, 1);
    }
}
