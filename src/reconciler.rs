//! Reconciliation of live outcomes against recorded outcomes
//!
//! Every creating call is classified by whether the recording produced an
//! object (non-zero id) and whether the live call produced one:
//!
//! | recorded | live | action |
//! |---|---|---|
//! | yes | yes | register the live object |
//! | yes | no  | warn, store nothing |
//! | no  | yes | warn, destroy the live object |
//! | no  | no  | note at maximum verbosity |
//!
//! A fatal live error is never reconciled; it is returned as
//! [`ReplayError::LiveApi`] and ends the run.

use crate::error::{LiveError, ReplayError};
use crate::identity_map::{IdentityMap, LiveObject};
use crate::logging::ReplayLogger;
use crate::operation::Operation;
use crate::traits::{LiveAllocator, LiveResult};
use crate::types::{Category, HandleId};

/// Recorded versus live outcome of one creating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub original_had_object: bool,
    pub live_succeeded: bool,
}

impl Outcome {
    pub fn new(original: HandleId, live_succeeded: bool) -> Self {
        Self {
            original_had_object: !original.is_null(),
            live_succeeded,
        }
    }

    pub fn classify(&self) -> Reconciliation {
        match (self.original_had_object, self.live_succeeded) {
            (true, true) => Reconciliation::Registered,
            (true, false) => Reconciliation::LiveFailed,
            (false, true) => Reconciliation::UnexpectedSuccess,
            (false, false) => Reconciliation::BothFailed,
        }
    }
}

/// What the reconciler did with one outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Registered,
    LiveFailed,
    UnexpectedSuccess,
    BothFailed,
}

/// Trace position a reconciliation reports against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub line: usize,
    pub operation: Operation,
}

impl CallSite {
    pub fn new(line: usize, operation: Operation) -> Self {
        Self { line, operation }
    }

    /// Wrap a live error as the fatal run-ending error for this call
    pub fn fatal(&self, source: LiveError) -> ReplayError {
        ReplayError::LiveApi {
            line: self.line,
            source,
        }
    }
}

/// Applies the reconciliation table, borrowing the replay state it mutates
pub struct Reconciler<'r, A: LiveAllocator + ?Sized> {
    live: &'r mut A,
    identity: &'r mut IdentityMap,
    logger: &'r mut ReplayLogger,
}

impl<'r, A: LiveAllocator + ?Sized> Reconciler<'r, A> {
    pub fn new(
        live: &'r mut A,
        identity: &'r mut IdentityMap,
        logger: &'r mut ReplayLogger,
    ) -> Self {
        Self {
            live,
            identity,
            logger,
        }
    }

    /// Reconcile a single creating call
    pub fn create(
        &mut self,
        site: CallSite,
        id: HandleId,
        result: LiveResult<LiveObject>,
    ) -> Result<Reconciliation, ReplayError> {
        let (object, error) = match result {
            Ok(object) => (Some(object), None),
            Err(error) if error.is_fatal() => return Err(site.fatal(error)),
            Err(error) => (None, Some(error)),
        };
        let reconciliation = Outcome::new(id, object.is_some()).classify();

        match (reconciliation, object) {
            (Reconciliation::Registered, Some(object)) => self.register(site, id, object)?,
            (Reconciliation::UnexpectedSuccess, Some(object)) => {
                self.logger.warn(
                    site.line,
                    Some(site.operation),
                    format!("{} succeeded, originally failed.", site.operation),
                );
                self.destroy(site, object)?;
            }
            (Reconciliation::LiveFailed, _) => {
                let reason = error.map(|e| e.to_string()).unwrap_or_default();
                self.logger.warn(
                    site.line,
                    Some(site.operation),
                    format!("{} failed ({}), while originally succeeded.", site.operation, reason),
                );
            }
            _ => self.logger.note(
                site.line,
                Some(site.operation),
                format!("{} failed, as it originally did.", site.operation),
            ),
        }
        Ok(reconciliation)
    }

    /// Reconcile a batch call element by element.
    ///
    /// Element `i` pairs `ids[i]` with live element `i`; missing live
    /// elements count as failures and surplus live elements are destroyed.
    pub fn batch(
        &mut self,
        site: CallSite,
        ids: &[HandleId],
        result: LiveResult<Vec<Option<LiveObject>>>,
    ) -> Result<Vec<Reconciliation>, ReplayError> {
        let live_objects = match result {
            Ok(objects) => objects,
            Err(error) if error.is_fatal() => return Err(site.fatal(error)),
            Err(error) => {
                return ids
                    .iter()
                    .map(|&id| self.create(site, id, Err(error.clone())))
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        let mut live_iter = live_objects.into_iter();
        for &id in ids {
            let element = match live_iter.next().flatten() {
                Some(object) => Ok(object),
                None => Err(LiveError::OutOfDeviceMemory),
            };
            outcomes.push(self.create(site, id, element)?);
        }
        for surplus in live_iter.flatten() {
            self.logger.warn(
                site.line,
                Some(site.operation),
                format!("{} returned more objects than were recorded.", site.operation),
            );
            self.destroy(site, surplus)?;
        }
        Ok(outcomes)
    }

    /// Remove `id` from `category` for a destroying call.
    ///
    /// A null id is silently ignored; an unknown id is a warning.
    pub fn take(&mut self, site: CallSite, category: Category, id: HandleId) -> Option<LiveObject> {
        if id.is_null() {
            return None;
        }
        let object = self.identity.remove(category, id);
        if object.is_none() {
            self.logger.warn(
                site.line,
                Some(site.operation),
                format!("{} {} not found.", category, id),
            );
        }
        object
    }

    /// Remove and destroy the object a destroying call names
    pub fn destroy_recorded(
        &mut self,
        site: CallSite,
        category: Category,
        id: HandleId,
    ) -> Result<bool, ReplayError> {
        match self.take(site, category, id) {
            Some(object) => {
                self.destroy(site, object)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn register(
        &mut self,
        site: CallSite,
        id: HandleId,
        object: LiveObject,
    ) -> Result<(), ReplayError> {
        if let Some(displaced) = self.identity.register(id, object) {
            self.logger.warn(
                site.line,
                Some(site.operation),
                format!("{} {} already exists, replacing it.", object.category(), id),
            );
            self.destroy(site, displaced)?;
        }
        Ok(())
    }

    /// Destroy a live object, warning on a non-fatal failure
    pub fn destroy(&mut self, site: CallSite, object: LiveObject) -> Result<(), ReplayError> {
        match object.destroy(self.live) {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(site.fatal(error)),
            Err(error) => {
                self.logger.warn(
                    site.line,
                    Some(site.operation),
                    format!("Destroying {} failed ({}).", object.category(), error),
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::PoolHandle;
    use crate::sim::SimulatedAllocator;
    use crate::types::Verbosity;

    fn site(operation: Operation) -> CallSite {
        CallSite::new(10, operation)
    }

    #[test]
    fn test_classification_table() {
        let id = HandleId(0x10);
        assert_eq!(Outcome::new(id, true).classify(), Reconciliation::Registered);
        assert_eq!(Outcome::new(id, false).classify(), Reconciliation::LiveFailed);
        assert_eq!(
            Outcome::new(HandleId::NULL, true).classify(),
            Reconciliation::UnexpectedSuccess
        );
        assert_eq!(Outcome::new(HandleId::NULL, false).classify(), Reconciliation::BothFailed);
    }

    #[test]
    fn test_unexpected_success_destroys_live_object() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::new(Verbosity::Default, 16);

        let allocation = live
            .create_lost_allocation()
            .expect("lost allocation is always available");
        assert_eq!(live.allocation_count(), 1);

        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let created = Ok(LiveObject::allocation(allocation));
        let outcome = reconciler
            .create(site(Operation::CreateLostAllocation), HandleId::NULL, created)
            .unwrap();

        assert_eq!(outcome, Reconciliation::UnexpectedSuccess);
        assert!(identity.is_empty());
        assert_eq!(live.allocation_count(), 0);
        assert_eq!(logger.warning_count(), 1);
    }

    #[test]
    fn test_live_failure_stores_nothing() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::new(Verbosity::Default, 16);

        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let outcome = reconciler
            .create(site(Operation::CreatePool), HandleId(0x1), Err(LiveError::OutOfDeviceMemory))
            .unwrap();

        assert_eq!(outcome, Reconciliation::LiveFailed);
        assert!(identity.is_empty());
        let warnings = logger.entries();
        assert!(warnings[0]
            .message
            .contains("failed (out of device memory), while originally succeeded"));
    }

    #[test]
    fn test_fatal_error_propagates() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::default();

        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let fatal = LiveError::DeviceLost { reason: "gone".to_string() };
        let result = reconciler.create(site(Operation::CreatePool), HandleId(0x1), Err(fatal));

        assert!(matches!(result, Err(ReplayError::LiveApi { line: 10, .. })));
        assert_eq!(logger.warning_count(), 0);
    }

    #[test]
    fn test_batch_pairs_elements() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::default();

        let a = live.create_lost_allocation().unwrap();
        let b = live.create_lost_allocation().unwrap();
        let ids = [HandleId(1), HandleId::NULL, HandleId(3)];
        let live_objects = vec![
            Some(LiveObject::allocation(a)),
            Some(LiveObject::allocation(b)),
            None,
        ];

        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let outcomes = reconciler
            .batch(site(Operation::AllocateMemoryPages), &ids, Ok(live_objects))
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                Reconciliation::Registered,
                Reconciliation::UnexpectedSuccess,
                Reconciliation::LiveFailed
            ]
        );
        assert_eq!(identity.resolve_allocation(HandleId(1)), Some(a));
        assert_eq!(identity.len(Category::Allocation), 1);
        assert_eq!(live.allocation_count(), 1);
        assert_eq!(logger.warning_count(), 2);
    }

    #[test]
    fn test_collision_destroys_displaced_object() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::default();

        let first = live.create_lost_allocation().unwrap();
        let second = live.create_lost_allocation().unwrap();
        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let id = HandleId(0x44);
        let lost = site(Operation::CreateLostAllocation);
        reconciler.create(lost, id, Ok(LiveObject::allocation(first))).unwrap();
        reconciler.create(lost, id, Ok(LiveObject::allocation(second))).unwrap();

        assert_eq!(identity.resolve_allocation(id), Some(second));
        assert_eq!(live.allocation_count(), 1);
        assert_eq!(logger.warning_count(), 1);
    }

    #[test]
    fn test_destroy_unknown_and_null_ids() {
        let mut live = SimulatedAllocator::new();
        let mut identity = IdentityMap::new();
        let mut logger = ReplayLogger::default();
        identity.register(HandleId(2), LiveObject::Pool(PoolHandle(99)));

        let mut reconciler = Reconciler::new(&mut live, &mut identity, &mut logger);
        let s = site(Operation::FreeMemory);
        assert!(!reconciler.destroy_recorded(s, Category::Allocation, HandleId::NULL).unwrap());
        assert!(!reconciler.destroy_recorded(s, Category::Allocation, HandleId(2)).unwrap());
        assert!(reconciler.take(s, Category::Allocation, HandleId(7)).is_none());

        assert_eq!(logger.warning_count(), 2);
        assert!(logger.entries()[0].message.contains("Allocation 0x2 not found."));
        assert!(identity.contains(Category::Pool, HandleId(2)));
    }
}
