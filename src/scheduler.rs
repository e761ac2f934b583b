//! Scheduled actions fired as the replay cursor advances
//!
//! Snapshots and defragmentations are requested for trace line numbers.
//! After every dispatched line, every action whose line has been reached
//! fires once, in ascending line order; at equal lines the snapshot goes
//! before the defragmentation. An action whose line was filtered out fires
//! after the next dispatched line past it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use crate::context::ReplayContext;
use crate::error::{LiveError, ReplayError};
use crate::identity_map::IdentityMap;
use crate::serialization::{SnapshotWriter, DEFRAGMENT_AFTER_SUFFIX, DEFRAGMENT_BEFORE_SUFFIX};
use crate::traits::LiveAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    DumpStats,
    DumpDetailedStats,
    Defragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub line: usize,
    pub kind: ActionKind,
    pub fired: bool,
}

/// Ascending actions with a cursor at the first unfired one
#[derive(Debug, Clone, Default)]
struct ActionQueue {
    actions: Vec<ScheduledAction>,
    cursor: usize,
}

impl ActionQueue {
    fn from_sorted(entries: impl IntoIterator<Item = (usize, ActionKind)>) -> Self {
        Self {
            actions: entries
                .into_iter()
                .map(|(line, kind)| ScheduledAction { line, kind, fired: false })
                .collect(),
            cursor: 0,
        }
    }

    fn due_line(&self, line: usize) -> Option<usize> {
        self.actions
            .get(self.cursor)
            .map(|action| action.line)
            .filter(|&due| due <= line)
    }

    fn fire(&mut self) -> Option<ScheduledAction> {
        let action = self.actions.get_mut(self.cursor)?;
        action.fired = true;
        self.cursor += 1;
        Some(*action)
    }

    fn pending(&self) -> usize {
        self.actions.len() - self.cursor
    }
}

/// The snapshot and defragmentation queues of one run
#[derive(Debug, Clone, Default)]
pub struct ActionSchedule {
    snapshots: ActionQueue,
    defragmentations: ActionQueue,
}

impl ActionSchedule {
    /// Build the queues. Duplicate lines collapse into one action and a
    /// detailed snapshot request replaces a plain one at the same line.
    pub fn new(
        stats_lines: &[usize],
        detailed_lines: &[usize],
        defragment_lines: &[usize],
    ) -> Self {
        let mut snapshots = BTreeMap::new();
        for &line in stats_lines {
            snapshots.insert(line, ActionKind::DumpStats);
        }
        for &line in detailed_lines {
            snapshots.insert(line, ActionKind::DumpDetailedStats);
        }

        let mut defragmentations: Vec<usize> = defragment_lines.to_vec();
        defragmentations.sort_unstable();
        defragmentations.dedup();

        Self {
            snapshots: ActionQueue::from_sorted(snapshots),
            defragmentations: ActionQueue::from_sorted(
                defragmentations.into_iter().map(|line| (line, ActionKind::Defragment)),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.actions.is_empty() && self.defragmentations.actions.is_empty()
    }

    /// Next action due at or before `line`, marked fired
    pub fn next_due(&mut self, line: usize) -> Option<ScheduledAction> {
        match (self.snapshots.due_line(line), self.defragmentations.due_line(line)) {
            (Some(snapshot), Some(defragment)) if snapshot <= defragment => self.snapshots.fire(),
            (_, Some(_)) => self.defragmentations.fire(),
            (Some(_), None) => self.snapshots.fire(),
            (None, None) => None,
        }
    }

    /// Fire every action due at `line` through `execute`; returns how many fired
    pub fn advance_to<E, F>(&mut self, line: usize, mut execute: F) -> Result<usize, E>
    where
        F: FnMut(ScheduledAction) -> Result<(), E>,
    {
        let mut fired = 0;
        while let Some(action) = self.next_due(line) {
            execute(action)?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Actions that have not fired yet
    pub fn pending(&self) -> usize {
        self.snapshots.pending() + self.defragmentations.pending()
    }

    /// Every scheduled action in queue order, snapshots first
    pub fn actions(&self) -> impl Iterator<Item = &ScheduledAction> {
        self.snapshots.actions.iter().chain(self.defragmentations.actions.iter())
    }
}

/// Executes fired actions against the live allocator
pub struct ActionRunner<'r, A: LiveAllocator + ?Sized> {
    live: &'r mut A,
    identity: &'r IdentityMap,
    context: &'r mut ReplayContext,
    writer: &'r SnapshotWriter,
}

impl<'r, A: LiveAllocator + ?Sized> ActionRunner<'r, A> {
    pub fn new(
        live: &'r mut A,
        identity: &'r IdentityMap,
        context: &'r mut ReplayContext,
        writer: &'r SnapshotWriter,
    ) -> Self {
        Self {
            live,
            identity,
            context,
            writer,
        }
    }

    /// Run `action` after trace line `current_line`; returns the artifacts written
    pub fn execute(
        &mut self,
        action: ScheduledAction,
        current_line: usize,
    ) -> Result<Vec<PathBuf>, ReplayError> {
        let written = match action.kind {
            ActionKind::DumpStats => vec![self.snapshot(action.line, "", false)?],
            ActionKind::DumpDetailedStats => vec![self.snapshot(action.line, "", true)?],
            ActionKind::Defragment => self.defragment(action.line, current_line)?,
        };
        self.context.statistics.actions_executed += 1;
        Ok(written)
    }

    fn snapshot(
        &mut self,
        line: usize,
        suffix: &str,
        detailed: bool,
    ) -> Result<PathBuf, ReplayError> {
        let stats = self.live.stats(detailed);
        let path = self.writer.write(line, suffix, &stats)?;
        self.context.statistics.snapshots_written += 1;
        Ok(path)
    }

    fn defragment(
        &mut self,
        line: usize,
        current_line: usize,
    ) -> Result<Vec<PathBuf>, ReplayError> {
        let before = self.snapshot(line, DEFRAGMENT_BEFORE_SUFFIX, false)?;

        let allocations = self.identity.allocation_handles();
        let flags = self.context.options().defragmentation_flags;
        tracing::info!(
            "Defragmenting {} allocations after line {}",
            allocations.len(),
            current_line
        );
        match self.live.defragment(&allocations, flags) {
            Ok(report) => self.context.statistics.defragmentation.record(&report, true),
            Err(error) => self.live_failure(current_line, "Scheduled defragmentation", error)?,
        }
        if let Err(error) = self.live.wait_idle() {
            self.live_failure(current_line, "Waiting for device idle", error)?;
        }

        let after = self.snapshot(line, DEFRAGMENT_AFTER_SUFFIX, false)?;
        Ok(vec![before, after])
    }

    fn live_failure(
        &mut self,
        line: usize,
        what: &str,
        error: LiveError,
    ) -> Result<(), ReplayError> {
        if error.is_fatal() {
            return Err(ReplayError::LiveApi { line, source: error });
        }
        self.context.logger.warn(line, None, format!("{} failed ({}).", what, error));
        Ok(())
    }
}
