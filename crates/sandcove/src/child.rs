//! Bounded table of supervised children.
//!
//! Slot lifecycle: Free -> Spawned -> Exited -> Free. A slot is only handed
//! out again once its exit has been processed and its control, stdout and
//! stderr descriptors are all closed, so late output from a previous
//! occupant can never be attributed to a new child.
//!
//! Records are reached through [`ChildTable::visit`] with a [`Filter`]; the
//! event loop never indexes the arena directly.
//!
//! The pid index always points at the newest holder of a pid. If the kernel
//! hands out a pid again while the previous holder's record is Exited but
//! still draining output, that record leaves the index and stays reachable
//! by slot until its descriptors close.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::BytesMut;

use crate::bridge::codec::ChildFrames;
use crate::error::{Error, Result};

/// How a child's stdout is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Control channel still open: stdout carries framed protocol messages.
    Supervisor,
    /// Control channel closed (the child exec'd): stdout is raw bytes.
    Executed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

/// Which of a child's descriptors an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Control,
    Stdout,
    Stderr,
}

/// Parent-side ends of a freshly forked child's pipes.
#[derive(Debug)]
pub struct ChildStdio {
    pub pid: i32,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    pub control: OwnedFd,
}

#[derive(Debug)]
pub struct ChildRecord {
    /// 0 when the slot is free.
    pub pid: i32,
    /// Position in the table. Stable until the record is reclaimed.
    pub slot: usize,
    pub control: Option<File>,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    pub mode: Mode,
    pub exit: Option<ExitState>,
    /// Bytes read from a supervisor-mode child's stdout, not yet a
    /// complete frame.
    pub frames: BytesMut,
    pub framer: ChildFrames,
}

impl Default for ChildRecord {
    fn default() -> Self {
        Self {
            pid: 0,
            slot: 0,
            control: None,
            stdin: None,
            stdout: None,
            stderr: None,
            mode: Mode::Supervisor,
            exit: None,
            frames: BytesMut::new(),
            framer: ChildFrames::new(),
        }
    }
}

impl ChildRecord {
    fn spawned(stdio: ChildStdio, slot: usize) -> Self {
        Self {
            pid: stdio.pid,
            slot,
            control: Some(File::from(stdio.control)),
            stdin: Some(File::from(stdio.stdin)),
            stdout: Some(File::from(stdio.stdout)),
            stderr: Some(File::from(stdio.stderr)),
            mode: Mode::Supervisor,
            exit: None,
            frames: BytesMut::new(),
            framer: ChildFrames::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.pid == 0
    }

    /// Exit processed and every output descriptor closed.
    pub fn is_reclaimable(&self) -> bool {
        self.exit.is_some()
            && self.control.is_none()
            && self.stdout.is_none()
            && self.stderr.is_none()
    }

    pub fn stream(&self, stream: Stream) -> Option<&File> {
        match stream {
            Stream::Control => self.control.as_ref(),
            Stream::Stdout => self.stdout.as_ref(),
            Stream::Stderr => self.stderr.as_ref(),
        }
    }

    pub fn raw_fd(&self, stream: Stream) -> Option<RawFd> {
        self.stream(stream).map(AsRawFd::as_raw_fd)
    }

    /// Drops the descriptor, closing it.
    pub fn close(&mut self, stream: Stream) {
        match stream {
            Stream::Control => self.control = None,
            Stream::Stdout => self.stdout = None,
            Stream::Stderr => self.stderr = None,
        }
    }

    /// Open output descriptors, in the order they should be serviced.
    pub fn open_streams(&self) -> impl Iterator<Item = (RawFd, Stream)> + '_ {
        [Stream::Control, Stream::Stdout, Stream::Stderr]
            .into_iter()
            .filter_map(|stream| self.raw_fd(stream).map(|fd| (fd, stream)))
    }
}

/// Selects which records [`ChildTable::visit`] walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// The live record for one pid, if any.
    Pid(i32),
    /// Whatever occupies one slot.
    Slot(usize),
    /// Every Spawned or Exited record, in slot order.
    Active,
}

pub struct ChildTable {
    records: Vec<ChildRecord>,
    index: HashMap<i32, usize>,
    /// Slots that are not Free. Can exceed `index.len()` while a reused
    /// pid's previous record drains.
    occupied: usize,
    capacity: usize,
}

impl ChildTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            occupied: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Drops every record, closing all of their descriptors.
    pub fn reset(&mut self, capacity: usize) -> Result<()> {
        tracing::debug!(
            old_capacity = self.capacity,
            capacity,
            active = self.occupied,
            "Resetting child table"
        );
        self.records = Vec::new();
        self.index = HashMap::new();
        self.occupied = 0;
        self.capacity = capacity;
        self.index
            .try_reserve(capacity.min(64))
            .map_err(|e| Error::Config(format!("child index: {e}")))?;
        Ok(())
    }

    pub fn has_free_slot(&self) -> bool {
        self.occupied < self.capacity
    }

    /// Registers a spawned child in the first free slot. Hands the
    /// descriptors back if the table is full or `pid` belongs to a child
    /// that has not exited.
    pub fn insert(&mut self, stdio: ChildStdio) -> std::result::Result<(), ChildStdio> {
        if !self.has_free_slot() || stdio.pid <= 0 {
            return Err(stdio);
        }
        let pid = stdio.pid;
        let previous = self.index.get(&pid).copied();
        if previous.is_some_and(|slot| self.records[slot].exit.is_none()) {
            return Err(stdio);
        }

        let slot = match self.records.iter().position(ChildRecord::is_free) {
            Some(slot) => {
                self.records[slot] = ChildRecord::spawned(stdio, slot);
                slot
            }
            None => {
                if self.records.try_reserve(1).is_err() {
                    return Err(stdio);
                }
                let slot = self.records.len();
                self.records.push(ChildRecord::spawned(stdio, slot));
                slot
            }
        };
        if let Some(previous) = previous {
            tracing::debug!(pid, previous, slot, "Pid reused before its old record drained");
        }
        self.index.insert(pid, slot);
        self.occupied += 1;

        tracing::trace!(pid, slot, "Registered child");
        Ok(())
    }

    /// Runs `visitor` on every record matching `filter`. Stops at the first
    /// error. Returns how many records were visited.
    pub fn visit<E>(
        &mut self,
        filter: Filter,
        mut visitor: impl FnMut(&mut ChildRecord) -> std::result::Result<(), E>,
    ) -> std::result::Result<usize, E> {
        match filter {
            Filter::Pid(pid) => match self.index.get(&pid) {
                Some(&slot) => {
                    visitor(&mut self.records[slot])?;
                    Ok(1)
                }
                None => Ok(0),
            },
            Filter::Slot(slot) => match self.records.get_mut(slot) {
                Some(record) if !record.is_free() => {
                    visitor(record)?;
                    Ok(1)
                }
                _ => Ok(0),
            },
            Filter::Active => {
                let mut visited = 0;
                for record in self.records.iter_mut().filter(|r| !r.is_free()) {
                    visitor(record)?;
                    visited += 1;
                }
                Ok(visited)
            }
        }
    }

    /// Returns fully processed records to Free.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        for (slot, record) in self.records.iter_mut().enumerate() {
            if !record.is_free() && record.is_reclaimable() {
                tracing::trace!(pid = record.pid, slot, "Reclaimed child slot");
                // a newer child may hold the pid by now
                if self.index.get(&record.pid) == Some(&slot) {
                    self.index.remove(&record.pid);
                }
                *record = ChildRecord::default();
                self.occupied -= 1;
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    fn stdio(pid: i32) -> ChildStdio {
        let (stdin, _) = pipe().unwrap();
        let (stdout, _) = pipe().unwrap();
        let (stderr, _) = pipe().unwrap();
        let (control, _) = pipe().unwrap();
        ChildStdio {
            pid,
            stdin,
            stdout,
            stderr,
            control,
        }
    }

    fn pids(table: &mut ChildTable) -> Vec<i32> {
        let mut pids = Vec::new();
        table
            .visit(Filter::Active, |r| {
                pids.push(r.pid);
                Ok::<_, ()>(())
            })
            .unwrap();
        pids
    }

    fn finish(table: &mut ChildTable, pid: i32) {
        table
            .visit(Filter::Pid(pid), |r| {
                r.exit = Some(ExitState::Exited(0));
                r.stdin = None;
                r.close(Stream::Control);
                r.close(Stream::Stdout);
                r.close(Stream::Stderr);
                Ok::<_, ()>(())
            })
            .unwrap();
    }

    #[test]
    fn insert_until_full() {
        let mut table = ChildTable::new(2);
        table.insert(stdio(10)).unwrap();
        table.insert(stdio(11)).unwrap();
        assert!(!table.has_free_slot());

        let rejected = table.insert(stdio(12)).unwrap_err();
        assert_eq!(rejected.pid, 12);
        assert_eq!(pids(&mut table), vec![10, 11]);
    }

    #[test]
    fn rejects_invalid_and_duplicate_pids() {
        let mut table = ChildTable::new(4);
        assert!(table.insert(stdio(0)).is_err());
        assert!(table.insert(stdio(-3)).is_err());
        table.insert(stdio(5)).unwrap();
        assert!(table.insert(stdio(5)).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn visit_by_pid() {
        let mut table = ChildTable::new(4);
        table.insert(stdio(10)).unwrap();
        table.insert(stdio(11)).unwrap();

        let mut seen = Vec::new();
        let n = table
            .visit(Filter::Pid(11), |r| {
                seen.push(r.pid);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!((n, seen), (1, vec![11]));

        let n = table.visit(Filter::Pid(99), |_| Err("unreachable")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn visitor_error_stops_the_walk() {
        let mut table = ChildTable::new(4);
        table.insert(stdio(1)).unwrap();
        table.insert(stdio(2)).unwrap();
        let mut calls = 0;
        let err = table.visit(Filter::Active, |_| {
            calls += 1;
            Err("stop")
        });
        assert_eq!(err, Err("stop"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn exited_slot_stays_taken_until_streams_close() {
        let mut table = ChildTable::new(1);
        table.insert(stdio(10)).unwrap();

        table
            .visit(Filter::Pid(10), |r| {
                r.exit = Some(ExitState::Signaled(9));
                r.stdin = None;
                r.close(Stream::Control);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(table.reclaim(), 0);
        assert!(!table.has_free_slot());

        finish(&mut table, 10);
        assert_eq!(table.reclaim(), 1);
        assert!(table.has_free_slot());
        assert!(pids(&mut table).is_empty());
    }

    #[test]
    fn closed_streams_without_exit_are_not_reclaimed() {
        let mut table = ChildTable::new(1);
        table.insert(stdio(10)).unwrap();
        table
            .visit(Filter::Pid(10), |r| {
                r.close(Stream::Control);
                r.close(Stream::Stdout);
                r.close(Stream::Stderr);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(table.reclaim(), 0);
    }

    #[test]
    fn freed_slot_is_reused_in_order() {
        let mut table = ChildTable::new(3);
        for pid in [1, 2, 3] {
            table.insert(stdio(pid)).unwrap();
        }
        finish(&mut table, 2);
        table.reclaim();
        table.insert(stdio(4)).unwrap();
        assert_eq!(pids(&mut table), vec![1, 4, 3]);

        // index follows the slot
        let mut found = 0;
        table
            .visit(Filter::Pid(4), |r| {
                found = r.pid;
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(found, 4);
    }

    #[test]
    fn reset_drops_everything() {
        let mut table = ChildTable::new(2);
        table.insert(stdio(1)).unwrap();
        table.reset(5).unwrap();
        assert_eq!(table.capacity(), 5);
        assert!(table.is_empty());
        assert!(pids(&mut table).is_empty());
        assert_eq!(table.visit(Filter::Pid(1), |_| Err(())), Ok(0));
    }

    #[test]
    fn recycled_pid_displaces_a_draining_record() {
        let mut table = ChildTable::new(4);
        table.insert(stdio(500)).unwrap();
        table
            .visit(Filter::Pid(500), |r| {
                r.exit = Some(ExitState::Exited(0));
                r.stdin = None;
                r.close(Stream::Control);
                r.close(Stream::Stderr);
                Ok::<_, ()>(())
            })
            .unwrap();

        table.insert(stdio(500)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(pids(&mut table), vec![500, 500]);

        // the pid now names the live child
        let mut slot = None;
        table
            .visit(Filter::Pid(500), |r| {
                assert!(r.exit.is_none());
                slot = Some(r.slot);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(slot, Some(1));

        // the old record is still reachable by slot until stdout closes
        assert_eq!(table.reclaim(), 0);
        table
            .visit(Filter::Slot(0), |r| {
                assert!(r.stdout.is_some());
                r.close(Stream::Stdout);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(table.reclaim(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.visit(Filter::Slot(0), |_| Err(())), Ok(0));
        assert_eq!(
            table.visit(Filter::Pid(500), |r| if r.slot == 1 { Ok(()) } else { Err(()) }),
            Ok(1)
        );

        // a live pid is still refused
        assert!(table.insert(stdio(500)).is_err());
    }

    #[test]
    fn displaced_record_keeps_its_slot_counted() {
        let mut table = ChildTable::new(2);
        table.insert(stdio(8)).unwrap();
        table
            .visit(Filter::Pid(8), |r| {
                r.exit = Some(ExitState::Signaled(9));
                Ok::<_, ()>(())
            })
            .unwrap();
        table.insert(stdio(8)).unwrap();
        assert!(!table.has_free_slot());
        assert!(table.insert(stdio(9)).is_err());
    }

    #[test]
    fn open_streams_in_service_order() {
        let mut table = ChildTable::new(1);
        table.insert(stdio(7)).unwrap();
        table
            .visit(Filter::Pid(7), |r| {
                r.close(Stream::Stdout);
                let streams: Vec<_> = r.open_streams().map(|(_, s)| s).collect();
                assert_eq!(streams, vec![Stream::Control, Stream::Stderr]);
                Ok::<_, ()>(())
            })
            .unwrap();
    }
}
