//! # meshsim-common
//!
//! Common types for the MeshSim simulation framework.
//!
//! This crate provides the core simulation primitives shared by every
//! other crate in the workspace:
//! - Time representation ([`SimTime`])
//! - Node identification ([`NodeId`])
//! - Simulation errors ([`SimError`])
//! - The shared task scheduler ([`TaskScheduler`])

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// An argument failed validation (zero node id, out-of-range quality, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A node id was not found in the manager.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node with the same id already exists.
    #[error("Node already exists: {0}")]
    DuplicateNode(NodeId),

    /// Starting a node that is already running.
    #[error("Node {0} is already running")]
    AlreadyRunning(NodeId),

    /// The manager's node limit was reached.
    #[error("Maximum node count reached: {0}")]
    NodeLimit(usize),

    /// A firmware name is not present in the registry.
    #[error("Unknown firmware: {0}")]
    UnknownFirmware(String),

    /// A scheduled event failed during execution.
    #[error("Event execution failed: {0}")]
    EventFailed(String),
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in milliseconds since simulation start.
///
/// The engine has no time source of its own; the outer loop computes the
/// current `SimTime` and passes it into every component operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms)
    }

    /// Create from whole seconds.
    pub fn from_secs(s: u64) -> Self {
        SimTime(s * 1000)
    }

    /// Create from seconds (float).
    pub fn from_secs_f64(s: f64) -> Self {
        SimTime((s * 1000.0) as u64)
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get as whole seconds (truncating).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Add a duration, returning `None` on overflow.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Elapsed time since `earlier`, saturating at zero.
    pub fn since(&self, earlier: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ============================================================================
// Node Identification
// ============================================================================

/// Unique identifier for a virtual node.
///
/// Zero is reserved as "unassigned/broadcast" and is never a valid node id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The reserved "unassigned/broadcast" id.
    pub const ZERO: NodeId = NodeId(0);

    /// Create a new node id.
    pub fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Get the raw id value.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Check whether this is the reserved zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Task Scheduler
// ============================================================================

/// Identifier for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct ScheduledTask {
    id: TaskId,
    interval: SimTime,
    next_due: SimTime,
    /// Remaining executions, `None` for unbounded.
    remaining: Option<u32>,
    callback: Box<dyn FnMut(SimTime)>,
}

/// Cooperative task scheduler shared by all nodes of a manager.
///
/// Tasks are plain closures invoked from the simulation thread whenever
/// [`TaskScheduler::run_due`] observes that their next due time has been
/// reached. There is no threading and no blocking: a task that is due
/// several intervals in the past fires once and is rescheduled from the
/// current time.
pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
    next_id: u64,
}

impl TaskScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        TaskScheduler {
            tasks: Vec::new(),
            next_id: 0,
        }
    }

    /// Schedule a repeating task. The first execution happens at `first_due`.
    pub fn add_periodic<F>(&mut self, first_due: SimTime, interval: SimTime, callback: F) -> TaskId
    where
        F: FnMut(SimTime) + 'static,
    {
        self.add_task(first_due, interval, None, callback)
    }

    /// Schedule a task that runs at most `iterations` times.
    pub fn add_limited<F>(
        &mut self,
        first_due: SimTime,
        interval: SimTime,
        iterations: u32,
        callback: F,
    ) -> TaskId
    where
        F: FnMut(SimTime) + 'static,
    {
        self.add_task(first_due, interval, Some(iterations), callback)
    }

    fn add_task<F>(
        &mut self,
        first_due: SimTime,
        interval: SimTime,
        remaining: Option<u32>,
        callback: F,
    ) -> TaskId
    where
        F: FnMut(SimTime) + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.push(ScheduledTask {
            id,
            interval,
            next_due: first_due,
            remaining,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a task. Returns `true` if the task existed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        self.tasks.len() != before
    }

    /// Execute every task whose due time has been reached.
    ///
    /// Returns the number of task executions performed.
    pub fn run_due(&mut self, now: SimTime) -> usize {
        let mut executed = 0;
        for task in &mut self.tasks {
            if task.next_due <= now {
                (task.callback)(now);
                executed += 1;
                task.next_due = now + task.interval;
                if let Some(remaining) = &mut task.remaining {
                    *remaining = remaining.saturating_sub(1);
                }
            }
        }
        self.tasks
            .retain(|t| t.remaining.map_or(true, |r| r > 0));
        executed
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs_f64(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_secs(), 1);
        assert!((time.as_secs_f64() - 1.5).abs() < 0.0001);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t1 - t2).as_millis(), 50);
        // Subtraction saturates rather than wrapping.
        assert_eq!((t2 - t1).as_millis(), 0);
    }

    #[test]
    fn test_node_id_zero_reserved() {
        assert!(NodeId::ZERO.is_zero());
        assert!(!NodeId::new(1001).is_zero());
    }

    #[test]
    fn test_scheduler_runs_due_tasks() {
        let counter = Rc::new(Cell::new(0u32));
        let c = counter.clone();

        let mut scheduler = TaskScheduler::new();
        scheduler.add_periodic(SimTime::from_millis(100), SimTime::from_millis(100), move |_| {
            c.set(c.get() + 1);
        });

        assert_eq!(scheduler.run_due(SimTime::from_millis(50)), 0);
        assert_eq!(scheduler.run_due(SimTime::from_millis(100)), 1);
        assert_eq!(scheduler.run_due(SimTime::from_millis(150)), 0);
        assert_eq!(scheduler.run_due(SimTime::from_millis(200)), 1);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_scheduler_limited_task_expires() {
        let mut scheduler = TaskScheduler::new();
        scheduler.add_limited(SimTime::ZERO, SimTime::from_millis(10), 2, |_| {});

        assert_eq!(scheduler.task_count(), 1);
        scheduler.run_due(SimTime::ZERO);
        assert_eq!(scheduler.task_count(), 1);
        scheduler.run_due(SimTime::from_millis(10));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_scheduler_cancel() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.add_periodic(SimTime::ZERO, SimTime::from_millis(10), |_| {});
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.task_count(), 0);
    }
}
