//! Data models shared by the store, the sync engine and the query surface.

pub mod activity;
pub mod audit;
pub mod project;
pub mod task;

pub use activity::{ActivityEvent, ActivityKind};
pub use audit::{AuditEvent, AuditEventType, AuditReport, AuditSummary};
pub use project::{MonitoredProject, ProjectToggle};
pub use task::{
    CycleMetrics, LabelAction, LabelChange, Task, TaskRecord, TaskWithMetrics, TimeStats,
};
