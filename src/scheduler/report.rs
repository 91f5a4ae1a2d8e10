//! Run report emitted at the end of every apply.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::model::{ExternalId, ResourceId, ResourceKind};
use crate::planner::PlanAction;

/// Per-node execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for upstream nodes.
    Pending,
    /// All upstream nodes settled; waiting for a worker.
    Ready,
    /// Provider call in flight.
    Running,
    /// The action was confirmed.
    Succeeded,
    /// Nothing to do; existing outputs are kept.
    Unchanged,
    /// The action failed.
    Failed,
    /// Not attempted because an upstream node failed.
    Blocked,
    /// Not started because the run was cancelled.
    Cancelled,
}

impl NodeStatus {
    /// Returns true once the node will not change again in this run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Unchanged | Self::Failed | Self::Blocked | Self::Cancelled
        )
    }

    /// Returns true if dependents may start.
    #[must_use]
    pub const fn unblocks_dependents(self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every node succeeded or was unchanged.
    Succeeded,
    /// Some nodes failed or were blocked; successes are kept.
    PartialFailure,
    /// The run was cancelled before every node settled.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial failure",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Final state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned action.
    pub action: PlanAction,
    /// Final status.
    pub status: NodeStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// External id after the run, if the resource exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    /// Error detail for failed, blocked or cancelled nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured result of an apply.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Hash of the desired graph that was applied.
    pub graph_hash: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Overall outcome.
    pub status: RunStatus,
    /// Every node of the plan, in execution order.
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// Derives the overall status from node outcomes.
    #[must_use]
    pub fn status_from(nodes: &[NodeReport], cancelled: bool) -> RunStatus {
        if cancelled && nodes.iter().any(|n| n.status == NodeStatus::Cancelled) {
            RunStatus::Cancelled
        } else if nodes.iter().all(|n| n.status.unblocks_dependents()) {
            RunStatus::Succeeded
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Returns true if every node succeeded or was unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Gets a node by id.
    #[must_use]
    pub fn node(&self, id: &ResourceId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Number of nodes with the given status.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Run duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} {}: {} succeeded, {} unchanged, {} failed, {} blocked, {} cancelled ({} ms)",
            self.run_id,
            self.status,
            self.count(NodeStatus::Succeeded),
            self.count(NodeStatus::Unchanged),
            self.count(NodeStatus::Failed),
            self.count(NodeStatus::Blocked),
            self.count(NodeStatus::Cancelled),
            self.duration_ms()
        )?;
        for node in &self.nodes {
            write!(f, "  {} {}.{} [{}]", node.status, node.kind, node.id, node.action)?;
            if let Some(err) = &node.error {
                write!(f, ": {err}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, status: NodeStatus) -> NodeReport {
        NodeReport {
            id: ResourceId::new(id),
            kind: ResourceKind::new("bucket"),
            action: PlanAction::Create,
            status,
            attempts: 1,
            external_id: None,
            error: None,
        }
    }

    #[test]
    fn test_status_derivation() {
        let ok = [node("a", NodeStatus::Succeeded), node("b", NodeStatus::Unchanged)];
        assert_eq!(RunReport::status_from(&ok, false), RunStatus::Succeeded);

        let partial = [node("a", NodeStatus::Failed), node("b", NodeStatus::Blocked)];
        assert_eq!(RunReport::status_from(&partial, false), RunStatus::PartialFailure);

        let cancelled = [node("a", NodeStatus::Succeeded), node("b", NodeStatus::Cancelled)];
        assert_eq!(RunReport::status_from(&cancelled, true), RunStatus::Cancelled);

        // A cancel that arrives after every node settled changes nothing.
        assert_eq!(RunReport::status_from(&ok, true), RunStatus::Succeeded);
    }

    #[test]
    fn test_report_serializes_every_node() {
        let report = RunReport {
            run_id: Uuid::new_v4(),
            graph_hash: String::from("abc"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: RunStatus::PartialFailure,
            nodes: vec![node("a", NodeStatus::Failed), node("b", NodeStatus::Blocked)],
        };

        let json = serde_json::to_value(&report).expect("serializable");
        assert_eq!(json["status"], "partial_failure");
        assert_eq!(json["nodes"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["nodes"][1]["status"], "blocked");
    }
}
