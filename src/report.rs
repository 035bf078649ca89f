//! 执行状态模型与汇总报告
//! 报告是收集循环结束后对最终记录集的一次性纯函数快照

use serde::Serialize;

/// 远程命令退出状态
///
/// `Unknown` 表示进程在未上报退出码的情况下结束（被信号杀死、连接中断等），
/// 与 `Code(0)` 严格区分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(u32),
    Unknown,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit {}", code),
            ExitStatus::Unknown => write!(f, "exit status unknown"),
        }
    }
}

/// 单台主机的执行状态机
///
/// Pending → Dialing → Running → {Completed | Failed | TimedOut}，
/// 进入终态后不再变化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NodeState {
    Pending,
    Dialing,
    Running,
    Completed { status: ExitStatus },
    Failed { reason: String },
    TimedOut,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed { .. } | NodeState::Failed { .. } | NodeState::TimedOut
        )
    }
}

/// 单台主机的执行记录
#[derive(Debug, Clone, Serialize)]
pub struct NodeExecution {
    pub address: String,
    #[serde(flatten)]
    pub state: NodeState,
}

impl NodeExecution {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: NodeState::Pending,
        }
    }
}

/// 成功完成的主机条目
#[derive(Debug, Clone, Serialize)]
pub struct CompletedNode {
    pub address: String,
    pub status: ExitStatus,
}

/// 失败的主机条目
#[derive(Debug, Clone, Serialize)]
pub struct FailedNode {
    pub address: String,
    pub reason: String,
}

/// 汇总报告
///
/// `unfinished` 仅在超时路径非空，且保持输入顺序。
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub completed: Vec<CompletedNode>,
    pub failed: Vec<FailedNode>,
    pub unfinished: Vec<String>,
}

impl RunReport {
    /// 从最终记录集推导报告；记录顺序即输入顺序
    pub fn from_records(records: &[NodeExecution]) -> Self {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut unfinished = Vec::new();

        for record in records {
            match &record.state {
                NodeState::Completed { status } => completed.push(CompletedNode {
                    address: record.address.clone(),
                    status: *status,
                }),
                NodeState::Failed { reason } => failed.push(FailedNode {
                    address: record.address.clone(),
                    reason: reason.clone(),
                }),
                NodeState::Pending | NodeState::Dialing | NodeState::Running | NodeState::TimedOut => {
                    unfinished.push(record.address.clone())
                }
            }
        }

        Self {
            total: records.len(),
            completed,
            failed,
            unfinished,
        }
    }

    /// 全部主机以退出码 0 完成
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
            && self.unfinished.is_empty()
            && self.completed.iter().all(|n| n.status.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, state: NodeState) -> NodeExecution {
        NodeExecution {
            address: address.to_string(),
            state,
        }
    }

    #[test]
    fn test_unknown_is_not_success() {
        assert!(!ExitStatus::Unknown.is_success());
        assert!(ExitStatus::Code(0).is_success());
        assert!(!ExitStatus::Code(7).is_success());
        assert_ne!(ExitStatus::Unknown, ExitStatus::Code(0));
    }

    #[test]
    fn test_report_partitions_records() {
        let records = vec![
            record("a", NodeState::Completed { status: ExitStatus::Code(0) }),
            record("b", NodeState::Failed { reason: "dial".to_string() }),
            record("c", NodeState::Running),
            record("d", NodeState::TimedOut),
        ];
        let report = RunReport::from_records(&records);
        assert_eq!(report.total, 4);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.unfinished, vec!["c", "d"]);
        assert!(!report.all_succeeded());
    }

    #[test]
    fn test_unfinished_preserves_input_order() {
        let records = vec![
            record("10.0.0.3", NodeState::Dialing),
            record("10.0.0.1", NodeState::Completed { status: ExitStatus::Code(0) }),
            record("10.0.0.2", NodeState::Pending),
        ];
        let report = RunReport::from_records(&records);
        assert_eq!(report.unfinished, vec!["10.0.0.3", "10.0.0.2"]);
    }

    #[test]
    fn test_all_succeeded_requires_zero_exit() {
        let records = vec![
            record("a", NodeState::Completed { status: ExitStatus::Code(0) }),
            record("b", NodeState::Completed { status: ExitStatus::Code(7) }),
        ];
        assert!(!RunReport::from_records(&records).all_succeeded());

        let records = vec![
            record("a", NodeState::Completed { status: ExitStatus::Code(0) }),
            record("b", NodeState::Completed { status: ExitStatus::Unknown }),
        ];
        assert!(!RunReport::from_records(&records).all_succeeded());
    }

    #[test]
    fn test_terminal_states() {
        assert!(NodeState::Completed { status: ExitStatus::Unknown }.is_terminal());
        assert!(NodeState::Failed { reason: String::new() }.is_terminal());
        assert!(NodeState::TimedOut.is_terminal());
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Dialing.is_terminal());
        assert!(!NodeState::Running.is_terminal());
    }
}
