//! 统一错误模型
//! 区分运行级错误（立即终止）与主机级错误（记入报告，不影响其他主机）

use thiserror::Error;

use crate::report::RunReport;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// 本地 SSH agent 不可用或握手被拒绝
    #[error("SSH agent error: {0}")]
    Agent(String),

    /// 服务端拒绝了 agent 提供的身份
    #[error("SSH authentication failed: {0}")]
    Auth(String),

    /// 到堡垒机的传输层连接失败（运行级，立即终止）
    #[error("Bastion connection error: {0}")]
    Connect(String),

    /// 经堡垒机到目标主机不可达（主机级）
    #[error("Dial error: {0}")]
    Dial(String),

    /// 通道已打开但会话协商失败（主机级）
    #[error("Session error: {0}")]
    Session(String),

    /// 远程命令启动或读取失败（主机级）
    #[error("Remote execution error: {0}")]
    Exec(String),

    /// 全局截止时间已到；报告中保留已完成主机的结果
    #[error("Run deadline exceeded, {} host(s) unfinished", report.unfinished.len())]
    Timeout { report: RunReport },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    // 便捷方法
    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        AppError::Template(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn agent(msg: impl Into<String>) -> Self {
        AppError::Agent(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        AppError::Auth(msg.into())
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        AppError::Connect(msg.into())
    }

    pub fn dial(msg: impl Into<String>) -> Self {
        AppError::Dial(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        AppError::Session(msg.into())
    }

    pub fn exec(msg: impl Into<String>) -> Self {
        AppError::Exec(msg.into())
    }

    /// 是否为主机级错误（不中断其他主机的执行）
    pub fn is_per_host(&self) -> bool {
        matches!(
            self,
            AppError::Dial(_) | AppError::Session(_) | AppError::Exec(_) | AppError::Auth(_)
        )
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 从 serde_json::Error 转换（模板解析）
impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Template(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_host_classification() {
        assert!(AppError::dial("unreachable").is_per_host());
        assert!(AppError::session("negotiation failed").is_per_host());
        assert!(AppError::auth("rejected").is_per_host());
        assert!(!AppError::connect("refused").is_per_host());
        assert!(!AppError::agent("no agent").is_per_host());
    }

    #[test]
    fn test_timeout_message_counts_unfinished() {
        let report = RunReport {
            total: 3,
            completed: vec![],
            failed: vec![],
            unfinished: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        };
        let err = AppError::Timeout { report };
        assert!(err.to_string().contains("2 host(s) unfinished"));
    }
}
