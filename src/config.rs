//! 配置系统
//! 环境配置从环境变量加载（FLEET_ 前缀）；运行参数由模板解析产生，派发后只读

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, compact
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// 整次运行的全局截止时间（秒）
    pub deadline_secs: u64,
    /// 进度心跳间隔（秒）
    pub heartbeat_secs: u64,
    /// 同时在途的会话上限（限制堡垒机通道压力）
    pub max_inflight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// 目标主机 SSH 端口
    pub port: u16,
    /// 连接与握手超时（秒）
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub ssh: SshConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("logging.level", "info")?
            .set_default("logging.format", "compact")?
            .set_default("dispatch.deadline_secs", 300)?
            .set_default("dispatch.heartbeat_secs", 5)?
            .set_default("dispatch.max_inflight", 32)?
            .set_default("ssh.port", 22)?
            .set_default("ssh.connect_timeout_secs", 10)?;

        // 从环境变量加载配置（前缀为 FLEET_）
        settings = settings.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        if self.dispatch.deadline_secs == 0 {
            return Err(ConfigError::Message(
                "dispatch.deadline_secs must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.heartbeat_secs == 0
            || self.dispatch.heartbeat_secs >= self.dispatch.deadline_secs
        {
            return Err(ConfigError::Message(
                "dispatch.heartbeat_secs must be greater than 0 and less than deadline_secs"
                    .to_string(),
            ));
        }

        if self.dispatch.max_inflight == 0 || self.dispatch.max_inflight > 1024 {
            return Err(ConfigError::Message(
                "dispatch.max_inflight must be between 1 and 1024".to_string(),
            ));
        }

        if self.ssh.port == 0 {
            return Err(ConfigError::Message("ssh.port must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// 单次运行的不可变参数，派发开始后只读
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// 目标主机地址（输入顺序即报告顺序）
    pub nodes: Vec<String>,
    /// 目标主机登录用户
    pub user: String,
    /// 堡垒机地址
    pub bastion_host: String,
    /// 堡垒机登录用户
    pub bastion_user: String,
    /// 要执行的命令
    pub command: String,
}

impl RunConfig {
    /// 校验运行参数；nodes 必须非空且地址格式合法
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(AppError::validation("node list must not be empty"));
        }
        for node in &self.nodes {
            if !is_well_formed_address(node) {
                return Err(AppError::validation(format!("malformed node address: {:?}", node)));
            }
        }
        if !is_well_formed_address(&self.bastion_host) {
            return Err(AppError::validation(format!(
                "malformed bastion address: {:?}",
                self.bastion_host
            )));
        }
        if self.user.is_empty() {
            return Err(AppError::validation("remote user must not be empty"));
        }
        if self.bastion_user.is_empty() {
            return Err(AppError::validation("bastion user must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(AppError::validation("command must not be empty"));
        }
        Ok(())
    }
}

/// 地址格式检查：主机名或 IP，端口可选
/// 只做粗粒度语法校验，可达性在拨号时才能确定
fn is_well_formed_address(addr: &str) -> bool {
    if addr.is_empty() || addr.contains(char::is_whitespace) {
        return false;
    }
    let host = match addr.rsplit_once(':') {
        // IPv6 字面量不带端口也含冒号，此处仅接受 host:port 形式的数字端口
        Some((host, port)) => {
            if port.parse::<u16>().map(|p| p > 0).unwrap_or(false) {
                host
            } else {
                return false;
            }
        }
        None => addr,
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}
