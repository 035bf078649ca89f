//! SSH执行模块
//! 堡垒机传输、目标会话以及派发器使用的会话抽象

pub mod bastion;
pub mod session;

use async_trait::async_trait;

use crate::error::Result;
use crate::report::ExitStatus;

pub use bastion::{BastionConnector, BastionTransport};

/// 会话来源：给定目标地址，经共享传输打开一个命令会话
///
/// 派发器只依赖此接口，真实实现是 [`BastionTransport`]，
/// 测试中用脚本化的假实现替代。
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn open_session(&self, address: &str) -> Result<Box<dyn CommandSession>>;

    /// 释放底层传输；幂等
    async fn close(&self);
}

/// 一次性命令会话：启动命令并等待远端进程结束
///
/// 远端输出透传到本地 stdout/stderr；完成判定由调用方（worker）负责。
#[async_trait]
pub trait CommandSession: Send {
    async fn run(self: Box<Self>, command: &str) -> Result<ExitStatus>;
}
