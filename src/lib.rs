//! fleetcmd 库
//! 经单一堡垒机在主机群上并发执行命令

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod report;
pub mod ssh;
pub mod telemetry;
pub mod template;
