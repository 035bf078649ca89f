//! 主机发现
//! 在运行参数定稿之前按名称前缀解析目标主机的可插拔来源

use async_trait::async_trait;

use crate::error::Result;

/// 主机发现来源
///
/// 派发器不感知发现过程；实现方（云清单客户端等）在模板解析阶段
/// 被调用一次。
#[async_trait]
pub trait HostDiscovery: Send + Sync {
    /// 返回名称匹配前缀的主机地址
    async fn discover(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 固定清单来源：按前缀过滤一份静态列表
///
/// 内置的参考实现，也是测试替身；真实的云清单客户端在同一 trait 上接入。
pub struct StaticDiscovery {
    hosts: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl HostDiscovery for StaticDiscovery {
    async fn discover(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .hosts
            .iter()
            .filter(|host| host.starts_with(prefix))
            .cloned()
            .collect())
    }
}
