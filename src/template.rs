//! 运行模板
//! JSON 模板的加载、校验、示例生成，以及到运行参数的解析

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RunConfig;
use crate::discovery::HostDiscovery;
use crate::error::{AppError, Result};

/// 运行模板（JSON 文档）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub bastion: Bastion,
    pub remote: Remote,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bastion {
    pub host: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    /// 固定的目标主机列表；可与 name-prefix 发现结果并用
    #[serde(default)]
    pub hosts: Vec<String>,
    pub user: String,
    /// 动态发现目标主机的名称前缀（可选）
    #[serde(rename = "name-prefix", default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
}

impl Template {
    /// 从文件加载并校验模板
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::template(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let template: Template = serde_json::from_str(&content)?;
        template.validate()?;
        Ok(template)
    }

    /// 校验模板；所有问题汇总成一个错误返回
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.bastion.host.is_empty() {
            problems.push("bastion host is required");
        }
        if self.bastion.user.is_empty() {
            problems.push("bastion user is required");
        }
        if self.remote.hosts.is_empty() && self.remote.name_prefix.as_deref().unwrap_or("").is_empty()
        {
            problems.push("either remote hosts or a name-prefix is required");
        }
        if self.remote.user.is_empty() {
            problems.push("remote user is required");
        }
        if self.command.is_empty() {
            problems.push("command is required");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(problems.join("; ")))
        }
    }

    /// 示例模板
    pub fn sample() -> Self {
        Self {
            bastion: Bastion {
                host: "bastion.example.com".to_string(),
                user: "admin".to_string(),
            },
            remote: Remote {
                hosts: vec![],
                user: "ec2-user".to_string(),
                name_prefix: Some("web".to_string()),
            },
            command: "ls -l /usr/".to_string(),
        }
    }

    /// 把示例模板写到指定路径
    pub fn write_sample(path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&Self::sample())?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// 解析为运行参数；name-prefix 存在时先通过发现源补全主机列表
    pub async fn resolve(&self, discovery: &dyn HostDiscovery) -> Result<RunConfig> {
        let mut nodes = self.remote.hosts.clone();

        if let Some(prefix) = self.remote.name_prefix.as_deref() {
            if !prefix.is_empty() {
                let discovered = discovery.discover(prefix).await?;
                info!(prefix = %prefix, count = discovered.len(), "Discovered hosts");
                nodes.extend(discovered);
            }
        }

        let run = RunConfig {
            nodes,
            user: self.remote.user.clone(),
            bastion_host: self.bastion.host.clone(),
            bastion_user: self.bastion.user.clone(),
            command: self.command.clone(),
        };
        run.validate()?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;

    fn template() -> Template {
        Template {
            bastion: Bastion {
                host: "bastion.example.com".to_string(),
                user: "admin".to_string(),
            },
            remote: Remote {
                hosts: vec!["10.0.0.1".to_string()],
                user: "ec2-user".to_string(),
                name_prefix: None,
            },
            command: "uptime".to_string(),
        }
    }

    #[test]
    fn test_validate_aggregates_all_problems() {
        let empty = Template {
            bastion: Bastion {
                host: String::new(),
                user: String::new(),
            },
            remote: Remote {
                hosts: vec![],
                user: String::new(),
                name_prefix: None,
            },
            command: String::new(),
        };
        let err = empty.validate().unwrap_err().to_string();
        assert!(err.contains("bastion host"));
        assert!(err.contains("bastion user"));
        assert!(err.contains("remote hosts"));
        assert!(err.contains("remote user"));
        assert!(err.contains("command"));
    }

    #[test]
    fn test_name_prefix_satisfies_host_requirement() {
        let mut t = template();
        t.remote.hosts.clear();
        t.remote.name_prefix = Some("web".to_string());
        assert!(t.validate().is_ok());

        t.remote.name_prefix = Some(String::new());
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_sample_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        Template::write_sample(&path).unwrap();

        let loaded = Template::load(&path).unwrap();
        assert_eq!(loaded.bastion.host, "bastion.example.com");
        assert_eq!(loaded.remote.name_prefix.as_deref(), Some("web"));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Template::load(&path), Err(AppError::Template(_))));
    }

    #[tokio::test]
    async fn test_resolve_appends_discovered_hosts() {
        let mut t = template();
        t.remote.name_prefix = Some("web".to_string());

        let discovery = StaticDiscovery::new(vec![
            "web-1.internal".to_string(),
            "db-1.internal".to_string(),
            "web-2.internal".to_string(),
        ]);

        let run = t.resolve(&discovery).await.unwrap();
        assert_eq!(run.nodes, vec!["10.0.0.1", "web-1.internal", "web-2.internal"]);
        assert_eq!(run.user, "ec2-user");
    }

    #[tokio::test]
    async fn test_resolve_without_prefix_keeps_static_hosts() {
        let t = template();
        let discovery = StaticDiscovery::new(vec!["web-1.internal".to_string()]);
        let run = t.resolve(&discovery).await.unwrap();
        assert_eq!(run.nodes, vec!["10.0.0.1"]);
    }
}
