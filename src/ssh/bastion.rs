//! 堡垒机连接
//! 检查本地 SSH agent、建立唯一一条到堡垒机的认证传输连接

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{RunConfig, SshConfig};
use crate::error::{AppError, Result};

/// SSH 客户端会话处理器
///
/// 通过堡垒机批量执行时采用即连即信策略（等价 StrictHostKeyChecking=no），
/// 指纹记录在 debug 日志中。
pub(crate) struct ClientHandler {
    pub(crate) host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// 堡垒机连接器
pub struct BastionConnector;

impl BastionConnector {
    /// 建立到堡垒机的共享传输
    ///
    /// agent 缺失在任何网络 I/O 之前失败；传输层失败与认证失败分别
    /// 映射为 Connect 和 Auth，二者都终止整次运行。
    pub async fn connect(run: &RunConfig, ssh: &SshConfig) -> Result<BastionTransport> {
        // agent 前置检查：SSH_AUTH_SOCK 必须存在、可连接且至少有一个身份
        let agent_sock = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| AppError::agent("no SSH agent available (SSH_AUTH_SOCK not set)"))?;

        let mut agent = AgentClient::connect_uds(&agent_sock)
            .await
            .map_err(|e| AppError::agent(format!("cannot reach SSH agent: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| AppError::agent(format!("agent refused identity listing: {}", e)))?;

        if identities.is_empty() {
            return Err(AppError::agent("SSH agent holds no identities"));
        }

        debug!(identities = identities.len(), "SSH agent ready");

        let (host, port) = split_address(&run.bastion_host, ssh.port);
        info!(bastion = %run.bastion_host, user = %run.bastion_user, "Connecting to bastion");

        let client_config = Arc::new(client::Config::default());
        let handler = ClientHandler { host: host.clone() };

        let mut handle = timeout(
            Duration::from_secs(ssh.connect_timeout_secs),
            client::connect(client_config, (host.as_str(), port), handler),
        )
        .await
        .map_err(|_| AppError::connect(format!("connection to {} timed out", run.bastion_host)))?
        .map_err(|e| AppError::connect(format!("cannot reach bastion {}: {}", run.bastion_host, e)))?;

        // agent 代签认证：依次尝试 agent 中的每个身份，私钥材料不离开 agent 进程
        let authenticated =
            authenticate_with_agent(&mut handle, &run.bastion_user, agent, identities).await?;
        if !authenticated {
            return Err(AppError::auth(format!(
                "bastion {} rejected every agent identity for user {}",
                run.bastion_host, run.bastion_user
            )));
        }

        info!(bastion = %run.bastion_host, "Bastion transport established");

        Ok(BastionTransport {
            handle: Mutex::new(Some(Arc::new(handle))),
            agent_sock,
            target_user: run.user.clone(),
            ssh: ssh.clone(),
        })
    }
}

/// 共享的堡垒机传输
///
/// 每次运行恰好存在一个实例；russh 的 `Handle` 是到单一会话任务的消息
/// 前端，所有 worker 的通道打开请求经由它串行化。
pub struct BastionTransport {
    /// take 后置 None，保证 close 恰好执行一次
    handle: Mutex<Option<Arc<client::Handle<ClientHandler>>>>,
    agent_sock: String,
    target_user: String,
    ssh: SshConfig,
}

impl std::fmt::Debug for BastionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BastionTransport")
            .field("agent_sock", &self.agent_sock)
            .field("target_user", &self.target_user)
            .field("ssh", &self.ssh)
            .finish_non_exhaustive()
    }
}

impl BastionTransport {
    /// 取共享句柄；传输已关闭时报 Connect 错误
    pub(crate) async fn handle(&self) -> Result<Arc<client::Handle<ClientHandler>>> {
        let guard = self.handle.lock().await;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| AppError::connect("bastion transport already closed"))
    }

    pub(crate) fn agent_sock(&self) -> &str {
        &self.agent_sock
    }

    pub(crate) fn target_user(&self) -> &str {
        &self.target_user
    }

    pub(crate) fn ssh(&self) -> &SshConfig {
        &self.ssh
    }

    /// 关闭传输；幂等，重复调用无效果
    pub async fn close(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            debug!("Bastion transport closed");
        }
    }
}

/// 用 agent 中的身份依次认证，成功即停
pub(crate) async fn authenticate_with_agent(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    mut agent: AgentClient<UnixStream>,
    identities: Vec<PublicKey>,
) -> Result<bool> {
    for key in identities {
        let (returned_agent, auth_result) = handle.authenticate_future(user, key, agent).await;
        agent = returned_agent;
        match auth_result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => return Err(AppError::agent(format!("agent signing failed: {}", e))),
        }
    }
    Ok(false)
}

/// 拆出地址中的可选端口，缺省用配置端口
pub(crate) fn split_address(addr: &str, default_port: u16) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) if port > 0 => (host.to_string(), port),
            _ => (addr.to_string(), default_port),
        },
        None => (addr.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("10.0.0.1", 22), ("10.0.0.1".to_string(), 22));
        assert_eq!(split_address("10.0.0.1:2222", 22), ("10.0.0.1".to_string(), 2222));
        assert_eq!(split_address("host.example.com:22", 2200), ("host.example.com".to_string(), 22));
    }

    #[tokio::test]
    #[serial]
    async fn test_connect_fails_without_agent_before_network_io() {
        std::env::remove_var("SSH_AUTH_SOCK");

        let run = RunConfig {
            nodes: vec!["10.0.0.1".to_string()],
            user: "user".to_string(),
            // 不可达地址：若 agent 检查不先行，连接会卡到超时
            bastion_host: "192.0.2.1".to_string(),
            bastion_user: "admin".to_string(),
            command: "true".to_string(),
        };
        let ssh = SshConfig {
            port: 22,
            connect_timeout_secs: 10,
        };

        let err = BastionConnector::connect(&run, &ssh).await.unwrap_err();
        assert!(matches!(err, AppError::Agent(_)), "expected Agent error, got: {}", err);
    }
}
