//! 目标主机会话
//! 经堡垒机传输的 direct-tcpip 通道完成目标握手、agent 认证并执行命令

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::report::ExitStatus;
use crate::ssh::bastion::{authenticate_with_agent, split_address, BastionTransport, ClientHandler};
use crate::ssh::{CommandSession, SessionSource};

#[async_trait]
impl SessionSource for BastionTransport {
    /// 打开到目标主机的命令会话
    ///
    /// 所有失败都是主机级的：Dial（目标经堡垒机不可达）、Auth（身份被拒）、
    /// Session（通道已开但会话协商失败）。
    async fn open_session(&self, address: &str) -> Result<Box<dyn CommandSession>> {
        let bastion = self.handle().await?;
        let (host, port) = split_address(address, self.ssh().port);

        debug!(node = %address, "Dialing target through bastion");

        // 经共享传输打开逻辑通道；通道打开由堡垒机会话任务串行处理
        let hop = bastion
            .channel_open_direct_tcpip(host.as_str(), u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| AppError::dial(format!("{} unreachable through bastion: {}", address, e)))?;

        // 在通道之上执行完整的目标主机 SSH 握手
        let client_config = Arc::new(client::Config::default());
        let handler = ClientHandler { host: host.clone() };

        let mut target = timeout(
            Duration::from_secs(self.ssh().connect_timeout_secs),
            client::connect_stream(client_config, hop.into_stream(), handler),
        )
        .await
        .map_err(|_| AppError::dial(format!("handshake with {} timed out", address)))?
        .map_err(|e| AppError::dial(format!("handshake with {} failed: {}", address, e)))?;

        // 目标认证复用同一 agent 的身份
        let mut agent = AgentClient::connect_uds(self.agent_sock())
            .await
            .map_err(|e| AppError::agent(format!("cannot reach SSH agent: {}", e)))?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| AppError::agent(format!("agent refused identity listing: {}", e)))?;

        let authenticated =
            authenticate_with_agent(&mut target, self.target_user(), agent, identities).await?;
        if !authenticated {
            return Err(AppError::auth(format!(
                "{} rejected every agent identity for user {}",
                address,
                self.target_user()
            )));
        }

        let channel = target
            .channel_open_session()
            .await
            .map_err(|e| AppError::session(format!("session negotiation with {} failed: {}", address, e)))?;

        // 目标自身可能还要继续跳转，为新会话申请 agent 转发
        if let Err(e) = channel.agent_forward(true).await {
            warn!(node = %address, error = %e, "Agent forwarding request declined");
        }

        Ok(Box::new(RemoteSession {
            address: address.to_string(),
            target,
            channel,
        }))
    }

    async fn close(&self) {
        BastionTransport::close(self).await;
    }
}

/// 一台目标主机上的交互会话
pub struct RemoteSession {
    address: String,
    target: client::Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl CommandSession for RemoteSession {
    /// 启动命令并等待远端进程结束
    ///
    /// 远端输出透传到本地 stdout/stderr。未观察到退出码的结束
    /// （信号、连接中断）返回 `ExitStatus::Unknown`。
    async fn run(mut self: Box<Self>, command: &str) -> Result<ExitStatus> {
        // 泵送结果先落到 outcome，通道与目标连接在返回前无条件释放，
        // 本地输出写失败等错误路径也不例外
        let outcome = match self.channel.exec(true, command).await {
            Ok(()) => pump_channel(&mut self.channel, &self.address).await,
            Err(e) => Err(AppError::exec(format!(
                "failed to start command on {}: {}",
                self.address, e
            ))),
        };

        let _ = self.channel.close().await;
        let _ = self
            .target
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;

        outcome
    }
}

/// 读通道消息直到通道关闭，远端输出透传到本地终端
async fn pump_channel(
    channel: &mut russh::Channel<client::Msg>,
    address: &str,
) -> Result<ExitStatus> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut exit_status = None;

    // 退出码可能在 EOF 之后才到达，继续读到通道关闭
    while let Some(msg) = channel.wait().await {
        if let Some(status) = observe_message(&msg, address, &mut stdout, &mut stderr).await? {
            exit_status = Some(status);
        }
    }

    // 通道关闭且始终没有退出码：按未知处理，绝不视作 0
    Ok(exit_status.unwrap_or(ExitStatus::Unknown))
}

/// 处理单条通道消息：数据写入对应输出流，退出消息映射为退出状态
async fn observe_message<O, E>(
    msg: &ChannelMsg,
    address: &str,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<Option<ExitStatus>>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    match msg {
        ChannelMsg::Data { ref data } => {
            stdout.write_all(data).await?;
            stdout.flush().await?;
            Ok(None)
        }
        ChannelMsg::ExtendedData { ref data, ext } => {
            // SSH_EXTENDED_DATA_STDERR
            if *ext == 1 {
                stderr.write_all(data).await?;
                stderr.flush().await?;
            }
            Ok(None)
        }
        ChannelMsg::ExitStatus { exit_status } => Ok(Some(ExitStatus::Code(*exit_status))),
        ChannelMsg::ExitSignal { signal_name, .. } => {
            debug!(node = %address, signal = ?signal_name, "Remote process killed by signal");
            Ok(Some(ExitStatus::Unknown))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// 一写即断的输出槽，模拟本地终端关闭
    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_exit_messages_map_to_status() {
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();

        let status = observe_message(
            &ChannelMsg::ExitStatus { exit_status: 7 },
            "h",
            &mut out,
            &mut err,
        )
        .await
        .unwrap();
        assert_eq!(status, Some(ExitStatus::Code(7)));

        let status = observe_message(
            &ChannelMsg::ExitSignal {
                signal_name: russh::Sig::KILL,
                core_dumped: false,
                error_message: String::new(),
                lang_tag: String::new(),
            },
            "h",
            &mut out,
            &mut err,
        )
        .await
        .unwrap();
        // 信号结束映射为 Unknown，绝不折算成退出码 0
        assert_eq!(status, Some(ExitStatus::Unknown));
    }

    #[tokio::test]
    async fn test_output_routed_by_stream() {
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();

        observe_message(
            &ChannelMsg::Data { data: CryptoVec::from(b"hello".to_vec()) },
            "h",
            &mut out,
            &mut err,
        )
        .await
        .unwrap();
        observe_message(
            &ChannelMsg::ExtendedData { data: CryptoVec::from(b"oops".to_vec()), ext: 1 },
            "h",
            &mut out,
            &mut err,
        )
        .await
        .unwrap();

        assert_eq!(out, b"hello");
        assert_eq!(err, b"oops");
    }

    #[tokio::test]
    async fn test_local_write_failure_surfaces_as_error() {
        let mut out = BrokenSink;
        let mut err: Vec<u8> = Vec::new();

        let result = observe_message(
            &ChannelMsg::Data { data: CryptoVec::from(b"data".to_vec()) },
            "h",
            &mut out,
            &mut err,
        )
        .await;

        // run() 在该错误返回前仍会关闭通道并断开目标连接
        assert!(matches!(result, Err(AppError::Io(_))));
    }
}
