//! 并发派发器
//! 每台目标主机一个 worker，收集循环在完成事件、心跳与全局截止时间之间仲裁

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DispatchConfig, RunConfig};
use crate::error::{AppError, Result};
use crate::report::{NodeExecution, NodeState, RunReport};
use crate::ssh::{BastionConnector, SessionSource};

/// worker 上报给收集循环的事件
///
/// 记录集归收集循环独占，worker 只发消息；每个 worker 恰好发出一个终态事件。
#[derive(Debug)]
struct NodeEvent {
    index: usize,
    state: NodeState,
}

/// 校验运行参数、建立堡垒机传输并派发整个舰队
///
/// 堡垒机层面的失败（agent 缺失、连接失败、认证被拒）在任何主机
/// 被拨号之前返回，此时没有任何主机记录离开 Pending。
pub async fn run_fleet(run: &RunConfig, app: &AppConfig) -> Result<RunReport> {
    run.validate()?;
    let transport = BastionConnector::connect(run, &app.ssh).await?;
    Dispatcher::run(Arc::new(transport), run, &app.dispatch).await
}

/// 并发派发器
pub struct Dispatcher;

impl Dispatcher {
    /// 在所有目标主机上并发执行命令并收集结果
    ///
    /// 失败策略为 fail-safe：单台主机失败记入报告，不中断其余主机；
    /// 只有全局截止时间会强制结束仍在执行的 worker。超时路径返回
    /// `AppError::Timeout`，其中保留全部已终态的结果和按输入顺序排列
    /// 的未完成主机列表。
    pub async fn run(
        source: Arc<dyn SessionSource>,
        run: &RunConfig,
        dispatch: &DispatchConfig,
    ) -> Result<RunReport> {
        let total = run.nodes.len();
        let mut records: Vec<NodeExecution> =
            run.nodes.iter().map(NodeExecution::new).collect();

        // 事件通道容量按非终态事件上界预留，worker 发送永不阻塞
        let (events_tx, mut events_rx) = mpsc::channel::<NodeEvent>(total * 3 + 1);
        // 背压：同时在途的会话数不超过 max_inflight
        let gate = Arc::new(Semaphore::new(dispatch.max_inflight));

        let mut workers = JoinSet::new();
        for (index, node) in run.nodes.iter().enumerate() {
            workers.spawn(node_worker(
                index,
                node.clone(),
                run.command.clone(),
                Arc::clone(&source),
                Arc::clone(&gate),
                events_tx.clone(),
            ));
        }
        // 收集循环只通过 worker 持有的发送端计数
        drop(events_tx);

        // 三个独立的时间信号，全部在派发开始时创建一次：
        // 截止时间为一次性绝对定时器，心跳为固定周期 ticker（首次滴答
        // 推迟一个周期），循环内的工作量不会使任何一个漂移或重置。
        let started = Instant::now();
        let deadline = tokio::time::sleep_until(started + Duration::from_secs(dispatch.deadline_secs));
        tokio::pin!(deadline);
        let heartbeat_period = Duration::from_secs(dispatch.heartbeat_secs);
        let mut heartbeat = interval_at(started + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut terminal = 0usize;
        let timed_out = loop {
            if terminal == total {
                break false;
            }
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(NodeEvent { index, state }) => {
                            let is_terminal = state.is_terminal();
                            let address = records[index].address.clone();
                            match &state {
                                NodeState::Completed { status } => {
                                    counter!("fleet_nodes_completed").increment(1);
                                    info!(node = %address, %status, "Completed execution on node");
                                }
                                NodeState::Failed { reason } => {
                                    counter!("fleet_nodes_failed").increment(1);
                                    warn!(node = %address, reason = %reason, "Node failed");
                                }
                                other => debug!(node = %address, state = ?other, "Node state change"),
                            }
                            records[index].state = state;
                            if is_terminal {
                                terminal += 1;
                            }
                        }
                        // 所有发送端已释放；终态计数在上方把守，这里只是兜底
                        None => break false,
                    }
                }
                _ = heartbeat.tick() => {
                    info!(
                        done = terminal,
                        total,
                        elapsed_secs = started.elapsed().as_secs(),
                        "Waiting for remaining nodes"
                    );
                }
                _ = &mut deadline => {
                    warn!(done = terminal, total, "Run deadline exceeded");
                    break true;
                }
            }
        };

        // 任何退出路径都主动终止仍在飞行的 worker，而不是任其后台完成；
        // 中止会释放各自的会话与子通道，共享传输随后恰好关闭一次
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        source.close().await;

        if timed_out {
            // 截止时间与完成事件同一瞬间就绪时，先把已入队的终态事件落账
            drain_pending_events(&mut events_rx, &mut records);
            for record in records.iter_mut() {
                if !record.state.is_terminal() {
                    counter!("fleet_nodes_unfinished").increment(1);
                    record.state = NodeState::TimedOut;
                }
            }
            return Err(AppError::Timeout {
                report: RunReport::from_records(&records),
            });
        }

        Ok(RunReport::from_records(&records))
    }
}

/// 把收集循环退出前已入队的终态事件写入记录集
///
/// 只接受首个终态迁移，非终态事件与重复终态一律丢弃。
fn drain_pending_events(events: &mut mpsc::Receiver<NodeEvent>, records: &mut [NodeExecution]) {
    while let Ok(NodeEvent { index, state }) = events.try_recv() {
        if state.is_terminal() && !records[index].state.is_terminal() {
            match &state {
                NodeState::Completed { .. } => counter!("fleet_nodes_completed").increment(1),
                NodeState::Failed { .. } => counter!("fleet_nodes_failed").increment(1),
                _ => {}
            }
            records[index].state = state;
        }
    }
}

/// 单台主机的 worker
///
/// 打开会话、启动命令、等待远端进程结束；无论成败恰好发出一个终态事件。
/// 事件发送失败说明收集循环已退出（超时路径），直接放弃即可。
async fn node_worker(
    index: usize,
    address: String,
    command: String,
    source: Arc<dyn SessionSource>,
    gate: Arc<Semaphore>,
    events: mpsc::Sender<NodeEvent>,
) {
    // 关闭信号量即视为派发结束
    let _permit = match Arc::clone(&gate).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let _ = events
        .send(NodeEvent {
            index,
            state: NodeState::Dialing,
        })
        .await;

    let session = match source.open_session(&address).await {
        Ok(session) => session,
        Err(e) => {
            let _ = events
                .send(NodeEvent {
                    index,
                    state: NodeState::Failed { reason: e.to_string() },
                })
                .await;
            return;
        }
    };

    let _ = events
        .send(NodeEvent {
            index,
            state: NodeState::Running,
        })
        .await;

    let state = match session.run(&command).await {
        Ok(status) => NodeState::Completed { status },
        Err(e) => NodeState::Failed { reason: e.to_string() },
    };
    let _ = events.send(NodeEvent { index, state }).await;
}
