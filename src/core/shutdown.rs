//! 优雅关闭
//!
//! 关闭信号（Ctrl+C / SIGTERM / 致命错误）取消根令牌，所有进行中的查询通过子令牌收到取消；
//! 随后 ShutdownCoordinator 依次执行清理任务（关闭 Agent 会话，回收子进程）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::session::SessionManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 quit 命令
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根令牌；查询应使用 child_token()，以便单独取消
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，单个任务超时不阻塞后续任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {}s",
                    name,
                    self.timeout.as_secs()
                ),
            }
        }
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 关闭全部 Agent 会话
pub struct SessionCleanup {
    sessions: Arc<SessionManager>,
}

impl SessionCleanup {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.sessions.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AgentSessions"
    }
}

/// 运行 app 直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(coordinator: &ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    let manager = coordinator.manager();
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished normally"),
        _ = manager.wait_for_shutdown() => tracing::info!("Shutdown signal received"),
    }

    // app 自然结束时也要取消仍在进行的查询
    manager.shutdown(ShutdownReason::UserInitiated);
    coordinator.run_cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AgentDescriptor, ConnectionSpec};
    use crate::session::{LocalAgent, LocalConnector, SessionSettings, SessionState};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_reason_is_broadcast() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::FatalError("no agents".into()));
        assert_eq!(
            rx.recv().await.unwrap(),
            ShutdownReason::FatalError("no agents".into())
        );
    }

    struct FlagCleanup(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_sessions() {
        let connector = LocalConnector::new().agent(
            "echo",
            LocalAgent::new().tool("echo", "Echo", serde_json::json!({"type": "object"}), |a| {
                Ok(a.to_string())
            }),
        );
        let sessions = Arc::new(SessionManager::new(
            vec![AgentDescriptor {
                name: "echo".into(),
                description: String::new(),
                connection: ConnectionSpec::Http {
                    url: "http://unused".into(),
                    api_key_env: None,
                },
                tools: vec![],
            }],
            Arc::new(connector),
            SessionSettings::default(),
        ));
        sessions.discover("echo").await.unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(SessionCleanup::new(Arc::clone(&sessions)));
        coordinator.register(FlagCleanup(Arc::clone(&flag)));

        run_with_graceful_shutdown(&coordinator, async {}).await;
        assert!(coordinator.manager().is_shutdown());
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(sessions.state("echo").await, Some(SessionState::Closed));
    }
}
