//! 桥接构建器：统一的装配逻辑
//!
//! 从 AppConfig 装配 SessionStore、传输层、AI 客户端、会话注册表、配对广播、路由与监管循环；
//! 各组件都可替换（测试注入 Mock）。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::error::{BridgeError, Result};
use crate::config::{load_config, AppConfig};
use crate::connection::{ConnectionState, ConnectionSupervisor, SupervisorExit};
use crate::conversation::{ConversationRegistry, SeedPolicy};
use crate::llm::{create_llm_client, LlmClient};
use crate::pairing::{PairingBroadcaster, QrEncoder, StatusAssets, SvgQrEncoder};
use crate::router::{AccessPolicy, MessageRouter, RouterConfig};
use crate::server::{serve, ServerState};
use crate::session::{create_session_store, SessionStore};
use crate::transport::{ConsoleTransport, Transport};

/// 桥接构建器：未显式注入的组件按配置创建
pub struct BridgeBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn Transport>>,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn SessionStore>>,
    qr_encoder: Option<Arc<dyn QrEncoder>>,
}

impl BridgeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            llm: None,
            store: None,
            qr_encoder: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_qr_encoder(mut self, encoder: Arc<dyn QrEncoder>) -> Self {
        self.qr_encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Bridge {
        let cfg = self.config;

        let store = self.store.unwrap_or_else(|| {
            let dir = &cfg.session.credentials_dir;
            create_session_store((!dir.as_os_str().is_empty()).then_some(dir.as_path()))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ConsoleTransport::stdio()));
        let llm = self.llm.unwrap_or_else(|| create_llm_client(&cfg.llm));
        let encoder = self
            .qr_encoder
            .unwrap_or_else(|| Arc::new(SvgQrEncoder::default()));

        let registry = Arc::new(ConversationRegistry::new(
            SeedPolicy {
                user_template: cfg.assistant.seed_prompt.clone(),
                reply: cfg.assistant.seed_reply.clone(),
            },
            cfg.context.max_turns,
        ));
        let broadcaster = Arc::new(PairingBroadcaster::new(encoder, StatusAssets::default()));
        let access = AccessPolicy::from_config(&cfg.access);
        if access.is_enabled() {
            tracing::info!("Allow-list enabled (scope: {:?})", cfg.access.scope);
        }
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            llm,
            access,
            RouterConfig::from_app(&cfg),
        ));
        let supervisor = ConnectionSupervisor::new(
            transport,
            store,
            Arc::clone(&broadcaster),
            Arc::clone(&registry),
            router.clone(),
        )
        .with_backoff(
            Duration::from_millis(cfg.reconnect.initial_backoff_ms),
            Duration::from_millis(cfg.reconnect.max_backoff_ms),
        );

        Bridge {
            config: cfg,
            registry,
            broadcaster,
            router,
            supervisor,
        }
    }
}

/// 装配完成、尚未运行的桥接
pub struct Bridge {
    pub config: AppConfig,
    pub registry: Arc<ConversationRegistry>,
    pub broadcaster: Arc<PairingBroadcaster>,
    pub router: Arc<MessageRouter>,
    supervisor: ConnectionSupervisor,
}

impl Bridge {
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state()
    }

    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.supervisor.transitions()
    }

    pub fn server_state(&self) -> Arc<ServerState> {
        Arc::new(ServerState {
            broadcaster: Arc::clone(&self.broadcaster),
            client_dir: self.config.server.client_dir.clone(),
        })
    }

    /// 绑定配置中的地址后运行
    pub async fn run(self, shutdown: CancellationToken) -> Result<SupervisorExit> {
        let bind_addr = self.config.server.bind_addr.clone();
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| BridgeError::BindAddr(format!("{}: {}", bind_addr, e)))?;
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// 运行运维服务与监管循环；致命断开后服务保持在线，直到 shutdown
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<SupervisorExit> {
        let server = tokio::spawn(serve(listener, self.server_state(), shutdown.clone()));

        let exit = self.supervisor.run(shutdown.clone()).await;
        if let SupervisorExit::Fatal(reason) = &exit {
            tracing::error!(
                "Messaging connection stopped ({}); operator page stays up until shutdown",
                reason
            );
            shutdown.cancelled().await;
        }

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => tracing::error!("Operator server task failed: {}", e),
        }
        tracing::info!("Bridge stopped");
        Ok(exit)
    }
}

/// 加载配置并创建构建器
pub fn create_bridge_builder(config_path: Option<PathBuf>) -> Result<BridgeBuilder> {
    let config = load_config(config_path)?;
    Ok(BridgeBuilder::new(config))
}
