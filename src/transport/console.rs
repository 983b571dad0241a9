//! 控制台传输层：开发用，stdin 每行一条入站消息，回复写到 stdout
//!
//! 没有凭据时模拟一次完整配对：推送配对码，稍后轮换出凭据并以 restart-required 断开，
//! 监管循环重连后即进入 open。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::traits::{
    ConnectionUpdate, Envelope, MessageRef, Presence, Transport, TransportConnection,
    TransportError, TransportEvent, TransportSession,
};
use crate::connection::CloseReason;
use crate::conversation::ConversationId;
use crate::session::SessionCredentials;

type LineReader = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// 模拟配对后写入的凭据分片名
pub const CONSOLE_CREDS_PART: &str = "creds.json";

pub struct ConsoleTransport {
    /// 跨会话共享的输入；同一时刻只有一个会话在读
    lines: Arc<Mutex<LineReader>>,
    output: SharedWriter,
    peer: ConversationId,
    display_name: String,
    pairing_delay: Duration,
}

impl ConsoleTransport {
    /// 绑定进程的 stdin/stdout
    pub fn stdio() -> Self {
        Self::new(
            Box::new(tokio::io::BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn new(
        input: Box<dyn AsyncBufRead + Send + Unpin>,
        output: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            lines: Arc::new(Mutex::new(input.lines())),
            output: Arc::new(Mutex::new(output)),
            peer: ConversationId::new("10000000000@s.whatsapp.net"),
            display_name: "Console".to_string(),
            pairing_delay: Duration::from_secs(3),
        }
    }

    /// 模拟对端身份（地址与显示名）
    pub fn with_peer(mut self, address: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.peer = ConversationId::new(address);
        self.display_name = display_name.into();
        self
    }

    /// 推送配对码到“扫码完成”之间的模拟延迟
    pub fn with_pairing_delay(mut self, delay: Duration) -> Self {
        self.pairing_delay = delay;
        self
    }

    fn spawn_pairing(&self, tx: mpsc::UnboundedSender<TransportEvent>, cancel: CancellationToken) {
        let delay = self.pairing_delay;
        let output = Arc::clone(&self.output);
        tokio::spawn(async move {
            let code = format!("2@{}", uuid::Uuid::new_v4().simple());
            write_line(&output, "[console] pairing code issued, open /scan to view it").await;
            let _ = tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::pairing(code)));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let device = uuid::Uuid::new_v4().to_string();
            let creds = SessionCredentials::new().with_part(
                CONSOLE_CREDS_PART,
                serde_json::json!({ "device": device }).to_string().into_bytes(),
            );
            write_line(&output, "[console] pairing simulated, restarting session").await;
            let _ = tx.send(TransportEvent::CredentialsRotated(creds));
            let _ = tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
                CloseReason::RestartRequired,
            )));
        });
    }

    fn spawn_reader(&self, tx: mpsc::UnboundedSender<TransportEvent>, cancel: CancellationToken) {
        let lines = Arc::clone(&self.lines);
        let peer = self.peer.clone();
        let display_name = self.display_name.clone();
        tokio::spawn(async move {
            let _ = tx.send(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()));
            let mut lines = lines.lock().await;
            let mut seq = 0u64;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next_line() => line,
                };
                let text = match next {
                    Ok(Some(text)) => text,
                    Ok(None) => {
                        tracing::info!("Console input closed");
                        // 输入结束后会话保持空闲，直到被拆除
                        cancel.cancelled().await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Console read failed: {}", e);
                        cancel.cancelled().await;
                        return;
                    }
                };
                if text.trim().is_empty() {
                    continue;
                }
                seq += 1;
                let envelope = Envelope {
                    message: MessageRef {
                        id: format!("console-{}", seq),
                        conversation: peer.clone(),
                        from_me: false,
                    },
                    sender: peer.clone(),
                    conversation: peer.clone(),
                    text: Some(text),
                    display_name: Some(display_name.clone()),
                    from_me: false,
                };
                if tx.send(TransportEvent::MessageReceived(envelope)).is_err() {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        match credentials {
            Some(creds) => {
                let valid = creds
                    .get(CONSOLE_CREDS_PART)
                    .is_some_and(|raw| serde_json::from_slice::<serde_json::Value>(raw).is_ok());
                if !valid {
                    return Err(TransportError::Credentials(format!(
                        "missing or unreadable {}",
                        CONSOLE_CREDS_PART
                    )));
                }
                self.spawn_reader(tx, cancel.clone());
            }
            None => self.spawn_pairing(tx, cancel.clone()),
        }

        Ok(TransportConnection {
            session: Arc::new(ConsoleSession {
                output: Arc::clone(&self.output),
                cancel,
            }),
            events: rx,
        })
    }
}

struct ConsoleSession {
    output: SharedWriter,
    cancel: CancellationToken,
}

#[async_trait]
impl TransportSession for ConsoleSession {
    async fn mark_read(&self, message: &MessageRef) -> Result<(), TransportError> {
        tracing::debug!("Read receipt for {}", message.id);
        Ok(())
    }

    async fn set_presence(
        &self,
        conversation: &ConversationId,
        presence: Presence,
    ) -> Result<(), TransportError> {
        tracing::debug!("Presence {:?} in {}", presence, conversation);
        Ok(())
    }

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
        quoting: Option<&MessageRef>,
    ) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let line = match quoting {
            Some(q) => format!("[{} re:{}] {}", conversation.canonical(), q.id, text),
            None => format!("[{}] {}", conversation.canonical(), text),
        };
        let mut out = self.output.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        out.write_all(b"\n")
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

async fn write_line(output: &SharedWriter, line: &str) {
    let mut out = output.lock().await;
    let _ = out.write_all(line.as_bytes()).await;
    let _ = out.write_all(b"\n").await;
    let _ = out.flush().await;
}
