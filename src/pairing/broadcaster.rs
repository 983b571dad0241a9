//! 配对状态广播
//!
//! 每次状态进入恰好发出一条通知；至多挂接一个运维观察者，未挂接时直接丢弃（不排队）。
//! 新挂接的观察者先收到当前状态快照，而不是历史事件。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::event::{OperatorEvent, PairingStatus, StatusNotice};
use super::qr::QrEncoder;

/// 状态图标资源路径
#[derive(Debug, Clone)]
pub struct StatusAssets {
    pub check: String,
    pub loader: String,
}

impl Default for StatusAssets {
    fn default() -> Self {
        Self {
            check: "./assets/check.svg".to_string(),
            loader: "./assets/loader.svg".to_string(),
        }
    }
}

/// 最近一次未被消费的配对码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQr {
    pub code: String,
    pub data_uri: String,
}

/// 观察者标识（detach 时校验，避免旧连接关闭时误摘新连接）
pub type ObserverId = u64;

struct Observer {
    id: ObserverId,
    tx: mpsc::UnboundedSender<OperatorEvent>,
}

/// 配对状态广播器
pub struct PairingBroadcaster {
    encoder: Arc<dyn QrEncoder>,
    assets: StatusAssets,
    current: Mutex<StatusNotice>,
    pending_qr: Mutex<Option<PendingQr>>,
    observer: Mutex<Option<Observer>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
}

impl PairingBroadcaster {
    pub fn new(encoder: Arc<dyn QrEncoder>, assets: StatusAssets) -> Self {
        let current = StatusNotice {
            status: PairingStatus::Loading,
            payload: assets.loader.clone(),
            log: LOG_LOADING.to_string(),
        };
        Self {
            encoder,
            assets,
            current: Mutex::new(current),
            pending_qr: Mutex::new(None),
            observer: Mutex::new(None),
            next_id: AtomicU64::new(1),
            emitted: AtomicU64::new(0),
        }
    }

    /// 进入 connecting
    pub fn loading(&self) {
        self.publish(StatusNotice {
            status: PairingStatus::Loading,
            payload: self.assets.loader.clone(),
            log: LOG_LOADING.to_string(),
        });
    }

    /// 新配对码：整体替换 PendingQR 并通知；渲染失败时只记日志，不发通知
    pub fn qr(&self, code: &str) -> bool {
        let data_uri = match self.encoder.encode(code) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!("Failed to render pairing code: {}", e);
                return false;
            }
        };
        *lock(&self.pending_qr) = Some(PendingQr {
            code: code.to_string(),
            data_uri: data_uri.clone(),
        });
        self.publish(StatusNotice {
            status: PairingStatus::Qr,
            payload: data_uri,
            log: "QR Code received, please scan!".to_string(),
        });
        true
    }

    /// 进入 open：清除 PendingQR；paired 表示本次运行中经过扫码
    pub fn opened(&self, paired: bool) {
        lock(&self.pending_qr).take();
        let (status, log) = if paired {
            (PairingStatus::Paired, "QR Code has been scanned!")
        } else {
            (PairingStatus::Connected, "Connected to the messaging network!")
        };
        self.publish(StatusNotice {
            status,
            payload: self.assets.check.clone(),
            log: log.to_string(),
        });
    }

    /// 进入 closed-retry
    pub fn reconnecting(&self, reason: &str) {
        self.publish(StatusNotice {
            status: PairingStatus::Reconnecting,
            payload: self.assets.loader.clone(),
            log: format!("Connection closed ({}), reconnecting...", reason),
        });
    }

    /// 进入 closed-fatal
    pub fn fatal(&self, message: impl Into<String>) {
        lock(&self.pending_qr).take();
        self.publish(StatusNotice {
            status: PairingStatus::Fatal,
            payload: String::new(),
            log: message.into(),
        });
    }

    /// 挂接观察者（替换已有的），并立即推送当前状态快照
    pub fn attach(&self, tx: mpsc::UnboundedSender<OperatorEvent>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // 先持有观察者锁再取快照，保证快照之后的通知不会漏发
        let mut observer = lock(&self.observer);
        for event in self.current().to_events() {
            let _ = tx.send(event);
        }
        if observer.replace(Observer { id, tx }).is_some() {
            tracing::debug!("Operator observer replaced by #{}", id);
        }
        id
    }

    /// 摘除观察者；id 不匹配（已被新连接替换）时忽略
    pub fn detach(&self, id: ObserverId) {
        let mut observer = lock(&self.observer);
        if observer.as_ref().is_some_and(|o| o.id == id) {
            *observer = None;
        }
    }

    pub fn has_observer(&self) -> bool {
        lock(&self.observer).is_some()
    }

    pub fn current(&self) -> StatusNotice {
        lock(&self.current).clone()
    }

    pub fn pending_qr(&self) -> Option<PendingQr> {
        lock(&self.pending_qr).clone()
    }

    /// 累计发出的通知数（含无观察者时被丢弃的）
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    fn publish(&self, notice: StatusNotice) {
        tracing::debug!(status = ?notice.status, "{}", notice.log);
        *lock(&self.current) = notice.clone();
        self.emitted.fetch_add(1, Ordering::SeqCst);

        let mut observer = lock(&self.observer);
        let Some(obs) = observer.as_ref() else {
            return;
        };
        let delivered = notice
            .to_events()
            .into_iter()
            .all(|event| obs.tx.send(event).is_ok());
        if !delivered {
            // 对端已断开
            *observer = None;
        }
    }
}

const LOG_LOADING: &str = "Registering QR Code, please wait!";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
