//! 连接状态机的状态与断开原因分类

use serde::Serialize;

/// 进程内唯一的连接状态，仅由 ConnectionSupervisor 修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    QrPending,
    Open,
    /// 主动关闭（进程退出）
    Closing,
    ClosedRetry,
    ClosedFatal,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::ClosedRetry | ConnectionState::ClosedFatal)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::QrPending => "qr-pending",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::ClosedRetry => "closed-retry",
            ConnectionState::ClosedFatal => "closed-fatal",
        };
        f.write_str(s)
    }
}

/// 传输层报告的断开原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionClosed,
    ConnectionLost,
    RestartRequired,
    TimedOut,
    LoggedOut,
    ConnectionReplaced,
    BadSession,
    /// 未识别的原因（原始状态码或描述）
    Unknown(String),
}

/// 断开原因的处置分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// 自动重连
    Transient,
    /// 已登出或会话损坏：需重新扫码
    FatalLogout,
    /// 被另一处登录顶替
    FatalReplaced,
    /// 未知原因按致命处理，不在未知条件上循环重连
    Unknown,
}

impl CloseClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloseClass::Transient)
    }
}

impl CloseReason {
    /// 由传输层数字状态码映射；408 同时对应 lost/timed-out，两者同属可重连
    pub fn from_status_code(code: u16) -> Self {
        match code {
            428 => CloseReason::ConnectionClosed,
            408 => CloseReason::TimedOut,
            515 => CloseReason::RestartRequired,
            401 => CloseReason::LoggedOut,
            440 => CloseReason::ConnectionReplaced,
            500 => CloseReason::BadSession,
            other => CloseReason::Unknown(other.to_string()),
        }
    }

    pub fn class(&self) -> CloseClass {
        match self {
            CloseReason::ConnectionClosed
            | CloseReason::ConnectionLost
            | CloseReason::RestartRequired
            | CloseReason::TimedOut => CloseClass::Transient,
            CloseReason::LoggedOut | CloseReason::BadSession => CloseClass::FatalLogout,
            CloseReason::ConnectionReplaced => CloseClass::FatalReplaced,
            CloseReason::Unknown(_) => CloseClass::Unknown,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ConnectionClosed => write!(f, "connection-closed"),
            CloseReason::ConnectionLost => write!(f, "connection-lost"),
            CloseReason::RestartRequired => write!(f, "restart-required"),
            CloseReason::TimedOut => write!(f, "timed-out"),
            CloseReason::LoggedOut => write!(f, "logged-out"),
            CloseReason::ConnectionReplaced => write!(f, "connection-replaced"),
            CloseReason::BadSession => write!(f, "bad-session"),
            CloseReason::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}
