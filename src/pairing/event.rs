//! 运维通道协议：状态通知与线上事件帧
//!
//! 线上帧为 JSON 文本：`{"event":"qr","data":"data:image/svg+xml;base64,..."}`、
//! `{"event":"qrstatus","data":"./assets/check.svg"}`、`{"event":"log","data":"..."}`。

use serde::{Deserialize, Serialize};

/// 服务端 -> 运维页面的事件帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum OperatorEvent {
    /// 配对码图片 data URI
    Qr(String),
    /// 状态图标资源路径
    QrStatus(String),
    Log(String),
}

/// 面向运维的状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    Loading,
    Qr,
    Connected,
    /// 本次运行中扫码后首次连上（与普通重连成功区分显示）
    Paired,
    Reconnecting,
    Fatal,
}

/// 一次状态进入对应的一条通知：标签 + 载荷 + 日志文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNotice {
    pub status: PairingStatus,
    /// qr 为图片 data URI，其余为静态资源路径；fatal 为空
    pub payload: String,
    pub log: String,
}

impl StatusNotice {
    /// 展开为线上帧
    pub fn to_events(&self) -> Vec<OperatorEvent> {
        let mut events = Vec::with_capacity(2);
        match self.status {
            PairingStatus::Qr => events.push(OperatorEvent::Qr(self.payload.clone())),
            PairingStatus::Fatal => {}
            _ => events.push(OperatorEvent::QrStatus(self.payload.clone())),
        }
        events.push(OperatorEvent::Log(self.log.clone()));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&OperatorEvent::QrStatus("./assets/check.svg".into())).unwrap();
        assert_eq!(json, r#"{"event":"qrstatus","data":"./assets/check.svg"}"#);
        let json = serde_json::to_string(&OperatorEvent::Log("hi".into())).unwrap();
        assert_eq!(json, r#"{"event":"log","data":"hi"}"#);
    }

    #[test]
    fn test_fatal_notice_is_log_only() {
        let notice = StatusNotice {
            status: PairingStatus::Fatal,
            payload: String::new(),
            log: "logged out".into(),
        };
        assert_eq!(notice.to_events(), vec![OperatorEvent::Log("logged out".into())]);
    }
}
