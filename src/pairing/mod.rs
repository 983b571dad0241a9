//! 配对状态：配对码渲染、运维通知与单观察者广播

mod broadcaster;
mod event;
mod qr;

pub use broadcaster::{ObserverId, PairingBroadcaster, PendingQr, StatusAssets};
pub use event::{OperatorEvent, PairingStatus, StatusNotice};
pub use qr::{QrEncoder, QrRenderError, SvgQrEncoder};
