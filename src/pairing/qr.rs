//! 配对码渲染：字符串 -> 可直接放进 `<img src>` 的 data URI

use base64::{engine::general_purpose::STANDARD, Engine as _};
use qrcode::render::svg;
use qrcode::QrCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QrRenderError {
    #[error("QR encode failed: {0}")]
    Encode(#[from] qrcode::types::QrError),
}

/// 配对码图片编码器
pub trait QrEncoder: Send + Sync {
    fn encode(&self, code: &str) -> Result<String, QrRenderError>;
}

/// SVG 编码器，输出 `data:image/svg+xml;base64,...`
#[derive(Debug, Clone)]
pub struct SvgQrEncoder {
    min_size: u32,
}

impl SvgQrEncoder {
    pub fn new(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl Default for SvgQrEncoder {
    fn default() -> Self {
        Self::new(264)
    }
}

impl QrEncoder for SvgQrEncoder {
    fn encode(&self, code: &str) -> Result<String, QrRenderError> {
        let qr = QrCode::new(code.as_bytes())?;
        let image = qr
            .render::<svg::Color>()
            .min_dimensions(self.min_size, self.min_size)
            .build();
        Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
    }
}
