//! 凭据存储抽象层
//!
//! 统一的凭据读写接口，支持内存和文件两种实现：启动时读取一次，每次凭据轮换时写入。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::credentials::SessionCredentials;

/// 凭据存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid credential part name: {0}")]
    InvalidPartName(String),

    #[error("Corrupt credential store: {0}")]
    Corrupt(String),
}

/// 凭据存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取已保存的凭据；从未保存过时返回 None
    async fn load(&self) -> Result<Option<SessionCredentials>, StoreError>;

    /// 按段合并写入
    async fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError>;

    /// 删除全部凭据（登出后需重新扫码）
    async fn clear(&self) -> Result<(), StoreError>;
}

/// 内存凭据存储（测试与一次性运行）
#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<Option<SessionCredentials>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: SessionCredentials) -> Self {
        Self {
            inner: RwLock::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<SessionCredentials>, StoreError> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .get_or_insert_with(SessionCredentials::new)
            .merge(credentials);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.inner.write().await = None;
        Ok(())
    }
}

/// 文件凭据存储：固定目录下每段一个文件，先写临时文件再 rename
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 段名直接作文件名，只允许 `[A-Za-z0-9._-]` 且不以 `.` 开头
    fn part_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StoreError::InvalidPartName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<SessionCredentials>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut credentials = SessionCredentials::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| StoreError::Corrupt(format!("non UTF-8 part name {:?}", n)))?;
            // 未完成的临时文件
            if name.starts_with('.') {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            credentials.insert(name, bytes);
        }

        if credentials.is_empty() {
            Ok(None)
        } else {
            Ok(Some(credentials))
        }
    }

    async fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for (name, bytes) in credentials.parts() {
            let path = self.part_path(name)?;
            let tmp = self.dir.join(format!(".{}.tmp", name));
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 创建凭据存储
///
/// 提供目录则使用文件存储；否则使用内存存储（进程退出即丢失，需重新扫码）
pub fn create_session_store(dir: Option<&Path>) -> Arc<dyn SessionStore> {
    match dir {
        Some(dir) => {
            tracing::info!("Using file credential store: {:?}", dir);
            Arc::new(FileSessionStore::new(dir))
        }
        None => {
            tracing::warn!("No credential directory configured, using in-memory store");
            Arc::new(MemorySessionStore::new())
        }
    }
}
