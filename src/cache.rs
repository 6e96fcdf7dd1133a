use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

/// 快取操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Cache miss: {0}")]
    Miss(String),
}

/// 快取操作的結果類型，封裝 [`CacheError`]。
pub type Result<T> = std::result::Result<T, CacheError>;

/// 憑證管理器使用的持久化介面。
///
/// key 為不含路徑分隔符的平面字串，例如網域名稱或 `acme_account+key`。
/// 不存在的 key 一律回傳 [`CacheError::Miss`]。
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容。
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// 寫入（或覆寫）指定 key 的內容。
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// 刪除指定 key；key 不存在時視為成功。
    async fn delete(&self, key: &str) -> Result<()>;
}

/// 檢查 key 是否可安全地對應到單一檔名。
fn verify_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("Empty key".to_string()));
    }
    if key == "." || key == ".." {
        return Err(CacheError::InvalidKey(format!(
            "Relative path key not allowed: {}",
            key
        )));
    }
    if key
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '\0' | '\n' | '\r'))
    {
        return Err(CacheError::InvalidKey(format!(
            "Invalid characters in key: {:?}",
            key
        )));
    }
    Ok(())
}

/// 以目錄為基礎的快取，每個 key 對應目錄下的一個檔案。
///
/// 目錄在第一次寫入時建立（權限 0700），檔案以暫存檔加 rename 的方式原子寫入（權限 0600）。
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirCache { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        verify_key(key)?;
        Ok(self.dir.join(key))
    }

    async fn ensure_dir(&self) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.dir).await?;
        Ok(())
    }
}

#[async_trait]
impl Cache for DirCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::Miss(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        self.ensure_dir().await?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let temp_path = self.dir.join(format!(".{}.{}.tmp", key, nanos));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            use tokio::io::AsyncWriteExt;
            let mut file = options.open(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 基於記憶體的快取實作，主要供測試使用。
#[derive(Debug, Default, Clone)]
pub struct MemCache {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前儲存的 key 數量。
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl Cache for MemCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        verify_key(key)?;
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::Miss(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        verify_key(key)?;
        self.data.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        verify_key(key)?;
        self.data.write().remove(key);
        Ok(())
    }
}
