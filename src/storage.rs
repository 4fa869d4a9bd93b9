use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Key is a dir: {0}")]
    IsDir(String),
    #[error("Not a directory: {0}")]
    NotDirectory(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 保險庫（vault）所需的儲存 API。
///
/// key 一律為以 `/` 分隔的相對路徑，例如 `acct-1/identifiers/www-example-com.json`。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 所對應檔案的內容。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 將資料寫入指定 key 所對應的檔案中，父目錄會自動建立。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 檢查指定 key 是否存在。
    fn exists(&self, key: &str) -> Result<bool>;

    /// 列出目錄 key 底下的檔案名稱（不含子目錄），順序由底層決定。
    ///
    /// 目錄不存在時回傳空列表。
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// 若儲存位於檔案系統上，回傳其根目錄。
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// 私有工具，提供 key 正規化與驗證等輔助函式。
struct KeyUtils;

impl KeyUtils {
    /// 將 key 正規化為相對路徑，拒絕空 key、控制字元以及跳出根目錄的 `..`。
    fn normalize(key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        let mut normalized = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StorageError::InvalidKey(format!(
                            "Cannot use '..' to escape root directory: {}",
                            key
                        )));
                    }
                }
                Component::Normal(name) => match name.to_str() {
                    Some(name) if !name.contains('\\') => normalized.push(name),
                    _ => {
                        return Err(StorageError::InvalidKey(format!(
                            "Invalid path component in: {}",
                            key
                        )))
                    }
                },
                Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)))
                }
            }
        }
        Ok(normalized)
    }

    /// 驗證檔案 key，不可以斜線結尾，也不可正規化為空。
    fn verify_file_key(key: &str) -> Result<PathBuf> {
        if key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "File key cannot end with '/': {}",
                key
            )));
        }
        let path = Self::normalize(key)?;
        if path.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(format!("Empty file key: {}", key)));
        }
        Ok(path)
    }
}

/// 以目錄樹為基礎的儲存實作，每個 key 對應根目錄下的一個實體檔案。
///
/// 匯出功能會在同一根目錄下建立預設輸出目錄，因此採用可直接瀏覽的檔案佈局。
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// 開啟（必要時建立）位於 `root` 的儲存目錄。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(StorageError::NotDirectory(
                root.to_string_lossy().into_owned(),
            ));
        }
        Self::create_private_dir(&root)?;
        Ok(Self { root })
    }

    fn create_private_dir(path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(path)?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

impl Storage for FileStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(&KeyUtils::verify_file_key(key)?);
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let relative = KeyUtils::verify_file_key(key)?;
        let path = self.resolve(&relative);
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        if let Some(parent) = path.parent() {
            if parent.exists() && !parent.is_dir() {
                return Err(StorageError::NotDirectory(
                    parent.to_string_lossy().into_owned(),
                ));
            }
            Self::create_private_dir(parent)?;
        }

        // 先寫入暫存檔再改名，避免中途中斷留下半份資料
        let temp_path = path.with_extension("partial");
        {
            let mut file = {
                let mut options = fs::OpenOptions::new();
                options.write(true).create(true).truncate(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                options.open(&temp_path)?
            };
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(&KeyUtils::normalize(key)?).exists())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.resolve(&KeyUtils::normalize(dir)?);
        if !path.exists() {
            return Ok(Vec::new());
        }
        if !path.is_dir() {
            return Err(StorageError::NotDirectory(dir.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.ends_with(".partial") {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// 基於記憶體的儲存實作，主要用於測試。
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    data: Arc<RwLock<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MemStorage {
    /// 建立一個空的記憶體儲存實例。
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = KeyUtils::verify_file_key(key)?;
        self.data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::verify_file_key(key)?;
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        // 父路徑不可已是檔案
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if !dir.as_os_str().is_empty() && data.contains_key(dir) {
                return Err(StorageError::NotDirectory(
                    dir.to_string_lossy().into_owned(),
                ));
            }
            parent = dir.parent();
        }
        if data.keys().any(|k| k != &path && k.starts_with(&path)) {
            return Err(StorageError::IsDir(key.to_string()));
        }
        data.insert(path, value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = KeyUtils::normalize(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .keys()
            .any(|k| k.starts_with(&path)))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = KeyUtils::normalize(dir)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .keys()
            .filter(|k| k.parent() == Some(path.as_path()))
            .filter_map(|k| k.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect())
    }
}
