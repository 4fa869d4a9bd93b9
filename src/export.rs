//! 將已簽署的憑證匯出到目錄，並回報每個檔案的 SHA-256。

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use openssl::sha::sha256;
use thiserror::Error;
use tracing::warn;

use crate::{
    acme::{AcmeClient, AcmeError, Certificate, ExportForm},
    report::{Outcome, Phase, Reporter},
};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Export directory {0} does not exist")]
    TargetMissing(PathBuf),
    #[error("Vault has no filesystem root, an export directory is required")]
    NoVaultRoot,
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, ExportError>;

/// 一個匯出的檔案。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub path: PathBuf,
    /// 大寫十六進位。
    pub sha256: String,
}

pub struct Exporter<'a> {
    acme: &'a dyn AcmeClient,
    reporter: &'a dyn Reporter,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 檔案內容的 SHA-256（大寫十六進位）。
pub fn checksum(path: &Path) -> Result<String> {
    let data = fs::read(path).map_err(io_err(path))?;
    Ok(hex::encode_upper(sha256(&data)))
}

impl<'a> Exporter<'a> {
    pub fn new(acme: &'a dyn AcmeClient, reporter: &'a dyn Reporter) -> Self {
        Self { acme, reporter }
    }

    /// 匯出七種形式並合成 `<alias>-combined.pem`（私鑰、憑證、簽發者憑證）。
    ///
    /// 指定的 `target_dir` 必須已存在；未指定時使用 `<vault root>/export/<alias>`，
    /// 不存在會自動建立。七種形式一律覆寫，合成檔只在 `overwrite` 時覆寫。
    pub fn export(
        &self,
        certificate: &Certificate,
        target_dir: Option<&Path>,
        overwrite: bool,
    ) -> Result<Vec<ExportedFile>> {
        let alias = certificate.alias.as_str();
        let dir = match target_dir {
            Some(dir) if dir.is_dir() => dir.to_path_buf(),
            Some(dir) => return Err(ExportError::TargetMissing(dir.to_path_buf())),
            None => {
                let dir = self
                    .acme
                    .root_dir()
                    .ok_or(ExportError::NoVaultRoot)?
                    .join("export")
                    .join(alias);
                fs::create_dir_all(&dir).map_err(io_err(&dir))?;
                dir
            }
        };

        let mut files = Vec::with_capacity(ExportForm::ALL.len() + 1);
        for form in ExportForm::ALL {
            let path = dir.join(form.file_name(alias));
            self.acme.export_certificate(alias, form, &path)?;
            files.push(self.exported(path)?);
        }

        let combined = dir.join(format!("{}-combined.pem", alias));
        if combined.exists() && !overwrite {
            warn!(path = %combined.display(), "Combined file exists, keeping it");
            self.reporter.record(
                Phase::Export,
                &combined.to_string_lossy(),
                Outcome::Skipped,
                "exists, use --overwrite to replace",
            );
        } else {
            let mut content = Vec::new();
            for form in [ExportForm::PrivateKeyPem, ExportForm::CertificatePem, ExportForm::IssuerPem] {
                let part = dir.join(form.file_name(alias));
                let mut data = fs::read(&part).map_err(io_err(&part))?;
                if !data.ends_with(b"\n") {
                    data.push(b'\n');
                }
                content.extend(data);
            }
            fs::write(&combined, content).map_err(io_err(&combined))?;
        }
        files.push(self.exported(combined)?);
        Ok(files)
    }

    fn exported(&self, path: PathBuf) -> Result<ExportedFile> {
        let sha256 = checksum(&path)?;
        self.reporter.record(
            Phase::Export,
            &path.to_string_lossy(),
            Outcome::Succeeded,
            &format!("sha256 {}", sha256),
        );
        Ok(ExportedFile { path, sha256 })
    }
}
