//! Presentation to PDF conversion through the external headless converter.
//!
//! Each invocation gets a disposable user-profile directory so parallel
//! conversions cannot clobber each other's lock files. The wall clock is
//! bounded: on timeout the whole process tree is killed, not just the
//! direct child (the converter forks helpers).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::error::ErrorCode;

/// How much captured stderr to keep in error messages.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("conversion timed out after {timeout_sec}s")]
    Timeout { timeout_sec: u64 },
    #[error("converter exited with status {status}: {stderr_tail}")]
    Failed { status: i32, stderr_tail: String },
    #[error("converter exited cleanly but produced no PDF at {path}")]
    MissingOutput { path: PathBuf },
    #[error("failed to launch converter '{bin}': {source}")]
    Spawn {
        bin: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::PdfConvertTimeout,
            _ => ErrorCode::PdfConvertFail,
        }
    }
}

/// Wrapper around the headless office converter binary.
#[derive(Debug, Clone)]
pub struct PdfConverter {
    bin: PathBuf,
    timeout: Duration,
}

impl PdfConverter {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// Convert one presentation into a PDF at `out_pdf`, within the
    /// configured timeout. The converter writes `<stem>.pdf` into a scratch
    /// outdir; on success that file is renamed atomically onto `out_pdf`.
    pub async fn convert(&self, pptx: &Path, out_pdf: &Path) -> Result<(), ConvertError> {
        let profile = tempfile::Builder::new()
            .prefix("sm-soffice-profile-")
            .tempdir()?;
        let outdir = tempfile::Builder::new().prefix("sm-soffice-out-").tempdir()?;

        let mut command = Command::new(&self.bin);
        command
            .arg("--headless")
            .arg("--invisible")
            .arg("--norestore")
            .arg(format!(
                "-env:UserInstallation=file://{}",
                profile.path().display()
            ))
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(outdir.path())
            .arg(pptx)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let mut child = command.spawn().map_err(|source| ConvertError::Spawn {
            bin: self.bin.display().to_string(),
            source,
        })?;
        let pid = child.id();

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(
                    pptx = %pptx.display(),
                    timeout_sec = self.timeout.as_secs(),
                    "conversion timed out, killing process tree"
                );
                kill_process_tree(pid, &mut child).await;
                return Err(ConvertError::Timeout {
                    timeout_sec: self.timeout.as_secs(),
                });
            }
        };

        let stderr_buf = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(ConvertError::Failed {
                status: status.code().unwrap_or(-1),
                stderr_tail: tail(&stderr_buf),
            });
        }

        let stem = pptx
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let produced = outdir.path().join(format!("{stem}.pdf"));
        if !produced.exists() {
            return Err(ConvertError::MissingOutput { path: produced });
        }

        if let Some(parent) = out_pdf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(&produced, out_pdf).is_err() {
            // Rename across filesystems (tempdir on tmpfs): copy, then drop
            // the scratch copy with the tempdir.
            std::fs::copy(&produced, out_pdf)?;
        }
        tracing::debug!(pptx = %pptx.display(), pdf = %out_pdf.display(), "converted");
        Ok(())
    }
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    // New session so a timeout can SIGKILL the whole tree by group id.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

async fn kill_process_tree(pid: Option<u32>, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let start = text.len() - STDERR_TAIL_BYTES;
    // Stay on a char boundary.
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(start);
    text[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    /// Drop a fake converter script into a tempdir and return its path.
    fn fake_converter(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-soffice.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Script that honors `--outdir` and writes `<stem>.pdf` there.
    const SUCCESS_BODY: &str = r#"
outdir=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--outdir" ]; then outdir="$arg"; fi
  prev="$arg"
  last="$arg"
done
stem=$(basename "$last" .pptx)
printf '%%PDF-1.4 fake' > "$outdir/$stem.pdf"
"#;

    #[tokio::test]
    async fn test_successful_conversion_renames_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_converter(dir.path(), SUCCESS_BODY);
        let pptx = dir.path().join("deck.pptx");
        std::fs::write(&pptx, b"fake pptx").unwrap();
        let out = dir.path().join("out").join("deck.pdf");

        let converter = PdfConverter::new(&bin, Duration::from_secs(10));
        converter.convert(&pptx, &out).await.unwrap();

        let content = std::fs::read(&out).unwrap();
        assert!(content.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_converter(dir.path(), "echo 'soffice: cannot open display' >&2\nexit 77");
        let pptx = dir.path().join("deck.pptx");
        std::fs::write(&pptx, b"fake pptx").unwrap();

        let converter = PdfConverter::new(&bin, Duration::from_secs(10));
        let err = converter
            .convert(&pptx, &dir.path().join("deck.pdf"))
            .await
            .unwrap_err();
        match err {
            ConvertError::Failed {
                status,
                stderr_tail,
            } => {
                assert_eq!(status, 77);
                assert!(stderr_tail.contains("cannot open display"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            ConvertError::Failed {
                status: 77,
                stderr_tail: String::new()
            }
            .code(),
            ErrorCode::PdfConvertFail
        );
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_converter(dir.path(), "exit 0");
        let pptx = dir.path().join("deck.pptx");
        std::fs::write(&pptx, b"fake pptx").unwrap();

        let converter = PdfConverter::new(&bin, Duration::from_secs(10));
        let err = converter
            .convert(&pptx, &dir.path().join("deck.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_hung_converter() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_converter(dir.path(), "sleep 600");
        let pptx = dir.path().join("deck.pptx");
        std::fs::write(&pptx, b"fake pptx").unwrap();

        let converter = PdfConverter::new(&bin, Duration::from_millis(300));
        let started = Instant::now();
        let err = converter
            .convert(&pptx, &dir.path().join("deck.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Timeout { .. }));
        assert_eq!(err.code(), ErrorCode::PdfConvertTimeout);
        // The kill is immediate; we must not have waited for the sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let pptx = dir.path().join("deck.pptx");
        std::fs::write(&pptx, b"fake pptx").unwrap();
        let converter = PdfConverter::new("/nonexistent/soffice-bin", Duration::from_secs(1));
        let err = converter
            .convert(&pptx, &dir.path().join("deck.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Spawn { .. }));
    }
}
