//! `liveproof setup`: fetch and verify the detector model the daemon loads.

use anyhow::{bail, Context, Result};
use liveproof_models::{hex_digest, sha256_file_hex, ModelFile, MODELS};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Model directory when none is given.
///
/// `LIVEPROOF_MODEL_DIR` wins so the CLI and daemon agree. Otherwise root
/// gets `/var/lib/liveproof/models` and everyone else
/// `$XDG_DATA_HOME/liveproof/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LIVEPROOF_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    if is_root() {
        PathBuf::from("/var/lib/liveproof/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("liveproof/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Whether `path` already holds the expected bytes.
fn is_current(model: &ModelFile, path: &Path) -> bool {
    match sha256_file_hex(path) {
        Ok(digest) if digest.eq_ignore_ascii_case(model.sha256) => {
            println!("  {} already present (checksum ok)", model.name);
            true
        }
        Ok(_) => {
            println!("  {} exists but checksum differs, re-downloading", model.name);
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "existing model unreadable");
            println!("  {} exists but unreadable, re-downloading", model.name);
            false
        }
    }
}

/// Forwards writes to a file while hashing them and printing progress by
/// tenths of the expected length.
struct Tee<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
    expected: Option<u64>,
    decile: u64,
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        if let Some(len) = self.expected.filter(|&l| l > 0) {
            let pct = self.written * 100 / len;
            if pct / 10 > self.decile {
                self.decile = pct / 10;
                print!("  {pct}%\r");
                io::stdout().flush().ok();
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream `model` into `<dest>.part`, then rename into place once the
/// checksum matches.
fn download_model(model: &ModelFile, dest: &Path) -> Result<()> {
    let part = dest.with_extension("onnx.part");
    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;
    let expected = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let file = fs::File::create(&part)
        .with_context(|| format!("failed to create {}", part.display()))?;
    let mut tee = Tee {
        inner: BufWriter::new(file),
        hasher: Sha256::new(),
        written: 0,
        expected,
        decile: 0,
    };
    io::copy(&mut resp.into_body().into_reader(), &mut tee)
        .with_context(|| format!("download of {} interrupted", model.name))?;
    tee.flush()?;
    tracing::debug!(bytes = tee.written, model = model.name, "download finished");

    let digest = hex_digest(tee.hasher);
    if !digest.eq_ignore_ascii_case(model.sha256) {
        fs::remove_file(&part).ok();
        bail!(
            "checksum mismatch for {}: expected {}, got {}",
            model.name,
            model.sha256,
            digest
        );
    }
    println!("  checksum ok");

    fs::rename(&part, dest)
        .with_context(|| format!("failed to move {} into place", part.display()))?;
    Ok(())
}

pub fn run(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = model_dir.unwrap_or_else(default_model_dir);

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;

    for model in MODELS {
        let dest = dir.join(model.name);
        if dest.exists() && is_current(model, &dest) {
            skipped += 1;
            continue;
        }
        download_model(model, &dest)?;
        downloaded += 1;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }
    println!("Start the daemon with LIVEPROOF_MODEL_DIR={}", dir.display());

    Ok(())
}

/// `liveproof verify-models`: check every manifest file without downloading.
pub fn verify(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = model_dir.unwrap_or_else(default_model_dir);
    liveproof_models::verify_models_dir(&dir)
        .with_context(|| format!("model verification failed in {}", dir.display()))?;
    for model in MODELS {
        println!("  {} ok", model.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_current_rejects_wrong_checksum() {
        let dir = std::env::temp_dir().join(format!("liveproof-setup-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(MODELS[0].name);
        fs::write(&path, b"not a model").unwrap();

        assert!(!is_current(&MODELS[0], &path));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_tee_hashes_what_it_writes() {
        let mut tee = Tee {
            inner: Vec::new(),
            hasher: Sha256::new(),
            written: 0,
            expected: None,
            decile: 0,
        };
        io::copy(&mut &b"abc"[..], &mut tee).unwrap();
        assert_eq!(tee.inner, b"abc");
        assert_eq!(tee.written, 3);
        assert_eq!(
            hex_digest(tee.hasher),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_is_current_handles_missing_file() {
        let path = std::env::temp_dir().join("liveproof-setup-missing/det_10g.onnx");
        assert!(!is_current(&MODELS[0], &path));
    }
}
