//! 持久化协作方：bytes + 目标目录 + 文件名 → 最终路径（必要时创建目录）。
//! 文件名安全化与去重命名逻辑集中在这里，下载管线只负责拼出提示名。

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const MAX_SAFE_FILENAME_LEN: usize = 180;

pub fn short_hash8(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    full.chars().take(8).collect()
}

pub fn clamp_ascii_len(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    // 安全截断：避免切在多字节字符中间
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub fn is_windows_reserved_device_name(stem: &str) -> bool {
    let u = stem
        .trim()
        .trim_end_matches([' ', '.'])
        .to_ascii_uppercase();
    if matches!(u.as_str(), "CON" | "PRN" | "AUX" | "NUL") {
        return true;
    }
    if (u.starts_with("COM") || u.starts_with("LPT")) && u.len() == 4 {
        return matches!(
            u.chars().nth(3),
            Some('1' | '2' | '3' | '4' | '5' | '6' | '7' | '8' | '9')
        );
    }
    false
}

pub fn sanitize_stem_for_filename(stem: &str) -> String {
    let mut out: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    while out.contains("  ") {
        out = out.replace("  ", " ");
    }

    let out = out.trim().trim_end_matches([' ', '.']).to_string();

    let mut out = if out.is_empty() {
        "image".to_string()
    } else {
        out
    };
    if is_windows_reserved_device_name(&out) {
        out = format!("_{}", out);
    }
    out
}

pub fn normalize_ext(ext: &str, fallback_ext: &str) -> String {
    let e = ext.trim().trim_start_matches('.').trim();
    let e = if e.is_empty() { fallback_ext.trim() } else { e };
    let e = e.trim().trim_start_matches('.').trim();
    if e.is_empty() {
        crate::image_type::default_image_extension().to_string()
    } else {
        e.to_ascii_lowercase()
    }
}

/// 由提示名 + fallback 扩展名 + 哈希源构造安全文件名：
/// `<sanitized-stem>-<hash8>.<ext>`，总长不超过 [MAX_SAFE_FILENAME_LEN]。
pub fn build_safe_filename(hint_filename: &str, fallback_ext: &str, hash_source: &str) -> String {
    let path = Path::new(hint_filename);
    let raw_stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let raw_ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let ext = normalize_ext(raw_ext, fallback_ext);
    let stem = sanitize_stem_for_filename(raw_stem);
    let h = short_hash8(hash_source);
    let suffix = format!("-{}", h);

    let reserve = suffix.len() + 1 + ext.len();
    let stem_max = MAX_SAFE_FILENAME_LEN.saturating_sub(reserve).max(1);
    let stem_final = clamp_ascii_len(&stem, stem_max);

    format!("{}{}.{}", stem_final, suffix, ext)
}

/// 目标已存在时追加 `(n)` 直到可用。
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let mut candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let mut idx = 1;
    loop {
        let suffix = format!("({})", idx);
        let (stem_max, ext_part) = if ext.is_empty() {
            (
                MAX_SAFE_FILENAME_LEN.saturating_sub(suffix.len()).max(1),
                String::new(),
            )
        } else {
            (
                MAX_SAFE_FILENAME_LEN
                    .saturating_sub(suffix.len() + 1 + ext.len())
                    .max(1),
                format!(".{}", ext),
            )
        };
        let stem_final = clamp_ascii_len(stem, stem_max);
        let new_name = format!("{}{}{}", stem_final, suffix, ext_part);
        candidate = dir.join(&new_name);
        if !candidate.exists() {
            return candidate;
        }
        idx += 1;
    }
}

/// 持久化协作方接口。
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// 将 bytes 写为 dir 下名为 filename 的文件（冲突时自动改名），返回最终路径。
    /// 写入必须是一次性的——失败时不能留下半写的文件。
    async fn persist(&self, bytes: &[u8], dir: &Path, filename: &str) -> Result<PathBuf, String>;
}

/// 文件系统实现：先全量写临时名再原子改名，避免半写文件。
pub struct FsImageSink;

#[async_trait]
impl ImageSink for FsImageSink {
    async fn persist(&self, bytes: &[u8], dir: &Path, filename: &str) -> Result<PathBuf, String> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("Failed to create output directory: {}", e))?;
        let dest = unique_path(dir, filename);
        let tmp = dest.with_extension(format!(
            "{}.part",
            dest.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));

        let mut file = tokio::fs::File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await
            .map_err(|e| format!("Failed to create file: {}", e))?;
        if let Err(e) = file.write_all(bytes).await {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(format!("Failed to write file: {}", e));
        }
        drop(file);
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| format!("Failed to finalize file: {}", e))?;
        Ok(dest)
    }
}
