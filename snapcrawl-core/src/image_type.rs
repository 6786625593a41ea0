//! 支持的图片扩展名与 MIME 类型，以及图片校验协作方（bytes → 宽/高/格式）。

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

/// 内置支持的图片扩展名（小写，不含点号）。
const BUILTIN_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// 扩展名到 MIME 的映射。
const EXT_MIME: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
];

static MIME_BY_EXT: OnceLock<HashMap<String, String>> = OnceLock::new();

fn mime_by_ext_map() -> &'static HashMap<String, String> {
    MIME_BY_EXT.get_or_init(|| {
        EXT_MIME
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    })
}

/// 判断扩展名是否为支持的图片类型。`ext` 可含点号，大小写不敏感。
#[inline]
pub fn is_supported_image_ext(ext: &str) -> bool {
    let e = ext.trim().trim_start_matches('.').to_lowercase();
    !e.is_empty() && BUILTIN_IMAGE_EXTENSIONS.contains(&e.as_str())
}

fn supported_mime_types() -> HashSet<String> {
    mime_by_ext_map().values().map(|m| m.to_lowercase()).collect()
}

/// 根据本地路径判断是否为支持的图片：先看扩展名，再按文件内容用 infer 推断。
/// infer 推断出的类型也必须在支持列表中才视为图片。
pub fn is_image_by_path(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if is_supported_image_ext(ext) {
        return true;
    }
    if let Ok(Some(kind)) = infer::get_from_path(path) {
        let mime = kind.mime_type().to_lowercase();
        if supported_mime_types().contains(&mime) {
            return true;
        }
    }
    false
}

/// 判断 URL 是否以支持的图片扩展名结尾。
pub fn url_has_image_extension(url: &str) -> bool {
    let url_lower = url.to_lowercase();
    let path_end = url_lower
        .find(['?', '#'])
        .map(|i| &url_lower[..i])
        .unwrap_or(&url_lower);
    match path_end.rfind('.') {
        Some(dot) => is_supported_image_ext(path_end[dot + 1..].trim()),
        None => false,
    }
}

/// 返回支持的图片扩展名列表。
pub fn supported_image_extensions() -> Vec<String> {
    let mut out: Vec<String> = BUILTIN_IMAGE_EXTENSIONS
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    out.sort();
    out
}

/// 默认图片扩展名（无扩展名时的 fallback）。
pub fn default_image_extension() -> &'static str {
    "jpg"
}

/// 校验得到的图片元信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    /// 规范化扩展名（小写，不含点），如 "jpg"、"png"。
    pub format: String,
}

/// 图片校验协作方：bytes → {width, height, format}，可选重编码。
pub trait ImageInspector: Send + Sync {
    fn inspect(&self, bytes: &[u8]) -> Result<ImageMeta, String>;

    /// 重编码为 JPEG（quality 1-100）。默认实现返回不支持。
    fn reencode_jpeg(&self, _bytes: &[u8], _quality: u8) -> Result<Vec<u8>, String> {
        Err("re-encode not supported by this inspector".to_string())
    }
}

/// 基于 image crate 的默认实现。
pub struct DefaultInspector;

impl ImageInspector for DefaultInspector {
    fn inspect(&self, bytes: &[u8]) -> Result<ImageMeta, String> {
        let format = image::guess_format(bytes)
            .map_err(|e| format!("无法识别图片格式: {}", e))?;
        let ext = format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or(default_image_extension());
        let img = image::load_from_memory(bytes).map_err(|e| format!("图片解码失败: {}", e))?;
        Ok(ImageMeta {
            width: img.width(),
            height: img.height(),
            format: normalize_format_ext(ext),
        })
    }

    fn reencode_jpeg(&self, bytes: &[u8], quality: u8) -> Result<Vec<u8>, String> {
        let img = image::load_from_memory(bytes).map_err(|e| format!("图片解码失败: {}", e))?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageOutputFormat::Jpeg(quality.clamp(1, 100)))
            .map_err(|e| format!("JPEG 重编码失败: {}", e))?;
        Ok(out.into_inner())
    }
}

/// image crate 返回的扩展名规范化（"jpeg" 仍保留为 "jpeg"，但与允许列表比较时
/// jpg/jpeg 视为同类）。
fn normalize_format_ext(ext: &str) -> String {
    ext.trim().to_lowercase()
}

/// 格式是否在允许列表内；空列表表示使用内置支持列表。jpg 与 jpeg 等价。
pub fn format_allowed(format: &str, allowed: &[String]) -> bool {
    let f = format.trim().to_lowercase();
    let eq = |a: &str, b: &str| a == b || (matches!(a, "jpg" | "jpeg") && matches!(b, "jpg" | "jpeg"));
    if allowed.is_empty() {
        return BUILTIN_IMAGE_EXTENSIONS.iter().any(|x| eq(x, &f));
    }
    allowed.iter().any(|a| eq(&a.trim().to_lowercase(), &f))
}
