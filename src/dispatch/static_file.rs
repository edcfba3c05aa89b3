use std::path::Path;

use tokio::fs::File;
use webparse::Response;

use crate::{ProtError, ProtResult, Body, FileAddress, NfsAddress};

/// 扩展名到 Content-Type 的常见映射
fn guess_content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("");
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// 静态文件后端: 打开文件按长度流出.
/// 目录穿越靠规范化路径校验, 目录本身按 404 处理.
pub async fn serve_file(address: &FileAddress) -> ProtResult<Response<Body>> {
    let path = Path::new(&address.path);
    if let Some(root) = &address.document_root {
        let canonical = tokio::fs::canonicalize(path).await.map_err(ProtError::IoError)?;
        let root = tokio::fs::canonicalize(root).await.map_err(ProtError::IoError)?;
        if !canonical.starts_with(&root) {
            return Err(ProtError::Forbidden("path escapes document root"));
        }
    }

    let file = File::open(path).await.map_err(ProtError::IoError)?;
    let metadata = file.metadata().await.map_err(ProtError::IoError)?;
    if metadata.is_dir() {
        return Err(ProtError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "is a directory",
        )));
    }
    let length = metadata.len();

    let content_type = address
        .content_type
        .clone()
        .unwrap_or_else(|| guess_content_type(&address.path).to_string());

    let response = Response::builder()
        .status(200)
        .header("Content-Type", content_type)
        .header("Content-Length", length.to_string())
        .body(Body::new_file(file, length))
        .map_err(|e| ProtError::from(e))?;
    Ok(response)
}

/// NFS 地址: 经本机挂载点当普通文件读
pub async fn serve_nfs(address: &NfsAddress) -> ProtResult<Response<Body>> {
    let file_address = FileAddress {
        path: format!("{}{}", address.export, address.path),
        content_type: None,
        document_root: Some(address.export.clone()),
    };
    serve_file(&file_address).await
}
