use crate::ResourceAddress;

use super::{WidgetRef, WidgetTree};

/// 模板里 URI 属性的重写方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// 浏览器直连部件后端, 仅限 HTTP 地址
    Direct,
    /// 经代理回来并把该部件设为焦点
    Focus,
    /// 经代理回来, 保持当前焦点
    Partial,
    /// 经代理取部件的原始输出
    Proxy,
    /// Partial 的分主机变体, 部件映射到独立主机名
    Partition,
    /// 用部件响应里的地址原样输出
    Response,
}

impl RewriteMode {
    pub fn parse(value: &str) -> Option<RewriteMode> {
        match value {
            "direct" => Some(RewriteMode::Direct),
            "focus" => Some(RewriteMode::Focus),
            "partial" => Some(RewriteMode::Partial),
            "proxy" => Some(RewriteMode::Proxy),
            "partition" => Some(RewriteMode::Partition),
            "response" => Some(RewriteMode::Response),
            _ => None,
        }
    }
}

/// 重写所需的请求环境
#[derive(Debug, Clone, Default)]
pub struct RewriteEnv {
    /// 外部可见的请求路径
    pub external_uri: String,
    /// 透传的参数串
    pub args: Option<String>,
    /// Partition 模式的分区域名
    pub partition_domain: Option<String>,
    /// 会话保持: 追加部件的 path_info
    pub stateful: bool,
}

fn escape_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// 相对地址并到 http 后端的绝对形式
fn widget_absolute_uri(address: &ResourceAddress, value: &str) -> Option<String> {
    match address {
        ResourceAddress::Http(http) => {
            let host = http.host_header.clone().unwrap_or_else(|| http.address.clone());
            let path = if value.starts_with('/') {
                value.to_string()
            } else {
                let base = match http.path.rfind('/') {
                    Some(pos) => &http.path[..pos + 1],
                    None => "/",
                };
                format!("{}{}", base, value)
            };
            Some(format!("http://{}{}", host, path))
        }
        _ => None,
    }
}

/// 浏览器回到代理的地址: 外部路径带上焦点与相对路径参数
fn widget_external_uri(
    env: &RewriteEnv,
    widget_path: &str,
    value: &str,
    frame: Option<&str>,
    raw: bool,
) -> String {
    let mut uri = format!(
        "{}?focus={}&path={}",
        env.external_uri,
        escape_query(widget_path),
        escape_query(value)
    );
    if let Some(frame) = frame {
        uri.push_str("&frame=");
        uri.push_str(&escape_query(frame));
    }
    if raw {
        uri.push_str("&raw=1");
    }
    if let Some(args) = &env.args {
        uri.push_str("&args=");
        uri.push_str(&escape_query(args));
    }
    uri
}

/// 把主机名换成部件的分区主机
fn uri_replace_hostname(uri: &str, hostname: &str) -> String {
    if uri.starts_with('/') {
        return format!("http://{}{}", hostname, uri);
    }
    match uri.find("://") {
        Some(pos) => {
            let start = pos + 3;
            let end = uri[start..]
                .find(|c| c == ':' || c == '/')
                .map(|p| start + p)
                .unwrap_or(uri.len());
            format!("{}{}{}", &uri[..start], hostname, &uri[end..])
        }
        None => uri.to_string(),
    }
}

/// 重写模板里的一个部件相对地址, 规则不适用时返回 None(原样保留)
pub fn rewrite_widget_uri(
    env: &RewriteEnv,
    tree: &WidgetTree,
    widget: WidgetRef,
    mode: RewriteMode,
    value: &str,
) -> Option<String> {
    let node = tree.get(widget);
    let class = node.class.as_ref()?;
    let widget_path = tree.path(widget);

    let mut value = value.to_string();
    if env.stateful {
        if let Some(path_info) = &node.path_info {
            if value.is_empty() {
                value = path_info.clone();
            }
        }
    }

    match mode {
        RewriteMode::Direct => widget_absolute_uri(&class.address, &value),
        RewriteMode::Response => Some(value),
        RewriteMode::Focus => {
            let frame = tree.current_frame(widget);
            Some(widget_external_uri(
                env,
                &widget_path,
                &value,
                frame.as_deref(),
                false,
            ))
        }
        RewriteMode::Partial => Some(widget_external_uri(
            env,
            &widget_path,
            &value,
            Some(&widget_path),
            false,
        )),
        RewriteMode::Proxy => Some(widget_external_uri(
            env,
            &widget_path,
            &value,
            Some(&widget_path),
            true,
        )),
        RewriteMode::Partition => {
            let uri = widget_external_uri(env, &widget_path, &value, Some(&widget_path), false);
            match &env.partition_domain {
                Some(domain) => {
                    let hostname = format!("{}.{}", widget_path.replace('/', "-"), domain);
                    Some(uri_replace_hostname(&uri, &hostname))
                }
                None => Some(uri),
            }
        }
    }
}
