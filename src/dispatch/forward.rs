use webparse::{HeaderMap, Response};

use crate::{Body, ForwardMode, ForwardSettings};

/// 头部所属的转发分组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderGroup {
    Capabilities,
    Cookie,
    Identity,
    Cors,
    Secure,
    Other,
}

/// 逐跳头永远不转发
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

fn group_of(name: &str) -> HeaderGroup {
    match name {
        "accept" | "accept-charset" | "accept-encoding" | "accept-language" | "user-agent" => {
            HeaderGroup::Capabilities
        }
        "cookie" | "cookie2" | "set-cookie" | "set-cookie2" => HeaderGroup::Cookie,
        "x-forwarded-for" | "via" | "x-real-ip" | "from" => HeaderGroup::Identity,
        "origin" => HeaderGroup::Cors,
        name if name.starts_with("access-control-") => HeaderGroup::Cors,
        "authorization" | "www-authenticate" | "proxy-authenticate" => HeaderGroup::Secure,
        _ => HeaderGroup::Other,
    }
}

fn mode_for(settings: &ForwardSettings, group: HeaderGroup) -> ForwardMode {
    match group {
        HeaderGroup::Capabilities => settings.capabilities,
        HeaderGroup::Cookie => settings.cookie,
        HeaderGroup::Identity => settings.identity,
        HeaderGroup::Cors => settings.cors,
        HeaderGroup::Secure => settings.secure,
        HeaderGroup::Other => settings.other,
    }
}

/// 把客户端请求头按分组策略整理成后端请求头.
/// Mangle 的身份组会追加本代理的 X-Forwarded-For 与 Via;
/// cookie 组的 Mangle 把网关自己的会话 cookie 摘掉.
pub fn forward_request_headers(
    settings: &ForwardSettings,
    headers: &HeaderMap,
    client_ip: Option<&str>,
    trusted_client: bool,
    session_cookie_name: &str,
) -> Vec<(String, String)> {
    let mut out = vec![];
    let mut seen_xff: Option<String> = None;
    let mut seen_via: Option<String> = None;

    for (name, value) in headers.iter() {
        let lower = name.to_string().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || lower == "host" {
            continue;
        }
        let group = group_of(&lower);
        let mode = mode_for(settings, group);
        match mode {
            ForwardMode::No => continue,
            ForwardMode::Yes | ForwardMode::Both => {
                out.push((lower.clone(), value.as_string().unwrap_or_default()));
            }
            ForwardMode::Mangle => match group {
                HeaderGroup::Identity => {
                    // 不受信客户端带来的链条整个不认
                    if trusted_client {
                        match &*lower {
                            "x-forwarded-for" => seen_xff = Some(value.as_string().unwrap_or_default()),
                            "via" => seen_via = Some(value.as_string().unwrap_or_default()),
                            _ => {}
                        }
                    }
                }
                HeaderGroup::Cookie => {
                    let kept = strip_session_cookie(&value.as_string().unwrap_or_default(), session_cookie_name);
                    if !kept.is_empty() {
                        out.push((lower.clone(), kept));
                    }
                }
                _ => {
                    out.push((lower.clone(), value.as_string().unwrap_or_default()));
                }
            },
        }
    }

    if settings.identity == ForwardMode::Mangle || settings.identity == ForwardMode::Both {
        if let Some(ip) = client_ip {
            let xff = match seen_xff {
                Some(prev) => format!("{}, {}", prev, ip),
                None => ip.to_string(),
            };
            out.push(("x-forwarded-for".to_string(), xff));
        }
        let via = match seen_via {
            Some(prev) => format!("{}, 1.1 wmgate", prev),
            None => "1.1 wmgate".to_string(),
        };
        out.push(("via".to_string(), via));
    }

    out
}

/// 后端响应头按分组策略整理后发回客户端
pub fn forward_response_headers(
    settings: &ForwardSettings,
    response: &Response<Body>,
) -> Vec<(String, String)> {
    let mut out = vec![];
    for (name, value) in response.headers().iter() {
        let lower = name.to_string().to_ascii_lowercase();
        if is_hop_by_hop(&lower) {
            continue;
        }
        let group = group_of(&lower);
        match mode_for(settings, group) {
            ForwardMode::No => continue,
            _ => out.push((lower, value.as_string().unwrap_or_default())),
        }
    }
    out
}

/// 从 Cookie 头里摘掉网关自己的会话 cookie
fn strip_session_cookie(value: &str, session_cookie_name: &str) -> String {
    value
        .split(';')
        .map(|part| part.trim())
        .filter(|part| {
            !part
                .split_once('=')
                .map(|(name, _)| name.trim() == session_cookie_name)
                .unwrap_or(false)
        })
        .collect::<Vec<_>>()
        .join("; ")
}
