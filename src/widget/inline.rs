use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use webparse::{HeaderName, Response};

use crate::{
    html_escape_str, Body, CatBody, CharsetBody, Consts, DelayedBody, ProtError, ProtResult,
    ResourceAddress, TimeoutBody,
};

use super::WidgetRegistry;

/// 子请求的出口, 由调度器实现; 拆开接口免得两头互相引用
#[async_trait]
pub trait SubRequestDispatch: Send + Sync {
    async fn fetch(
        &self,
        address: &ResourceAddress,
        path_info: &str,
        headers: Vec<(String, String)>,
    ) -> ProtResult<Response<Body>>;
}

/// 内嵌抓取需要的环境
pub struct InlineEnv {
    pub registry: Arc<WidgetRegistry>,
    pub dispatch: Arc<dyn SubRequestDispatch>,
    /// 当前请求的 Host
    pub host: String,
    /// 本容器允许的子类别, 空表示不限
    pub approved_children: Vec<String>,
    /// 模板是否声明为容器
    pub container: bool,
}

/// 描述一次内嵌抓取的参数
#[derive(Debug, Clone, Default)]
pub struct InlineRequest {
    pub class_name: String,
    pub id: Option<String>,
    pub view_name: Option<String>,
    pub path_info: String,
}

/// 被动子部件的占位流: 同步返回 delayed, 抓取在后台完成.
/// 响应头期限 5 秒, 响应体期限 10 秒; 任何失败都落成
/// 错误占位片段, 不拖垮父模板.
pub fn spawn_inline_widget(env: Arc<InlineEnv>, request: InlineRequest) -> Body {
    let (body, sender) = DelayedBody::into_body();
    let class_name = request.class_name.clone();
    tokio::spawn(async move {
        match fetch_inline(env, request).await {
            Ok(content) => sender.set(content),
            Err(e) => {
                log::warn!("inline widget {} failed: {}", class_name, e);
                sender.set(error_placeholder(&class_name, &e));
            }
        }
    });
    TimeoutBody::into_body(
        body,
        Duration::from_secs(Consts::WIDGET_BODY_TIMEOUT_SECS),
    )
}

/// 错误时嵌入的占位片段
fn error_placeholder(class_name: &str, error: &ProtError) -> Body {
    Body::from(format!(
        "<span class=\"widget-error\" data-widget=\"{}\">{}</span>",
        html_escape_str(class_name),
        html_escape_str(&format!("{}", error))
    ))
}

async fn fetch_inline(env: Arc<InlineEnv>, request: InlineRequest) -> ProtResult<Body> {
    if !env.container {
        return Err(ProtError::Forbidden("not a container document"));
    }
    if !env.approved_children.is_empty()
        && !env
            .approved_children
            .iter()
            .any(|name| name == &request.class_name)
    {
        return Err(ProtError::Forbidden("widget class not approved"));
    }

    let class = env.registry.resolve(&request.class_name).await?;
    class.check_host(&env.host)?;

    if class.find_view(request.view_name.as_deref()).is_none() && !class.views.is_empty() {
        return Err(ProtError::Extension("no such view"));
    }

    // 响应头期限独立于体期限
    let response = match tokio::time::timeout(
        Duration::from_secs(Consts::WIDGET_HEADER_TIMEOUT_SECS),
        env.dispatch.fetch(&class.address, &request.path_info, vec![]),
    )
    .await
    {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(ProtError::header_timeout("widget")),
    };

    widget_response_format(response)
}

/// 内容适配: 只有文本类能拼进 HTML 文档,
/// 非 UTF-8 先转码, text/plain 包进 <pre>
fn widget_response_format(mut response: Response<Body>) -> ProtResult<Body> {
    if let Some(encoding) = response
        .headers()
        .get_option_value(&HeaderName::CONTENT_ENCODING)
    {
        if !encoding.as_string().unwrap_or_default().eq_ignore_ascii_case("identity") {
            return Err(ProtError::UnsupportedEncoding);
        }
    }

    let content_type = response
        .headers()
        .get_option_value(&HeaderName::CONTENT_TYPE)
        .map(|v| v.as_string().unwrap_or_default())
        .unwrap_or_else(|| "text/html".to_string());
    let (mime, charset) = split_content_type(&content_type);

    let allowed = mime.starts_with("text/")
        || mime == "application/xml"
        || mime == "application/xhtml+xml";
    if !allowed {
        return Err(ProtError::UnsupportedEncoding);
    }

    let mut body = std::mem::replace(response.body_mut(), Body::empty());
    if let Some(charset) = charset {
        if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("us-ascii") {
            body = CharsetBody::into_body(body, &charset)?;
        }
    }

    if mime == "text/plain" {
        body = CatBody::into_body(vec![Body::from("<pre>"), body, Body::from("</pre>")]);
    }
    Ok(body)
}

fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut mime = value.trim().to_ascii_lowercase();
    let mut charset = None;
    if let Some(pos) = mime.find(';') {
        let params = mime[pos + 1..].to_string();
        mime.truncate(pos);
        mime = mime.trim().to_string();
        for param in params.split(';') {
            if let Some((name, v)) = param.split_once('=') {
                if name.trim() == "charset" {
                    charset = Some(v.trim().trim_matches('"').to_string());
                }
            }
        }
    }
    (mime, charset)
}
