mod cache;
mod request;
mod response;

pub use self::cache::TranslateCache;
pub use self::request::TranslateRequest;
pub use self::response::{
    expand_string, ChildAddress, FileAddress, HttpAddress, NfsAddress, ResourceAddress,
    TranslateResponse, Transformation, View,
};

use async_trait::async_trait;

use crate::ProtResult;

/// 翻译服务: 请求元组进, 后端与策略出.
/// 线上走独立的翻译进程, 测试与简单部署用表驱动实现.
#[async_trait]
pub trait TranslateOracle: Send + Sync {
    async fn translate(&self, request: &TranslateRequest) -> ProtResult<TranslateResponse>;
}

/// 前缀表驱动的翻译实现
pub struct TableOracle {
    rules: Vec<(String, TranslateResponse)>,
    widgets: std::collections::HashMap<String, TranslateResponse>,
}

impl TableOracle {
    pub fn new() -> Self {
        Self {
            rules: vec![],
            widgets: std::collections::HashMap::new(),
        }
    }

    pub fn add(&mut self, prefix: &str, response: TranslateResponse) -> &mut Self {
        self.rules.push((prefix.to_string(), response));
        self
    }

    pub fn add_widget(&mut self, widget_type: &str, response: TranslateResponse) -> &mut Self {
        self.widgets.insert(widget_type.to_string(), response);
        self
    }
}

#[async_trait]
impl TranslateOracle for TableOracle {
    async fn translate(&self, request: &TranslateRequest) -> ProtResult<TranslateResponse> {
        if let Some(widget_type) = &request.widget_type {
            if let Some(response) = self.widgets.get(widget_type) {
                return Ok(response.clone());
            }
            return Err(crate::ProtError::Extension("unknown widget type"));
        }
        // 最长前缀优先
        let mut best: Option<&(String, TranslateResponse)> = None;
        for rule in &self.rules {
            if request.uri.starts_with(&rule.0) {
                if best.map(|b| rule.0.len() > b.0.len()).unwrap_or(true) {
                    best = Some(rule);
                }
            }
        }
        match best {
            Some((_, response)) => Ok(response.clone()),
            None => Ok(TranslateResponse {
                status: Some(404),
                ..Default::default()
            }),
        }
    }
}
