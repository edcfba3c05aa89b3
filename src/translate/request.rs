/// 问询翻译服务时携带的请求快照
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub uri: String,
    pub host: String,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub authorization: Option<String>,
    pub session: Option<String>,
    pub args: Option<String>,
    pub param: Option<String>,
    pub remote_host: Option<String>,
    /// 上一轮翻译发回的追问凭据, 原样带回
    pub check: Option<Vec<u8>>,
    /// 错误文档流程: 后端的出错状态
    pub error_document_status: Option<u16>,
    /// 解析部件类别时设置
    pub widget_type: Option<String>,
}

impl TranslateRequest {
    pub fn new(uri: &str, host: &str) -> Self {
        Self {
            uri: uri.to_string(),
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// 缓存指纹: vary 头集之外的部分
    pub fn cache_key(&self) -> String {
        match &self.widget_type {
            Some(widget_type) => format!("widget={};{}", widget_type, self.uri),
            None => format!("{}|{}", self.host, self.uri),
        }
    }
}
