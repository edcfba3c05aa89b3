use std::time::Duration;

use regex::Captures;

use crate::ForwardSettings;

/// 静态文件后端
#[derive(Debug, Clone, Default)]
pub struct FileAddress {
    pub path: String,
    pub content_type: Option<String>,
    pub document_root: Option<String>,
}

/// HTTP 与 AJP 共用的网络后端地址
#[derive(Debug, Clone, Default)]
pub struct HttpAddress {
    /// host:port 形式, 同时是连接池的键
    pub address: String,
    pub host_header: Option<String>,
    pub path: String,
}

/// 子进程后端(CGI/FastCGI/WAS/LHTTP/管道)的公共部分
#[derive(Debug, Clone, Default)]
pub struct ChildAddress {
    pub executable: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub document_root: String,
    pub script_name: String,
    pub path_info: String,
    /// WAS 的参数表
    pub parameters: Vec<(String, String)>,
    pub jailed: bool,
    /// 并发上限, 决定监听积压
    pub concurrency: u32,
}

impl ChildAddress {
    /// 池键: 可执行体加参数的合成串
    pub fn stock_key(&self) -> String {
        let mut key = self.executable.clone();
        for arg in &self.args {
            key.push('\u{1}');
            key.push_str(arg);
        }
        key
    }
}

#[derive(Debug, Clone, Default)]
pub struct NfsAddress {
    pub server: String,
    pub export: String,
    pub path: String,
}

/// 翻译结果选中的后端
#[derive(Debug, Clone)]
pub enum ResourceAddress {
    None,
    Local(FileAddress),
    Http(HttpAddress),
    Lhttp(ChildAddress),
    Pipe(ChildAddress),
    Cgi(ChildAddress),
    Fastcgi(ChildAddress),
    Was(ChildAddress),
    Ajp(HttpAddress),
    Nfs(NfsAddress),
}

impl Default for ResourceAddress {
    fn default() -> Self {
        ResourceAddress::None
    }
}

/// 视图里的一步变换
#[derive(Debug, Clone)]
pub enum Transformation {
    /// HTML 组装, container 表示允许内嵌子部件
    Process { container: bool },
    /// CSS 里的 url() 重写
    ProcessCss { rewrite_url: bool },
    /// 纯文本的替换标记处理
    ProcessText,
    /// 把当前响应体再经过一个后端过滤
    Filter(ResourceAddress),
}

#[derive(Debug, Clone, Default)]
pub struct View {
    /// 无名即默认视图
    pub name: Option<String>,
    pub transformations: Vec<Transformation>,
}

impl View {
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// 翻译服务对一次请求的裁决, 是该请求此后的全部事实依据
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    pub address: ResourceAddress,
    /// 覆盖响应状态
    pub status: Option<u16>,
    pub redirect: Option<String>,
    pub message: Option<String>,
    pub www_authenticate: Option<String>,
    pub views: Vec<View>,
    /// 响应缓存的寿命与 Vary 头名集
    pub max_age: Option<Duration>,
    pub vary: Vec<String>,
    pub invalidate: Vec<String>,
    /// 前缀匹配的适用基串与正/反正则
    pub base: Option<String>,
    pub regex: Option<String>,
    pub inverse_regex: Option<String>,
    pub request_header_forward: Option<ForwardSettings>,
    pub response_header_forward: Option<ForwardSettings>,
    pub cookie_host: Option<String>,
    pub session_cookie: Option<String>,
    pub session_site: Option<String>,
    /// 原样把 args/path_info 递给后端
    pub transparent: bool,
    /// 翻译服务的追问凭据
    pub check: Option<Vec<u8>>,
    /// 命中这些状态时走错误文档流程
    pub error_document: Vec<u16>,
    /// 部件类别元数据
    pub container: bool,
    pub stateful: bool,
    pub untrusted_host: Option<String>,
    pub untrusted_prefix: Option<String>,
    pub untrusted_site_suffix: Option<String>,
    /// 允许作为子部件出现的类别名, 空表示不限
    pub approved_children: Vec<String>,
}

/// 把 \1..\9 模板用正则捕获组展开
pub fn expand_string(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(d) if d.is_ascii_digit() => {
                    let idx = d.to_digit(10).unwrap() as usize;
                    chars.next();
                    if let Some(m) = caps.get(idx) {
                        out.push_str(m.as_str());
                    }
                    continue;
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

impl ResourceAddress {
    /// 对地址里的路径字段做捕获组展开
    pub fn expand(&self, caps: &Captures<'_>) -> ResourceAddress {
        let mut address = self.clone();
        match &mut address {
            ResourceAddress::Local(file) => {
                file.path = expand_string(&file.path, caps);
            }
            ResourceAddress::Http(http) | ResourceAddress::Ajp(http) => {
                http.path = expand_string(&http.path, caps);
            }
            ResourceAddress::Lhttp(child)
            | ResourceAddress::Pipe(child)
            | ResourceAddress::Cgi(child)
            | ResourceAddress::Fastcgi(child)
            | ResourceAddress::Was(child) => {
                child.path_info = expand_string(&child.path_info, caps);
                child.script_name = expand_string(&child.script_name, caps);
            }
            ResourceAddress::Nfs(nfs) => {
                nfs.path = expand_string(&nfs.path, caps);
            }
            ResourceAddress::None => {}
        }
        address
    }
}

impl TranslateResponse {
    /// 用新的捕获组重算可展开字段
    pub fn expand(&self, caps: &Captures<'_>) -> TranslateResponse {
        let mut response = self.clone();
        response.address = self.address.expand(caps);
        if let Some(redirect) = &self.redirect {
            response.redirect = Some(expand_string(redirect, caps));
        }
        response
    }

    /// 取名字对应的视图, None 取默认视图
    pub fn find_view(&self, name: Option<&str>) -> Option<&View> {
        match name {
            Some(name) => self.views.iter().find(|v| v.is_named(name)),
            None => self.views.first(),
        }
    }
}
