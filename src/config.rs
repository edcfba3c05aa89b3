use std::time::Duration;

use crate::Consts;

/// 头部转发分组的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    Yes,
    No,
    Mangle,
    Both,
}

/// 按组的头部转发配置, 请求与响应各一份
#[derive(Clone, Debug)]
pub struct ForwardSettings {
    pub capabilities: ForwardMode,
    pub cookie: ForwardMode,
    pub identity: ForwardMode,
    pub cors: ForwardMode,
    pub secure: ForwardMode,
    pub other: ForwardMode,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            capabilities: ForwardMode::Yes,
            cookie: ForwardMode::Mangle,
            identity: ForwardMode::Mangle,
            cors: ForwardMode::No,
            secure: ForwardMode::No,
            other: ForwardMode::No,
        }
    }
}

impl ForwardSettings {
    /// 响应方向的默认: 除了身份组基本照单全收
    pub fn permissive() -> Self {
        Self {
            capabilities: ForwardMode::Yes,
            cookie: ForwardMode::Yes,
            identity: ForwardMode::Mangle,
            cors: ForwardMode::Yes,
            secure: ForwardMode::Yes,
            other: ForwardMode::Yes,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StockConfig {
    /// 同一键下的并发上限
    pub limit_per_key: usize,
    /// 同一键下保留的空闲数量上限
    pub max_idle: usize,
    /// 等待空闲资源的期限, 超出报 ResourceExhausted
    pub wait_timeout: Duration,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            limit_per_key: 16,
            max_idle: 8,
            wait_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// 体存储的总预算, 超出触发淘汰
    pub max_size: usize,
    /// 超过该大小的响应体不缓存
    pub max_body_size: usize,
    /// 未显式指定时的默认缓存时长
    pub default_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            max_body_size: 8 * 1024 * 1024,
            default_max_age: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub cookie_host: Option<String>,
    pub cookie_path: String,
    pub idle_timeout: Duration,
    /// 集群布局: (规模, 本节点编号)
    pub cluster: Option<(u32, u32)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "wmgate_session".to_string(),
            cookie_host: None,
            cookie_path: "/".to_string(),
            idle_timeout: Duration::from_secs(1200),
            cluster: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// 错误页输出详细信息还是固定文案
    pub verbose_response: bool,
    /// 仅信任列表内的代理追加的 X-Forwarded-For
    pub trusted_proxies: Vec<String>,
    pub stock: StockConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub request_forward: ForwardSettings,
    pub response_forward: ForwardSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(60),
            verbose_response: false,
            trusted_proxies: vec![],
            stock: StockConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            request_forward: ForwardSettings::default(),
            response_forward: ForwardSettings::permissive(),
        }
    }
}
