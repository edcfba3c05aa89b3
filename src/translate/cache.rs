use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use regex::Regex;

use crate::{ProtError, ProtResult};

use super::{TranslateOracle, TranslateRequest, TranslateResponse};

struct CachedTranslation {
    response: TranslateResponse,
    /// base 条目的适用正则, 预编译
    regex: Option<Regex>,
    inverse_regex: Option<Regex>,
    expires: Instant,
}

impl CachedTranslation {
    /// base 条目对某个 uri 后缀是否适用
    fn applies(&self, suffix: &str) -> bool {
        if let Some(inverse) = &self.inverse_regex {
            if inverse.is_match(suffix) {
                return false;
            }
        }
        match &self.regex {
            Some(regex) => regex.is_match(suffix),
            None => true,
        }
    }
}

/// 翻译缓存: 精确条目之外, 带 base 的条目按前缀加正则匹配命中,
/// 命中后用新捕获组重新展开可展开字段.
pub struct TranslateCache {
    oracle: Arc<dyn TranslateOracle>,
    max_age: Duration,
    inner: Mutex<TranslateCacheInner>,
}

struct TranslateCacheInner {
    exact: HashMap<String, CachedTranslation>,
    /// (base, 缓存键) 递查表
    bases: Vec<(String, String)>,
    base_entries: HashMap<String, CachedTranslation>,
}

impl TranslateCache {
    pub fn new(oracle: Arc<dyn TranslateOracle>, max_age: Duration) -> Self {
        Self {
            oracle,
            max_age,
            inner: Mutex::new(TranslateCacheInner {
                exact: HashMap::new(),
                bases: vec![],
                base_entries: HashMap::new(),
            }),
        }
    }

    pub async fn translate(&self, request: &TranslateRequest) -> ProtResult<TranslateResponse> {
        // 带追问凭据或错误文档状态的轮次不缓存
        if request.check.is_some() || request.error_document_status.is_some() {
            return self.oracle.translate(request).await;
        }

        if let Some(response) = self.lookup(request) {
            return Ok(response);
        }

        let response = self.oracle.translate(request).await?;
        self.insert(request, &response)?;
        // 第一跳也走一遍条目匹配, 展开字段用当前 uri 的捕获组
        if let Some(expanded) = self.lookup(request) {
            return Ok(expanded);
        }
        Ok(response)
    }

    fn lookup(&self, request: &TranslateRequest) -> Option<TranslateResponse> {
        let key = request.cache_key();
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.exact.get(&key) {
            if entry.expires > now {
                return Some(entry.response.clone());
            }
        }

        for (base, cache_key) in &inner.bases {
            if !request.uri.starts_with(base.as_str()) {
                continue;
            }
            let entry = match inner.base_entries.get(cache_key) {
                Some(v) => v,
                None => continue,
            };
            if entry.expires <= now {
                continue;
            }
            let suffix = &request.uri[base.len()..];
            if !entry.applies(suffix) {
                continue;
            }
            // 重新匹配取得新的捕获组再展开
            let response = match &entry.regex {
                Some(regex) => match regex.captures(suffix) {
                    Some(caps) => entry.response.expand(&caps),
                    None => continue,
                },
                None => entry.response.clone(),
            };
            log::trace!("tcache base hit {} for {}", base, request.uri);
            return Some(response);
        }
        None
    }

    fn insert(&self, request: &TranslateRequest, response: &TranslateResponse) -> ProtResult<()> {
        let expires = Instant::now()
            + response.max_age.unwrap_or(self.max_age);
        let regex = match &response.regex {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|_| ProtError::Config(format!("bad regex {}", pattern)))?,
            ),
            None => None,
        };
        let inverse_regex = match &response.inverse_regex {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|_| ProtError::Config(format!("bad regex {}", pattern)))?,
            ),
            None => None,
        };
        let entry = CachedTranslation {
            response: response.clone(),
            regex,
            inverse_regex,
            expires,
        };

        let mut inner = self.inner.lock().unwrap();
        match &response.base {
            Some(base) => {
                let cache_key = format!("{}#{}", request.host, base);
                if !inner.bases.iter().any(|(_, k)| k == &cache_key) {
                    inner.bases.push((base.clone(), cache_key.clone()));
                }
                inner.base_entries.insert(cache_key, entry);
            }
            None => {
                inner.exact.insert(request.cache_key(), entry);
            }
        }
        Ok(())
    }

    /// 控制命令 FLUSH_TRANSLATION_CACHE
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.exact.clear();
        inner.bases.clear();
        inner.base_entries.clear();
    }

    /// 失效指定 uri 前缀下的条目
    pub fn invalidate_uri(&self, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.exact.retain(|key, _| !key.contains(uri));
        let removed: Vec<String> = inner
            .bases
            .iter()
            .filter(|(base, _)| uri.starts_with(base.as_str()) || base.starts_with(uri))
            .map(|(_, k)| k.clone())
            .collect();
        inner.bases.retain(|(base, _)| {
            !(uri.starts_with(base.as_str()) || base.starts_with(uri))
        });
        for key in removed {
            inner.base_entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.exact.len() + inner.base_entries.len()
    }
}
