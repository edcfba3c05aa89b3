// Copyright 2023 - 2024 Wmgate See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2023/11/27 14:02:19

mod rubber;

pub use self::rubber::Rubber;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use webparse::{Binary, Buf};

use crate::{CacheConfig, Consts};

/// 缓存键: 方法加绝对 uri
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub uri: String,
}

impl CacheKey {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
        }
    }
}

/// 从缓存里取出的可服务响应
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Binary,
}

struct CacheEntry {
    /// 翻译要求区分的请求头名
    vary_names: Vec<String>,
    /// 写入时这些头的取值快照
    vary_snapshot: HashMap<String, Option<String>>,
    status: u16,
    headers: Vec<(String, String)>,
    body_id: u64,
    expires: Instant,
}

impl CacheEntry {
    /// 快照逐字节相等才算命中
    fn vary_matches(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        for name in &self.vary_names {
            let stored = self.vary_snapshot.get(name).cloned().unwrap_or(None);
            if stored != lookup(name) {
                return false;
            }
        }
        true
    }
}

/// 查询的三种结局: 命中; 未命中由本请求回源;
/// 已有同指纹请求在回源, 挂在它后面等结果.
pub enum CacheLookup {
    Hit(CachedResponse),
    Miss(FetchGuard),
    Wait(oneshot::Receiver<Option<CachedResponse>>),
}

/// 回源凭据: 持有者负责完成或放弃这次填充.
/// 放弃(含 panic)会放行所有等待者各自回源.
pub struct FetchGuard {
    cache: Arc<HttpCache>,
    key: CacheKey,
    done: bool,
}

impl FetchGuard {
    /// 回源成功, 写入缓存并广播给等待者
    pub fn complete(
        mut self,
        vary_names: Vec<String>,
        lookup: &dyn Fn(&str) -> Option<String>,
        max_age: Option<Duration>,
        status: u16,
        headers: Vec<(String, String)>,
        body: Binary,
    ) {
        self.done = true;
        self.cache
            .insert(&self.key, vary_names, lookup, max_age, status, headers, body);
        self.cache.finish_pending(&self.key);
    }

    /// 不可缓存或失败, 只解除等待
    pub fn abandon(mut self) {
        self.done = true;
        self.cache.finish_pending(&self.key);
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cache.finish_pending(&self.key);
        }
    }
}

/// HTTP 响应缓存.
/// 键是 (方法, uri); Vary 的判定靠写入时的请求头快照;
/// 体数据放在带预算的仓库里, 定时压实.
pub struct HttpCache {
    config: CacheConfig,
    rubber: Rubber,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, Vec<CacheEntry>>,
    pending: HashMap<String, Vec<oneshot::Sender<Option<CachedResponse>>>>,
}

/// 可以进缓存的状态码
fn is_cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 203 | 204 | 301 | 304 | 404 | 410)
}

impl HttpCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let rubber = Rubber::new(config.max_size);
        Arc::new(Self {
            config,
            rubber,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
            }),
        })
    }

    pub fn max_body_size(&self) -> usize {
        self.config.max_body_size
    }

    pub fn is_cacheable(&self, method: &str, status: u16, body_len: usize) -> bool {
        method == "GET" && is_cacheable_status(status) && body_len <= self.config.max_body_size
    }

    fn entry_key(key: &CacheKey) -> String {
        format!("{} {}", key.method, key.uri)
    }

    /// 查缓存; 未命中时登记回源资格, 同键并发只放一个出去
    pub fn lookup(
        self: &Arc<Self>,
        key: &CacheKey,
        header_lookup: &dyn Fn(&str) -> Option<String>,
    ) -> CacheLookup {
        let entry_key = Self::entry_key(key);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(entries) = inner.entries.get_mut(&entry_key) {
            entries.retain(|e| e.expires > now);
            for entry in entries.iter() {
                if entry.vary_matches(&header_lookup) {
                    if let Some(body) = self.rubber.get(entry.body_id) {
                        log::trace!("http cache hit {}", entry_key);
                        return CacheLookup::Hit(CachedResponse {
                            status: entry.status,
                            headers: entry.headers.clone(),
                            body,
                        });
                    }
                }
            }
        }

        if let Some(waiters) = inner.pending.get_mut(&entry_key) {
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            return CacheLookup::Wait(receiver);
        }
        inner.pending.insert(entry_key, vec![]);
        CacheLookup::Miss(FetchGuard {
            cache: self.clone(),
            key: key.clone(),
            done: false,
        })
    }

    fn insert(
        &self,
        key: &CacheKey,
        vary_names: Vec<String>,
        header_lookup: &dyn Fn(&str) -> Option<String>,
        max_age: Option<Duration>,
        status: u16,
        headers: Vec<(String, String)>,
        body: Binary,
    ) {
        if !self.is_cacheable(&key.method, status, body.remaining()) {
            return;
        }
        let body_id = match self.rubber.add(body) {
            Some(v) => v,
            None => return,
        };
        let mut vary_snapshot = HashMap::new();
        for name in &vary_names {
            vary_snapshot.insert(name.clone(), header_lookup(name));
        }
        let entry = CacheEntry {
            vary_names,
            vary_snapshot,
            status,
            headers,
            body_id,
            expires: Instant::now() + max_age.unwrap_or(self.config.default_max_age),
        };

        let entry_key = Self::entry_key(key);
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.entries.entry(entry_key).or_default();
        // 同快照的旧条目被新条目顶掉
        let mut replaced = vec![];
        entries.retain(|old| {
            let same = old.vary_snapshot == entry.vary_snapshot;
            if same {
                replaced.push(old.body_id);
            }
            !same
        });
        entries.push(entry);
        drop(inner);
        for id in replaced {
            self.rubber.remove(id);
        }
    }

    /// 回源收尾: 唤醒等待者, 各自按自己的 Vary 指纹重查缓存
    fn finish_pending(&self, key: &CacheKey) {
        let entry_key = Self::entry_key(key);
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(&entry_key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// 按头名与当前取值清掉匹配的旧条目
    pub fn invalidate(
        &self,
        names: &[String],
        header_lookup: &dyn Fn(&str) -> Option<String>,
    ) {
        if names.is_empty() {
            return;
        }
        let mut removed_bodies = vec![];
        let mut inner = self.inner.lock().unwrap();
        for entries in inner.entries.values_mut() {
            entries.retain(|entry| {
                let matched = names.iter().any(|name| {
                    match entry.vary_snapshot.get(name) {
                        Some(stored) => stored == &header_lookup(name),
                        None => false,
                    }
                });
                if matched {
                    removed_bodies.push(entry.body_id);
                }
                !matched
            });
        }
        drop(inner);
        for id in removed_bodies {
            self.rubber.remove(id);
        }
    }

    /// 周期压实体仓库, 顺带摘掉失去体的条目
    pub fn compress(&self) {
        let evicted = self.rubber.compress();
        if evicted.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for entries in inner.entries.values_mut() {
            entries.retain(|e| !evicted.contains(&e.body_id));
        }
    }

    /// 挂一个压实定时器
    pub fn spawn_compress_timer(cache: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                Consts::CACHE_COMPRESS_INTERVAL_SECS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.compress();
            }
        });
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().map(|v| v.len()).sum()
    }
}
