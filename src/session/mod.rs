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
// Created Date: 2023/11/29 11:13:08

use std::{
    collections::HashMap,
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering},
    sync::Mutex,
    time::{Duration, Instant},
};

use rand::RngCore;

use crate::SessionConfig;

/// 32 字节的随机会话标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    data: [u32; 8],
}

impl SessionId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut data = [0u32; 8];
        for word in &mut data {
            *word = rng.next_u32();
        }
        Self { data }
    }

    /// 集群散列取最后一个字
    pub fn cluster_hash(&self) -> u32 {
        self.data[7]
    }

    /// 把低字折到本节点: 任何成员看一眼 id 就知道该发给谁
    pub fn set_cluster_node(&mut self, cluster_size: u32, cluster_node: u32) {
        assert!(cluster_size > 0);
        assert!(cluster_node < cluster_size);
        let hash = self.cluster_hash();
        let remainder = hash % cluster_size;
        self.data[7] = hash - remainder + cluster_node;
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.len() != 64 {
            return None;
        }
        let mut data = [0u32; 8];
        for (i, word) in data.iter_mut().enumerate() {
            *word = u32::from_str_radix(&value[i * 8..i * 8 + 8], 16).ok()?;
        }
        Some(Self { data })
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for word in &self.data {
            write!(f, "{:08x}", word)?;
        }
        Ok(())
    }
}

/// 单个客户端的状态
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub created: Instant,
    pub last_used: Instant,
    pub counter: u64,
    /// 语言协商的缓存
    pub language: Option<String>,
    /// 部件的会话态 path_info, 按部件路径存
    pub widget_states: HashMap<String, String>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            created: now,
            last_used: now,
            counter: 0,
            language: None,
            widget_states: HashMap::new(),
        }
    }

    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

#[cfg(debug_assertions)]
static SESSION_LOCK_HELD: AtomicBool = AtomicBool::new(false);

/// 会话表: 互斥保护, 访问即触碰.
/// 死锁纪律: 任何调用路径同时最多持一把会话锁,
/// 调试构建下由断言盯着.
pub struct SessionManager {
    config: SessionConfig,
    inner: Mutex<HashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn assert_lock_free() {
        #[cfg(debug_assertions)]
        {
            assert!(
                !SESSION_LOCK_HELD.swap(true, Ordering::SeqCst),
                "a session is already locked by this process"
            );
        }
    }

    fn assert_lock_release() {
        #[cfg(debug_assertions)]
        {
            SESSION_LOCK_HELD.store(false, Ordering::SeqCst);
        }
    }

    /// 建新会话并插表, 集群配置会先折好节点
    pub fn create(&self) -> SessionId {
        let mut id = SessionId::generate();
        if let Some((size, node)) = self.config.cluster {
            id.set_cluster_node(size, node);
        }
        Self::assert_lock_free();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(id, Session::new(id));
        }
        Self::assert_lock_release();
        log::debug!("session created {}", id);
        id
    }

    /// 找到则触碰并回调, 锁内完成
    pub fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        Self::assert_lock_free();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(id) {
                Some(session) => {
                    session.last_used = Instant::now();
                    session.counter += 1;
                    Some(f(session))
                }
                None => None,
            }
        };
        Self::assert_lock_release();
        result
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.with_session(id, |_| ()).is_some()
    }

    /// 周期清理: 过期会话出表
    pub fn cleanup(&self) -> usize {
        let idle = self.config.idle_timeout;
        Self::assert_lock_free();
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.len();
            inner.retain(|_, session| !session.is_expired(idle));
            before - inner.len()
        };
        Self::assert_lock_release();
        if removed > 0 {
            log::debug!("cleaned {} expired sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        Self::assert_lock_free();
        let len = {
            let inner = self.inner.lock().unwrap();
            inner.len()
        };
        Self::assert_lock_release();
        len
    }

    /// 会话 Set-Cookie 的值
    pub fn cookie_for(&self, id: &SessionId) -> String {
        let mut cookie = format!(
            "{}={}; Path={}; HttpOnly",
            self.config.cookie_name, id, self.config.cookie_path
        );
        if let Some(host) = &self.config.cookie_host {
            cookie.push_str("; Domain=");
            cookie.push_str(host);
        }
        cookie
    }
}
