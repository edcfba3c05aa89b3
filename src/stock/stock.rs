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
// Created Date: 2023/11/08 16:40:21

use std::{
    collections::{HashMap, VecDeque},
    io,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::oneshot};

use crate::{ProtError, ProtResult, StockConfig};

/// 资源的构造与体检, 每类后端实现一份
#[async_trait]
pub trait StockBuilder: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn build(&self, key: &str) -> ProtResult<Self::Item>;

    /// 复用闲置资源前的活性检查, false 表示丢弃重建
    fn check(&self, item: &mut Self::Item) -> bool {
        let _ = item;
        true
    }

    fn destroy(&self, item: Self::Item) {
        drop(item);
    }
}

struct IdleItem<I> {
    item: I,
    since: Instant,
    tag: String,
    epoch: u64,
}

struct KeyState<I> {
    idle: VecDeque<IdleItem<I>>,
    borrowed: usize,
    /// 按先来先得唤醒等待者
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl<I> Default for KeyState<I> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            borrowed: 0,
            waiters: VecDeque::new(),
        }
    }
}

struct Inner<I> {
    map: HashMap<String, KeyState<I>>,
    /// 每次 fade 事件递增
    epoch: u64,
    /// 最近一次 fade_all 时的纪元
    fade_all_epoch: u64,
    /// (纪元, 标签令牌) 形式的定向 fade 记录
    fade_tags: Vec<(u64, String)>,
    created: u64,
    destroyed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StockStats {
    pub idle: usize,
    pub busy: usize,
    pub created: u64,
    pub destroyed: u64,
}

/// 以键分组的可复用资源池.
/// 借出以租约形式交付, 必须恰好归还一次并附带复用提示;
/// 租约被直接丢弃按不可复用处理.
pub struct Stock<B: StockBuilder> {
    builder: B,
    config: StockConfig,
    inner: Mutex<Inner<B::Item>>,
}

impl<B: StockBuilder> Stock<B> {
    pub fn new(builder: B, config: StockConfig) -> Arc<Self> {
        Arc::new(Self {
            builder,
            config,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                epoch: 0,
                fade_all_epoch: 0,
                fade_tags: vec![],
                created: 0,
                destroyed: 0,
            }),
        })
    }

    fn is_faded(inner: &Inner<B::Item>, epoch: u64, tag: &str) -> bool {
        if inner.fade_all_epoch > epoch {
            return true;
        }
        inner
            .fade_tags
            .iter()
            .any(|(e, t)| *e > epoch && tag_matches(tag, t))
    }

    /// 借出一个资源, 闲置的经活性检查后优先复用
    pub async fn get(self: &Arc<Self>, key: &str, tag: &str) -> ProtResult<Lease<B>> {
        enum Action<I> {
            Got(I, String, u64),
            Wait(oneshot::Receiver<()>),
            Build,
        }
        loop {
            let action = {
                let mut inner = self.inner.lock().unwrap();
                let mut action = None;
                loop {
                    let candidate = inner.map.entry(key.to_string()).or_default().idle.pop_back();
                    match candidate {
                        Some(mut idle) => {
                            // fade 判定与活性探测都要在借出前完成
                            let faded = Self::is_faded(&inner, idle.epoch, &idle.tag);
                            if faded || !self.builder.check(&mut idle.item) {
                                self.builder.destroy(idle.item);
                                inner.destroyed += 1;
                                continue;
                            }
                            inner.map.get_mut(key).unwrap().borrowed += 1;
                            let epoch = inner.epoch;
                            action = Some(Action::Got(idle.item, idle.tag, epoch));
                            break;
                        }
                        None => break,
                    }
                }
                match action {
                    Some(a) => a,
                    None => {
                        let state = inner.map.get_mut(key).unwrap();
                        if state.borrowed >= self.config.limit_per_key {
                            let (sender, receiver) = oneshot::channel();
                            state.waiters.push_back(sender);
                            Action::Wait(receiver)
                        } else {
                            state.borrowed += 1;
                            Action::Build
                        }
                    }
                }
            };

            match action {
                Action::Got(item, tag, epoch) => {
                    return Ok(Lease {
                        stock: self.clone(),
                        key: key.to_string(),
                        tag,
                        epoch,
                        item: Some(item),
                    });
                }
                Action::Wait(receiver) => {
                    match tokio::time::timeout(self.config.wait_timeout, receiver).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) | Err(_) => {
                            self.remove_waiter(key);
                            return Err(ProtError::ResourceExhausted);
                        }
                    }
                }
                Action::Build => {
                    // 占住名额后再异步建连
                    match self.builder.build(key).await {
                        Ok(item) => {
                            let epoch = {
                                let mut inner = self.inner.lock().unwrap();
                                inner.created += 1;
                                inner.epoch
                            };
                            return Ok(Lease {
                                stock: self.clone(),
                                key: key.to_string(),
                                tag: tag.to_string(),
                                epoch,
                                item: Some(item),
                            });
                        }
                        Err(e) => {
                            self.return_slot(key);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn remove_waiter(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.map.get_mut(key) {
            state.waiters.retain(|w| !w.is_closed());
        }
    }

    fn return_slot(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.map.get_mut(key) {
            state.borrowed = state.borrowed.saturating_sub(1);
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.send(()).is_ok() {
                    break;
                }
            }
        }
    }

    fn put(&self, key: &str, tag: String, epoch: u64, item: B::Item, reuse: bool) {
        let mut inner = self.inner.lock().unwrap();
        let faded = Self::is_faded(&inner, epoch, &tag);
        let max_idle = self.config.max_idle;
        let state = inner.map.entry(key.to_string()).or_default();
        state.borrowed = state.borrowed.saturating_sub(1);
        let keep = reuse && !faded && state.idle.len() < max_idle;
        if keep {
            state.idle.push_back(IdleItem {
                item,
                since: Instant::now(),
                tag,
                epoch,
            });
            wake_one(state);
        } else {
            wake_one(state);
            inner.destroyed += 1;
            drop(inner);
            self.builder.destroy(item);
        }
    }

    /// 标记所有资源(闲置与借出)归还即毁
    pub fn fade_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.fade_all_epoch = inner.epoch;
        let mut destroyed = 0;
        for state in inner.map.values_mut() {
            destroyed += state.idle.len() as u64;
            state.idle.clear();
        }
        inner.destroyed += destroyed;
    }

    /// 只对标签含指定令牌的资源生效
    pub fn fade_tag(&self, tag: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.fade_tags.push((epoch, tag.to_string()));
        if inner.fade_tags.len() > 64 {
            inner.fade_tags.remove(0);
        }
        let mut destroyed = 0;
        for state in inner.map.values_mut() {
            let before = state.idle.len();
            state.idle.retain(|idle| !tag_matches(&idle.tag, tag));
            destroyed += (before - state.idle.len()) as u64;
        }
        inner.destroyed += destroyed;
    }

    /// 内存吃紧时丢掉最旧的闲置资源
    pub fn discard_some(&self, count: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0;
        for _ in 0..count {
            let oldest = inner
                .map
                .iter()
                .filter(|(_, s)| !s.idle.is_empty())
                .min_by_key(|(_, s)| s.idle.front().map(|i| i.since).unwrap_or_else(Instant::now))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    if let Some(state) = inner.map.get_mut(&key) {
                        state.idle.pop_front();
                        dropped += 1;
                    }
                }
                None => break,
            }
        }
        inner.destroyed += dropped as u64;
        dropped
    }

    pub fn stats(&self) -> StockStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = StockStats {
            created: inner.created,
            destroyed: inner.destroyed,
            ..Default::default()
        };
        for state in inner.map.values() {
            stats.idle += state.idle.len();
            stats.busy += state.borrowed;
        }
        stats
    }
}

/// 标签是以 NUL 分隔的令牌串
fn tag_matches(tag: &str, token: &str) -> bool {
    tag.split('\0').any(|t| t == token)
}

fn wake_one<I>(state: &mut KeyState<I>) {
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            break;
        }
    }
}

/// 借据: 恰好归还一次, 附带是否可复用的提示.
/// 提前退出或 panic 走 Drop, 一律按不可复用归还.
pub struct Lease<B: StockBuilder> {
    stock: Arc<Stock<B>>,
    key: String,
    tag: String,
    epoch: u64,
    item: Option<B::Item>,
}

impl<B: StockBuilder> Lease<B> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// 归还资源, reuse 表示连接仍然健康可以再借
    pub fn release(mut self, reuse: bool) {
        if let Some(item) = self.item.take() {
            self.stock
                .put(&self.key, std::mem::take(&mut self.tag), self.epoch, item, reuse);
        }
    }
}

impl<B: StockBuilder> Deref for Lease<B> {
    type Target = B::Item;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().unwrap()
    }
}

impl<B: StockBuilder> DerefMut for Lease<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.as_mut().unwrap()
    }
}

impl<B: StockBuilder> Drop for Lease<B> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.stock
                .put(&self.key, std::mem::take(&mut self.tag), self.epoch, item, false);
        }
    }
}

/// 以 host:port 为键的 TCP 连接池
pub struct TcpStockBuilder;

#[async_trait]
impl StockBuilder for TcpStockBuilder {
    type Item = TcpStream;

    async fn build(&self, key: &str) -> ProtResult<Self::Item> {
        TcpStream::connect(key)
            .await
            .map_err(|e| ProtError::Connect(e))
    }

    fn check(&self, item: &mut Self::Item) -> bool {
        // 非阻塞探一眼: 有数据或已收 FIN 都说明对端不再可用
        let mut buf = [0u8; 1];
        match item.try_read(&mut buf) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}
