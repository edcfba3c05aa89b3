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
// Created Date: 2023/12/14 11:47:33

use std::{path::PathBuf, sync::Arc};

use tokio::net::UnixDatagram;
use webparse::{BinaryMut, Buf, BufMut};

use crate::{Consts, ProtError, ProtResult, ProxyContext};

/// 控制通道的命令集
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// 所有子进程连接标记归还即毁
    FadeChildren,
    /// 只处理指定标签的
    FadeTag(String),
    FlushTranslationCache,
    /// 失效翻译缓存里匹配 uri 的条目
    TcacheInvalidate(String),
    EnableNode(String),
    DisableNode(String),
    Stats,
    TerminateChildren,
}

const CMD_FADE_CHILDREN: u16 = 1;
const CMD_FADE_TAG: u16 = 2;
const CMD_FLUSH_TRANSLATION_CACHE: u16 = 3;
const CMD_TCACHE_INVALIDATE: u16 = 4;
const CMD_ENABLE_NODE: u16 = 5;
const CMD_DISABLE_NODE: u16 = 6;
const CMD_STATS: u16 = 7;
const CMD_TERMINATE_CHILDREN: u16 = 8;

impl ControlCommand {
    /// 线上格式: {magic u32, command u16, length u16, payload}
    pub fn encode(&self) -> BinaryMut {
        let (code, payload): (u16, Vec<u8>) = match self {
            ControlCommand::FadeChildren => (CMD_FADE_CHILDREN, vec![]),
            ControlCommand::FadeTag(tag) => (CMD_FADE_TAG, tag.as_bytes().to_vec()),
            ControlCommand::FlushTranslationCache => (CMD_FLUSH_TRANSLATION_CACHE, vec![]),
            ControlCommand::TcacheInvalidate(uri) => {
                (CMD_TCACHE_INVALIDATE, uri.as_bytes().to_vec())
            }
            ControlCommand::EnableNode(node) => (CMD_ENABLE_NODE, node.as_bytes().to_vec()),
            ControlCommand::DisableNode(node) => (CMD_DISABLE_NODE, node.as_bytes().to_vec()),
            ControlCommand::Stats => (CMD_STATS, vec![]),
            ControlCommand::TerminateChildren => (CMD_TERMINATE_CHILDREN, vec![]),
        };
        let mut buf = BinaryMut::new();
        buf.put_slice(&Consts::CONTROL_MAGIC.to_be_bytes());
        buf.put_u16(code);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);
        buf
    }

    pub fn decode(data: &[u8]) -> ProtResult<ControlCommand> {
        if data.len() < 8 {
            return Err(ProtError::Protocol("short control packet"));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != Consts::CONTROL_MAGIC {
            return Err(ProtError::Protocol("bad control magic"));
        }
        let command = u16::from_be_bytes([data[4], data[5]]);
        let length = u16::from_be_bytes([data[6], data[7]]) as usize;
        if data.len() < 8 + length {
            return Err(ProtError::Protocol("short control payload"));
        }
        let payload = String::from_utf8_lossy(&data[8..8 + length]).to_string();
        let cmd = match command {
            CMD_FADE_CHILDREN => ControlCommand::FadeChildren,
            CMD_FADE_TAG => ControlCommand::FadeTag(payload),
            CMD_FLUSH_TRANSLATION_CACHE => ControlCommand::FlushTranslationCache,
            CMD_TCACHE_INVALIDATE => ControlCommand::TcacheInvalidate(payload),
            CMD_ENABLE_NODE => ControlCommand::EnableNode(payload),
            CMD_DISABLE_NODE => ControlCommand::DisableNode(payload),
            CMD_STATS => ControlCommand::Stats,
            CMD_TERMINATE_CHILDREN => ControlCommand::TerminateChildren,
            _ => return Err(ProtError::Protocol("unknown control command")),
        };
        Ok(cmd)
    }
}

/// 每进程一个的控制通道: Unix 数据报, 管理命令走它进来
pub struct ControlServer {
    ctx: Arc<ProxyContext>,
    path: PathBuf,
}

impl ControlServer {
    pub fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!("wmgate-control-{}", std::process::id()))
    }

    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self {
            ctx,
            path: Self::socket_path(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// 常驻任务: 收命令, 执行, STATS 原路回包
    pub async fn run(self) -> ProtResult<()> {
        let _ = std::fs::remove_file(&self.path);
        let socket = UnixDatagram::bind(&self.path).map_err(ProtError::IoError)?;
        log::info!("control socket at {:?}", self.path);
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("control recv failed: {}", e);
                    continue;
                }
            };
            let command = match ControlCommand::decode(&buf[..n]) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("control packet rejected: {}", e);
                    continue;
                }
            };
            log::info!("control command {:?}", command);
            match command {
                ControlCommand::FadeChildren => {
                    self.ctx.tcp_stock.fade_all();
                    self.ctx.child_sockets.fade_all();
                }
                ControlCommand::FadeTag(tag) => {
                    self.ctx.tcp_stock.fade_tag(&tag);
                    self.ctx.child_sockets.fade_tag(&tag);
                }
                ControlCommand::FlushTranslationCache => {
                    self.ctx.tcache.flush();
                    self.ctx.registry.flush();
                }
                ControlCommand::TcacheInvalidate(uri) => {
                    self.ctx.tcache.invalidate_uri(&uri);
                }
                ControlCommand::EnableNode(node) | ControlCommand::DisableNode(node) => {
                    // 集群节点指令单进程部署无事可做, 记下日志便于排查
                    log::info!("cluster node command ignored for {}", node);
                }
                ControlCommand::Stats => {
                    let stats = self.stats();
                    if let Some(addr) = from.as_pathname() {
                        let _ = socket.send_to(stats.as_bytes(), addr);
                    }
                }
                ControlCommand::TerminateChildren => {
                    self.ctx.child_stock.terminate_all();
                }
            }
        }
    }

    fn stats(&self) -> String {
        let tcp = self.ctx.tcp_stock.stats();
        let children = self.ctx.child_sockets.stats();
        format!(
            "tcp idle={} busy={} created={} destroyed={}\n\
             child idle={} busy={} created={} destroyed={}\n\
             children running={}\n\
             sessions={}\n\
             tcache={} http_cache={}\n",
            tcp.idle,
            tcp.busy,
            tcp.created,
            tcp.destroyed,
            children.idle,
            children.busy,
            children.created,
            children.destroyed,
            self.ctx.child_stock.running(),
            self.ctx.sessions.len(),
            self.ctx.tcache.len(),
            self.ctx.http_cache.len(),
        )
    }
}
