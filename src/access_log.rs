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
// Created Date: 2023/12/13 17:20:41

use std::{
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::net::{UdpSocket, UnixDatagram};
use webparse::{BinaryMut, Buf, BufMut};

use crate::Consts;

/// 一次请求的访问记录
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub timestamp: SystemTime,
    pub site: String,
    pub remote_host: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub length: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub duration: Duration,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl AccessLogEntry {
    /// 一行文本的形式
    pub fn format_line(&self) -> String {
        let secs = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!(
            "{} {} \"{} {}\" {} {} {}us \"{}\" \"{}\"",
            secs,
            if self.remote_host.is_empty() {
                "-"
            } else {
                &self.remote_host
            },
            self.method,
            self.uri,
            self.status,
            self.length,
            self.duration.as_micros(),
            self.referer.as_deref().unwrap_or("-"),
            self.user_agent.as_deref().unwrap_or("-"),
        )
    }

    /// 数据报的二进制布局: 魔数 + 定长数字段 + 长度前缀字符串,
    /// 数字一律大端
    pub fn encode(&self) -> BinaryMut {
        fn put_string(buf: &mut BinaryMut, value: &str) {
            buf.put_u16(value.len() as u16);
            buf.put_slice(value.as_bytes());
        }
        let mut buf = BinaryMut::new();
        buf.put_slice(&Consts::LOG_MAGIC.to_be_bytes());
        buf.put_slice(
            &(self
                .timestamp
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64)
                .to_be_bytes(),
        );
        buf.put_u16(self.status);
        buf.put_slice(&self.length.to_be_bytes());
        buf.put_slice(&self.bytes_received.to_be_bytes());
        buf.put_slice(&self.bytes_sent.to_be_bytes());
        buf.put_slice(&(self.duration.as_micros() as u64).to_be_bytes());
        put_string(&mut buf, &self.site);
        put_string(&mut buf, &self.remote_host);
        put_string(&mut buf, &self.method);
        put_string(&mut buf, &self.uri);
        put_string(&mut buf, self.referer.as_deref().unwrap_or(""));
        put_string(&mut buf, self.user_agent.as_deref().unwrap_or(""));
        buf
    }
}

/// 日志的去向
pub enum AccessLogSink {
    /// 一行一条打到 stderr
    Stderr,
    /// 二进制数据报发往 UDP 地址
    Udp(UdpSocket, SocketAddr),
    /// 二进制数据报发往 Unix datagram 套接字
    UnixDatagram(UnixDatagram, PathBuf),
    /// 丢弃
    Null,
}

/// 访问日志出口: 记录行为不阻塞请求主流程
pub struct AccessLogger {
    sink: AccessLogSink,
}

impl AccessLogger {
    pub fn stderr() -> Self {
        Self {
            sink: AccessLogSink::Stderr,
        }
    }

    pub fn null() -> Self {
        Self {
            sink: AccessLogSink::Null,
        }
    }

    pub async fn udp(target: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            sink: AccessLogSink::Udp(socket, target),
        })
    }

    pub fn unix_datagram(path: PathBuf) -> std::io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        Ok(Self {
            sink: AccessLogSink::UnixDatagram(socket, path),
        })
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        match &self.sink {
            AccessLogSink::Stderr => {
                eprintln!("{}", entry.format_line());
            }
            AccessLogSink::Udp(socket, target) => {
                let datagram = entry.encode();
                let _ = socket.try_send_to(datagram.chunk(), *target);
            }
            AccessLogSink::UnixDatagram(socket, path) => {
                let datagram = entry.encode();
                let _ = socket.try_send_to(datagram.chunk(), path);
            }
            AccessLogSink::Null => {}
        }
    }
}
