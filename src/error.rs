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
// Created Date: 2023/11/02 09:21:17

use std::{fmt::Display, io};

use tokio::sync::mpsc::error::SendError;
use webparse::WebError;

pub type ProtResult<T> = Result<T, ProtError>;

#[derive(Debug)]
pub enum TimeoutError {
    Connect(&'static str),
    Read(&'static str),
    Write(&'static str),
    Header(&'static str),
    Body(&'static str),
}

impl TimeoutError {
    pub fn is_header(&self) -> bool {
        match self {
            TimeoutError::Header(_) => true,
            _ => false,
        }
    }

    pub fn info(&self) -> &'static str {
        match self {
            TimeoutError::Connect(info) => info,
            TimeoutError::Read(info) => info,
            TimeoutError::Write(info) => info,
            TimeoutError::Header(info) => info,
            TimeoutError::Body(info) => info,
        }
    }
}

impl Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::Connect(info) => f.write_fmt(format_args!("connect timeout {}", info)),
            TimeoutError::Read(info) => f.write_fmt(format_args!("read timeout {}", info)),
            TimeoutError::Write(info) => f.write_fmt(format_args!("write timeout {}", info)),
            TimeoutError::Header(info) => f.write_fmt(format_args!("header timeout {}", info)),
            TimeoutError::Body(info) => f.write_fmt(format_args!("body timeout {}", info)),
        }
    }
}

#[derive(Debug)]
pub enum ProtError {
    /// 标准错误库的错误类型
    IoError(io::Error),
    /// 解析库发生错误
    WebError(WebError),
    /// 配置错误, 不可恢复
    Config(String),
    /// 对端协议错误, 关闭该连接但进程继续
    Protocol(&'static str),
    /// 后端连接失败, 在重试上限内可重试
    Connect(io::Error),
    /// 超时类错误, 调用方决定是否重试
    Timeout(TimeoutError),
    /// 调用方主动取消, 不再产生任何事件
    Cancelled,
    /// 后端在发送任何字节前关闭连接, 请求体未发送时可重试一次
    Refused,
    /// 资源池已满且在期限内无空闲
    ResourceExhausted,
    /// 信任或准入检查拒绝
    Forbidden(&'static str),
    /// 子部件响应的类型无法拼接
    UnsupportedEncoding,
    /// 其它错误信息
    Extension(&'static str),
    SendError,
}

impl Display for ProtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtError::IoError(e) => f.write_fmt(format_args!("io error: {}", e)),
            ProtError::WebError(w) => w.fmt(f),
            ProtError::Config(s) => f.write_fmt(format_args!("config error: {}", s)),
            ProtError::Protocol(s) => f.write_fmt(format_args!("protocol error: {}", s)),
            ProtError::Connect(e) => f.write_fmt(format_args!("connect error: {}", e)),
            ProtError::Timeout(t) => t.fmt(f),
            ProtError::Cancelled => f.write_str("cancelled"),
            ProtError::Refused => f.write_str("refused before any response byte"),
            ProtError::ResourceExhausted => f.write_str("stock exhausted"),
            ProtError::Forbidden(s) => f.write_fmt(format_args!("forbidden: {}", s)),
            ProtError::UnsupportedEncoding => f.write_str("unsupported encoding"),
            ProtError::Extension(s) => f.write_fmt(format_args!("extension {}", s)),
            ProtError::SendError => f.write_str("send error"),
        }
    }
}

impl From<io::Error> for ProtError {
    fn from(value: io::Error) -> Self {
        ProtError::IoError(value)
    }
}

impl From<WebError> for ProtError {
    fn from(value: WebError) -> Self {
        ProtError::WebError(value)
    }
}

impl<T> From<SendError<T>> for ProtError {
    fn from(_: SendError<T>) -> Self {
        ProtError::SendError
    }
}

impl ProtError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn is_io(&self) -> bool {
        match self {
            Self::IoError(_) => true,
            _ => false,
        }
    }

    /// 是否可以安全重试, 仅限请求体还未发出的场合
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refused => true,
            Self::Connect(_) => true,
            _ => false,
        }
    }

    /// 错误折算成对客户端的状态码
    pub fn to_status(&self) -> u16 {
        match self {
            Self::Timeout(_) => 504,
            Self::Forbidden(_) => 403,
            Self::IoError(e) if e.kind() == io::ErrorKind::NotFound => 404,
            Self::IoError(e) if e.kind() == io::ErrorKind::PermissionDenied => 403,
            _ => 502,
        }
    }

    pub fn connect_timeout(val: &'static str) -> Self {
        Self::Timeout(TimeoutError::Connect(val))
    }

    pub fn read_timeout(val: &'static str) -> Self {
        Self::Timeout(TimeoutError::Read(val))
    }

    pub fn write_timeout(val: &'static str) -> Self {
        Self::Timeout(TimeoutError::Write(val))
    }

    pub fn header_timeout(val: &'static str) -> Self {
        Self::Timeout(TimeoutError::Header(val))
    }

    pub fn body_timeout(val: &'static str) -> Self {
        Self::Timeout(TimeoutError::Body(val))
    }
}
