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
// Created Date: 2023/11/16 15:23:40

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use webparse::{Binary, BinaryMut, Buf, BufMut, Method, Request, Response};

use crate::{Consts, ProtError, ProtResult, Body, SocketLease};

use super::{read_some, BackendBody};

/// 包代码, 方向见各自注释
pub const AJP_CODE_FORWARD_REQUEST: u8 = 2;
pub const AJP_CODE_SEND_BODY_CHUNK: u8 = 3;
pub const AJP_CODE_SEND_HEADERS: u8 = 4;
pub const AJP_CODE_END_RESPONSE: u8 = 5;
pub const AJP_CODE_GET_BODY_CHUNK: u8 = 6;
pub const AJP_CODE_SHUTDOWN: u8 = 7;
pub const AJP_CODE_CPING: u8 = 10;
pub const AJP_CODE_CPONG_REPLY: u8 = 9;

const AJP_ATTRIBUTE_QUERY_STRING: u8 = 0x05;
const AJP_ATTRIBUTES_END: u8 = 0xff;
const AJP_HEADER_CONTENT_LENGTH: u16 = 0xA008;

/// 单个请求体包允许携带的最大数据量
const MAX_BODY_CHUNK: usize = 8186;

/// 转发请求需要的连接环境
#[derive(Debug, Clone)]
pub struct AjpRequestInfo {
    pub protocol: String,
    pub remote_addr: String,
    pub remote_host: String,
    pub server_name: String,
    pub server_port: u16,
    pub is_ssl: bool,
}

impl Default for AjpRequestInfo {
    fn default() -> Self {
        Self {
            protocol: "HTTP/1.1".to_string(),
            remote_addr: String::new(),
            remote_host: String::new(),
            server_name: String::new(),
            server_port: 80,
            is_ssl: false,
        }
    }
}

fn to_ajp_method(method: &Method) -> Option<u8> {
    match method {
        Method::Options => Some(1),
        Method::Get => Some(2),
        Method::Head => Some(3),
        Method::Post => Some(4),
        Method::Put => Some(5),
        Method::Delete => Some(6),
        Method::Trace => Some(7),
        _ => None,
    }
}

/// 常见请求头在线上的整数编码
fn request_header_code(name: &str) -> Option<u16> {
    let code = match name {
        "accept" => 0xA001,
        "accept-charset" => 0xA002,
        "accept-encoding" => 0xA003,
        "accept-language" => 0xA004,
        "authorization" => 0xA005,
        "connection" => 0xA006,
        "content-type" => 0xA007,
        "content-length" => 0xA008,
        "cookie" => 0xA009,
        "cookie2" => 0xA00A,
        "host" => 0xA00B,
        "pragma" => 0xA00C,
        "referer" => 0xA00D,
        "user-agent" => 0xA00E,
        _ => return None,
    };
    Some(code)
}

fn response_header_name(code: u16) -> Option<&'static str> {
    let name = match code {
        0xA001 => "Content-Type",
        0xA002 => "Content-Language",
        0xA003 => "Content-Length",
        0xA004 => "Date",
        0xA005 => "Last-Modified",
        0xA006 => "Location",
        0xA007 => "Set-Cookie",
        0xA008 => "Set-Cookie2",
        0xA009 => "Servlet-Engine",
        0xA00A => "Status",
        0xA00B => "WWW-Authenticate",
        _ => return None,
    };
    Some(name)
}

fn put_ajp_string(buf: &mut BinaryMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// 帧头: 请求方向 0x12 0x34, 长度为大端 u16
fn put_packet(out: &mut BinaryMut, payload: &[u8]) {
    out.put_slice(&[0x12, 0x34]);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
}

struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u16(&mut self) -> ProtResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(ProtError::Protocol("short AJP packet"));
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn string(&mut self) -> ProtResult<Option<String>> {
        let len = self.u16()?;
        if len == 0xFFFF {
            return Ok(None);
        }
        let len = len as usize;
        if self.pos + len + 1 > self.data.len() {
            return Err(ProtError::Protocol("short AJP string"));
        }
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).to_string();
        self.pos += len + 1;
        Ok(Some(s))
    }
}

struct AjpExchange {
    socket: SocketLease,
    read_buf: BinaryMut,
    read_timeout: Duration,
    write_timeout: Duration,
    /// 还没送出去的请求体
    body: Option<Body>,
    /// 空体终结包是否已发
    terminated: bool,
    /// 响应 Content-Length 宣告的剩余量, 未宣告为 None
    remaining: Option<u64>,
}

impl AjpExchange {
    async fn write_all(&mut self, data: &[u8]) -> ProtResult<()> {
        match tokio::time::timeout(self.write_timeout, self.socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtError::write_timeout("ajp")),
        }
    }

    /// 读一个完整的响应包, 返回 (code, payload 去掉 code 字节)
    async fn read_packet(&mut self, got_any: &mut bool) -> ProtResult<(u8, Binary)> {
        loop {
            let chunk = self.read_buf.chunk();
            if chunk.len() >= 5 {
                if chunk[0] != b'A' || chunk[1] != b'B' {
                    return Err(ProtError::Protocol("malformed AJP response packet"));
                }
                let length = u16::from_be_bytes([chunk[2], chunk[3]]) as usize;
                if length == 0 {
                    return Err(ProtError::Protocol("malformed AJP response packet"));
                }
                if chunk.len() >= 4 + length {
                    let code = chunk[4];
                    let payload = Binary::from(chunk[5..4 + length].to_vec());
                    self.read_buf.advance(4 + length);
                    return Ok((code, payload));
                }
            }
            let n = match tokio::time::timeout(
                self.read_timeout,
                read_some(&mut self.socket, &mut self.read_buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtError::read_timeout("ajp")),
            };
            if n == 0 {
                if *got_any {
                    return Err(ProtError::Protocol("premature end of response"));
                }
                return Err(ProtError::Refused);
            }
            *got_any = true;
        }
    }

    /// 应服务端的拉取发一段请求体; 体尽后补发空体终结包
    async fn send_body_chunk(&mut self, requested: u16) -> ProtResult<()> {
        let max = std::cmp::min(requested as usize, MAX_BODY_CHUNK);
        if let Some(mut body) = self.body.take() {
            let mut collected = BinaryMut::new();
            let mut ended = false;
            while collected.remaining() < max {
                let (is_end, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
                collected.put_slice(bin.chunk());
                if is_end {
                    ended = true;
                    break;
                }
            }
            if collected.remaining() > 0 {
                let take = std::cmp::min(collected.remaining(), max);
                let mut payload = BinaryMut::new();
                payload.put_u16(take as u16);
                payload.put_slice(&collected.chunk()[..take]);
                collected.advance(take);
                let mut out = BinaryMut::new();
                put_packet(&mut out, payload.chunk());
                self.write_all(&out.chunk().to_vec()).await?;
                if collected.remaining() > 0 {
                    // 超出本次拉取量的数据退回流里
                    body.cache_buffer(collected.chunk());
                    self.body = Some(body);
                    return Ok(());
                }
            }
            if !ended {
                self.body = Some(body);
                return Ok(());
            }
        }
        if !self.terminated {
            self.terminated = true;
            let mut out = BinaryMut::new();
            put_packet(&mut out, &[]);
            self.write_all(&out.chunk().to_vec()).await?;
        }
        Ok(())
    }
}

/// AJPv13 后端客户端.
/// 请求方向魔数 0x12 0x34, 响应方向 'A' 'B'; 请求体按服务端的
/// GET_BODY_CHUNK 拉取分帧, 空体包收尾; 响应体由 SEND_BODY_CHUNK
/// 携带, 包内多余字节按垃圾丢弃, END_RESPONSE 收尾.
pub struct AjpClient {
    socket: SocketLease,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl AjpClient {
    pub fn new(socket: SocketLease) -> Self {
        Self {
            socket,
            read_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub async fn request(
        self,
        mut req: Request<Body>,
        info: AjpRequestInfo,
    ) -> ProtResult<Response<Body>> {
        let method_code = match to_ajp_method(req.method()) {
            Some(v) => v,
            None => {
                self.socket.release(true);
                return Err(ProtError::Protocol("unknown request method"));
            }
        };
        let no_body = req.method() == &Method::Head;

        // AJPv13 的请求体必须预先知道长度
        let body_len = match req.body().available() {
            Some(v) => v,
            None => {
                self.socket.release(true);
                return Err(ProtError::Protocol(
                    "AJPv13 does not support chunked request bodies",
                ));
            }
        };

        let mut payload = BinaryMut::new();
        payload.put_u8(AJP_CODE_FORWARD_REQUEST);
        payload.put_u8(method_code);

        let path = req.path().clone();
        let (uri, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, req.url().query.clone()),
        };

        put_ajp_string(&mut payload, &info.protocol);
        put_ajp_string(&mut payload, &uri);
        put_ajp_string(&mut payload, &info.remote_addr);
        put_ajp_string(&mut payload, &info.remote_host);
        put_ajp_string(&mut payload, &info.server_name);
        payload.put_u16(info.server_port);
        payload.put_u8(info.is_ssl as u8);

        // 头表: 已知名用整数编码, 其余带长度前缀写名字
        let mut headers = BinaryMut::new();
        let mut num_headers = 0u16;
        for (name, value) in req.headers().iter() {
            let lower = name.to_string().to_ascii_lowercase();
            if lower == "content-length" {
                continue;
            }
            match request_header_code(&lower) {
                Some(code) => {
                    headers.put_u16(code);
                }
                None => put_ajp_string(&mut headers, &lower),
            }
            put_ajp_string(&mut headers, &value.as_string().unwrap_or_default());
            num_headers += 1;
        }
        if body_len > 0 {
            num_headers += 1;
        }
        payload.put_u16(num_headers);
        payload.put_slice(headers.chunk());
        if body_len > 0 {
            payload.put_u16(AJP_HEADER_CONTENT_LENGTH);
            put_ajp_string(&mut payload, &body_len.to_string());
        }

        if let Some(query) = query {
            payload.put_u8(AJP_ATTRIBUTE_QUERY_STRING);
            put_ajp_string(&mut payload, &query);
        }
        payload.put_u8(AJP_ATTRIBUTES_END);

        let mut frame = BinaryMut::new();
        put_packet(&mut frame, payload.chunk());

        let mut exchange = AjpExchange {
            socket: self.socket,
            read_buf: BinaryMut::new(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            body: if body_len > 0 {
                Some(std::mem::replace(req.body_mut(), Body::empty()))
            } else {
                None
            },
            terminated: body_len == 0,
            remaining: None,
        };

        match exchange.run(frame, no_body).await {
            Ok(res) => Ok(res),
            Err(e) => Err(e),
        }
    }
}

impl AjpExchange {
    async fn run(mut self, frame: BinaryMut, no_body: bool) -> ProtResult<Response<Body>> {
        match self.write_all(&frame.chunk().to_vec()).await {
            Ok(()) => {}
            Err(e) => {
                self.socket.release(false);
                return Err(e);
            }
        }
        // 第一段请求体不等拉取, 主动送出
        if self.body.is_some() {
            if let Err(e) = self.send_body_chunk(1024).await {
                self.socket.release(false);
                return Err(e);
            }
        }

        let mut got_any = false;
        // 等待 SEND_HEADERS, 其间处理体拉取
        let (status, header_list) = loop {
            let (code, payload) = match self.read_packet(&mut got_any).await {
                Ok(v) => v,
                Err(e) => {
                    self.socket.release(false);
                    return Err(e);
                }
            };
            match code {
                AJP_CODE_GET_BODY_CHUNK => {
                    let mut reader = PacketReader::new(payload.chunk());
                    let requested = match reader.u16() {
                        Ok(v) => v,
                        Err(e) => {
                            self.socket.release(false);
                            return Err(e);
                        }
                    };
                    if let Err(e) = self.send_body_chunk(requested).await {
                        self.socket.release(false);
                        return Err(e);
                    }
                }
                AJP_CODE_SEND_HEADERS => {
                    match Self::parse_send_headers(payload.chunk()) {
                        Ok(v) => break v,
                        Err(e) => {
                            self.socket.release(false);
                            return Err(e);
                        }
                    }
                }
                AJP_CODE_CPONG_REPLY => {
                    // 游离的 ping 回执, 忽略
                }
                _ => {
                    self.socket.release(false);
                    return Err(ProtError::Protocol("unknown packet from AJP server"));
                }
            }
        };

        let mut builder = Response::builder().status(status);
        let mut content_length: Option<u64> = None;
        for (name, value) in &header_list {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            }
            builder = builder.header(name.clone(), value.clone());
        }
        self.remaining = content_length;

        let empty_status = status == 204 || status == 304 || (status >= 100 && status < 200);
        if no_body || empty_status {
            // 后续的所有体包都按垃圾丢掉, 等 END_RESPONSE
            loop {
                let (code, payload) = match self.read_packet(&mut got_any).await {
                    Ok(v) => v,
                    Err(e) => {
                        self.socket.release(false);
                        return Err(e);
                    }
                };
                match code {
                    AJP_CODE_SEND_BODY_CHUNK => continue,
                    AJP_CODE_GET_BODY_CHUNK => {
                        let mut reader = PacketReader::new(payload.chunk());
                        if let Ok(requested) = reader.u16() {
                            if let Err(e) = self.send_body_chunk(requested).await {
                                self.socket.release(false);
                                return Err(e);
                            }
                        }
                    }
                    AJP_CODE_END_RESPONSE => {
                        self.socket.release(true);
                        let response = builder
                            .body(Body::empty())
                            .map_err(|e| ProtError::from(e))?;
                        return Ok(response);
                    }
                    AJP_CODE_CPONG_REPLY => continue,
                    _ => {
                        self.socket.release(false);
                        return Err(ProtError::Protocol("unknown packet from AJP server"));
                    }
                }
            }
        }

        let (sender, body) = BackendBody::channel(30);
        let response = builder.body(body).map_err(|e| ProtError::from(e))?;
        tokio::spawn(async move {
            self.pump_body(sender, got_any).await;
        });
        Ok(response)
    }

    fn parse_send_headers(payload: &[u8]) -> ProtResult<(u16, Vec<(String, String)>)> {
        let mut reader = PacketReader::new(payload);
        let status = reader.u16()?;
        let _reason = reader.string()?;
        let num_headers = reader.u16()?;
        let mut headers = vec![];
        for _ in 0..num_headers {
            // 头名: 高字节 0xA0 是编码名, 否则是带长前缀的字符串
            let first = reader.u16()?;
            let name = if first & 0xFF00 == 0xA000 {
                match response_header_name(first) {
                    Some(v) => v.to_string(),
                    None => return Err(ProtError::Protocol("unknown AJP header code")),
                }
            } else {
                let len = first as usize;
                if reader.pos + len + 1 > reader.data.len() {
                    return Err(ProtError::Protocol("short AJP string"));
                }
                let s = String::from_utf8_lossy(&reader.data[reader.pos..reader.pos + len])
                    .to_string();
                reader.pos += len + 1;
                s
            };
            let value = reader
                .string()?
                .ok_or(ProtError::Protocol("null AJP header value"))?;
            headers.push((name, value));
        }
        if status < 100 || status >= 600 {
            return Err(ProtError::Protocol("invalid status from AJP server"));
        }
        Ok((status, headers))
    }

    /// 响应体泵: SEND_BODY_CHUNK 进通道, END_RESPONSE 收尾
    async fn pump_body(mut self, sender: Sender<ProtResult<(bool, Binary)>>, mut got_any: bool) {
        loop {
            let (code, payload) = match self.read_packet(&mut got_any).await {
                Ok(v) => v,
                Err(e) => {
                    let _ = sender.send(Err(e)).await;
                    self.socket.release(false);
                    return;
                }
            };
            match code {
                AJP_CODE_SEND_BODY_CHUNK => {
                    // payload 此时不含 code 字节: u16 数据长 + 数据 + 垃圾
                    let mut reader = PacketReader::new(payload.chunk());
                    let chunk_len = match reader.u16() {
                        Ok(v) => v as usize,
                        Err(e) => {
                            let _ = sender.send(Err(e)).await;
                            self.socket.release(false);
                            return;
                        }
                    };
                    if payload.remaining() < 2 + chunk_len {
                        let _ = sender
                            .send(Err(ProtError::Protocol("malformed AJP SEND_BODY_CHUNK packet")))
                            .await;
                        self.socket.release(false);
                        return;
                    }
                    if let Some(remaining) = self.remaining {
                        if chunk_len as u64 > remaining {
                            let _ = sender
                                .send(Err(ProtError::Protocol(
                                    "excess chunk length in AJP SEND_BODY_CHUNK packet",
                                )))
                                .await;
                            self.socket.release(false);
                            return;
                        }
                        self.remaining = Some(remaining - chunk_len as u64);
                    }
                    let data =
                        Binary::from(payload.chunk()[2..2 + chunk_len].to_vec());
                    // 其后的 junk_length 字节随包一起丢弃
                    if sender.send(Ok((false, data))).await.is_err() {
                        self.socket.release(false);
                        return;
                    }
                }
                AJP_CODE_GET_BODY_CHUNK => {
                    let mut reader = PacketReader::new(payload.chunk());
                    if let Ok(requested) = reader.u16() {
                        if self.send_body_chunk(requested).await.is_err() {
                            self.socket.release(false);
                            return;
                        }
                    }
                }
                AJP_CODE_END_RESPONSE => {
                    if self.remaining.map(|v| v > 0).unwrap_or(false) {
                        let _ = sender
                            .send(Err(ProtError::Protocol("premature end of response")))
                            .await;
                        self.socket.release(false);
                        return;
                    }
                    let _ = sender.send(Ok((true, Binary::new()))).await;
                    self.socket.release(true);
                    return;
                }
                AJP_CODE_CPONG_REPLY => {
                    // 中途到达的 ping 回执按无事发生处理
                }
                _ => {
                    let _ = sender
                        .send(Err(ProtError::Protocol("unknown packet from AJP server")))
                        .await;
                    self.socket.release(false);
                    return;
                }
            }
        }
    }
}
