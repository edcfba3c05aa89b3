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
// Created Date: 2023/11/14 11:08:46

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use webparse::{Binary, BinaryMut, Buf, BufMut, Helper, Method, Request, Response};

use crate::{Consts, ProtError, ProtResult, Body, SocketLease};

use super::{read_some, BackendBody};

/// 响应体的三种计长方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Length(u64),
    Chunked,
    /// 靠对端关闭界定
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataCrlf,
    Trailer,
    Done,
}

/// chunked 传输编码的解码器
struct ChunkDecoder {
    state: ChunkState,
    left: u64,
    line: Vec<u8>,
}

impl ChunkDecoder {
    fn new() -> Self {
        Self {
            state: ChunkState::Size,
            left: 0,
            line: vec![],
        }
    }

    /// 尽量消费 buf, 解出的数据追加到 out, 返回是否已到末块
    fn decode(&mut self, buf: &mut BinaryMut, out: &mut BinaryMut) -> ProtResult<bool> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(true),
                ChunkState::Size | ChunkState::Trailer | ChunkState::DataCrlf => {
                    let chunk = buf.chunk();
                    let pos = chunk.iter().position(|b| *b == b'\n');
                    match pos {
                        None => {
                            self.line.extend_from_slice(chunk);
                            if self.line.len() > 1024 {
                                return Err(ProtError::Protocol("chunk header too long"));
                            }
                            buf.advance_all();
                            return Ok(false);
                        }
                        Some(p) => {
                            self.line.extend_from_slice(&chunk[..p]);
                            buf.advance(p + 1);
                            let mut line = std::mem::take(&mut self.line);
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            match self.state {
                                ChunkState::DataCrlf => {
                                    if !line.is_empty() {
                                        return Err(ProtError::Protocol("chunk data not terminated"));
                                    }
                                    self.state = ChunkState::Size;
                                }
                                ChunkState::Size => {
                                    let text = String::from_utf8_lossy(&line);
                                    let size_part = text.split(';').next().unwrap_or("").trim();
                                    let size = u64::from_str_radix(size_part, 16)
                                        .map_err(|_| ProtError::Protocol("bad chunk size"))?;
                                    if size == 0 {
                                        self.state = ChunkState::Trailer;
                                    } else {
                                        self.left = size;
                                        self.state = ChunkState::Data;
                                    }
                                }
                                ChunkState::Trailer => {
                                    // 空行收尾, 其余 trailer 行直接忽略
                                    if line.is_empty() {
                                        self.state = ChunkState::Done;
                                        return Ok(true);
                                    }
                                }
                                _ => unreachable!(),
                            }
                        }
                    }
                }
                ChunkState::Data => {
                    if buf.remaining() == 0 {
                        return Ok(false);
                    }
                    let take = std::cmp::min(self.left as usize, buf.remaining());
                    out.put_slice(&buf.chunk()[..take]);
                    buf.advance(take);
                    self.left -= take as u64;
                    if self.left == 0 {
                        self.state = ChunkState::DataCrlf;
                    }
                }
            }
        }
    }
}

/// HTTP/1.1 后端客户端.
/// 流程: 发送头 → 发送体 → 收状态行与响应头 → 流式收响应体;
/// 在任何响应字节之前对端断开记为 Refused, 由调度器决定重试.
pub struct HttpClient {
    socket: SocketLease,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HttpClient {
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

    pub async fn request(mut self, mut req: Request<Body>) -> ProtResult<Response<Body>> {
        let is_head = req.method() == &Method::Head;
        match self.send_request(&mut req).await {
            Ok(()) => {}
            Err(e) => {
                self.socket.release(false);
                return Err(e);
            }
        }
        let mut read_buf = BinaryMut::new();
        let response = match self.read_headers(&mut read_buf).await {
            Ok(res) => res,
            Err(e) => {
                self.socket.release(false);
                return Err(e);
            }
        };

        let keep_alive = super::header_value(response.headers(), "Connection")
            .map(|v| !v.eq_ignore_ascii_case("close"))
            .unwrap_or(true);

        let status = response.status().as_u16();
        let mode = if is_head || status == 204 || status == 304 {
            BodyMode::None
        } else if response.headers().is_chunked() {
            BodyMode::Chunked
        } else {
            let body_len = response.get_body_len();
            if body_len < 0 {
                BodyMode::Eof
            } else {
                BodyMode::Length(body_len as u64)
            }
        };

        match mode {
            BodyMode::None => {
                self.socket.release(keep_alive);
                let (response, _) = response.into(Body::empty());
                Ok(response)
            }
            BodyMode::Length(0) => {
                self.socket.release(keep_alive);
                let (response, _) = response.into(Body::empty());
                Ok(response)
            }
            _ => {
                let (sender, body) = BackendBody::channel(30);
                let (response, _) = response.into(body);
                tokio::spawn(async move {
                    let reuse = self.pump_body(mode, read_buf, &sender).await;
                    self.socket.release(reuse && keep_alive);
                });
                Ok(response)
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> ProtResult<()> {
        match tokio::time::timeout(self.write_timeout, self.socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtError::write_timeout("backend")),
        }
    }

    async fn send_request(&mut self, req: &mut Request<Body>) -> ProtResult<()> {
        let body_len = req.body().available();
        let chunked = match body_len {
            Some(len) => {
                if len > 0 || req.method() == &Method::Post || req.method() == &Method::Put {
                    req.headers_mut()
                        .insert("Content-Length".to_string(), len.to_string());
                }
                false
            }
            None => {
                req.headers_mut()
                    .insert("Transfer-Encoding".to_string(), "chunked".to_string());
                true
            }
        };

        let mut buffer = BinaryMut::new();
        req.encode_header(&mut buffer)?;
        self.write_all(&buffer.chunk().to_vec()).await?;

        // 请求体按到达顺序写出
        loop {
            let next = std::future::poll_fn(|cx| req.body_mut().poll_data(cx)).await?;
            let (is_end, bin) = next;
            if bin.remaining() > 0 {
                if chunked {
                    let mut framed = BinaryMut::new();
                    Helper::encode_chunk_data(&mut framed, bin.chunk())?;
                    self.write_all(&framed.chunk().to_vec()).await?;
                } else {
                    self.write_all(&bin.chunk().to_vec()).await?;
                }
            }
            if is_end {
                if chunked {
                    let mut framed = BinaryMut::new();
                    Helper::encode_chunk_data(&mut framed, &[])?;
                    self.write_all(&framed.chunk().to_vec()).await?;
                }
                break;
            }
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut BinaryMut) -> ProtResult<usize> {
        match tokio::time::timeout(self.read_timeout, read_some(&mut self.socket, buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtError::read_timeout("backend")),
        }
    }

    async fn read_headers(&mut self, read_buf: &mut BinaryMut) -> ProtResult<Response<()>> {
        let mut got_any = false;
        loop {
            let n = self.read_some(read_buf).await?;
            if n == 0 {
                if got_any {
                    return Err(ProtError::Protocol("premature close in headers"));
                }
                return Err(ProtError::Refused);
            }
            got_any = true;

            let mut response = Response::new(());
            let size = match response.parse_buffer(&mut read_buf.clone()) {
                Err(e) => {
                    if e.is_partial() {
                        continue;
                    }
                    return Err(e.into());
                }
                Ok(n) => n,
            };
            if response.is_partial() {
                continue;
            }
            read_buf.advance(size);
            return Ok(response);
        }
    }

    /// 把响应体搬进通道, 返回连接是否还能复用
    async fn pump_body(
        &mut self,
        mode: BodyMode,
        mut read_buf: BinaryMut,
        sender: &Sender<ProtResult<(bool, Binary)>>,
    ) -> bool {
        let mut left = match mode {
            BodyMode::Length(len) => len,
            _ => 0,
        };
        let mut decoder = ChunkDecoder::new();
        loop {
            // 先消化缓冲里已有的数据
            if read_buf.remaining() > 0 {
                match mode {
                    BodyMode::Length(_) => {
                        let take = std::cmp::min(left as usize, read_buf.remaining());
                        let data = Binary::from(read_buf.chunk()[..take].to_vec());
                        read_buf.advance(take);
                        left -= take as u64;
                        let is_end = left == 0;
                        if sender.send(Ok((is_end, data))).await.is_err() {
                            return false;
                        }
                        if is_end {
                            return true;
                        }
                    }
                    BodyMode::Chunked => {
                        let mut out = BinaryMut::new();
                        match decoder.decode(&mut read_buf, &mut out) {
                            Ok(done) => {
                                if out.remaining() > 0 || done {
                                    let data = Binary::from(out.chunk().to_vec());
                                    if sender.send(Ok((done, data))).await.is_err() {
                                        return false;
                                    }
                                }
                                if done {
                                    return true;
                                }
                            }
                            Err(e) => {
                                let _ = sender.send(Err(e)).await;
                                return false;
                            }
                        }
                    }
                    BodyMode::Eof => {
                        let data = Binary::from(read_buf.chunk().to_vec());
                        read_buf.advance_all();
                        if sender.send(Ok((false, data))).await.is_err() {
                            return false;
                        }
                    }
                    BodyMode::None => unreachable!(),
                }
            }

            match self.read_some(&mut read_buf).await {
                Ok(0) => match mode {
                    BodyMode::Eof => {
                        let _ = sender.send(Ok((true, Binary::new()))).await;
                        // 靠 EOF 收尾的连接没有复用价值
                        return false;
                    }
                    _ => {
                        let _ = sender
                            .send(Err(ProtError::Protocol("premature end of response")))
                            .await;
                        return false;
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    let _ = sender.send(Err(e)).await;
                    return false;
                }
            }
        }
    }
}
