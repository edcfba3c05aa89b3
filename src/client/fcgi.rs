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
// Created Date: 2023/11/20 10:44:02

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use webparse::{Binary, BinaryMut, Buf, BufMut, Request, Response};

use crate::{Consts, ProtError, ProtResult, Body, SocketLease};

use super::{find_headers_end, parse_cgi_headers, read_some, BackendBody};

const FCGI_VERSION: u8 = 1;

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

const FCGI_REQUEST_COMPLETE: u8 = 0;

/// 参数记录用到的连接环境
#[derive(Debug, Clone, Default)]
pub struct FcgiRequestInfo {
    pub document_root: String,
    pub script_filename: String,
    pub path_info: String,
    pub remote_addr: String,
    pub server_name: String,
    pub server_port: u16,
}

fn put_record(out: &mut BinaryMut, record_type: u8, request_id: u16, content: &[u8]) {
    out.put_u8(FCGI_VERSION);
    out.put_u8(record_type);
    out.put_u16(request_id);
    out.put_u16(content.len() as u16);
    out.put_u8(0);
    out.put_u8(0);
    out.put_slice(content);
}

/// 名值对的长度: 短的 1 字节, 长的 4 字节并置最高位
fn put_pair_len(out: &mut BinaryMut, len: usize) {
    if len < 128 {
        out.put_u8(len as u8);
    } else {
        out.put_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
    }
}

fn put_pair(out: &mut BinaryMut, name: &str, value: &str) {
    put_pair_len(out, name.len());
    put_pair_len(out, value.len());
    out.put_slice(name.as_bytes());
    out.put_slice(value.as_bytes());
}

/// FastCGI 后端客户端, 响应者角色.
/// 记录帧 {version, type, request_id, content_length, padding};
/// STDOUT 里是 CGI 风格的响应, END_REQUEST 收尾.
pub struct FcgiClient {
    socket: SocketLease,
    read_timeout: Duration,
    write_timeout: Duration,
    request_id: u16,
}

impl FcgiClient {
    pub fn new(socket: SocketLease) -> Self {
        Self {
            socket,
            read_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            request_id: 1,
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    fn build_params(req: &Request<Body>, info: &FcgiRequestInfo) -> BinaryMut {
        let mut params = BinaryMut::new();
        let path = req.path().clone();
        let (uri, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path.clone(), req.url().query.clone().unwrap_or_default()),
        };
        put_pair(&mut params, "GATEWAY_INTERFACE", "CGI/1.1");
        put_pair(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
        put_pair(&mut params, "REQUEST_METHOD", &req.method().to_string());
        put_pair(&mut params, "REQUEST_URI", &path);
        put_pair(&mut params, "SCRIPT_NAME", &uri);
        put_pair(&mut params, "QUERY_STRING", &query);
        put_pair(&mut params, "DOCUMENT_ROOT", &info.document_root);
        put_pair(&mut params, "SCRIPT_FILENAME", &info.script_filename);
        if !info.path_info.is_empty() {
            put_pair(&mut params, "PATH_INFO", &info.path_info);
        }
        put_pair(&mut params, "REMOTE_ADDR", &info.remote_addr);
        put_pair(&mut params, "SERVER_NAME", &info.server_name);
        put_pair(&mut params, "SERVER_PORT", &info.server_port.to_string());
        if let Some(len) = req.body().available() {
            if len > 0 {
                put_pair(&mut params, "CONTENT_LENGTH", &len.to_string());
            }
        }
        for (name, value) in req.headers().iter() {
            let lower = name.to_string().to_ascii_lowercase();
            match &*lower {
                "content-type" => put_pair(&mut params, "CONTENT_TYPE", &value.as_string().unwrap_or_default()),
                "content-length" => {}
                _ => {
                    let env = format!("HTTP_{}", lower.to_ascii_uppercase().replace('-', "_"));
                    put_pair(&mut params, &env, &value.as_string().unwrap_or_default());
                }
            }
        }
        params
    }

    pub async fn request(
        mut self,
        mut req: Request<Body>,
        info: FcgiRequestInfo,
    ) -> ProtResult<Response<Body>> {
        let request_id = self.request_id;
        let mut out = BinaryMut::new();

        let mut begin = BinaryMut::new();
        begin.put_u16(FCGI_RESPONDER);
        begin.put_u8(FCGI_KEEP_CONN);
        begin.put_slice(&[0u8; 5]);
        put_record(&mut out, FCGI_BEGIN_REQUEST, request_id, begin.chunk());

        let params = Self::build_params(&req, &info);
        // 参数可能超过单记录上限, 按 32k 切
        for chunk in params.chunk().chunks(32 * 1024) {
            put_record(&mut out, FCGI_PARAMS, request_id, chunk);
        }
        put_record(&mut out, FCGI_PARAMS, request_id, &[]);

        if let Err(e) = self.write_with_timeout(&out.chunk().to_vec()).await {
            self.socket.release(false);
            return Err(e);
        }

        // 请求体走 STDIN 记录
        let mut body = std::mem::replace(req.body_mut(), Body::empty());
        loop {
            let next = std::future::poll_fn(|cx| body.poll_data(cx)).await;
            let (is_end, bin) = match next {
                Ok(v) => v,
                Err(e) => {
                    self.socket.release(false);
                    return Err(e);
                }
            };
            let mut out = BinaryMut::new();
            for chunk in bin.chunk().chunks(32 * 1024) {
                put_record(&mut out, FCGI_STDIN, request_id, chunk);
            }
            if is_end {
                put_record(&mut out, FCGI_STDIN, request_id, &[]);
            }
            if out.remaining() > 0 {
                if let Err(e) = self.write_with_timeout(&out.chunk().to_vec()).await {
                    self.socket.release(false);
                    return Err(e);
                }
            }
            if is_end {
                break;
            }
        }

        self.recv_response(request_id).await
    }

    async fn write_with_timeout(&mut self, data: &[u8]) -> ProtResult<()> {
        match tokio::time::timeout(self.write_timeout, self.socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtError::write_timeout("fcgi")),
        }
    }

    async fn recv_response(mut self, request_id: u16) -> ProtResult<Response<Body>> {
        let mut read_buf = BinaryMut::new();
        let mut got_any = false;
        let mut stdout = BinaryMut::new();

        // 读 STDOUT 直到响应头完整
        let (status, header_list, leftover) = loop {
            let record = match self.read_record(&mut read_buf, &mut got_any).await {
                Ok(v) => v,
                Err(e) => {
                    self.socket.release(false);
                    return Err(e);
                }
            };
            match record {
                (FCGI_STDOUT, id, content) if id == request_id => {
                    stdout.put_slice(content.chunk());
                    if let Some(pos) = find_headers_end(stdout.chunk()) {
                        match parse_cgi_headers(&stdout.chunk()[..pos]) {
                            Ok((status, headers)) => {
                                let leftover =
                                    Binary::from(stdout.chunk()[pos..].to_vec());
                                break (status, headers, leftover);
                            }
                            Err(e) => {
                                self.socket.release(false);
                                return Err(e);
                            }
                        }
                    }
                }
                (FCGI_STDERR, id, content) if id == request_id => {
                    if content.remaining() > 0 {
                        log::warn!(
                            "fcgi stderr: {}",
                            String::from_utf8_lossy(content.chunk())
                        );
                    }
                }
                (FCGI_END_REQUEST, id, _) if id == request_id => {
                    self.socket.release(false);
                    return Err(if got_any {
                        ProtError::Protocol("premature end of response")
                    } else {
                        ProtError::Refused
                    });
                }
                _ => {
                    self.socket.release(false);
                    return Err(ProtError::Protocol("unexpected FastCGI record"));
                }
            }
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in &header_list {
            builder = builder.header(name.clone(), value.clone());
        }
        let (sender, response_body) = BackendBody::channel(30);
        let response = builder
            .body(response_body)
            .map_err(|e| ProtError::from(e))?;

        tokio::spawn(async move {
            if leftover.remaining() > 0 {
                if sender.send(Ok((false, leftover))).await.is_err() {
                    self.socket.release(false);
                    return;
                }
            }
            self.pump_body(request_id, read_buf, sender).await;
        });
        Ok(response)
    }

    async fn pump_body(
        mut self,
        request_id: u16,
        mut read_buf: BinaryMut,
        sender: Sender<ProtResult<(bool, Binary)>>,
    ) {
        let mut got_any = true;
        loop {
            let record = match self.read_record(&mut read_buf, &mut got_any).await {
                Ok(v) => v,
                Err(e) => {
                    let _ = sender.send(Err(e)).await;
                    self.socket.release(false);
                    return;
                }
            };
            match record {
                (FCGI_STDOUT, id, content) if id == request_id => {
                    if content.remaining() > 0 {
                        if sender.send(Ok((false, content))).await.is_err() {
                            self.socket.release(false);
                            return;
                        }
                    }
                }
                (FCGI_STDERR, id, content) if id == request_id => {
                    if content.remaining() > 0 {
                        log::warn!(
                            "fcgi stderr: {}",
                            String::from_utf8_lossy(content.chunk())
                        );
                    }
                }
                (FCGI_END_REQUEST, id, content) if id == request_id => {
                    let complete = content.remaining() >= 5
                        && content.chunk()[4] == FCGI_REQUEST_COMPLETE;
                    if complete {
                        let _ = sender.send(Ok((true, Binary::new()))).await;
                        self.socket.release(true);
                    } else {
                        let _ = sender
                            .send(Err(ProtError::Protocol("FastCGI request not complete")))
                            .await;
                        self.socket.release(false);
                    }
                    return;
                }
                _ => {
                    let _ = sender
                        .send(Err(ProtError::Protocol("unexpected FastCGI record")))
                        .await;
                    self.socket.release(false);
                    return;
                }
            }
        }
    }

    /// 读一条完整记录, 返回 (type, request_id, content)
    async fn read_record(
        &mut self,
        read_buf: &mut BinaryMut,
        got_any: &mut bool,
    ) -> ProtResult<(u8, u16, Binary)> {
        loop {
            let chunk = read_buf.chunk();
            if chunk.len() >= 8 {
                if chunk[0] != FCGI_VERSION {
                    return Err(ProtError::Protocol("bad FastCGI version"));
                }
                let record_type = chunk[1];
                let request_id = u16::from_be_bytes([chunk[2], chunk[3]]);
                let content_length = u16::from_be_bytes([chunk[4], chunk[5]]) as usize;
                let padding = chunk[6] as usize;
                let total = 8 + content_length + padding;
                if chunk.len() >= total {
                    let content = Binary::from(chunk[8..8 + content_length].to_vec());
                    read_buf.advance(total);
                    return Ok((record_type, request_id, content));
                }
            }
            let n = match tokio::time::timeout(
                self.read_timeout,
                read_some(&mut self.socket, read_buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtError::read_timeout("fcgi")),
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
}

