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
// Created Date: 2023/11/22 09:31:55

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use webparse::{Binary, BinaryMut, Buf, BufMut, Method, Request, Response};

use crate::{Consts, ProtError, ProtResult, Body, SocketLease};

use super::{read_some, BackendBody};

pub const WAS_COMMAND_NOP: u16 = 0;
pub const WAS_COMMAND_REQUEST: u16 = 1;
pub const WAS_COMMAND_METHOD: u16 = 2;
pub const WAS_COMMAND_URI: u16 = 3;
pub const WAS_COMMAND_SCRIPT_NAME: u16 = 4;
pub const WAS_COMMAND_PATH_INFO: u16 = 5;
pub const WAS_COMMAND_QUERY_STRING: u16 = 6;
pub const WAS_COMMAND_HEADER: u16 = 7;
pub const WAS_COMMAND_PARAMETER: u16 = 8;
pub const WAS_COMMAND_STATUS: u16 = 9;
pub const WAS_COMMAND_NO_DATA: u16 = 10;
pub const WAS_COMMAND_DATA: u16 = 11;
pub const WAS_COMMAND_LENGTH: u16 = 12;
pub const WAS_COMMAND_STOP: u16 = 13;
pub const WAS_COMMAND_PREMATURE: u16 = 14;

fn to_was_method(method: &Method) -> u32 {
    match method {
        Method::Head => 1,
        Method::Get => 2,
        Method::Post => 3,
        Method::Put => 4,
        Method::Delete => 5,
        Method::Options => 6,
        Method::Trace => 7,
        _ => 2,
    }
}

/// 响应体的进度状态.
/// 宣告长度只会出现一次且不得小于已收字节;
/// PREMATURE 宣告等于已收字节数时按正常结束处理, 只有缺口才算错.
#[derive(Debug, Default)]
struct WasInputState {
    received: u64,
    length: Option<u64>,
    premature: bool,
}

impl WasInputState {
    fn set_length(&mut self, length: u64) -> ProtResult<()> {
        match self.length {
            Some(known) if known != length => {
                Err(ProtError::Protocol("wrong input length announced"))
            }
            _ => {
                if length < self.received {
                    return Err(ProtError::Protocol("announced length is too small"));
                }
                self.length = Some(length);
                self.premature = false;
                Ok(())
            }
        }
    }

    fn set_premature(&mut self, length: u64) -> ProtResult<()> {
        if let Some(known) = self.length {
            if length > known {
                return Err(ProtError::Protocol("announced premature length is too large"));
            }
        }
        if self.received > length {
            return Err(ProtError::Protocol("announced premature length is too small"));
        }
        self.length = Some(length);
        self.premature = true;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.length.map(|l| self.received >= l).unwrap_or(false)
    }

    /// 到齐即善终; 收不满宣告值才是截断
    fn finish(&self) -> ProtResult<()> {
        if self.premature && !self.is_eof() {
            return Err(ProtError::Protocol("premature end of WAS response"));
        }
        Ok(())
    }
}

fn put_control(out: &mut BinaryMut, command: u16, payload: &[u8]) {
    out.put_slice(&(payload.len() as u16).to_le_bytes());
    out.put_slice(&command.to_le_bytes());
    out.put_slice(payload);
}

/// WAS 后端客户端: 控制通道走元数据包 {length, command},
/// 响应体走独立的数据通道, 长度与截断由控制包宣告.
pub struct WasClient {
    control: SocketLease,
    data: SocketLease,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl WasClient {
    pub fn new(control: SocketLease, data: SocketLease) -> Self {
        Self {
            control,
            data,
            read_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub async fn request(
        mut self,
        mut req: Request<Body>,
        parameters: Vec<(String, String)>,
    ) -> ProtResult<Response<Body>> {
        let result = self.send_request(&mut req, parameters).await;
        if let Err(e) = result {
            self.control.release(false);
            self.data.release(false);
            return Err(e);
        }
        self.recv_response().await
    }

    async fn send_request(
        &mut self,
        req: &mut Request<Body>,
        parameters: Vec<(String, String)>,
    ) -> ProtResult<()> {
        let mut out = BinaryMut::new();
        put_control(&mut out, WAS_COMMAND_REQUEST, &[]);
        put_control(
            &mut out,
            WAS_COMMAND_METHOD,
            &to_was_method(req.method()).to_le_bytes(),
        );

        let path = req.path().clone();
        let (uri, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.clone(), req.url().query.clone()),
        };
        put_control(&mut out, WAS_COMMAND_URI, path.as_bytes());
        put_control(&mut out, WAS_COMMAND_SCRIPT_NAME, uri.as_bytes());
        if let Some(query) = query {
            put_control(&mut out, WAS_COMMAND_QUERY_STRING, query.as_bytes());
        }
        for (name, value) in req.headers().iter() {
            let entry = format!("{}={}", name.to_string().to_ascii_lowercase(), value.as_string().unwrap_or_default());
            put_control(&mut out, WAS_COMMAND_HEADER, entry.as_bytes());
        }
        for (name, value) in &parameters {
            let entry = format!("{}={}", name, value);
            put_control(&mut out, WAS_COMMAND_PARAMETER, entry.as_bytes());
        }

        let body_len = req.body().available();
        match body_len {
            Some(0) => {
                put_control(&mut out, WAS_COMMAND_NO_DATA, &[]);
                self.write_control(&out.chunk().to_vec()).await?;
            }
            Some(len) => {
                put_control(&mut out, WAS_COMMAND_DATA, &[]);
                put_control(&mut out, WAS_COMMAND_LENGTH, &len.to_le_bytes());
                self.write_control(&out.chunk().to_vec()).await?;
                let mut body = std::mem::replace(req.body_mut(), Body::empty());
                loop {
                    let (is_end, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
                    if bin.remaining() > 0 {
                        match tokio::time::timeout(
                            self.write_timeout,
                            self.data.write_all(bin.chunk()),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return Err(e.into()),
                            Err(_) => return Err(ProtError::write_timeout("was data")),
                        }
                    }
                    if is_end {
                        break;
                    }
                }
            }
            None => {
                // 长度未知: 先宣告 DATA, 结束后补 LENGTH
                put_control(&mut out, WAS_COMMAND_DATA, &[]);
                self.write_control(&out.chunk().to_vec()).await?;
                let mut body = std::mem::replace(req.body_mut(), Body::empty());
                let mut sent = 0u64;
                loop {
                    let (is_end, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
                    if bin.remaining() > 0 {
                        sent += bin.remaining() as u64;
                        match tokio::time::timeout(
                            self.write_timeout,
                            self.data.write_all(bin.chunk()),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return Err(e.into()),
                            Err(_) => return Err(ProtError::write_timeout("was data")),
                        }
                    }
                    if is_end {
                        break;
                    }
                }
                let mut tail = BinaryMut::new();
                put_control(&mut tail, WAS_COMMAND_LENGTH, &sent.to_le_bytes());
                self.write_control(&tail.chunk().to_vec()).await?;
            }
        }
        Ok(())
    }

    async fn write_control(&mut self, data: &[u8]) -> ProtResult<()> {
        match tokio::time::timeout(self.write_timeout, self.control.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtError::write_timeout("was control")),
        }
    }

    async fn recv_response(mut self) -> ProtResult<Response<Body>> {
        let mut control_buf = BinaryMut::new();
        let mut got_any = false;
        let mut status: Option<u16> = None;
        let mut headers: Vec<(String, String)> = vec![];
        let mut input = WasInputState::default();

        // 收齐 STATUS/HEADER 直到 DATA 或 NO_DATA
        let has_body = loop {
            let (command, payload) =
                match read_control(&mut self.control, &mut control_buf, self.read_timeout, &mut got_any)
                    .await
                {
                    Ok(v) => v,
                    Err(e) => {
                        self.control.release(false);
                        self.data.release(false);
                        return Err(e);
                    }
                };
            match command {
                WAS_COMMAND_NOP => {}
                WAS_COMMAND_STATUS => {
                    if payload.remaining() >= 4 {
                        let v = u32::from_le_bytes([
                            payload.chunk()[0],
                            payload.chunk()[1],
                            payload.chunk()[2],
                            payload.chunk()[3],
                        ]);
                        status = Some(v as u16);
                    } else {
                        self.control.release(false);
                        self.data.release(false);
                        return Err(ProtError::Protocol("malformed WAS STATUS"));
                    }
                }
                WAS_COMMAND_HEADER => {
                    let text = String::from_utf8_lossy(payload.chunk()).to_string();
                    match text.split_once('=') {
                        Some((name, value)) => {
                            headers.push((name.to_string(), value.to_string()))
                        }
                        None => {
                            self.control.release(false);
                            self.data.release(false);
                            return Err(ProtError::Protocol("malformed WAS header"));
                        }
                    }
                }
                WAS_COMMAND_LENGTH => {
                    let len = read_u64(&payload)?;
                    if let Err(e) = input.set_length(len) {
                        self.control.release(false);
                        self.data.release(false);
                        return Err(e);
                    }
                }
                WAS_COMMAND_NO_DATA => break false,
                WAS_COMMAND_DATA => break true,
                _ => {
                    self.control.release(false);
                    self.data.release(false);
                    return Err(ProtError::Protocol("unexpected WAS control packet"));
                }
            }
        };

        let status = match status {
            Some(v) => v,
            None => {
                self.control.release(false);
                self.data.release(false);
                return Err(ProtError::Protocol("missing WAS status"));
            }
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            builder = builder.header(name.clone(), value.clone());
        }

        if !has_body {
            self.control.release(true);
            self.data.release(true);
            let response = builder.body(Body::empty()).map_err(|e| ProtError::from(e))?;
            return Ok(response);
        }

        let (sender, body) = BackendBody::channel(30);
        let response = builder.body(body).map_err(|e| ProtError::from(e))?;
        let read_timeout = self.read_timeout;
        tokio::spawn(async move {
            self.pump_body(control_buf, input, sender, read_timeout).await;
        });
        Ok(response)
    }

    /// 数据与控制两路并行: 数据进通道, 控制包改写长度状态
    async fn pump_body(
        mut self,
        mut control_buf: BinaryMut,
        mut input: WasInputState,
        sender: Sender<ProtResult<(bool, Binary)>>,
        read_timeout: Duration,
    ) {
        let mut data_buf = BinaryMut::new();
        let mut got_any = true;
        loop {
            if input.is_eof() {
                match input.finish() {
                    Ok(()) => {
                        let _ = sender.send(Ok((true, Binary::new()))).await;
                        self.control.release(!input.premature);
                        self.data.release(!input.premature);
                    }
                    Err(e) => {
                        let _ = sender.send(Err(e)).await;
                        self.control.release(false);
                        self.data.release(false);
                    }
                }
                return;
            }

            tokio::select! {
                data = read_some(&mut self.data, &mut data_buf) => {
                    match data {
                        Ok(0) => {
                            let _ = sender
                                .send(Err(ProtError::Protocol("premature end of WAS response")))
                                .await;
                            self.control.release(false);
                            self.data.release(false);
                            return;
                        }
                        Ok(_) => {
                            let mut take = data_buf.remaining();
                            if let Some(length) = input.length {
                                let left = (length - input.received) as usize;
                                take = std::cmp::min(take, left);
                            }
                            let bin = Binary::from(data_buf.chunk()[..take].to_vec());
                            data_buf.advance(take);
                            input.received += take as u64;
                            let is_end = input.is_eof();
                            if sender.send(Ok((is_end, bin))).await.is_err() {
                                self.control.release(false);
                                self.data.release(false);
                                return;
                            }
                            if is_end {
                                self.control.release(true);
                                self.data.release(true);
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = sender.send(Err(e.into())).await;
                            self.control.release(false);
                            self.data.release(false);
                            return;
                        }
                    }
                }
                control = read_control(&mut self.control, &mut control_buf, read_timeout, &mut got_any) => {
                    match control {
                        Ok((WAS_COMMAND_LENGTH, payload)) => {
                            let result = read_u64(&payload).and_then(|len| input.set_length(len));
                            if let Err(e) = result {
                                let _ = sender.send(Err(e)).await;
                                self.control.release(false);
                                self.data.release(false);
                                return;
                            }
                        }
                        Ok((WAS_COMMAND_PREMATURE, payload)) => {
                            let result = read_u64(&payload).and_then(|len| input.set_premature(len));
                            if let Err(e) = result {
                                let _ = sender.send(Err(e)).await;
                                self.control.release(false);
                                self.data.release(false);
                                return;
                            }
                        }
                        Ok((WAS_COMMAND_NOP, _)) => {}
                        Ok(_) => {
                            let _ = sender
                                .send(Err(ProtError::Protocol("unexpected WAS control packet")))
                                .await;
                            self.control.release(false);
                            self.data.release(false);
                            return;
                        }
                        Err(e) => {
                            let _ = sender.send(Err(e)).await;
                            self.control.release(false);
                            self.data.release(false);
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn read_u64(payload: &Binary) -> ProtResult<u64> {
    if payload.remaining() < 8 {
        return Err(ProtError::Protocol("short WAS length payload"));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload.chunk()[..8]);
    Ok(u64::from_le_bytes(bytes))
}

/// 读一个控制包 {length u16, command u16} + payload
async fn read_control(
    control: &mut SocketLease,
    buf: &mut BinaryMut,
    read_timeout: Duration,
    got_any: &mut bool,
) -> ProtResult<(u16, Binary)> {
    loop {
        let chunk = buf.chunk();
        if chunk.len() >= 4 {
            let length = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
            let command = u16::from_le_bytes([chunk[2], chunk[3]]);
            if chunk.len() >= 4 + length {
                let payload = Binary::from(chunk[4..4 + length].to_vec());
                buf.advance(4 + length);
                return Ok((command, payload));
            }
        }
        let n = match tokio::time::timeout(read_timeout, read_some(control, buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ProtError::read_timeout("was control")),
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
