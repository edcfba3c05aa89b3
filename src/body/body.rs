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
// Created Date: 2023/11/03 14:37:12

use brotli::CompressorWriter;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};

use std::fmt::Debug;
use std::{
    fmt::Display,
    io::Write,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::{
    fs::File,
    io::{AsyncRead, ReadBuf},
    sync::mpsc::Receiver,
};
use webparse::{Binary, BinaryMut, Buf, BufMut, Helper, Serialize, WebResult};

use crate::{Consts, ProtError, ProtResult};

/// 可组合的拉取数据源, 组合流(拼接/替换/转码等)都实现该特征
pub trait BodySource: Send + Sync {
    /// 拉取下一段数据, bool 表示是否为最后一段
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>>;

    /// 剩余字节数, 已知精确值时返回
    fn origin_len(&self) -> Option<u64> {
        None
    }
}

enum InnerSource {
    None,
    Receiver(Receiver<(bool, Binary)>),
    File { file: File, left: u64, cache_buf: Vec<u8> },
    Stream(Box<dyn BodySource>),
}

impl Debug for InnerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InnerSource::None => f.write_str("None"),
            InnerSource::Receiver(_) => f.write_str("Receiver"),
            InnerSource::File { left, .. } => f.debug_struct("File").field("left", left).finish(),
            InnerSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl InnerSource {
    pub fn is_none(&self) -> bool {
        match self {
            InnerSource::None => true,
            _ => false,
        }
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<ProtResult<(bool, Binary)>>> {
        match self {
            InnerSource::None => Poll::Ready(None),
            InnerSource::Receiver(receiver) => match receiver.poll_recv(cx) {
                Poll::Ready(Some(v)) => Poll::Ready(Some(Ok(v))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            InnerSource::File { file, left, cache_buf } => {
                if *left == 0 {
                    return Poll::Ready(None);
                }
                let max = std::cmp::min(*left as usize, cache_buf.len());
                let size = {
                    let mut buf = ReadBuf::new(&mut cache_buf[..max]);
                    match ready!(Pin::new(file).poll_read(cx, &mut buf)) {
                        Ok(_) => buf.filled().len(),
                        Err(e) => return Poll::Ready(Some(Err(e.into()))),
                    }
                };
                if size == 0 {
                    // 文件提前见底, 按声明长度算是协议性截断
                    return Poll::Ready(Some(Err(ProtError::Protocol("file truncated"))));
                }
                *left -= size as u64;
                let is_end = *left == 0;
                Poll::Ready(Some(Ok((is_end, Binary::from(cache_buf[..size].to_vec())))))
            }
            InnerSource::Stream(stream) => match ready!(stream.poll_data(cx)) {
                Ok(v) => Poll::Ready(Some(Ok(v))),
                Err(e) => Poll::Ready(Some(Err(e))),
            },
        }
    }
}

struct InnerCompress {
    write_gz: Option<GzEncoder<BinaryMut>>,
    write_br: Option<CompressorWriter<BinaryMut>>,
    write_de: Option<DeflateEncoder<BinaryMut>>,
}

impl Debug for InnerCompress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerCompress")
            .field("write_gz", &self.write_gz)
            .field("write_de", &self.write_de)
            .finish()
    }
}

impl InnerCompress {
    pub fn new() -> Self {
        Self {
            write_gz: None,
            write_br: None,
            write_de: None,
        }
    }

    pub fn open_write_gz(&mut self) {
        if self.write_gz.is_none() {
            self.write_gz = Some(GzEncoder::new(BinaryMut::new(), Compression::default()));
        }
    }

    pub fn open_write_de(&mut self) {
        if self.write_de.is_none() {
            self.write_de = Some(DeflateEncoder::new(BinaryMut::new(), Compression::default()));
        }
    }

    pub fn open_write_br(&mut self) {
        if self.write_br.is_none() {
            self.write_br = Some(CompressorWriter::new(BinaryMut::new(), 4096, 11, 22));
        }
    }
}

/// 贯穿整个管道的拉取式字节流.
/// 数据来源可以是内存, 通道, 文件或另一个组合流; 消费端要么按块读取,
/// 要么经 poll_encode 带上 chunked/压缩编码写入连接缓冲.
#[derive(Debug)]
pub struct Body {
    receiver: InnerSource,
    binary: Option<Binary>,
    binary_mut: Option<BinaryMut>,
    cache_body_data: BinaryMut,
    origin_compress_method: i8,
    now_compress_method: i8,
    compress: InnerCompress,
    is_chunked: bool,
    is_end: bool,
    is_process_end: bool,
    /// 错误只上报一次, 之后流保持终结状态
    error: Option<ProtError>,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            receiver: InnerSource::None,
            binary: Default::default(),
            binary_mut: Default::default(),
            cache_body_data: BinaryMut::new(),
            origin_compress_method: Consts::COMPRESS_METHOD_NONE,
            now_compress_method: Consts::COMPRESS_METHOD_NONE,
            compress: InnerCompress::new(),
            is_chunked: false,
            is_end: true,
            is_process_end: false,
            error: None,
        }
    }
}

impl Body {
    pub fn empty() -> Body {
        Default::default()
    }

    pub fn only(binary: Binary) -> Body {
        Body {
            binary: Some(binary),
            ..Default::default()
        }
    }

    pub fn new_text(text: String) -> Body {
        Body::only(Binary::from(text.into_bytes()))
    }

    pub fn new_binary(binary: BinaryMut) -> Body {
        Body {
            binary_mut: Some(binary),
            ..Default::default()
        }
    }

    pub fn new(receiver: Receiver<(bool, Binary)>, binary: BinaryMut, is_end: bool) -> Body {
        Body {
            receiver: InnerSource::Receiver(receiver),
            binary_mut: Some(binary),
            is_end,
            ..Default::default()
        }
    }

    pub fn new_file(file: File, length: u64) -> Body {
        let mut vec = Vec::with_capacity(20480);
        vec.resize(20480, 0);
        Body {
            receiver: InnerSource::File {
                file,
                left: length,
                cache_buf: vec,
            },
            is_end: length == 0,
            ..Default::default()
        }
    }

    pub fn new_source(source: Box<dyn BodySource>) -> Body {
        Body {
            receiver: InnerSource::Stream(source),
            is_end: false,
            ..Default::default()
        }
    }

    /// 指定长度的全零流
    pub fn zero(len: u64) -> Body {
        struct Zero(u64);
        impl BodySource for Zero {
            fn poll_data(&mut self, _cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
                if self.0 == 0 {
                    return Poll::Ready(Ok((true, Binary::new())));
                }
                let take = std::cmp::min(self.0, 16384) as usize;
                self.0 -= take as u64;
                Poll::Ready(Ok((self.0 == 0, Binary::from(vec![0u8; take]))))
            }

            fn origin_len(&self) -> Option<u64> {
                Some(self.0)
            }
        }
        Body::new_source(Box::new(Zero(len)))
    }

    pub fn binary(&mut self) -> Binary {
        let mut buffer = BinaryMut::new();
        if let Some(bin) = self.binary.take() {
            buffer.put_slice(bin.chunk());
        }
        if let Some(bin) = self.binary_mut.take() {
            buffer.put_slice(bin.chunk());
        }
        buffer.freeze()
    }

    pub fn get_now_compress(&self) -> i8 {
        if self.origin_compress_method > 0 {
            return self.origin_compress_method;
        } else {
            self.origin_compress_method + self.now_compress_method
        }
    }

    pub fn set_compress_gzip(&mut self) {
        self.set_compress_method(Consts::COMPRESS_METHOD_GZIP);
    }

    pub fn set_compress_deflate(&mut self) {
        self.set_compress_method(Consts::COMPRESS_METHOD_DEFLATE);
    }

    pub fn set_compress_brotli(&mut self) {
        self.set_compress_method(Consts::COMPRESS_METHOD_BROTLI);
    }

    pub fn set_compress_method(&mut self, method: i8) {
        self.origin_compress_method = method;
        self.now_compress_method = Consts::COMPRESS_METHOD_NONE;
    }

    pub fn is_chunked(&self) -> bool {
        self.is_chunked
    }

    pub fn set_chunked(&mut self, chunked: bool) {
        self.is_chunked = chunked;
    }

    pub fn cache_buffer(&mut self, buf: &[u8]) -> usize {
        if self.binary_mut.is_none() {
            self.binary_mut = Some(BinaryMut::new());
        }
        self.binary_mut.as_mut().unwrap().put_slice(buf);
        buf.len()
    }

    pub fn is_end(&self) -> bool {
        self.is_end
    }

    pub fn set_end(&mut self, end: bool) {
        self.is_end = end
    }

    /// 取走发生过的错误, 只返回一次
    pub fn take_error(&mut self) -> Option<ProtError> {
        self.error.take()
    }

    fn set_error(&mut self, err: ProtError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.is_end = true;
        self.receiver = InnerSource::None;
    }

    pub fn read_now(&mut self) -> Binary {
        self.binary()
    }

    /// 当前缓存里的字节数, 来源已结束时即剩余总量
    pub fn origin_len(&self) -> usize {
        let mut size = 0;
        if let Some(bin) = &self.binary {
            size += bin.remaining();
        }
        if let Some(bin) = &self.binary_mut {
            size += bin.remaining();
        }
        size
    }

    /// 最佳已知剩余长度
    pub fn available(&self) -> Option<u64> {
        let cached = self.origin_len() as u64;
        if self.is_end {
            return Some(cached);
        }
        match &self.receiver {
            InnerSource::File { left, .. } => Some(cached + left),
            InnerSource::Stream(s) => s.origin_len().map(|v| cached + v),
            _ => None,
        }
    }

    pub fn copy_now(&self) -> Binary {
        let mut buffer = BinaryMut::new();
        if let Some(bin) = &self.binary {
            buffer.put_slice(bin.chunk());
        }
        if let Some(bin) = &self.binary_mut {
            buffer.put_slice(bin.chunk());
        }
        buffer.freeze()
    }

    /// 丢弃缓存中的前 n 个字节
    pub fn skip(&mut self, mut n: usize) -> usize {
        let mut skipped = 0;
        if let Some(bin) = &mut self.binary {
            let take = std::cmp::min(n, bin.remaining());
            bin.advance(take);
            n -= take;
            skipped += take;
        }
        if n > 0 {
            if let Some(bin) = &mut self.binary_mut {
                let take = std::cmp::min(n, bin.remaining());
                bin.advance(take);
                skipped += take;
            }
        }
        skipped
    }

    /// 拉取下一段原始数据, 末段返回 true; 结束后恒返回空的末段
    pub fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if let Some(err) = self.error.take() {
            return Poll::Ready(Err(err));
        }
        let cached = self.binary();
        if cached.remaining() > 0 {
            let end = self.is_end && self.receiver.is_none();
            return Poll::Ready(Ok((end, cached)));
        }
        if self.is_end {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        match ready!(self.receiver.poll_recv(cx)) {
            Some(Ok((is_end, bin))) => {
                if is_end {
                    self.is_end = true;
                    self.receiver = InnerSource::None;
                }
                Poll::Ready(Ok((is_end, bin)))
            }
            Some(Err(e)) => {
                self.is_end = true;
                self.receiver = InnerSource::None;
                Poll::Ready(Err(e))
            }
            None => {
                self.is_end = true;
                self.receiver = InnerSource::None;
                Poll::Ready(Ok((true, Binary::new())))
            }
        }
    }

    /// 等待来源全部到齐并缓存, 不做解码
    pub async fn wait_all(&mut self) -> ProtResult<usize> {
        let mut size = 0;
        while !self.is_end {
            let (is_end, bin) = std::future::poll_fn(|cx| self.poll_data(cx)).await?;
            size += self.cache_buffer(bin.chunk());
            if is_end {
                break;
            }
        }
        Ok(size)
    }

    /// 等待全部数据并经编码管道读出
    pub async fn read_all(&mut self, buffer: &mut BinaryMut) -> Option<usize> {
        if self.wait_all().await.is_err() {
            return None;
        }
        let _ = self.process_data(None);
        match self.read_data(buffer) {
            Ok(s) => Some(s),
            _ => None,
        }
    }

    fn inner_encode_data<B: Buf + BufMut>(
        buffer: &mut B,
        data: &[u8],
        is_chunked: bool,
    ) -> std::io::Result<usize> {
        if is_chunked {
            Helper::encode_chunk_data(buffer, data)
        } else {
            Ok(buffer.put_slice(data))
        }
    }

    fn encode_data(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self.get_now_compress() {
            Consts::COMPRESS_METHOD_GZIP => {
                // 数据结束, 需要主动调用结束以导出全部结果
                if data.len() == 0 {
                    self.compress.open_write_gz();
                    let gz = self.compress.write_gz.take().unwrap();
                    let value = gz.finish()?;
                    if value.remaining() > 0 {
                        Self::inner_encode_data(&mut self.cache_body_data, &value, self.is_chunked)?;
                    }
                    if self.is_chunked {
                        Helper::encode_chunk_data(&mut self.cache_body_data, data)
                    } else {
                        Ok(0)
                    }
                } else {
                    self.compress.open_write_gz();
                    let gz = self.compress.write_gz.as_mut().unwrap();
                    gz.write_all(data)?;
                    // 每次写入, 再尝试读取出数据
                    if gz.get_mut().remaining() > 0 {
                        let s = Self::inner_encode_data(
                            &mut self.cache_body_data,
                            &gz.get_mut().chunk(),
                            self.is_chunked,
                        );
                        gz.get_mut().clear();
                        s
                    } else {
                        Ok(0)
                    }
                }
            }
            Consts::COMPRESS_METHOD_DEFLATE => {
                if data.len() == 0 {
                    self.compress.open_write_de();
                    let de = self.compress.write_de.take().unwrap();
                    let value = de.finish()?;
                    if value.remaining() > 0 {
                        Self::inner_encode_data(&mut self.cache_body_data, &value, self.is_chunked)?;
                    }
                    if self.is_chunked {
                        Helper::encode_chunk_data(&mut self.cache_body_data, data)
                    } else {
                        Ok(0)
                    }
                } else {
                    self.compress.open_write_de();
                    let de = self.compress.write_de.as_mut().unwrap();
                    de.write_all(data)?;
                    if de.get_mut().remaining() > 0 {
                        let s = Self::inner_encode_data(
                            &mut self.cache_body_data,
                            &de.get_mut().chunk(),
                            self.is_chunked,
                        );
                        de.get_mut().clear();
                        s
                    } else {
                        Ok(0)
                    }
                }
            }
            Consts::COMPRESS_METHOD_BROTLI => {
                if data.len() == 0 {
                    self.compress.open_write_br();
                    let mut br = self.compress.write_br.take().unwrap();
                    br.flush()?;
                    let value = br.into_inner();
                    if value.remaining() > 0 {
                        Self::inner_encode_data(&mut self.cache_body_data, &value, self.is_chunked)?;
                    }
                    if self.is_chunked {
                        Helper::encode_chunk_data(&mut self.cache_body_data, data)
                    } else {
                        Ok(0)
                    }
                } else {
                    self.compress.open_write_br();
                    let br = self.compress.write_br.as_mut().unwrap();
                    br.write_all(data)?;
                    if br.get_mut().remaining() > 0 {
                        let s = Self::inner_encode_data(
                            &mut self.cache_body_data,
                            &br.get_mut().chunk(),
                            self.is_chunked,
                        );
                        br.get_mut().clear();
                        s
                    } else {
                        Ok(0)
                    }
                }
            }
            _ => Self::inner_encode_data(&mut self.cache_body_data, data, self.is_chunked),
        }
    }

    /// 把已到的数据推进编码管道, cx 为空时只处理缓存部分
    pub fn process_data(&mut self, mut cx: Option<&mut Context<'_>>) -> std::io::Result<usize> {
        if self.is_process_end {
            return Ok(0);
        }
        let mut size = 0;
        if let Some(bin) = self.binary.take() {
            if bin.chunk().len() > 0 {
                size += self.encode_data(bin.chunk())?;
            }
        }
        if let Some(bin) = self.binary_mut.take() {
            if bin.chunk().len() > 0 {
                size += self.encode_data(bin.chunk())?;
            }
        }
        let mut has_encode_end = false;
        if !self.is_end && cx.is_some() {
            loop {
                match self.receiver.poll_recv(cx.as_mut().unwrap()) {
                    Poll::Pending => {
                        break;
                    }
                    Poll::Ready(Some(Ok((is_end, bin)))) => {
                        size += self.encode_data(bin.chunk())?;
                        self.is_end = is_end;
                        if bin.remaining() == 0 {
                            has_encode_end = is_end;
                        }
                        if is_end {
                            break;
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        self.set_error(e);
                        break;
                    }
                    Poll::Ready(None) => {
                        self.is_end = true;
                        break;
                    }
                }
            }
        }
        if !has_encode_end && self.is_end && self.error.is_none() {
            self.encode_data(&[])?;
        }
        self.is_process_end = has_encode_end || self.is_end;
        Ok(size)
    }

    pub fn poll_encode<B: Buf + BufMut>(
        &mut self,
        cx: &mut Context<'_>,
        buffer: &mut B,
    ) -> Poll<WebResult<usize>> {
        self.process_data(Some(cx))?;
        let s = self.read_data(buffer)?;
        Poll::Ready(Ok(s))
    }

    pub fn read_data<B: Buf + BufMut>(&mut self, read_data: &mut B) -> WebResult<usize> {
        self.process_data(None)?;

        let mut size = 0;
        if self.cache_body_data.remaining() > 0 {
            size += read_data.put_slice(&self.cache_body_data.chunk());
            self.cache_body_data.advance_all();
        }
        Ok(size)
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.cache_body_data.remaining() == 0 && !self.is_end {
            match ready!(self.poll_data(cx)) {
                Ok((_, bin)) => {
                    self.cache_body_data.put_slice(bin.chunk());
                }
                Err(e) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("{}", e),
                    )))
                }
            }
        }
        let len = std::cmp::min(self.cache_body_data.remaining(), buf.remaining());
        buf.put_slice(&self.cache_body_data.chunk()[..len]);
        self.cache_body_data.advance(len);
        Poll::Ready(Ok(()))
    }
}

impl Serialize for Body {
    fn serialize<B: Buf + BufMut>(&mut self, buffer: &mut B) -> WebResult<usize> {
        let mut size = 0;
        if let Some(bin) = self.binary.take() {
            size += buffer.put_slice(bin.chunk());
        }
        if let Some(bin) = self.binary_mut.take() {
            size += buffer.put_slice(bin.chunk());
        }
        Ok(size)
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::empty()
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::only(Binary::from(value.as_bytes().to_vec()))
    }
}

impl From<Binary> for Body {
    fn from(value: Binary) -> Self {
        Body::only(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::only(Binary::from(value.into_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::only(Binary::from(value))
    }
}

impl From<Body> for Vec<u8> {
    fn from(mut value: Body) -> Self {
        let bin = value.read_now();
        bin.into_slice_all()
    }
}

impl From<Body> for String {
    fn from(mut value: Body) -> Self {
        let bin = value.read_now();
        let v = bin.into_slice_all();
        String::from_utf8_lossy(&v).to_string()
    }
}

impl Display for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_end {
            let bin = self.copy_now();
            f.write_str(&String::from_utf8_lossy(bin.chunk()))
        } else {
            let mut f = f.debug_struct("Body");
            f.field("is_end", &self.is_end);
            f.finish()
        }
    }
}
