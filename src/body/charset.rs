use std::task::{ready, Context, Poll};

use encoding_rs::{Decoder, Encoding};
use webparse::{Binary, Buf};

use crate::{ProtError, ProtResult, Body, BodySource};

/// 把任意字符集的流转码成 UTF-8, 相当于 iconv(x, "utf-8").
/// 不认识的字符集在构造时即报错.
pub struct CharsetBody {
    input: Body,
    decoder: Decoder,
    input_end: bool,
}

impl CharsetBody {
    pub fn new(input: Body, charset: &str) -> ProtResult<Self> {
        let encoding = Encoding::for_label(charset.as_bytes())
            .ok_or(ProtError::UnsupportedEncoding)?;
        Ok(Self {
            input,
            decoder: encoding.new_decoder(),
            input_end: false,
        })
    }

    pub fn into_body(input: Body, charset: &str) -> ProtResult<Body> {
        Ok(Body::new_source(Box::new(CharsetBody::new(input, charset)?)))
    }
}

impl BodySource for CharsetBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if self.input_end {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        let (is_end, bin) = ready!(self.input.poll_data(cx))?;
        self.input_end = is_end;
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bin.remaining())
            .unwrap_or(bin.remaining() * 4 + 16);
        let mut out = String::with_capacity(capacity);
        let (result, _read, _replaced) =
            self.decoder
                .decode_to_string(bin.chunk(), &mut out, is_end);
        match result {
            encoding_rs::CoderResult::InputEmpty => {}
            encoding_rs::CoderResult::OutputFull => {
                // 容量按上限预留过, 不应出现
                return Poll::Ready(Err(ProtError::UnsupportedEncoding));
            }
        }
        Poll::Ready(Ok((is_end, Binary::from(out.into_bytes()))))
    }
}
