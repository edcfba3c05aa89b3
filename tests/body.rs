#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webparse::{Binary, BinaryMut, Buf};
    use wmgate::{
        Body, BufferedBody, CatBody, CharsetBody, DelayedBody, HoldBody, HtmlEscapeBody,
        ReplaceBody, SubstBody, TimeoutBody,
    };

    async fn drain(mut body: Body) -> Vec<u8> {
        let mut out = BinaryMut::new();
        body.read_all(&mut out).await.unwrap();
        out.chunk().to_vec()
    }

    async fn drain_err(mut body: Body) -> Result<Vec<u8>, wmgate::ProtError> {
        let mut out = BinaryMut::new();
        loop {
            let (is_end, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
            out.put_slice(bin.chunk());
            if is_end {
                return Ok(out.chunk().to_vec());
            }
        }
    }

    #[tokio::test]
    async fn test_memory_body() {
        assert_eq!(drain(Body::from("hello")).await, b"hello");
        assert_eq!(drain(Body::empty()).await, b"");
        assert_eq!(drain(Body::zero(5)).await, vec![0u8; 5]);
        assert_eq!(Body::from("hello").available(), Some(5));
    }

    #[tokio::test]
    async fn test_cat_body() {
        let body = CatBody::into_body(vec![
            Body::from("a"),
            Body::empty(),
            Body::from("bc"),
            Body::from("def"),
        ]);
        assert_eq!(body.available(), Some(6));
        assert_eq!(drain(body).await, b"abcdef");
    }

    #[tokio::test]
    async fn test_chunked_channel_body() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let body = Body::new(receiver, BinaryMut::new(), false);
        tokio::spawn(async move {
            for part in ["he", "ll", ""] {
                sender
                    .send((false, Binary::from(part.as_bytes().to_vec())))
                    .await
                    .unwrap();
            }
            sender
                .send((true, Binary::from(b"o".to_vec())))
                .await
                .unwrap();
        });
        assert_eq!(drain(body).await, b"hello");
    }

    #[tokio::test]
    async fn test_subst_backtracking() {
        // 前缀回退: "fo " 要原样吐出, "foobar" 走长词, 收尾的 "foo" 走短词
        let mut subst = SubstBody::new(Body::from("fo foobar foo"));
        subst.add("foo", "X").add("foobar", "Y");
        assert_eq!(drain(subst.into_body()).await, b"fo Y X");
    }

    #[tokio::test]
    async fn test_subst_across_chunks() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let body = Body::new(receiver, BinaryMut::new(), false);
        tokio::spawn(async move {
            sender
                .send((false, Binary::from(b"ab foo".to_vec())))
                .await
                .unwrap();
            sender
                .send((true, Binary::from(b"bar cd".to_vec())))
                .await
                .unwrap();
        });
        let mut subst = SubstBody::new(body);
        subst.add("foobar", "Z");
        assert_eq!(drain(subst.into_body()).await, b"ab Z cd");
    }

    #[tokio::test]
    async fn test_subst_overlapping_rescan() {
        let mut subst = SubstBody::new(Body::from("aab"));
        subst.add("ab", "X");
        assert_eq!(drain(subst.into_body()).await, b"aX");
    }

    #[tokio::test]
    async fn test_replace_ranges() {
        let mut replace = ReplaceBody::new(Body::from("hello cruel world"));
        replace.add(6, 11, Body::from("kind")).unwrap();
        assert_eq!(drain(replace.into_body()).await, b"hello kind world");
    }

    #[tokio::test]
    async fn test_replace_rejects_overlap() {
        let mut replace = ReplaceBody::new(Body::from("0123456789"));
        replace.add(2, 5, Body::from("x")).unwrap();
        assert!(replace.add(4, 6, Body::from("y")).is_err());
    }

    #[tokio::test]
    async fn test_html_escape() {
        let body = HtmlEscapeBody::into_body(Body::from("<a href=\"x\">&'"));
        assert_eq!(
            drain(body).await,
            b"&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }

    #[tokio::test]
    async fn test_charset_conversion() {
        // latin-1 的 0xe9 是 é
        let body = Body::from(vec![0x63, 0x61, 0x66, 0xe9]);
        let converted = CharsetBody::into_body(body, "iso-8859-1").unwrap();
        assert_eq!(drain(converted).await, "café".as_bytes());
    }

    #[tokio::test]
    async fn test_charset_unknown_fails() {
        assert!(CharsetBody::into_body(Body::from("x"), "no-such-charset").is_err());
    }

    #[tokio::test]
    async fn test_buffered_body() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let body = Body::new(receiver, BinaryMut::new(), false);
        tokio::spawn(async move {
            sender
                .send((false, Binary::from(b"aa".to_vec())))
                .await
                .unwrap();
            sender
                .send((true, Binary::from(b"bb".to_vec())))
                .await
                .unwrap();
        });
        let buffered = BufferedBody::into_body(body, 1024);
        assert_eq!(drain(buffered).await, b"aabb");
    }

    #[tokio::test]
    async fn test_hold_releases_buffered_end() {
        let (body, handle) = HoldBody::into_body(Body::from("held"));
        let task = tokio::spawn(async move { drain(body).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        handle.release();
        assert_eq!(task.await.unwrap(), b"held");
    }

    #[tokio::test]
    async fn test_delayed_fill() {
        let (body, sender) = DelayedBody::into_body();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.set(Body::from("late"));
        });
        assert_eq!(drain(body).await, b"late");
    }

    #[tokio::test]
    async fn test_delayed_dropped_sender_cancels() {
        let (body, sender) = DelayedBody::into_body();
        drop(sender);
        let result = drain_err(body).await;
        assert!(matches!(result, Err(wmgate::ProtError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_body() {
        let (_sender, receiver) = tokio::sync::mpsc::channel::<(bool, Binary)>(1);
        let body = Body::new(receiver, BinaryMut::new(), false);
        let timed = TimeoutBody::into_body(body, Duration::from_millis(30));
        let result = drain_err(timed).await;
        assert!(matches!(result, Err(wmgate::ProtError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_compress_gzip_roundtrip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut body = Body::from("compress me compress me compress me");
        body.set_compress_gzip();
        let mut out = BinaryMut::new();
        body.read_all(&mut out).await.unwrap();

        let mut decoder = GzDecoder::new(out.chunk());
        let mut plain = String::new();
        decoder.read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "compress me compress me compress me");
    }
}
