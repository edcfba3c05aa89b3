#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use wmgate::{ProtResult, Stock, StockBuilder, StockConfig, TcpStockBuilder};

    /// 计数型的假资源, 只看借还逻辑
    struct Counter {
        built: AtomicUsize,
        destroyed: AtomicUsize,
    }

    struct CounterBuilder(Arc<Counter>);

    #[async_trait]
    impl StockBuilder for CounterBuilder {
        type Item = usize;

        async fn build(&self, _key: &str) -> ProtResult<usize> {
            Ok(self.0.built.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy(&self, _item: usize) {
            self.0.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn small_config() -> StockConfig {
        StockConfig {
            limit_per_key: 4,
            max_idle: 2,
            wait_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_lease_accounting() {
        let counter = Arc::new(Counter {
            built: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        });
        let stock = Stock::new(CounterBuilder(counter.clone()), small_config());

        let mut tasks = vec![];
        for i in 0..16usize {
            let stock = stock.clone();
            tasks.push(tokio::spawn(async move {
                let lease = stock.get("k", "").await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                match i % 3 {
                    0 => lease.release(true),
                    1 => lease.release(false),
                    // 直接丢弃等于 reuse=false
                    _ => drop(lease),
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = stock.stats();
        assert_eq!(stats.busy, 0);
        assert!(stats.idle <= 2);
    }

    #[tokio::test]
    async fn test_per_key_limit_waits() {
        let counter = Arc::new(Counter {
            built: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        });
        let stock = Stock::new(
            CounterBuilder(counter.clone()),
            StockConfig {
                limit_per_key: 1,
                max_idle: 1,
                wait_timeout: Duration::from_millis(50),
            },
        );

        let first = stock.get("k", "").await.unwrap();
        // 名额占满, 第二个借用要等到超时
        let result = stock.get("k", "").await;
        assert!(matches!(result, Err(wmgate::ProtError::ResourceExhausted)));
        first.release(true);
        // 归还之后立即可借
        let second = stock.get("k", "").await.unwrap();
        second.release(true);
    }

    #[tokio::test]
    async fn test_fade_all() {
        let counter = Arc::new(Counter {
            built: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        });
        let stock = Stock::new(CounterBuilder(counter.clone()), small_config());

        let lease = stock.get("k", "").await.unwrap();
        stock.fade_all();
        // 标记之后归还的资源不再回池
        lease.release(true);
        assert_eq!(stock.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_fade_tag_selective() {
        let counter = Arc::new(Counter {
            built: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        });
        let stock = Stock::new(CounterBuilder(counter.clone()), small_config());

        let tagged = stock.get("a", "site1\0T").await.unwrap();
        let other = stock.get("b", "site2").await.unwrap();
        stock.fade_tag("T");
        tagged.release(true);
        other.release(true);

        let stats = stock.stats();
        // 带 T 标签的没能回池, 另一个照常
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_liveness_probe_discards_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 服务端收连接后马上挂断
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let _ = stream.shutdown().await;
                }
            }
        });

        let stock = Stock::new(TcpStockBuilder, small_config());
        let key = addr.to_string();
        let lease = stock.get(&key, "").await.unwrap();
        lease.release(true);
        assert_eq!(stock.stats().idle, 1);

        // 给 FIN 一点传播时间
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 复用前的活性探测发现对端已关, 新借用是新建的连接
        let lease: wmgate::Lease<TcpStockBuilder> = stock.get(&key, "").await.unwrap();
        let stats = stock.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.destroyed, 1);
        lease.release(false);
    }

    #[tokio::test]
    async fn test_tcp_builder_connect_refused() {
        let stock: Arc<Stock<TcpStockBuilder>> = Stock::new(TcpStockBuilder, small_config());
        let result = stock.get("127.0.0.1:1", "").await;
        assert!(matches!(result, Err(wmgate::ProtError::Connect(_))));
    }
}
