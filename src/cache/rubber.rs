use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use webparse::{Binary, Buf};

/// 响应体的堆外仓库: 以句柄存取, 总量记账, 超预算按最久未用淘汰.
/// 取出的是 Binary 的廉价克隆, 在途引用天然把数据钉住,
/// 条目被淘汰也不影响正在发送的响应.
pub struct Rubber {
    max_size: usize,
    inner: Mutex<RubberInner>,
}

struct RubberItem {
    data: Binary,
    last_used: Instant,
}

struct RubberInner {
    total: usize,
    next_id: u64,
    items: HashMap<u64, RubberItem>,
}

impl Rubber {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(RubberInner {
                total: 0,
                next_id: 1,
                items: HashMap::new(),
            }),
        }
    }

    /// 存一份体数据, 超出单体预算时拒收
    pub fn add(&self, data: Binary) -> Option<u64> {
        if data.remaining() > self.max_size {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.total += data.remaining();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(
            id,
            RubberItem {
                data,
                last_used: Instant::now(),
            },
        );
        Some(id)
    }

    pub fn get(&self, id: u64) -> Option<Binary> {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.get_mut(&id) {
            Some(item) => {
                item.last_used = Instant::now();
                Some(item.data.clone())
            }
            None => None,
        }
    }

    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.remove(&id) {
            inner.total -= item.data.remaining();
        }
    }

    pub fn total_size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.total
    }

    /// 压实: 淘汰最久未用的条目直到回到预算内, 返回被摘掉的句柄
    pub fn compress(&self) -> Vec<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = vec![];
        while inner.total > self.max_size {
            let oldest = inner
                .items
                .iter()
                .min_by_key(|(_, item)| item.last_used)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    if let Some(item) = inner.items.remove(&id) {
                        inner.total -= item.data.remaining();
                    }
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }
}
