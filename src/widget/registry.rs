use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{ProtResult, TranslateCache, TranslateRequest};

use super::WidgetClass;

/// 部件类别登记处: 类别名经翻译服务解析成元数据, 结果进程内复用
pub struct WidgetRegistry {
    tcache: Arc<TranslateCache>,
    classes: Mutex<HashMap<String, WidgetClass>>,
}

impl WidgetRegistry {
    pub fn new(tcache: Arc<TranslateCache>) -> Arc<Self> {
        Arc::new(Self {
            tcache,
            classes: Mutex::new(HashMap::new()),
        })
    }

    pub async fn resolve(&self, widget_type: &str) -> ProtResult<WidgetClass> {
        {
            let classes = self.classes.lock().unwrap();
            if let Some(class) = classes.get(widget_type) {
                return Ok(class.clone());
            }
        }

        let mut request = TranslateRequest::default();
        request.widget_type = Some(widget_type.to_string());
        let response = self.tcache.translate(&request).await?;
        let class = WidgetClass::from_translate(&response);

        let mut classes = self.classes.lock().unwrap();
        classes.insert(widget_type.to_string(), class.clone());
        Ok(class)
    }

    /// 控制命令触发的清空
    pub fn flush(&self) {
        let mut classes = self.classes.lock().unwrap();
        classes.clear();
    }
}
