use std::sync::Arc;

use crate::{Body, SubstBody};

use super::ProcessorEnv;

/// 纯文本处理: 只做 &c: 标记替换, 不碰标签
pub struct TextProcessor;

impl TextProcessor {
    pub fn process(input: Body, env: Arc<ProcessorEnv>) -> Body {
        let mut subst = SubstBody::new(input);
        for (name, value) in &env.context_values {
            subst.add(&format!("&c:{};", name), value);
        }
        subst.into_body()
    }
}
