use crate::{ProtError, ProtResult, ResourceAddress, TranslateResponse, View};

/// 部件树里的下标句柄, 代替裸指针回指
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetRef(pub usize);

/// 解析完成的部件类别元数据
#[derive(Debug, Clone)]
pub struct WidgetClass {
    pub address: ResourceAddress,
    pub views: Vec<View>,
    pub container: bool,
    pub stateful: bool,
    pub untrusted_host: Option<String>,
    pub untrusted_prefix: Option<String>,
    pub untrusted_site_suffix: Option<String>,
    /// 允许内嵌的子类别名, 空表示不限
    pub approved_children: Vec<String>,
}

impl WidgetClass {
    pub fn from_translate(response: &TranslateResponse) -> Self {
        Self {
            address: response.address.clone(),
            views: response.views.clone(),
            container: response.container,
            stateful: response.stateful,
            untrusted_host: response.untrusted_host.clone(),
            untrusted_prefix: response.untrusted_prefix.clone(),
            untrusted_site_suffix: response.untrusted_site_suffix.clone(),
            approved_children: response.approved_children.clone(),
        }
    }

    /// 信任规则: 只有指定的不受信主机名才许展示该部件
    pub fn check_host(&self, host: &str) -> ProtResult<()> {
        if let Some(untrusted) = &self.untrusted_host {
            if host != untrusted {
                return Err(ProtError::Forbidden("untrusted host mismatch"));
            }
        }
        if let Some(prefix) = &self.untrusted_prefix {
            if !host.starts_with(&format!("{}.", prefix)) {
                return Err(ProtError::Forbidden("untrusted prefix mismatch"));
            }
        }
        if let Some(suffix) = &self.untrusted_site_suffix {
            if !host.ends_with(suffix.as_str()) {
                return Err(ProtError::Forbidden("untrusted site suffix mismatch"));
            }
        }
        Ok(())
    }

    pub fn find_view(&self, name: Option<&str>) -> Option<&View> {
        match name {
            Some(name) => self.views.iter().find(|v| v.is_named(name)),
            None => self.views.first(),
        }
    }
}

/// 组装树上的一个节点
#[derive(Debug)]
pub struct Widget {
    pub class_name: String,
    pub id: Option<String>,
    pub parent: Option<WidgetRef>,
    /// 模板声明的视图与默认参数
    pub view_name: Option<String>,
    pub query_args: Option<String>,
    /// 本次请求是否聚焦/代理该部件
    pub focused: bool,
    pub proxied: bool,
    pub path_info: Option<String>,
    pub session_sync_pending: bool,
    pub class: Option<WidgetClass>,
}

impl Widget {
    fn new(class_name: String, id: Option<String>, parent: Option<WidgetRef>) -> Self {
        Self {
            class_name,
            id,
            parent,
            view_name: None,
            query_args: None,
            focused: false,
            proxied: false,
            path_info: None,
            session_sync_pending: false,
            class: None,
        }
    }
}

/// 以 Vec 为底的部件树, 父子关系全用下标表达
pub struct WidgetTree {
    widgets: Vec<Widget>,
}

impl WidgetTree {
    pub fn new_root(class_name: &str) -> (Self, WidgetRef) {
        let tree = Self {
            widgets: vec![Widget::new(class_name.to_string(), None, None)],
        };
        (tree, WidgetRef(0))
    }

    pub fn add_child(
        &mut self,
        parent: WidgetRef,
        class_name: &str,
        id: Option<String>,
    ) -> WidgetRef {
        let index = self.widgets.len();
        self.widgets
            .push(Widget::new(class_name.to_string(), id, Some(parent)));
        WidgetRef(index)
    }

    pub fn get(&self, widget: WidgetRef) -> &Widget {
        &self.widgets[widget.0]
    }

    pub fn get_mut(&mut self, widget: WidgetRef) -> &mut Widget {
        &mut self.widgets[widget.0]
    }

    /// id 链组成的路径, 定位聚焦目标用
    pub fn path(&self, widget: WidgetRef) -> String {
        let mut parts = vec![];
        let mut current = Some(widget);
        while let Some(w) = current {
            let node = self.get(w);
            parts.push(
                node.id
                    .clone()
                    .unwrap_or_else(|| node.class_name.clone()),
            );
            current = node.parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// 自身或祖先里被代理的那个部件的路径
    pub fn current_frame(&self, widget: WidgetRef) -> Option<String> {
        let mut current = Some(widget);
        while let Some(w) = current {
            if self.get(w).proxied {
                return Some(self.path(w));
            }
            current = self.get(w).parent;
        }
        None
    }

    /// 子部件的内嵌准入: 父类别要是容器, 且子类别在许可名单里
    pub fn check_approval(&self, parent: WidgetRef, child_class_name: &str) -> ProtResult<()> {
        let parent_widget = self.get(parent);
        let parent_class = match &parent_widget.class {
            Some(class) => class,
            None => return Err(ProtError::Forbidden("parent class unresolved")),
        };
        if !parent_class.container {
            return Err(ProtError::Forbidden("parent is not a container"));
        }
        if !parent_class.approved_children.is_empty()
            && !parent_class
                .approved_children
                .iter()
                .any(|name| name == child_class_name)
        {
            return Err(ProtError::Forbidden("widget class not approved"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }
}
