mod inline;
mod registry;
mod rewrite;
mod widget;

pub use self::inline::{spawn_inline_widget, InlineEnv, InlineRequest, SubRequestDispatch};
pub use self::registry::WidgetRegistry;
pub use self::rewrite::{rewrite_widget_uri, RewriteEnv, RewriteMode};
pub use self::widget::{Widget, WidgetClass, WidgetRef, WidgetTree};
