mod css;
mod parser;
mod processor;
mod text;

pub use self::css::CssProcessor;
pub use self::parser::{HtmlEvent, HtmlParser, TagAttr, WIDGET_TAG};
pub use self::processor::{Processor, ProcessorBody, ProcessorEnv};
pub use self::text::TextProcessor;
