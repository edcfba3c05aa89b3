mod body;
mod buffered;
mod cat;
mod charset;
mod delayed;
mod escape;
mod hold;
mod replace;
mod subst;
mod timeout;

pub use self::body::{Body, BodySource};
pub use self::buffered::BufferedBody;
pub use self::cat::CatBody;
pub use self::charset::CharsetBody;
pub use self::delayed::{DelayedBody, DelayedSender};
pub use self::escape::{html_escape, html_escape_str, HtmlEscapeBody};
pub use self::hold::{HoldBody, HoldHandle};
pub use self::replace::{Replace, ReplaceBody};
pub use self::subst::SubstBody;
pub use self::timeout::TimeoutBody;
