mod cgi;
mod dispatcher;
mod forward;
mod static_file;

pub use self::dispatcher::{Dispatcher, ProxyContext};
pub use self::forward::{forward_request_headers, forward_response_headers};
pub use self::static_file::{serve_file, serve_nfs};
