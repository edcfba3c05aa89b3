mod child;
mod socket;
mod stock;

pub use self::child::{ChildConfig, ChildSocketBuilder, ChildStock};
pub use self::socket::SocketLease;
pub use self::stock::{Lease, Stock, StockBuilder, StockStats, TcpStockBuilder};
