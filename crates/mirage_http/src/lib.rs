pub mod policy;
pub mod reply;
pub mod request;
pub mod responses;
mod timeouts;

pub use policy::CachePolicy;
pub use reply::{Reply, is_hop_by_hop, parse_reply, parse_reply_within, read_reply, write_reply};
pub use request::{HeadError, Request, RequestHead, RequestLimits, parse_request_head, read_request};

use tokio::io::{AsyncRead, AsyncWrite};

pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
