use std::net::{Ipv4Addr, SocketAddr};

use crate::ListenEndpoint;

#[inline]
pub(crate) fn _default_listen() -> ListenEndpoint {
    ListenEndpoint(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)))
}

pub(crate) const fn _default_unlimited() -> u64 {
    0
}
