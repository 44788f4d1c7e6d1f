//! Hierarchical byte-rate limiting for streams and listeners.
//!
//! A [RateSetting] is the runtime knob. [LimiterNode]s hold a token bucket
//! each and chain to a parent, so a server-wide budget can sit above the
//! per-connection ones. [ThrottledStream] gates reads and writes on a pair
//! of nodes and [ThrottledAcceptor] hands out such streams for every
//! accepted connection.
mod bucket;
mod context;
mod limiter;
mod listener;
mod setting;
mod stream;

pub use bucket::TokenBucket;
pub use context::WaitContext;
pub use limiter::LimiterNode;
pub use listener::{Acceptor, ListenerRates, ThrottledAcceptor};
pub use setting::{Limit, RateSetting, RateValues, UNLIMITED};
pub use stream::ThrottledStream;
