//! HTTP/1.x wire handling: the incremental head parser, the positional
//! header index, and chunked-framing helpers.

pub mod chunked;
pub mod headers;
pub mod msg;
pub mod parse;

pub use self::headers::{HdrCtx, HdrIdx};
pub use self::msg::{HttpMsg, MsgFlags, MsgState, Span, StartLine};
pub use self::parse::{parse_message, parse_message_opts};
