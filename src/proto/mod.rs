//! Protocol-level pieces: the HTTP/1.x wire machinery and the transaction
//! object tying one request/response exchange together.

pub mod h1;
pub mod txn;

pub use self::txn::{ConnMode, Transaction, TxnFlags};
