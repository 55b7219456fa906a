//! Node-facing ingestion: binary decoding, JSON-RPC, and the ZMQ feed.

pub mod parser;
pub mod rpc;
pub mod zmq_listener;

pub use parser::{parse_block, parse_transaction, ParseError, ParsedBlock, ParsedTransaction};
pub use rpc::{BitcoinRpc, RpcError, VerboseBlock, VerboseTransaction};
pub use zmq_listener::{RawMessage, ZmqListener};
