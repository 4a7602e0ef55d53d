pub mod envelope;
pub mod codec;
pub mod frame;
pub mod client;
pub mod runtime;

pub use client::{CallError, NodeClient};
pub use codec::{Codec, CodecError, JsonCodec, YamlCodec};
pub use envelope::{ErrorCode, Message, Method};
pub use runtime::{HandlerError, NodeHandler, NodeServer, ServerHandle};
