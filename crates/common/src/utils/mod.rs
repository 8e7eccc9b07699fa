mod encoding;
mod headers;
mod id;

pub use encoding::{decode_chunk, encode_chunk};
pub use headers::{headers_to_wire, wire_to_headers};
pub use id::{generate_backend_id, generate_exchange_id};
