mod http;
mod socket;

pub use http::{ResponseHead, TunneledResponse, start_http_exchange};
pub use socket::{ClientSocket, start_client_socket};
