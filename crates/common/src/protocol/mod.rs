mod frame;
mod url;

pub use frame::{BodyState, Frame, Headers, RequestFrame, ResponseFrame, SocketFrame};
pub use url::TargetUrl;
