mod classifier;
mod errors;
mod protocol;

pub use classifier::is_ping_frame;
pub use errors::WorkerError;
pub use protocol::{
    AckRequest, FlushReply, HelloRequest, PingReply, RegisterReply, RegisterRequest,
    RequestHeader, UnregisterReply, UnregisterRequest, Update, NOTIFICATION_MESSAGE_TYPE,
};
