mod frame;
pub use frame::*;
mod session;
pub use session::*;

pub use tokio_util::sync::CancellationToken;
