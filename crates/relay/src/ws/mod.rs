mod handler;
mod protocol;

pub use handler::{router, GatewayState};
