pub mod encoder;
pub mod errors;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod streams;
pub mod transport;

pub use server::HostServer;
pub use session::SessionRegistry;
