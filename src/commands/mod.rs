pub mod host;

pub use host::{check_backend, run_host};
