pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod providers;
pub mod raw;
pub mod relay;
pub mod requester;
pub mod safety;
pub mod sanitize;
pub mod server;
pub mod stream;
pub mod tokens;
pub mod translate;
pub mod usage;

pub use config::GatewayConfig;
pub use error::{RelayError, Result};
pub use logging::SharedLogger;
pub use relay::{Relay, RelayOutput};
pub use server::{build_router, AppState};
