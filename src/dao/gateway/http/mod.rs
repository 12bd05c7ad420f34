mod config;
mod error;
mod store;

pub use config::HttpGatewayConfig;
pub use error::{HttpDaoError, HttpResult};
pub use store::HttpGateway;
