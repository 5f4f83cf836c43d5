pub mod config;
pub mod error;
pub mod kubernetes;
pub mod swg;

pub use config::Config;
pub use error::Error;
pub use kubernetes::cache::{CacheAction, FrontendList, ServiceCache, ServiceEvent};
pub use swg::StoppableWaitGroup;

pub type Result<T, E = Error> = std::result::Result<T, E>;
