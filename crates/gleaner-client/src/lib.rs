pub mod fetcher;
pub mod static_driver;

#[cfg(feature = "browser")]
pub mod browser_driver;

pub use fetcher::{ReqwestFetcher, ReqwestFetcherFactory};
pub use static_driver::StaticHtmlDriver;

#[cfg(feature = "browser")]
pub use browser_driver::{ChromiumDriver, ChromiumOptions};
