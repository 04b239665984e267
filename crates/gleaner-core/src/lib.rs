pub mod error;
pub mod extract;
pub mod keypath;
pub mod models;
pub mod navigator;
pub mod normalize;
pub mod paths;
pub mod pipeline;
pub mod policy;
pub mod session;
pub mod storage;
pub mod template;
pub mod throttle;
pub mod traits;

#[cfg(test)]
mod testutil;

pub use error::{CrawlError, ExtractionError, PersistenceError};
pub use models::{ItemKind, ItemPayload, NormalizedItem, RawRecord, SaveSummary, SavedArtifact};
pub use navigator::Navigator;
pub use normalize::Normalizer;
pub use pipeline::{
    CrawlOutcome, CrawlPipeline, CrawlRequest, PipelineEvent, PipelineReporter, PipelineState,
    TracingReporter,
};
pub use policy::CrawlPolicy;
pub use session::{SessionCookie, SessionSnapshot};
pub use storage::StorageDispatcher;
pub use traits::{BrowserDriver, ResourceFetcher, ResourceFetcherFactory};
