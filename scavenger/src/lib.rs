mod system;
mod barrier;
mod error;
mod settings;
mod space;
mod heap;
mod object_model;
mod forwarding;
mod cache;
mod cache_pool;
mod scan_queue;
mod remembered_set;
mod copy_scan_ratio;
mod stats;
mod tenure;
mod events;
mod dispatcher;
mod roots;
mod worker;
mod engine;
mod copy;
mod scan;
mod backout;
mod concurrent;
#[cfg(test)]
mod rng;
#[cfg(test)]
mod test_graph;

pub use system::OS_PAGE_SIZE;
pub use barrier::SenseBarrier;
pub use error::{ScavengeError, SettingsError};
pub use settings::{ConcurrentSettings, ScanOrdering, ScavengerSettings, TenureSettings};
pub use space::{BumpSpace, Region, SubSpace};
pub use heap::*;
pub use object_model::{
    CopyDetails, HotFields, ObjectModel, ObjectScanner, ScanReason, StandardObjectModel,
};
pub use forwarding::ForwardedHeader;
pub use cache::{CacheMode, CacheRole, CopyScanCache};
pub use cache_pool::FreeCachePool;
pub use scan_queue::{ScanQueue, WaitOutcome, WaitPolicy};
pub use remembered_set::{RememberedEntry, RememberedSet, RememberedSetFragment};
pub use copy_scan_ratio::CopyScanRatio;
pub use stats::{FlipHistory, FlipHistoryRow, GcHistory, ScavengerStats};
pub use tenure::TenureMask;
pub use events::{EventListener, LogListener, ScavengerEvent};
pub use dispatcher::{Dispatcher, ThreadPoolDispatcher};
pub use roots::{RootBuffer, RootProvider};
pub use worker::WorkerContext;
pub use engine::{CollectOutcome, PercolateReason, Scavenger};
pub use concurrent::{ConcurrentPhase, ConcurrentStart, Mutator, ScanProgress};
