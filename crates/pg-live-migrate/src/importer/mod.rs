//! Import side of the engine.
//!
//! - [`file`]: snapshot batches — split, bulk-load, retry, resume.
//! - [`dispatcher`]: hash-partitioned apply channels with size/time/flush
//!   batching.
//! - [`conflict`]: unique-key conflict ordering across channels.
//! - [`stream`]: the event segment reader wiring it all together.

pub mod conflict;
pub mod dispatcher;
pub mod file;
pub mod stream;

pub use conflict::ConflictDetectionCache;
pub use dispatcher::{ChannelApplier, DispatchMessage, EventDispatcher};
pub use file::{import_batch_with_retries, split_data_file, BatchSizeLimits, SnapshotFileImporter};
pub use stream::{start_apply_channels, EventStreamImporter, StreamingConfig, StreamingPipeline};
