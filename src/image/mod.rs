//! Image resolution for pipeline stages.
//!
//! [`ImageResolver`] turns a component descriptor into a pulled image
//! reference plus its repository digests. Registry specifics live in
//! [`RegistryKind`]; retries use an injectable [`Sleeper`].

pub mod registry;
pub mod resolver;
pub mod retry;

pub use registry::RegistryKind;
pub use resolver::{ImageRequest, ImageResolver, ResolvedImage, StageRole};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
