//! Provider adapter interface and built-in adapters.
//!
//! The engine core never performs I/O against external systems itself. Every
//! resource kind is realized by a `Provider` looked up in a `ProviderRegistry`.

mod adapter;
mod local_file;
mod random_id;
mod registry;

pub use adapter::{
    Capabilities, CurrentState, OperationContext, PropertyMode, Provider, ProviderOutput,
    ReplaceOrder,
};
pub use local_file::LocalFileProvider;
pub use random_id::{RandomIdProvider, DEFAULT_BYTE_LENGTH};
pub use registry::{ProviderRegistry, LOCAL_FILE_KIND, RANDOM_ID_KIND};
