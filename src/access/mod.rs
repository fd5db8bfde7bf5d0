mod entity;
mod http;
mod machine;
mod memory;
mod provider;
mod sweep;

pub use entity::{AccessCodeDiagnostics, AccessCodeEntity};
pub use http::HttpAccessCodeProvider;
pub use machine::{AccessCodeConfig, AccessCodeError, AccessCodeMachine};
pub use memory::MemoryProvider;
pub use provider::{
    AccessCodeProvider, EntityKind, EntityRef, ProviderError, ProviderOp, RemoteAccessCode,
    ValidityWindow,
};
pub use sweep::{ConsistencyDrift, SweepReport};
