//! Capability providers: context-specific responders for conversational commands.

pub mod descriptor;
pub mod provider;
pub mod registry;

pub use descriptor::ProviderDescriptor;
pub use provider::{Capability, CapabilityRequest, ProviderLauncher};
pub use registry::{CapabilityRegistry, ProviderHandle, ProviderInfo, ProviderState};
