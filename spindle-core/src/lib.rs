pub mod component;
pub mod error;
pub mod manager;
pub mod property_sheet;
pub mod provenance;
pub mod raw_config;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod tasks;

pub use component::{
    BuildContext, Component, ComponentFactory, ComponentListener, NamedComponent, PropertyKind,
    PropertySchema, PropertySpec, ResolvedValue, TypeRegistry,
};
pub use error::{Result, SpindleError, SpindleResult};
pub use manager::ConfigurationManager;
pub use property_sheet::PropertySheet;
pub use provenance::{
    extract_configuration, marshal, unmarshal, ConfigurationData, MarshalledProvenance,
    MarshalledValue, ObjectProvenance, Provenance,
};
pub use raw_config::{GlobalProperties, RawPropertyRecord, RawValue, SheetPolicy};
pub use registry::{
    DirectoryListener, Lease, LocalDirectory, Query, RegistrationHandle, RegistryEntry,
    ServiceDirectory, WatchHandle,
};
pub use remote::{RemoteComponentManager, RemoteMultiComponentManager};
pub use retry::{retry_with_backoff, BackoffPolicy, RetryPolicy};
pub use tasks::TaskHandle;
