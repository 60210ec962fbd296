//! Shared component fixtures for integration tests
#![allow(dead_code)]

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use spindle_core::component::{
    BuildContext, Component, ComponentFactory, PropertyKind, PropertySchema,
};
use spindle_core::error::{SpindleError, SpindleResult};
use spindle_core::manager::ConfigurationManager;
use spindle_core::raw_config::RawValue;
use spindle_core::TypeRegistry;

/// Leaf component with two defaulted scalars.
pub struct Source {
    pub rate: u64,
    pub channels: u64,
}

impl Component for Source {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct SourceFactory {
    schema: PropertySchema,
}

impl SourceFactory {
    pub fn new() -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new()
                .defaulted("rate", PropertyKind::Scalar, RawValue::Scalar("16000".into()))
                .defaulted("channels", PropertyKind::Scalar, RawValue::Scalar("1".into())),
        })
    }
}

impl ComponentFactory for SourceFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        Ok(Arc::new(Source {
            rate: ctx.parse("rate")?,
            channels: ctx.parse("channels")?,
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<Source>()
    }
}

/// Mid-tier component with a required reference and a defaulted scalar.
pub struct Filter {
    pub gain: String,
    pub input: Arc<dyn Component>,
}

impl Component for Filter {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct FilterFactory {
    schema: PropertySchema,
}

impl FilterFactory {
    pub fn new() -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new()
                .required("input", PropertyKind::ComponentRef)
                .defaulted("gain", PropertyKind::Scalar, RawValue::Scalar("1.0".into())),
        })
    }
}

impl ComponentFactory for FilterFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        Ok(Arc::new(Filter {
            gain: ctx.scalar("gain")?.to_string(),
            input: ctx.component("input")?,
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<Filter>()
    }
}

/// Fan-in component covering the container property kinds.
pub struct Mixer {
    pub inputs: Vec<Arc<dyn Component>>,
    pub label_count: usize,
    pub band_count: usize,
}

impl Component for Mixer {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct MixerFactory {
    schema: PropertySchema,
}

impl MixerFactory {
    pub fn new() -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new()
                .required("inputs", PropertyKind::ComponentRefList)
                .optional("labels", PropertyKind::List)
                .optional("bands", PropertyKind::Map),
        })
    }
}

impl ComponentFactory for MixerFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        let label_count = match ctx.property("labels") {
            Some(_) => ctx.list("labels")?.len(),
            None => 0,
        };
        let band_count = match ctx.property("bands") {
            Some(_) => ctx.map("bands")?.len(),
            None => 0,
        };
        Ok(Arc::new(Mixer {
            inputs: ctx.components("inputs")?,
            label_count,
            band_count,
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<Mixer>()
    }
}

/// Records start/stop order into a shared log; used for lifecycle and
/// shutdown-ordering assertions.
pub struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    pub input: Option<Arc<dyn Component>>,
}

impl Component for Recorder {
    fn start(&self) -> SpindleResult<()> {
        self.log.lock().push(format!("start:{}", self.name));
        Ok(())
    }
    fn stop(&self) {
        self.log.lock().push(format!("stop:{}", self.name));
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct RecorderFactory {
    schema: PropertySchema,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecorderFactory {
    pub fn new(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new().optional("input", PropertyKind::ComponentRef),
            log,
        })
    }
}

impl ComponentFactory for RecorderFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        let input = match ctx.property("input") {
            Some(_) => Some(ctx.component("input")?),
            None => None,
        };
        Ok(Arc::new(Recorder {
            name: ctx.component_name().to_string(),
            log: self.log.clone(),
            input,
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<Recorder>()
    }
}

/// Component whose post-construction hook always fails.
pub struct FaultyStarter;

impl Component for FaultyStarter {
    fn start(&self) -> SpindleResult<()> {
        Err(SpindleError::Internal {
            message: "refusing to start".to_string(),
        })
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct FaultyStarterFactory {
    schema: PropertySchema,
}

impl FaultyStarterFactory {
    pub fn new() -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new(),
        })
    }
}

impl ComponentFactory for FaultyStarterFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, _ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        Ok(Arc::new(FaultyStarter))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<FaultyStarter>()
    }
}

/// Remote-side service: counts operations actually served; can be made to
/// fail its remote calls to simulate a dead provider.
pub struct EchoService {
    served: Arc<AtomicUsize>,
    failing: AtomicBool,
}

impl EchoService {
    pub fn serve(&self) -> SpindleResult<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SpindleError::RemoteInvocation {
                operation: "serve".to_string(),
                details: "provider unreachable".to_string(),
            });
        }
        Ok(self.served.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Simulate the provider process dying: every later call fails.
    pub fn kill(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl Component for EchoService {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct EchoServiceFactory {
    schema: PropertySchema,
    served: Arc<AtomicUsize>,
}

impl EchoServiceFactory {
    /// Every instance built by this factory shares one served-operations
    /// counter, so totals survive provider replacement.
    pub fn new(served: Arc<AtomicUsize>) -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new()
                .defaulted("greeting", PropertyKind::Scalar, RawValue::Scalar("echo".into())),
            served,
        })
    }
}

impl ComponentFactory for EchoServiceFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, _ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        Ok(Arc::new(EchoService {
            served: self.served.clone(),
            failing: AtomicBool::new(false),
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<EchoService>()
    }
}

/// Client-side component depending on an imported [`EchoService`].
///
/// Implements the explicit recovery protocol: a transient failure triggers
/// one reconfigure of its own sheet through the manager handle, then one
/// retry through the rebuilt instance.
pub struct EchoClient {
    name: String,
    manager: Weak<ConfigurationManager>,
    service: Arc<EchoService>,
    starts: Arc<AtomicUsize>,
    observed: Arc<AtomicUsize>,
}

impl EchoClient {
    pub fn call(&self) -> SpindleResult<usize> {
        let total = self.service.serve()?;
        self.observed.fetch_add(1, Ordering::SeqCst);
        Ok(total)
    }

    /// One call with the reconfigure-and-retry protocol applied.
    pub fn call_with_recovery(&self) -> SpindleResult<usize> {
        match self.call() {
            Err(err) if err.is_transient() => {
                let manager =
                    self.manager
                        .upgrade()
                        .ok_or_else(|| SpindleError::Internal {
                            message: "manager released".to_string(),
                        })?;
                let rebuilt = manager.reconfigure(&self.name)?;
                let replacement = rebuilt
                    .as_any_arc()
                    .downcast::<EchoClient>()
                    .map_err(|_| SpindleError::Internal {
                        message: "rebuilt client has unexpected type".to_string(),
                    })?;
                replacement.call()
            }
            other => other,
        }
    }
}

impl Component for EchoClient {
    fn start(&self) -> SpindleResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct EchoClientFactory {
    schema: PropertySchema,
    starts: Arc<AtomicUsize>,
    observed: Arc<AtomicUsize>,
}

impl EchoClientFactory {
    /// Instances share the start and observed counters so a rebuild is
    /// visible as one more start, not a reset.
    pub fn new(starts: Arc<AtomicUsize>, observed: Arc<AtomicUsize>) -> Arc<dyn ComponentFactory> {
        Arc::new(Self {
            schema: PropertySchema::new().required("service", PropertyKind::ComponentRef),
            starts,
            observed,
        })
    }
}

impl ComponentFactory for EchoClientFactory {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>> {
        Ok(Arc::new(EchoClient {
            name: ctx.component_name().to_string(),
            manager: ctx.manager(),
            service: ctx.component_as::<EchoService>("service")?,
            starts: self.starts.clone(),
            observed: self.observed.clone(),
        }))
    }
    fn instance_type_id(&self) -> TypeId {
        TypeId::of::<EchoClient>()
    }
}

/// Registry with the plain pipeline types every test needs.
pub fn pipeline_registry() -> Arc<TypeRegistry> {
    let registry = Arc::new(TypeRegistry::new());
    registry
        .register("test.Source", SourceFactory::new())
        .unwrap();
    registry
        .register("test.Filter", FilterFactory::new())
        .unwrap();
    registry.register("test.Mixer", MixerFactory::new()).unwrap();
    registry
}
