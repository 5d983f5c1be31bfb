//! # Service Registry
//!
//! Named services exported by a peer, plus the side table of annotations for
//! every function reachable from them.
//!
//! ## Philosophy
//!
//! - **Annotations off the function**: A function value never learns it is a
//!   service method. The registry keys what it knows by [`FunctionId`], so the
//!   same closure can be shared between services and plain arguments.
//! - **One member table**: A service arrives either as a plain mapping or as a
//!   receiver object; both are flattened into the same ordered member list at
//!   registration.
//!
//! ## Addressing
//!
//! Members are addressed as `services.<service id>.<member path>`, where the
//! path descends through nested maps (and list indices) with dots.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::error::RpcError;
use crate::value::Callable;
use crate::value::FunctionId;
use crate::value::Value;

pub const SERVICES_PREFIX: &str = "services";

/// Whether a dotted path addresses a service member.
pub fn is_service_path(path: &str) -> bool {
    path.strip_prefix(SERVICES_PREFIX).is_some_and(|rest| rest.starts_with('.'))
}

/// Who may reach a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Only callers in the same workspace.
    #[default]
    Protected,
    /// Any caller.
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Protected => "protected",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "protected" => Ok(Visibility::Protected),
            "public" => Ok(Visibility::Public),
            other => Err(RpcError::InvalidArgument(format!("unknown visibility {other:?}"))),
        }
    }
}

/// Which methods receive the caller context as an extra last argument.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequireContext {
    #[default]
    None,
    All,
    /// Member paths, e.g. `"get_service"` or `"cache.process"`.
    Methods(Vec<String>),
}

impl RequireContext {
    pub fn applies_to(&self, path: &str) -> bool {
        match self {
            RequireContext::None => false,
            RequireContext::All => true,
            RequireContext::Methods(paths) => paths.iter().any(|p| p == path),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequireContext::None => Value::Bool(false),
            RequireContext::All => Value::Bool(true),
            RequireContext::Methods(paths) => {
                Value::List(paths.iter().map(|p| Value::str(p)).collect())
            }
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null | Value::Bool(false) => Ok(RequireContext::None),
            Value::Bool(true) => Ok(RequireContext::All),
            Value::List(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        RpcError::InvalidArgument("require_context entries must be strings".into())
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(RequireContext::Methods),
            other => Err(RpcError::InvalidArgument(format!(
                "require_context must be a bool or a list, got {}",
                other.kind()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceConfig {
    pub visibility: Visibility,
    pub require_context: RequireContext,
    /// Run members on a separate task instead of the dispatcher's.
    pub run_in_executor: bool,
    /// Workspace that owns the service; defaults to the peer's.
    pub workspace: Option<String>,
}

impl ServiceConfig {
    pub fn public() -> Self {
        Self { visibility: Visibility::Public, ..Self::default() }
    }

    pub fn with_require_context(mut self, require_context: RequireContext) -> Self {
        self.require_context = require_context;
        self
    }

    pub fn with_run_in_executor(mut self, run_in_executor: bool) -> Self {
        self.run_in_executor = run_in_executor;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut config = Value::map([
            ("visibility", Value::str(self.visibility.as_str())),
            ("require_context", self.require_context.to_value()),
            ("run_in_executor", Value::Bool(self.run_in_executor)),
        ]);
        if let Some(ws) = &self.workspace {
            config.set("workspace", Value::str(ws));
        }
        config
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let mut config = ServiceConfig::default();
        if let Some(v) = value.get("visibility").and_then(Value::as_str) {
            config.visibility = Visibility::parse(v)?;
        }
        if let Some(v) = value.get("require_context") {
            config.require_context = RequireContext::from_value(v)?;
        }
        if let Some(v) = value.get("run_in_executor").and_then(Value::as_bool) {
            config.run_in_executor = v;
        }
        config.workspace = value.get("workspace").and_then(Value::as_str).map(str::to_string);
        Ok(config)
    }
}

/// A service implemented by a receiver object.
pub trait ServiceObject: Send + Sync + 'static {
    fn id(&self) -> String;

    fn name(&self) -> Option<String> {
        None
    }

    fn config(&self) -> ServiceConfig {
        ServiceConfig::default()
    }

    /// The exported members, usually closures capturing `self`.
    fn members(self: Arc<Self>) -> Vec<(String, Value)>;
}

/// What can be registered as a service.
pub enum ServiceApi {
    /// A map with `id` and optional `name`, `type`, `description` and
    /// `config` keys; every other key is a member.
    Mapping(Value),
    Object(Arc<dyn ServiceObject>),
}

/// A registered, normalized service.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub description: Option<String>,
    pub config: ServiceConfig,
    pub members: Vec<(String, Value)>,
}

impl Service {
    pub fn from_api(api: ServiceApi) -> Result<Self> {
        let service = match api {
            ServiceApi::Mapping(Value::Map(entries)) => {
                let mut id = None;
                let mut name = None;
                let mut kind = None;
                let mut description = None;
                let mut config = ServiceConfig::default();
                let mut members = Vec::new();
                for (key, value) in entries {
                    match key.as_str() {
                        "id" => id = value.as_str().map(str::to_string),
                        "name" => name = value.as_str().map(str::to_string),
                        "type" => kind = value.as_str().map(str::to_string),
                        "description" => description = value.as_str().map(str::to_string),
                        "config" => config = ServiceConfig::from_value(&value)?,
                        _ => members.push((key, value)),
                    }
                }
                let id = id.ok_or_else(|| RpcError::InvalidArgument("service id is required".into()))?;
                Service {
                    name: name.unwrap_or_else(|| id.clone()),
                    id,
                    kind: kind.unwrap_or_else(|| "generic".into()),
                    description,
                    config,
                    members,
                }
            }
            ServiceApi::Mapping(other) => {
                return Err(RpcError::InvalidArgument(format!(
                    "service must be a map, got {}",
                    other.kind()
                )));
            }
            ServiceApi::Object(object) => {
                let id = object.id();
                Service {
                    name: object.name().unwrap_or_else(|| id.clone()),
                    id,
                    kind: "generic".into(),
                    description: None,
                    config: object.config(),
                    members: object.members(),
                }
            }
        };

        if service.id.is_empty() || service.id.contains(['.', ':', '/']) {
            return Err(RpcError::InvalidArgument(format!(
                "invalid service id {:?}",
                service.id
            )));
        }
        Ok(service)
    }

    pub fn member(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let value = self.members.iter().find(|(k, _)| k == head).map(|(_, v)| v)?;
        match rest {
            Some(rest) => value.get_path(rest),
            None => Some(value),
        }
    }

    /// Public description, without members.
    pub fn descriptor(&self, full_id: &str) -> Value {
        let mut info = Value::map([
            ("id", Value::str(full_id)),
            ("name", Value::str(&self.name)),
            ("type", Value::str(&self.kind)),
            ("config", self.config.to_value()),
        ]);
        if let Some(description) = &self.description {
            info.set("description", Value::str(description));
        }
        info
    }

    /// Descriptor plus members, as handed out by `get_service`.
    pub fn interface(&self, full_id: &str) -> Value {
        let Value::Map(mut entries) = self.descriptor(full_id) else {
            return Value::Interface(self.members.clone());
        };
        entries.extend(self.members.iter().cloned());
        Value::Interface(entries)
    }
}

/// What the registry knows about one exported function.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodAnnotation {
    /// Full address, `services.<id>.<path>`.
    pub method_id: String,
    pub require_context: bool,
    pub visibility: Visibility,
    pub run_in_executor: bool,
}

/// A resolved, callable service member.
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    pub callable: Callable,
    pub annotation: MethodAnnotation,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
    annotations: DashMap<FunctionId, MethodAnnotation>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a service. Returns the replaced one, if `overwrite` allowed it.
    pub fn insert(&self, service: Service, overwrite: bool) -> Result<Option<Arc<Service>>> {
        if !overwrite && self.services.contains_key(&service.id) {
            return Err(RpcError::ServiceExists(service.id));
        }
        let service = Arc::new(service);
        let previous = self.services.insert(service.id.clone(), service.clone());
        if let Some(old) = &previous {
            self.forget_annotations(old);
        }
        self.annotate(&service);
        Ok(previous)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Service>> {
        let (_, service) = self.services.remove(id)?;
        self.forget_annotations(&service);
        Some(service)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.services.get(id).map(|s| s.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub fn clear(&self) {
        self.services.clear();
        self.annotations.clear();
    }

    pub fn annotation(&self, id: FunctionId) -> Option<MethodAnnotation> {
        self.annotations.get(&id).map(|a| a.value().clone())
    }

    /// Resolves `services.<id>.<path>` for a caller in `caller_workspace`.
    /// Protected services only answer callers of `local_workspace`.
    pub fn resolve(
        &self,
        method_id: &str,
        caller_workspace: Option<&str>,
        local_workspace: Option<&str>,
    ) -> Result<ResolvedMethod> {
        let (service_id, path) = method_id
            .strip_prefix(SERVICES_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.split_once('.'))
            .ok_or_else(|| RpcError::NotFound(format!("method {method_id}")))?;
        let service = self
            .get(service_id)
            .ok_or_else(|| RpcError::NotFound(format!("service {service_id}")))?;
        check_visibility(&service, caller_workspace, local_workspace)?;

        let callable = match service.member(path) {
            Some(Value::Function(f)) => f.clone(),
            Some(other) => {
                return Err(RpcError::InvalidArgument(format!(
                    "{method_id} is a {}, not a function",
                    other.kind()
                )));
            }
            None => return Err(RpcError::NotFound(format!("method {method_id}"))),
        };
        let annotation = MethodAnnotation {
            method_id: method_id.to_string(),
            require_context: service.config.require_context.applies_to(path),
            visibility: service.config.visibility,
            run_in_executor: service.config.run_in_executor,
        };
        Ok(ResolvedMethod { callable, annotation })
    }

    fn annotate(&self, service: &Service) {
        for (key, value) in &service.members {
            self.annotate_value(service, key, value);
        }
    }

    fn annotate_value(&self, service: &Service, path: &str, value: &Value) {
        match value {
            Value::Function(f) if !f.is_remote() => {
                self.annotations.insert(
                    f.id(),
                    MethodAnnotation {
                        method_id: format!("{SERVICES_PREFIX}.{}.{path}", service.id),
                        require_context: service.config.require_context.applies_to(path),
                        visibility: service.config.visibility,
                        run_in_executor: service.config.run_in_executor,
                    },
                );
            }
            Value::Map(entries) => {
                for (key, child) in entries {
                    self.annotate_value(service, &format!("{path}.{key}"), child);
                }
            }
            Value::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.annotate_value(service, &format!("{path}.{i}"), child);
                }
            }
            _ => {}
        }
    }

    fn forget_annotations(&self, service: &Service) {
        let prefix = format!("{SERVICES_PREFIX}.{}.", service.id);
        self.annotations.retain(|_, a| !a.method_id.starts_with(&prefix));
    }
}

/// Public services answer everyone; protected ones only their own workspace.
pub fn check_visibility(
    service: &Service,
    caller_workspace: Option<&str>,
    local_workspace: Option<&str>,
) -> Result<()> {
    let owner = service.config.workspace.as_deref().or(local_workspace);
    match service.config.visibility {
        Visibility::Public => Ok(()),
        Visibility::Protected if caller_workspace == owner => Ok(()),
        Visibility::Protected => Err(RpcError::Permission(format!(
            "service {} is protected",
            service.id
        ))),
    }
}

/// A parsed `"[workspace/]client:service"` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub workspace: Option<String>,
    pub client_id: Option<String>,
    pub service_id: String,
}

impl ServiceUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (workspace, rest) = match uri.split_once('/') {
            Some((ws, rest)) => (Some(ws.to_string()), rest),
            None => (None, uri),
        };
        let (client_id, service_id) = match rest.split_once(':') {
            Some((client, svc)) => (Some(client.to_string()), svc),
            None => (None, rest),
        };
        if service_id.is_empty()
            || client_id.as_deref() == Some("")
            || workspace.as_deref() == Some("")
        {
            return Err(RpcError::InvalidArgument(format!("invalid service uri {uri:?}")));
        }
        Ok(Self {
            workspace,
            client_id,
            service_id: service_id.to_string(),
        })
    }
}
