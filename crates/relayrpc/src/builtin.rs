//! The `built-in` service every peer exports: liveness, service lookup,
//! remote registration and the receiving half of chunked transfer.
//!
//! All members require context; the caller context is always the last
//! argument.

use std::sync::Arc;
use std::sync::Weak;

use crate::error::Result;
use crate::error::RpcError;
use crate::peer::Inner;
use crate::service::RequireContext;
use crate::service::Service;
use crate::service::ServiceApi;
use crate::service::ServiceConfig;
use crate::service::ServiceUri;
use crate::service::check_visibility;
use crate::value::Callable;
use crate::value::Value;

pub const BUILTIN_SERVICE_ID: &str = "built-in";

fn upgrade(weak: &Weak<Inner>) -> Result<Arc<Inner>> {
    weak.upgrade().ok_or(RpcError::Disconnected)
}

/// Splits the trailing context off the positional arguments.
fn split_context(mut args: Vec<Value>) -> (Vec<Value>, Value) {
    let context = args.pop().unwrap_or(Value::Null);
    (args, context)
}

fn caller(context: &Value) -> Result<&str> {
    context
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Protocol("call context without sender".into()))
}

fn caller_workspace(context: &Value) -> Option<&str> {
    context.get("ws").and_then(Value::as_str)
}

fn string_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidArgument(format!("{name} must be a string")))
}

/// A builtin member that needs the engine.
fn member<F>(weak: &Weak<Inner>, name: &str, f: F) -> Callable
where
    F: Fn(&Arc<Inner>, Vec<Value>, Value) -> Result<Value> + Send + Sync + 'static,
{
    let weak = weak.clone();
    Callable::sync(move |args| {
        let inner = upgrade(&weak)?;
        let (args, context) = split_context(args);
        f(&inner, args, context)
    })
    .with_name(name)
}

impl Inner {
    pub(crate) fn builtin_service(self: &Arc<Self>) -> Service {
        let weak = Arc::downgrade(self);

        let ping = Callable::sync(|_| Ok(Value::str("pong")))
            .with_name("ping")
            .with_doc("Liveness probe; answers \"pong\".");

        let get_service = member(&weak, "get_service", |inner, args, context| {
            let uri = ServiceUri::parse(string_arg(&args, 0, "service_id")?)?;
            inner.local_interface(&uri.service_id, caller_workspace(&context))
        })
        .with_signature("get_service(service_id)");

        let register_service = member(&weak, "register_service", |inner, args, context| {
            if caller_workspace(&context) != inner.config.workspace.as_deref() {
                return Err(RpcError::Permission(format!(
                    "{} may not register services here",
                    caller(&context)?
                )));
            }
            let api = args
                .first()
                .cloned()
                .ok_or_else(|| RpcError::InvalidArgument("register_service needs a service".into()))?;
            let overwrite = args.get(1).and_then(Value::as_bool).unwrap_or(false);
            let notify = args.get(2).and_then(Value::as_bool).unwrap_or(true);
            inner.register(Service::from_api(ServiceApi::Mapping(api))?, overwrite, notify)
        })
        .with_signature("register_service(api, overwrite=false, notify=true)");

        let create = member(&weak, "create", |inner, args, context| {
            let id = string_arg(&args, 0, "message_id")?;
            let heartbeat = args.get(1).and_then(Value::as_bool).unwrap_or(false);
            let idle = heartbeat.then_some(inner.config.method_timeout);
            inner.cache.create(id, caller(&context)?, idle)?;
            Ok(Value::Null)
        });

        let append = member(&weak, "append", |inner, args, context| {
            let id = string_arg(&args, 0, "message_id")?;
            let data = args
                .get(1)
                .and_then(Value::as_bytes)
                .ok_or_else(|| RpcError::InvalidArgument("append expects bytes".into()))?;
            inner.cache.append(id, caller(&context)?, data)?;
            Ok(Value::Null)
        });

        let process = member(&weak, "process", |inner, args, context| {
            let id = string_arg(&args, 0, "message_id")?;
            let bytes = inner.cache.take(id, caller(&context)?)?;
            tracing::debug!(client_id = %inner.wire_id, message_id = %id, size = bytes.len(), "dispatching reassembled message");
            inner.dispatch(bytes);
            Ok(Value::Null)
        });

        let remove = member(&weak, "remove", |inner, args, context| {
            let id = string_arg(&args, 0, "message_id")?;
            Ok(Value::Bool(inner.cache.remove(id, caller(&context)?)))
        });

        Service {
            id: BUILTIN_SERVICE_ID.to_string(),
            name: "Built-in services".to_string(),
            kind: "built-in".to_string(),
            description: None,
            config: ServiceConfig::public().with_require_context(RequireContext::All),
            members: vec![
                ("ping".into(), Value::Function(ping)),
                ("get_service".into(), Value::Function(get_service)),
                ("register_service".into(), Value::Function(register_service)),
                (
                    "message_cache".into(),
                    Value::map([
                        ("create", Value::Function(create)),
                        ("append", Value::Function(append)),
                        ("process", Value::Function(process)),
                        ("remove", Value::Function(remove)),
                    ]),
                ),
            ],
        }
    }

    /// The interface of a local service, if `caller_workspace` may see it.
    fn local_interface(&self, service_id: &str, caller_workspace: Option<&str>) -> Result<Value> {
        let service = self
            .services
            .get(service_id)
            .ok_or_else(|| RpcError::NotFound(format!("service {service_id}")))?;
        check_visibility(&service, caller_workspace, self.config.workspace.as_deref())?;
        Ok(service.interface(&self.full_service_id(service_id)))
    }
}
