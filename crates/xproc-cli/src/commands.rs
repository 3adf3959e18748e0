//! Subcommand implementations.

use crate::config::CliConfig;
use crate::service::LocalProcessService;
use crate::values::{parse_argument, render};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;
use xproc::process_service::{self, ProcessServiceStub};
use xproc::{
    ConnectionManager, InterfaceDescriptor, ServiceHost, ServiceHostHandle, ServiceRegistry,
    TcpTransport,
};

fn interface(legacy: bool) -> Result<Arc<InterfaceDescriptor>> {
    let descriptor = if legacy {
        process_service::descriptor_v1()?
    } else {
        process_service::descriptor()?
    };
    Ok(descriptor)
}

/// Start hosting the process service. The host runs until the handle drops.
pub async fn start_host(config: &CliConfig, legacy: bool) -> Result<ServiceHostHandle> {
    let registry = Arc::new(ServiceRegistry::with_options(config.dispatcher.clone()));
    let service = Arc::new(LocalProcessService::new());
    registry.bind_service(interface(legacy)?, Arc::new(ProcessServiceStub::new(service)));

    let addr = format!("{}:{}", config.host, config.port);
    let handle = ServiceHost::start(registry, &addr)
        .await
        .with_context(|| format!("starting host on {}", addr))?;
    info!(
        "Serving {} ({}) with {} workers",
        process_service::INTERFACE_NAME,
        if legacy { "v1" } else { "v2" },
        config.dispatcher.workers
    );
    Ok(handle)
}

/// Perform one call against a running host and return the JSON result.
pub async fn call(
    config: &CliConfig,
    addr: &str,
    method: &str,
    raw_args: &[String],
) -> Result<serde_json::Value> {
    let descriptor = interface(false)?;
    let Some(declared) = descriptor.method(method) else {
        let known: Vec<&str> = descriptor.methods().iter().map(|m| m.name()).collect();
        bail!("unknown method {} (expected one of {})", method, known.join(", "));
    };

    let types = declared.argument_types();
    if raw_args.len() != types.len() {
        bail!(
            "{} takes {} arguments ({}), got {}",
            method,
            types.len(),
            types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            raw_args.len()
        );
    }
    let args = raw_args
        .iter()
        .zip(types)
        .map(|(raw, ty)| parse_argument(raw, *ty))
        .collect::<Result<Vec<_>>>()?;

    let manager =
        ConnectionManager::with_options(Arc::new(TcpTransport::new()), config.connection.clone());
    let proxy = manager
        .connect(addr, descriptor.clone())
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    let value = proxy.call(method, args).await?;
    manager
        .release(addr, descriptor.name())
        .await
        .with_context(|| format!("releasing {}", addr))?;

    Ok(render(&value))
}

/// The descriptor as pretty JSON.
pub fn describe(legacy: bool) -> Result<String> {
    let descriptor = interface(legacy)?;
    Ok(serde_json::to_string_pretty(&descriptor.summary())?)
}
