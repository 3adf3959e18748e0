//! The `ProcessService` interface: descriptor, typed trait, stub and proxy.
//!
//! Version 2 of the contract appended `startService` (with a local default),
//! `getStartedAt` and `postData`. [`descriptor_v1`] describes hosts built
//! before that.

use crate::codec::{Value, WireType};
use crate::connection::ConnectionManager;
use crate::descriptor::{InterfaceDescriptor, InterfaceDescriptorBuilder, MethodDescriptor};
use crate::error::{Result, XprocError};
use crate::proxy::Proxy;
use crate::stub::ServiceObject;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};

pub const INTERFACE_NAME: &str = "ProcessService";

pub const GET_CURRENT_TIME_STAMP: &str = "getCurrentTimeStamp";
pub const GET_STRING: &str = "getString";
pub const TEST_FUNCTION: &str = "testFunction";
pub const START_SERVICE: &str = "startService";
pub const GET_STARTED_AT: &str = "getStartedAt";
pub const POST_DATA: &str = "postData";

static DESCRIPTOR: OnceLock<Arc<InterfaceDescriptor>> = OnceLock::new();
static DESCRIPTOR_V1: OnceLock<Arc<InterfaceDescriptor>> = OnceLock::new();

/// What `startService` does when the remote side doesn't implement it.
/// Both the descriptor's caller-side default and the trait's default body
/// run this.
fn start_service_fallback() -> Result<()> {
    Ok(())
}

fn start_service_default(_args: &[Value]) -> Result<Value> {
    start_service_fallback().map(|()| Value::Void)
}

fn declare_v1() -> InterfaceDescriptorBuilder {
    InterfaceDescriptor::builder(INTERFACE_NAME)
        .method(GET_CURRENT_TIME_STAMP, &[], WireType::I64)
        .method(GET_STRING, &[], WireType::NullableString)
        .method(
            TEST_FUNCTION,
            &[WireType::String, WireType::I32],
            WireType::String,
        )
}

fn cached(
    cell: &'static OnceLock<Arc<InterfaceDescriptor>>,
    build: fn() -> Result<InterfaceDescriptor>,
) -> Result<Arc<InterfaceDescriptor>> {
    if let Some(descriptor) = cell.get() {
        return Ok(descriptor.clone());
    }
    let built = Arc::new(build()?);
    // Another thread may have won the race; either copy is identical.
    Ok(cell.get_or_init(|| built).clone())
}

/// Current (version 2) descriptor.
pub fn descriptor() -> Result<Arc<InterfaceDescriptor>> {
    cached(&DESCRIPTOR, || {
        declare_v1()
            .optional_method(START_SERVICE, &[], WireType::Void, start_service_default)
            .method(GET_STARTED_AT, &[], WireType::Timestamp)
            .method(POST_DATA, &[WireType::StringArray], WireType::I32Array)
            .build()
    })
}

/// Version 1 descriptor, as served by older hosts.
pub fn descriptor_v1() -> Result<Arc<InterfaceDescriptor>> {
    cached(&DESCRIPTOR_V1, || declare_v1().build())
}

/// Typed view of the interface.
#[async_trait]
pub trait ProcessService: Send + Sync {
    /// Milliseconds since the Unix epoch, as seen by the service.
    async fn get_current_time_stamp(&self) -> Result<i64>;

    async fn get_string(&self) -> Result<Option<String>>;

    async fn test_function(&self, path: String, parameters: i32) -> Result<String>;

    /// Added in version 2. Callers of older hosts get the same no-op.
    async fn start_service(&self) -> Result<()> {
        start_service_fallback()
    }

    /// Added in version 2.
    async fn get_started_at(&self) -> Result<DateTime<Utc>>;

    /// Added in version 2. One result per item, in order.
    async fn post_data(&self, items: Vec<String>) -> Result<Vec<i32>>;
}

/// Serves a [`ProcessService`] implementation through a dispatcher.
pub struct ProcessServiceStub<S> {
    service: Arc<S>,
}

impl<S: ProcessService + 'static> ProcessServiceStub<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: ProcessService + 'static> ServiceObject for ProcessServiceStub<S> {
    async fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let mut next = |what: &str| {
            args.next()
                .ok_or_else(|| XprocError::malformed(format!("missing argument {}", what)))
        };

        match method.name() {
            GET_CURRENT_TIME_STAMP => Ok(Value::I64(self.service.get_current_time_stamp().await?)),
            GET_STRING => Ok(Value::Str(self.service.get_string().await?)),
            TEST_FUNCTION => {
                let path = next("path")?.into_string()?;
                let parameters = next("parameters")?.into_i32()?;
                Ok(Value::string(
                    self.service.test_function(path, parameters).await?,
                ))
            }
            START_SERVICE => {
                self.service.start_service().await?;
                Ok(Value::Void)
            }
            GET_STARTED_AT => Ok(Value::Timestamp(self.service.get_started_at().await?)),
            POST_DATA => {
                let items = next("items")?.into_string_array()?;
                Ok(Value::I32Array(self.service.post_data(items).await?))
            }
            _ => Err(XprocError::UnsupportedMethod {
                code: method.code(),
            }),
        }
    }
}

/// Caller-side [`ProcessService`] backed by a [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProcessServiceProxy {
    proxy: Proxy,
}

impl ProcessServiceProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    /// Connect to the service hosted at `target`.
    pub async fn connect(manager: &ConnectionManager, target: &str) -> Result<Self> {
        let proxy = manager.connect(target, descriptor()?).await?;
        Ok(Self::new(proxy))
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

#[async_trait]
impl ProcessService for ProcessServiceProxy {
    async fn get_current_time_stamp(&self) -> Result<i64> {
        self.proxy
            .call(GET_CURRENT_TIME_STAMP, Vec::new())
            .await?
            .into_i64()
    }

    async fn get_string(&self) -> Result<Option<String>> {
        self.proxy
            .call(GET_STRING, Vec::new())
            .await?
            .into_nullable_string()
    }

    async fn test_function(&self, path: String, parameters: i32) -> Result<String> {
        self.proxy
            .call(
                TEST_FUNCTION,
                vec![Value::string(path), Value::I32(parameters)],
            )
            .await?
            .into_string()
    }

    async fn start_service(&self) -> Result<()> {
        self.proxy.call(START_SERVICE, Vec::new()).await?.into_unit()
    }

    async fn get_started_at(&self) -> Result<DateTime<Utc>> {
        self.proxy
            .call(GET_STARTED_AT, Vec::new())
            .await?
            .into_timestamp()
    }

    async fn post_data(&self, items: Vec<String>) -> Result<Vec<i32>> {
        self.proxy
            .call(POST_DATA, vec![Value::StringArray(items)])
            .await?
            .into_i32_array()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FIRST_CALL_TRANSACTION;

    struct Fixed;

    #[async_trait]
    impl ProcessService for Fixed {
        async fn get_current_time_stamp(&self) -> Result<i64> {
            Ok(1_700_000_000_000)
        }

        async fn get_string(&self) -> Result<Option<String>> {
            Ok(None)
        }

        async fn test_function(&self, path: String, parameters: i32) -> Result<String> {
            Ok(format!("{}/{}", path, parameters))
        }

        async fn get_started_at(&self) -> Result<DateTime<Utc>> {
            Err(XprocError::RemoteFailure {
                message: "not started".into(),
            })
        }

        async fn post_data(&self, items: Vec<String>) -> Result<Vec<i32>> {
            Ok(items.iter().map(|s| s.len() as i32).collect())
        }
    }

    #[test]
    fn test_v2_extends_v1_without_renumbering() {
        let v1 = descriptor_v1().unwrap();
        let v2 = descriptor().unwrap();

        for method in v1.methods() {
            assert_eq!(v2.method(method.name()).unwrap().code(), method.code());
        }
        assert_eq!(v2.method(GET_CURRENT_TIME_STAMP).unwrap().code(), FIRST_CALL_TRANSACTION);
        assert_eq!(v2.method(START_SERVICE).unwrap().code(), 4);
        assert_eq!(v2.method(GET_STARTED_AT).unwrap().code(), 5);
        assert_eq!(v2.method(POST_DATA).unwrap().code(), 6);
        assert!(v2.method(START_SERVICE).unwrap().has_default_implementation());
        assert!(!v2.method(GET_STARTED_AT).unwrap().has_default_implementation());
        assert!(v1.method(START_SERVICE).is_none());
    }

    #[test]
    fn test_descriptor_is_built_once() {
        assert!(Arc::ptr_eq(&descriptor().unwrap(), &descriptor().unwrap()));
    }

    #[tokio::test]
    async fn test_stub_maps_methods_to_trait() {
        let stub = ProcessServiceStub::new(Arc::new(Fixed));
        let d = descriptor().unwrap();

        let value = stub
            .invoke(
                d.method(TEST_FUNCTION).unwrap(),
                vec![Value::string("a/b"), Value::I32(3)],
            )
            .await
            .unwrap();
        assert_eq!(value, Value::string("a/b/3"));

        let value = stub.invoke(d.method(GET_STRING).unwrap(), vec![]).await.unwrap();
        assert_eq!(value, Value::null_string());

        // startService uses the trait's default body.
        let value = stub.invoke(d.method(START_SERVICE).unwrap(), vec![]).await.unwrap();
        assert_eq!(value, Value::Void);

        assert!(stub.invoke(d.method(GET_STARTED_AT).unwrap(), vec![]).await.is_err());

        let value = stub
            .invoke(
                d.method(POST_DATA).unwrap(),
                vec![Value::StringArray(vec!["ab".into(), "".into(), "xyz".into()])],
            )
            .await
            .unwrap();
        assert_eq!(value, Value::I32Array(vec![2, 0, 3]));
    }

    #[tokio::test]
    async fn test_start_service_defaults_agree() {
        let d = descriptor().unwrap();
        let caller_side = d.method(START_SERVICE).unwrap().run_default(&[]).unwrap();
        let callee_side = Fixed.start_service().await.map(|()| Value::Void);
        assert_eq!(caller_side.unwrap(), callee_side.unwrap());
    }
}
