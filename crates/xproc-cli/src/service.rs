//! The `ProcessService` implementation served by `xproc serve`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;
use xproc::process_service::ProcessService;
use xproc::{Result, XprocError};

pub struct LocalProcessService {
    process_name: String,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl LocalProcessService {
    pub fn new() -> Self {
        Self {
            process_name: format!("xproc-{}", std::process::id()),
            started_at: Mutex::new(None),
        }
    }

    fn started_at_slot(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalProcessService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessService for LocalProcessService {
    async fn get_current_time_stamp(&self) -> Result<i64> {
        Ok(Utc::now().timestamp_millis())
    }

    async fn get_string(&self) -> Result<Option<String>> {
        Ok(Some(self.process_name.clone()))
    }

    async fn test_function(&self, path: String, parameters: i32) -> Result<String> {
        Ok(format!("{}/{}/{}", self.process_name, path, parameters))
    }

    async fn start_service(&self) -> Result<()> {
        let mut started_at = self.started_at_slot();
        if started_at.is_none() {
            let now = whole_millis(Utc::now())?;
            *started_at = Some(now);
            info!("Service started at {}", now);
        }
        Ok(())
    }

    async fn get_started_at(&self) -> Result<DateTime<Utc>> {
        let started_at = *self.started_at_slot();
        started_at.ok_or_else(|| XprocError::RemoteFailure {
            message: "service has not been started".to_string(),
        })
    }

    async fn post_data(&self, items: Vec<String>) -> Result<Vec<i32>> {
        items
            .iter()
            .map(|item| {
                i32::try_from(item.chars().count()).map_err(|_| XprocError::RemoteFailure {
                    message: format!("item of {} bytes is too long to count", item.len()),
                })
            })
            .collect()
    }
}

/// Timestamps cross the wire with millisecond precision.
fn whole_millis(ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).ok_or_else(|| {
        XprocError::RemoteFailure {
            message: format!("timestamp {} out of range", ts),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use xproc::codec::{decode, encode};
    use xproc::{Value, WireType};

    #[tokio::test]
    async fn test_started_at_requires_start() {
        let service = LocalProcessService::new();
        assert!(service.get_started_at().await.is_err());

        service.start_service().await.unwrap();
        let first = service.get_started_at().await.unwrap();
        service.start_service().await.unwrap();
        assert_eq!(service.get_started_at().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_started_at_survives_the_codec() {
        let service = LocalProcessService::new();
        service.start_service().await.unwrap();
        let started_at = Value::Timestamp(service.get_started_at().await.unwrap());

        let bytes = encode(std::slice::from_ref(&started_at), &[WireType::Timestamp]).unwrap();
        assert_eq!(decode(&bytes, &[WireType::Timestamp]).unwrap(), vec![started_at]);
    }

    #[tokio::test]
    async fn test_post_data_counts_characters() {
        let service = LocalProcessService::new();
        let counts = service
            .post_data(vec!["héllo".to_string(), String::new()])
            .await
            .unwrap();
        assert_eq!(counts, vec![5, 0]);
    }

    #[tokio::test]
    async fn test_function_includes_process_name() {
        let service = LocalProcessService::new();
        let result = service.test_function("a".to_string(), 2).await.unwrap();
        assert!(result.starts_with("xproc-"));
        assert!(result.ends_with("/a/2"));
    }
}
