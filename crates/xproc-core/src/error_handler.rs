//! Caller-side handlers for failed remote calls.
//!
//! A handler sees the error of a failed call and decides whether to absorb
//! it. An absorbed failure of a method whose return type has an absent value
//! (`void`, `string?`) makes the call return that value instead of the error.
//! Other methods always surface their errors.
//!
//! A [`ConnectionManager`](crate::ConnectionManager) can carry a root handler
//! that every proxy it hands out starts with; a proxy can replace it with
//! [`Proxy::with_error_handler`](crate::Proxy::with_error_handler).

use crate::error::XprocError;
use std::sync::Arc;

/// Decides whether a failed call is absorbed.
pub trait ErrorHandler: Send + Sync {
    /// Return `true` to absorb `error`.
    fn handle_error(&self, method: &str, error: &XprocError) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&str, &XprocError) -> bool + Send + Sync,
{
    fn handle_error(&self, method: &str, error: &XprocError) -> bool {
        self(method, error)
    }
}

/// Asks `first`, then `second` when `first` declined.
pub struct ChainedErrorHandler {
    first: Arc<dyn ErrorHandler>,
    second: Arc<dyn ErrorHandler>,
}

impl ChainedErrorHandler {
    pub fn new(first: Arc<dyn ErrorHandler>, second: Arc<dyn ErrorHandler>) -> Self {
        Self { first, second }
    }
}

impl ErrorHandler for ChainedErrorHandler {
    fn handle_error(&self, method: &str, error: &XprocError) -> bool {
        self.first.handle_error(method, error) || self.second.handle_error(method, error)
    }
}

/// Chain two handlers into one.
pub fn chain(first: Arc<dyn ErrorHandler>, second: Arc<dyn ErrorHandler>) -> Arc<dyn ErrorHandler> {
    Arc::new(ChainedErrorHandler::new(first, second))
}
