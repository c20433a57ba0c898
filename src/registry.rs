//! Host-function registry for `Execute` commands.
//!
//! `Execute` entries name a `(module, function)` pair that must have been
//! registered by the embedding process before the engine starts. Invocation
//! is plain map lookup and dynamic dispatch; there is no reflective runtime
//! lookup. Host functions observe the backend handle, they do not mutate it.
//!
//! Failures never escape: an unknown function, a returned error or a panic
//! all become an error reply for the client, and the engine keeps running.

use crate::backend::Backend;
use crate::observability;
use crate::types::{ExecuteCall, LogPosition, Reply};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Registered host function: `(handle, position, table, args) -> payload`.
pub type HostFn<B> = Box<
    dyn Fn(&<B as Backend>::Handle, LogPosition, &str, &[Vec<u8>]) -> crate::Result<Vec<u8>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionId {
    module: String,
    function: String,
}

/// Maps `(module, function)` identifiers to typed host functions.
pub struct FunctionRegistry<B: Backend> {
    funcs: HashMap<FunctionId, HostFn<B>>,
}

impl<B: Backend> Default for FunctionRegistry<B> {
    fn default() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }
}

impl<B: Backend> FunctionRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function. A later registration under the same
    /// identifiers replaces the earlier one.
    pub fn register<F>(&mut self, module: impl Into<String>, function: impl Into<String>, f: F)
    where
        F: Fn(&B::Handle, LogPosition, &str, &[Vec<u8>]) -> crate::Result<Vec<u8>>
            + Send
            + Sync
            + 'static,
    {
        self.funcs.insert(
            FunctionId {
                module: module.into(),
                function: function.into(),
            },
            Box::new(f),
        );
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Invoke the function named by `call` against `handle` at `position`.
    ///
    /// Panics are caught and converted to error replies, like any other
    /// failure.
    pub fn invoke(&self, handle: &B::Handle, position: LogPosition, call: &ExecuteCall) -> Reply {
        let id = FunctionId {
            module: call.module.clone(),
            function: call.function.clone(),
        };
        let Some(func) = self.funcs.get(&id) else {
            warn!(module = %call.module, function = %call.function, "unknown host function");
            observability::record_execute_error();
            return Reply::Error(format!(
                "unknown function {}:{}",
                call.module, call.function
            ));
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            func(handle, position, &call.table, &call.args)
        }));

        match outcome {
            Ok(Ok(payload)) => Reply::Payload(payload),
            Ok(Err(e)) => {
                observability::record_execute_error();
                Reply::Error(e.to_string())
            }
            Err(panic) => {
                let cause = panic_message(&panic);
                warn!(module = %call.module, function = %call.function, %cause, "host function panicked");
                observability::record_execute_error();
                Reply::Error(cause)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "host function panicked".to_string()
    }
}
