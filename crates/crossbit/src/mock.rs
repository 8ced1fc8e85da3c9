//! In-process session used when no host is configured.
//!
//! The handler is resolved from the session's [`HandlerRegistry`] and runs on
//! the caller's thread. It sees `host() == None` and `port() == -1` and gets
//! its constructor kwargs as strings, like a real worker would.
//! Environment paths are not applied.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::bootstrap::ModuleRef;
use crate::bridge::protocol::Fault;
use crate::capture::CapturedOutput;
use crate::error::BridgeError;
use crate::handler::{HandlerContext, Invoke, ResolveError, display_paths};
use crate::session::{Session, SessionConfig};
use crate::value::{Call, Kwargs, Value};

const IMPORT_ERROR: &str = "ImportError";

pub struct MockSession {
    handler: Box<dyn Invoke>,
    closed: bool,
}

impl MockSession {
    pub fn open(config: SessionConfig) -> Result<Self, BridgeError> {
        let registry = config.registry.as_deref().ok_or_else(|| {
            BridgeError::Spawn("a mocked session needs a handler registry".to_string())
        })?;
        let module = ModuleRef::parse(&config.module)
            .map_err(|e| Fault::bare(IMPORT_ERROR, e.to_string()))?;
        let search = config.search_path()?;

        let factory = registry.resolve(&module.name).map_err(|e| match e {
            ResolveError::UnknownModule(_) => Fault::bare(
                IMPORT_ERROR,
                format!("{e}\nModule search path:\n{}", display_paths(&search)),
            ),
            other => Fault::bare(IMPORT_ERROR, other.to_string()),
        })?;

        let ctx = HandlerContext::new(None, -1)
            .with_kwargs(config.stringified_kwargs())
            .with_search_path(search);
        let handler = factory.construct(&ctx)?;
        if handler.library().is_none() {
            return Err(BridgeError::Spawn(format!(
                "{} did not bind a library during construction",
                factory.type_name()
            )));
        }
        tracing::debug!(module = %module.name, handler = factory.type_name(), "Mocked handler constructed");

        Ok(Self {
            handler,
            closed: false,
        })
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler.type_name()
    }
}

#[async_trait]
impl Session for MockSession {
    fn host(&self) -> Option<&str> {
        None
    }

    fn port(&self) -> i32 {
        -1
    }

    fn library_path(&self) -> &Path {
        self.handler
            .library()
            .map(|lib| lib.path())
            .unwrap_or_else(|| Path::new(""))
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, BridgeError> {
        if self.closed {
            return Err(BridgeError::Protocol(
                "the connection to the worker is closed".into(),
            ));
        }
        self.handler
            .invoke(name, Call::new(args, kwargs))
            .map_err(|fault| BridgeError::Fault(fault.in_member(name)))
    }

    async fn close(&mut self, _kill_timeout: Duration) -> CapturedOutput {
        if !self.closed {
            self.closed = true;
            self.handler.shutdown_handler();
        }
        CapturedOutput::default()
    }
}

impl fmt::Display for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<MockSession lib={} handler={}>",
            self.library_path().display(),
            self.handler.type_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::open;
    use crate::testing;

    fn config(module: &str) -> SessionConfig {
        SessionConfig::mocked(module, Arc::new(testing::registry()))
    }

    #[tokio::test]
    async fn calls_run_in_process() {
        let mut session = open(config("counter").with_kwarg("label", 7)).await.unwrap();
        assert_eq!(session.host(), None);
        assert_eq!(session.port(), -1);
        assert_eq!(session.library_path(), std::env::current_exe().unwrap());

        let sum = session
            .call("add", vec![Value::from(2), Value::from(3)], Kwargs::new())
            .await
            .unwrap();
        assert_eq!(sum, Value::Int(5));
        let label = session.call("label", vec![], Kwargs::new()).await.unwrap();
        assert_eq!(label, Value::from("7"));
    }

    #[tokio::test]
    async fn faults_name_the_member() {
        let mut session = open(config("counter")).await.unwrap();
        let err = session
            .call("add", vec![Value::from(2), Value::from("x")], Kwargs::new())
            .await
            .unwrap_err();
        let fault = err.fault().unwrap();
        assert_eq!(fault.name, Fault::TYPE_ERROR);
        assert!(fault.trace.ends_with("in add"), "{}", fault.trace);

        let err = session.call("missing", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err.fault().unwrap().name, Fault::ATTRIBUTE_ERROR);

        let err = session.call("explode", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err.fault().unwrap().name, Fault::PANIC);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut session = open(config("counter")).await.unwrap();
        assert!(session.close(Duration::from_secs(1)).await.is_empty());
        assert!(session.is_closed());
        assert!(session.close(Duration::from_secs(1)).await.is_empty());
        let err = session.call("add", vec![], Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[tokio::test]
    async fn resolution_failures() {
        let err = open(config("nowhere")).await.err().unwrap();
        let fault = err.fault().unwrap();
        assert_eq!(fault.name, IMPORT_ERROR);
        assert!(fault.message.contains("No module named 'nowhere'"));

        let err = open(config("empty")).await.err().unwrap();
        assert_eq!(err.fault().unwrap().name, IMPORT_ERROR);

        let err = open(config("unbound")).await.err().unwrap();
        assert!(matches!(err, BridgeError::Spawn(_)));
    }
}
