//! Application zones and the handler registry.
//!
//! The registry replaces the original dynamic-library loading: the embedding
//! application registers named handler and hook providers up front, and the
//! configuration's `ZONE.api = content,provider,module` lines are resolved
//! against those registrations when the server is built. An unresolvable
//! provider fails startup.

use crate::{
    config::{UserParams, ZoneConfig},
    errors::ConfigError,
    http::{request::Request, response::Response, types::StatusCode},
    session::store::{SessionHandle, SessionStore},
};
use async_trait::async_trait;
use std::{collections::HashMap, io, sync::Arc};

/// An application request handler bound to a content name.
///
/// Handlers run on worker tasks and may await freely; the worker slot is
/// charged for the whole call. The returned status is recorded in the access
/// log.
///
/// ```
/// use nesta::{Handler, HandlerContext, Request, Response, StatusCode};
///
/// struct Hello;
///
/// #[async_trait::async_trait]
/// impl Handler for Hello {
///     async fn handle(&self, _: &Request, resp: &mut Response, _: &HandlerContext) -> StatusCode {
///         resp.status(StatusCode::Ok)
///             .header("Content-Type", "text/html")
///             .body("<p>hello</p>");
///         StatusCode::Ok
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: &Request,
        response: &mut Response,
        ctx: &HandlerContext,
    ) -> StatusCode;
}

/// Zone init/term hook, called with the user-parameter map. A failing init
/// hook aborts startup; term hook failures are logged and ignored.
pub trait Hook: Send + Sync + 'static {
    fn call(&self, params: &UserParams) -> io::Result<()>;
}

impl<F> Hook for F
where
    F: Fn(&UserParams) -> io::Result<()> + Send + Sync + 'static,
{
    fn call(&self, params: &UserParams) -> io::Result<()> {
        self(params)
    }
}

/// Per-request context handed to handlers alongside request and response.
pub struct HandlerContext {
    zone: Arc<Zone>,
    session: Option<SessionHandle>,
    params: Arc<UserParams>,
}

impl HandlerContext {
    pub(crate) fn new(
        zone: Arc<Zone>,
        session: Option<SessionHandle>,
        params: Arc<UserParams>,
    ) -> Self {
        Self {
            zone,
            session,
            params,
        }
    }

    /// The zone this handler is registered in.
    pub fn zone_name(&self) -> &str {
        &self.zone.name
    }

    /// The session bound to this request via its cookie, if any.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// The zone's session store, when sessions are enabled for it. Handlers
    /// create new sessions through this.
    pub fn store(&self) -> Option<&SessionStore> {
        self.zone.sessions.as_ref()
    }

    /// User parameters from the configuration.
    pub fn params(&self) -> &UserParams {
        &self.params
    }
}

/// A named application zone: session settings plus lifecycle hooks. Handler
/// bindings live in the server's content-name table.
pub struct Zone {
    pub(crate) name: String,
    pub(crate) sessions: Option<SessionStore>,
    pub(crate) init_hooks: Vec<Arc<dyn Hook>>,
    pub(crate) term_hooks: Vec<Arc<dyn Hook>>,
}

impl Zone {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_ref()
    }
}

/// Registration table the embedding application fills before the server is
/// built. `provider` names are what `ZONE.api` lines refer to.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request-handler provider under `name`.
    pub fn provide(&mut self, name: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Registers an init/term hook provider under `name`.
    pub fn provide_hook(&mut self, name: impl Into<String>, hook: impl Hook) -> &mut Self {
        self.hooks.insert(name.into(), Arc::new(hook));
        self
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub(crate) fn hook(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }
}

/// Builds a zone from its configuration, resolving hook providers.
pub(crate) fn build_zone(
    config: &ZoneConfig,
    registry: &HandlerRegistry,
    sessions: Option<SessionStore>,
) -> Result<Zone, ConfigError> {
    let mut init_hooks = Vec::with_capacity(config.init_apis.len());
    for binding in &config.init_apis {
        init_hooks.push(registry.hook(&binding.provider).ok_or_else(|| {
            ConfigError::UnknownHook {
                provider: binding.provider.clone(),
                module: binding.module.clone(),
            }
        })?);
    }
    let mut term_hooks = Vec::with_capacity(config.term_apis.len());
    for binding in &config.term_apis {
        term_hooks.push(registry.hook(&binding.provider).ok_or_else(|| {
            ConfigError::UnknownHook {
                provider: binding.provider.clone(),
                module: binding.module.clone(),
            }
        })?);
    }

    Ok(Zone {
        name: config.name.clone(),
        sessions,
        init_hooks,
        term_hooks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Handler for Nop {
        async fn handle(
            &self,
            _: &Request,
            resp: &mut Response,
            _: &HandlerContext,
        ) -> StatusCode {
            resp.status(StatusCode::Ok);
            StatusCode::Ok
        }
    }

    #[test]
    fn registry_resolves_providers() {
        let mut registry = HandlerRegistry::new();
        registry.provide("hello", Nop);
        registry.provide_hook("boot", |_: &UserParams| Ok(()));

        assert!(registry.handler("hello").is_some());
        assert!(registry.handler("missing").is_none());
        assert!(registry.hook("boot").is_some());
    }

    #[test]
    fn unknown_hook_fails_zone_build() {
        let registry = HandlerRegistry::new();
        let config = ZoneConfig {
            name: "shop".into(),
            max_session: 0,
            session_timeout: -1,
            apis: Vec::new(),
            init_apis: vec![crate::config::HookBinding {
                provider: "nope".into(),
                module: "libshop".into(),
            }],
            term_apis: Vec::new(),
        };
        assert!(matches!(
            build_zone(&config, &registry, None),
            Err(ConfigError::UnknownHook { .. })
        ));
    }
}
