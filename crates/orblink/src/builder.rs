//! # Link Builder
//!
//! Fluent setup for a link: configuration, the object offered to the peer,
//! and the hooks the link calls back into.

use std::sync::Arc;

use orbpack::EmptyObject;
use orbpack::LocalObject;

use crate::config::LinkConfig;
use crate::link::Authorizer;
use crate::link::Link;
use crate::link::ReadyCallback;
use crate::spawner::Spawner;
use crate::spawner::TokioSpawner;
use crate::transport::Transport;

pub struct LinkBuilder {
    config: LinkConfig,
    gateway: Option<LocalObject>,
    authorizer: Option<Authorizer>,
    on_ready: Option<ReadyCallback>,
    spawner: Option<Arc<dyn Spawner>>,
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkBuilder {
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            gateway: None,
            authorizer: None,
            on_ready: None,
            spawner: None,
        }
    }

    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// The object the peer receives from `finish`. Defaults to an object
    /// that rejects every call.
    pub fn gateway(mut self, gateway: LocalObject) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Decides once, after the peer hello, whether the link may proceed.
    pub fn authorizer(mut self, authorizer: impl Fn(&Link) -> bool + Send + Sync + 'static) -> Self {
        self.authorizer = Some(Box::new(authorizer));
        self
    }

    pub fn on_ready(mut self, on_ready: impl FnOnce(Option<Link>) + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(on_ready));
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Starts the handshake on `transport`. Must run inside a tokio runtime
    /// unless a spawner with its own handle is set.
    pub fn start(self, transport: impl Transport) -> Link {
        self.start_shared(Arc::new(transport))
    }

    pub fn start_shared(self, transport: Arc<dyn Transport>) -> Link {
        let gateway = self.gateway.unwrap_or_else(|| LocalObject::new(EmptyObject));
        let spawner = self.spawner.unwrap_or_else(|| Arc::new(TokioSpawner::new()));
        Link::start(self.config, transport, spawner, gateway, self.authorizer, self.on_ready)
    }
}

impl Link {
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }
}
