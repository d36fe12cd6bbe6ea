//! Instance-tagged logging over the `log` facade.
//!
//! Every device and forwarder carries its own logger so concurrent sessions
//! stay distinguishable in a shared sink. Two levels are used by the
//! data-plane: verbose (per-packet detail) and error.

use std::sync::Arc;

use log::{debug, error, info};

/// Cloneable logger tag. Safe to call from any thread.
#[derive(Clone, Debug)]
pub struct TunnelLogger {
    tag: Arc<str>,
}

impl TunnelLogger {
    pub fn new(tag: impl AsRef<str>) -> Self {
        TunnelLogger {
            tag: Arc::from(tag.as_ref()),
        }
    }

    /// Derive a logger for a sub-component, e.g. `wg0` -> `wg0/udpfwd`.
    pub fn sub(&self, component: &str) -> Self {
        TunnelLogger {
            tag: Arc::from(format!("{}/{}", self.tag, component).as_str()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn verbose(&self, msg: impl AsRef<str>) {
        debug!("{}: {}", self.tag, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        info!("{}: {}", self.tag, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        error!("{}: {}", self.tag, msg.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_extends_tag() {
        let root = TunnelLogger::new("wg0");
        let child = root.sub("udpfwd");
        assert_eq!(child.tag(), "wg0/udpfwd");
        assert_eq!(root.tag(), "wg0");
    }
}
