//! Injected logging sink.
//!
//! Components never install or read a process-wide subscriber themselves.
//! A [`LogSink`] is handed to them at construction and every public entry
//! point runs its body inside it.

use tracing::Dispatch;

/// Where the core's `tracing` events go.
#[derive(Clone, Default)]
pub struct LogSink {
    dispatch: Option<Dispatch>,
}

impl LogSink {
    /// Route events to the given dispatcher.
    #[must_use]
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }

    /// Use whatever subscriber is current on the calling thread.
    #[must_use]
    pub fn ambient() -> Self {
        Self::default()
    }

    /// Whether a dispatcher was injected.
    #[must_use]
    pub fn is_injected(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Run `f` with this sink as the current dispatcher.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("injected", &self.is_injected())
            .finish()
    }
}

impl From<Dispatch> for LogSink {
    fn from(dispatch: Dispatch) -> Self {
        Self::new(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_sink_scopes_its_dispatcher() {
        let sink = LogSink::from(Dispatch::new(tracing_subscriber::registry()));
        assert!(sink.is_injected());
        assert!(!LogSink::ambient().is_injected());

        let scoped = sink.scope(|| {
            tracing::dispatcher::get_default(|current| current.is::<tracing_subscriber::Registry>())
        });
        assert!(scoped);
        assert!(!tracing::dispatcher::get_default(|current| {
            current.is::<tracing_subscriber::Registry>()
        }));
        assert_eq!(format!("{sink:?}"), "LogSink { injected: true }");
    }
}
