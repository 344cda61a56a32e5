//! # Driver Lifecycle
//!
//! Opening connects to the sound server and starts the event loop; closing
//! stops the loop, reports every outstanding request as destroyed and
//! disconnects. Dropping a [`Driver`] closes it.

use crate::connection::{retire, EventLoop, LoopSink, Shared};
use crate::error::{DriverError, Result};
use crate::proplist;
use crate::registry::{self, Finished};
use bridge_traits::{ContextState, PropList, SoundLookup, ThemeCache};
use core_runtime::config::{DriverConfig, DriverSettings};
use core_runtime::events::DriverEvent;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// A connection to a sound server that plays event sounds.
///
/// All methods take `&self`; share a driver between threads with an `Arc`.
pub struct Driver {
    pub(crate) shared: Arc<Shared>,
    event_loop: Option<EventLoop>,
    pub(crate) lookup: Arc<dyn SoundLookup>,
    /// Context properties, consulted by sound lookups.
    pub(crate) props: Arc<PropList>,
    pub(crate) theme: Mutex<Option<ThemeCache>>,
    pub(crate) settings: DriverSettings,
    opened: bool,
}

impl Driver {
    /// Connect to the configured server and wait until the connection is
    /// ready.
    ///
    /// # Errors
    ///
    /// - [`DriverError::NoDriver`] if a driver name was requested and the
    ///   server answers to a different one
    /// - [`DriverError::Invalid`] if a context property key is malformed
    /// - The translated server error if the connection fails
    #[instrument(skip(config), fields(client = %config.settings.client_name))]
    pub fn open(config: DriverConfig) -> Result<Self> {
        let DriverConfig {
            settings,
            server,
            lookup,
            props,
            event_bus,
        } = config;

        if let Some(requested) = settings.driver.as_deref() {
            if requested != server.name() {
                debug!(requested, available = server.name(), "Driver name mismatch");
                return Err(DriverError::NoDriver);
            }
        }

        let mut client_props = proplist::to_server_props(&props)?;
        proplist::strip_internal_keys(&mut client_props);

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = server
            .new_connection(
                &settings.client_name,
                client_props,
                Arc::new(LoopSink::new(tx.clone())),
            )
            .map_err(DriverError::from_server)?;

        let shared = Arc::new(Shared::new(
            connection,
            settings.device.clone(),
            settings.write_chunk_limit,
            event_bus,
            tx.clone(),
        ));
        let event_loop = EventLoop::spawn(Arc::clone(&shared), tx, rx)?;

        let mut driver = Self {
            shared,
            event_loop: Some(event_loop),
            lookup,
            props,
            theme: Mutex::new(None),
            settings,
            opened: false,
        };
        driver.connect()?;
        driver.opened = true;

        info!(server = server.name(), "Connected to sound server");
        driver.shared.emit(DriverEvent::Connected);
        Ok(driver)
    }

    fn connect(&self) -> Result<()> {
        let mut guard = self.shared.lock();
        guard
            .connection
            .connect(self.settings.server.as_deref())
            .map_err(DriverError::from_server)?;

        loop {
            let state = guard.connection.state();
            debug_assert_ne!(
                state,
                ContextState::Terminated,
                "connection terminated while opening"
            );
            match state {
                ContextState::Ready => return Ok(()),
                ContextState::Failed => {
                    let error = guard.connection_error();
                    warn!(%error, "Failed to connect to sound server");
                    return Err(error);
                }
                ContextState::Terminated => return Err(DriverError::State),
                ContextState::Unconnected | ContextState::Connecting => guard.wait(),
            }
        }
    }

    /// Close the driver. Every outstanding request receives
    /// [`DriverError::Destroyed`] on the calling thread before this returns.
    pub fn close(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        let Some(mut event_loop) = self.event_loop.take() else {
            return;
        };
        event_loop.stop();

        let finished: Vec<Finished> = {
            let mut guard = self.shared.lock();
            let (coord, mut registry) = guard.split();
            let outstanding = registry.drain();
            drop(registry);

            let finished = outstanding
                .into_iter()
                .map(|request| {
                    retire(coord.connection.as_mut(), request, Err(DriverError::Destroyed))
                })
                .collect();
            coord.operations.clear();
            coord.feeds.clear();
            coord.connection.disconnect();
            finished
        };

        debug!(destroyed = finished.len(), "Driver closing");
        registry::deliver_all(finished, self.shared.events.as_ref());
        *self.theme.lock() = None;

        if self.opened {
            info!("Driver closed");
            self.shared.emit(DriverEvent::Closed);
        }
    }

    /// Route future requests to `device`, or to the server default with
    /// `None`. Requests already playing are not moved.
    pub fn change_device(&self, device: Option<&str>) -> Result<()> {
        let mut guard = self.shared.lock();
        guard.device = device.map(str::to_string);
        debug!(device = ?guard.device, "Output device changed");
        Ok(())
    }

    /// Merge `changed` into the context properties and push them to the
    /// server. The update is not waited for.
    #[instrument(skip(self, changed))]
    pub fn change_props(&self, changed: &PropList) -> Result<()> {
        let mut server_props = proplist::to_server_props(changed)?;
        proplist::strip_internal_keys(&mut server_props);

        let entries = changed.with_locked(|entries| entries.to_vec());
        for entry in entries {
            self.props.set(entry.key(), entry.value());
        }

        let mut guard = self.shared.lock();
        guard.ensure_ready()?;
        guard
            .connection
            .update_proplist(&server_props)
            .map_err(DriverError::from_server)?;
        Ok(())
    }

    /// Paths that wait for the event loop cannot run on it.
    pub(crate) fn ensure_off_loop(&self) -> Result<()> {
        match &self.event_loop {
            Some(event_loop) if event_loop.is_current() => {
                warn!("Blocking driver call from a completion callback");
                Err(DriverError::State)
            }
            Some(_) => Ok(()),
            None => Err(DriverError::State),
        }
    }

    /// Requests still awaiting a final result from the server.
    pub fn outstanding_count(&self) -> usize {
        self.shared.outstanding_count()
    }

    /// Whether sink-input removal notifications are enabled.
    pub fn is_subscribed(&self) -> bool {
        self.shared.lock().subscribed
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("settings", &self.settings)
            .field("outstanding", &self.outstanding_count())
            .field("running", &self.event_loop.is_some())
            .finish()
    }
}
