//! # Driver Configuration Module
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! [`DriverConfig`] holding the collaborators and tunables a driver needs.
//! It enforces fail-fast validation so a driver is never opened without a
//! sound server or a sound lookup.
//!
//! ## Required Dependencies
//!
//! - `SoundServer` - Creates the server connection
//! - `SoundLookup` - Resolves event names to sound files for uploads and
//!   direct streams
//!
//! ## Tunables
//!
//! [`DriverSettings`] holds the plain-data part of the configuration and can
//! be loaded from JSON:
//!
//! ```json
//! { "client_name": "desktop-shell", "device": "speakers", "max_play_attempts": 3 }
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::DriverConfig;
//! use std::sync::Arc;
//!
//! let config = DriverConfig::builder()
//!     .client_name("desktop-shell")
//!     .server(Arc::new(MySoundServer::new()))
//!     .lookup(Arc::new(MyThemeLookup::new()))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::EventBus;
use bridge_traits::{PropList, SoundLookup, SoundServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default client name reported to the server.
pub const DEFAULT_CLIENT_NAME: &str = "chime";

/// Default bound on play/upload cycles per request.
pub const DEFAULT_MAX_PLAY_ATTEMPTS: u32 = 3;

/// Default cap on bytes read from a sound file per write request.
pub const DEFAULT_WRITE_CHUNK_LIMIT: usize = 64 * 1024;

/// Plain-data driver tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Name this client reports to the server
    pub client_name: String,
    /// Driver name the host asked for; the server must answer to it
    pub driver: Option<String>,
    /// Server address; `None` uses the server's default
    pub server: Option<String>,
    /// Output device; `None` uses the server's default sink
    pub device: Option<String>,
    /// Play attempts before falling back to a direct stream
    pub max_play_attempts: u32,
    /// Upper bound on bytes handed to the server per write
    pub write_chunk_limit: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            driver: None,
            server: None,
            device: None,
            max_play_attempts: DEFAULT_MAX_PLAY_ATTEMPTS,
            write_chunk_limit: DEFAULT_WRITE_CHUNK_LIMIT,
        }
    }
}

impl DriverSettings {
    /// Parse and validate settings from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: DriverSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(Error::Config("Client name cannot be empty".to_string()));
        }

        if self.max_play_attempts == 0 {
            return Err(Error::Config(
                "max_play_attempts must be at least 1".to_string(),
            ));
        }

        if self.write_chunk_limit == 0 {
            return Err(Error::Config(
                "write_chunk_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Everything a driver needs to open. Use [`DriverConfigBuilder`] to
/// construct instances.
#[derive(Clone)]
pub struct DriverConfig {
    pub settings: DriverSettings,

    /// Sound server factory (required)
    pub server: Arc<dyn SoundServer>,

    /// Event sound resolver (required)
    pub lookup: Arc<dyn SoundLookup>,

    /// Context-wide properties sent as client properties on connect
    pub props: Arc<PropList>,

    /// Optional bus for driver events
    pub event_bus: Option<EventBus>,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("settings", &self.settings)
            .field("server", &self.server.name())
            .field("lookup", &"SoundLookup { ... }")
            .field("props", &self.props)
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

impl DriverConfig {
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }
}

fn server_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SoundServer".to_string(),
        message: "A SoundServer implementation is required to open a driver. \
                 Inject the platform sound server adapter, or the loopback server in tests."
            .to_string(),
    }
}

fn lookup_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SoundLookup".to_string(),
        message: "A SoundLookup implementation is required to resolve event sounds \
                 for cache uploads and direct streams."
            .to_string(),
    }
}

/// Builder for constructing [`DriverConfig`] instances.
#[derive(Default)]
pub struct DriverConfigBuilder {
    settings: DriverSettings,
    server: Option<Arc<dyn SoundServer>>,
    lookup: Option<Arc<dyn SoundLookup>>,
    props: Option<Arc<PropList>>,
    event_bus: Option<EventBus>,
}

impl DriverConfigBuilder {
    /// Replace every tunable at once, e.g. with settings loaded from JSON.
    pub fn settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.settings.client_name = name.into();
        self
    }

    /// Require the server to answer to this driver name.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.settings.driver = Some(driver.into());
        self
    }

    pub fn server_address(mut self, address: impl Into<String>) -> Self {
        self.settings.server = Some(address.into());
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.settings.device = Some(device.into());
        self
    }

    pub fn max_play_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_play_attempts = attempts;
        self
    }

    pub fn write_chunk_limit(mut self, bytes: usize) -> Self {
        self.settings.write_chunk_limit = bytes;
        self
    }

    pub fn server(mut self, server: Arc<dyn SoundServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn SoundLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn props(mut self, props: Arc<PropList>) -> Self {
        self.props = Some(props);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] when the server or lookup is missing
    /// - [`Error::Config`] when a tunable is out of range
    pub fn build(self) -> Result<DriverConfig> {
        let server = self.server.ok_or_else(server_missing_error)?;
        let lookup = self.lookup.ok_or_else(lookup_missing_error)?;
        self.settings.validate()?;

        Ok(DriverConfig {
            settings: self.settings,
            server,
            lookup,
            props: self.props.unwrap_or_default(),
            event_bus: self.event_bus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::server::{
        ServerConnection, ServerErrorCode, ServerEventSink, ServerPropList, ServerResult,
    };
    use bridge_traits::sound::{SoundFile, ThemeCache};

    struct NullServer;

    impl SoundServer for NullServer {
        fn name(&self) -> &str {
            "null"
        }

        fn new_connection(
            &self,
            _client_name: &str,
            _props: ServerPropList,
            _events: Arc<dyn ServerEventSink>,
        ) -> ServerResult<Box<dyn ServerConnection>> {
            Err(ServerErrorCode::CONNECTION_REFUSED)
        }
    }

    struct NullLookup;

    impl SoundLookup for NullLookup {
        fn lookup(
            &self,
            event_id: &str,
            _context_props: &PropList,
            _request_props: &PropList,
            _theme: &mut Option<ThemeCache>,
        ) -> BridgeResult<Box<dyn SoundFile>> {
            Err(bridge_traits::BridgeError::NotFound(event_id.to_string()))
        }
    }

    fn complete_builder() -> DriverConfigBuilder {
        DriverConfig::builder()
            .server(Arc::new(NullServer))
            .lookup(Arc::new(NullLookup))
    }

    #[test]
    fn test_defaults() {
        let config = complete_builder().build().unwrap();
        assert_eq!(config.settings.client_name, "chime");
        assert_eq!(config.settings.max_play_attempts, 3);
        assert_eq!(config.settings.write_chunk_limit, 64 * 1024);
        assert!(config.settings.device.is_none());
        assert!(config.props.is_empty());
        assert!(config.event_bus.is_none());
    }

    #[test]
    fn test_missing_server_fails_fast() {
        let result = DriverConfig::builder()
            .lookup(Arc::new(NullLookup))
            .build();
        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "SoundServer")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_lookup_fails_fast() {
        let result = DriverConfig::builder()
            .server(Arc::new(NullServer))
            .build();
        assert!(matches!(
            result,
            Err(Error::CapabilityMissing { ref capability, .. }) if capability == "SoundLookup"
        ));
    }

    #[test]
    fn test_invalid_tunables() {
        assert!(matches!(
            complete_builder().max_play_attempts(0).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            complete_builder().write_chunk_limit(0).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            complete_builder().client_name("  ").build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_settings_from_json() {
        let settings =
            DriverSettings::from_json(r#"{ "client_name": "shell", "device": "hdmi" }"#).unwrap();
        assert_eq!(settings.client_name, "shell");
        assert_eq!(settings.device.as_deref(), Some("hdmi"));
        assert_eq!(settings.max_play_attempts, DEFAULT_MAX_PLAY_ATTEMPTS);

        assert!(matches!(
            DriverSettings::from_json(r#"{ "max_play_attempts": 0 }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DriverSettings::from_json("not json"),
            Err(Error::Settings(_))
        ));
    }

    #[test]
    fn test_builder_overrides() {
        let config = complete_builder()
            .settings(DriverSettings {
                client_name: "shell".to_string(),
                ..DriverSettings::default()
            })
            .driver("null")
            .server_address("unix:/run/sound")
            .device("speakers")
            .max_play_attempts(5)
            .write_chunk_limit(1024)
            .event_bus(EventBus::default())
            .build()
            .unwrap();

        assert_eq!(config.settings.client_name, "shell");
        assert_eq!(config.settings.driver.as_deref(), Some("null"));
        assert_eq!(config.settings.server.as_deref(), Some("unix:/run/sound"));
        assert_eq!(config.settings.max_play_attempts, 5);
        assert_eq!(config.settings.write_chunk_limit, 1024);
        assert!(config.event_bus.is_some());
    }
}
