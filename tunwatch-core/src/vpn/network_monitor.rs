//! Network state monitoring
//!
//! Defines the connectivity and WiFi signal contracts the engine consumes,
//! and a NetworkManager-backed implementation that polls D-Bus and emits
//! only on change.

use crate::error::MonitorError;
use crate::signal::{Broadcaster, Subscription};
use crate::types::WifiInfo;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, Proxy};

const NM_DESTINATION: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";
const NM_ACTIVE_INTERFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const NM_WIRELESS_INTERFACE: &str = "org.freedesktop.NetworkManager.Device.Wireless";
const NM_ACCESS_POINT_INTERFACE: &str = "org.freedesktop.NetworkManager.AccessPoint";

/// NM_STATE_CONNECTED_GLOBAL
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;
const WIRELESS_CONNECTION_TYPE: &str = "802-11-wireless";

/// Online/offline updates; the first value reflects the current status
pub trait ConnectivitySignal: Send + Sync {
    fn subscribe(&self) -> Subscription<bool>;
}

/// WiFi network updates
pub trait WifiInfoSignal: Send + Sync {
    fn subscribe(&self) -> Subscription<WifiInfo>;
}

impl ConnectivitySignal for Broadcaster<bool> {
    fn subscribe(&self) -> Subscription<bool> {
        Broadcaster::subscribe(self)
    }
}

impl WifiInfoSignal for Broadcaster<WifiInfo> {
    fn subscribe(&self) -> Subscription<WifiInfo> {
        Broadcaster::subscribe(self)
    }
}

/// A signal fed by a background polling task
///
/// The task stops when the signal is dropped.
pub struct PolledSignal<T> {
    values: Broadcaster<T>,
    task: JoinHandle<()>,
}

impl<T> Drop for PolledSignal<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConnectivitySignal for PolledSignal<bool> {
    fn subscribe(&self) -> Subscription<bool> {
        self.values.subscribe()
    }
}

impl WifiInfoSignal for PolledSignal<WifiInfo> {
    fn subscribe(&self) -> Subscription<WifiInfo> {
        self.values.subscribe()
    }
}

/// Queries NetworkManager over the system bus
#[derive(Clone)]
pub struct NetworkMonitor {
    connection: Connection,
}

impl NetworkMonitor {
    /// Connect to the system D-Bus and verify NetworkManager is available
    ///
    /// # Errors
    ///
    /// Returns `MonitorError` if the D-Bus connection fails or NetworkManager is not running
    #[tracing::instrument]
    pub async fn new() -> Result<Self, MonitorError> {
        let connection = Connection::system().await?;

        let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
        let bus_name = zbus::names::BusName::try_from(NM_DESTINATION)
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
        let name_has_owner = proxy
            .name_has_owner(bus_name)
            .await
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;

        if !name_has_owner {
            return Err(MonitorError::NetworkManagerUnavailable);
        }

        Ok(Self { connection })
    }

    /// Check if the network currently has global connectivity
    #[tracing::instrument(skip(self))]
    pub async fn is_network_available(&self) -> Result<bool, MonitorError> {
        let proxy = Proxy::new(&self.connection, NM_DESTINATION, NM_PATH, NM_INTERFACE).await?;
        let state: u32 = proxy
            .get_property("State")
            .await
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;

        Ok(state == NM_STATE_CONNECTED_GLOBAL)
    }

    /// Describe the primary connection's WiFi status
    ///
    /// A failure to read the SSID is reported as `ssid: None`, not as an error.
    #[tracing::instrument(skip(self))]
    pub async fn wifi_info(&self) -> Result<WifiInfo, MonitorError> {
        let nm = Proxy::new(&self.connection, NM_DESTINATION, NM_PATH, NM_INTERFACE).await?;
        let primary: OwnedObjectPath = nm
            .get_property("PrimaryConnection")
            .await
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
        if primary.as_str() == "/" {
            return Ok(WifiInfo::off_wifi());
        }

        let active = Proxy::new(
            &self.connection,
            NM_DESTINATION,
            primary.as_str(),
            NM_ACTIVE_INTERFACE,
        )
        .await?;
        let kind: String = active
            .get_property("Type")
            .await
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
        if kind != WIRELESS_CONNECTION_TYPE {
            return Ok(WifiInfo::off_wifi());
        }

        let ssid = match self.active_ssid(&active).await {
            Ok(ssid) => ssid,
            Err(e) => {
                debug!("SSID unavailable: {}", e);
                None
            }
        };
        Ok(WifiInfo {
            connected_to_wifi: true,
            ssid,
        })
    }

    async fn active_ssid(&self, active: &Proxy<'_>) -> Result<Option<String>, zbus::Error> {
        let devices: Vec<OwnedObjectPath> = active.get_property("Devices").await?;
        let Some(device) = devices.first() else {
            return Ok(None);
        };

        let wireless = Proxy::new(
            &self.connection,
            NM_DESTINATION,
            device.as_str(),
            NM_WIRELESS_INTERFACE,
        )
        .await?;
        let access_point: OwnedObjectPath = wireless.get_property("ActiveAccessPoint").await?;
        if access_point.as_str() == "/" {
            return Ok(None);
        }

        let ap = Proxy::new(
            &self.connection,
            NM_DESTINATION,
            access_point.as_str(),
            NM_ACCESS_POINT_INTERFACE,
        )
        .await?;
        let raw: Vec<u8> = ap.get_property("Ssid").await?;
        let ssid = String::from_utf8_lossy(&raw).trim().to_string();
        Ok((!ssid.is_empty()).then_some(ssid))
    }

    /// Poll global connectivity every `interval`
    pub fn connectivity_signal(&self, interval: Duration) -> PolledSignal<bool> {
        let monitor = self.clone();
        let values = Broadcaster::new();
        let publisher = values.clone();
        let task = tokio::spawn(async move {
            loop {
                match monitor.is_network_available().await {
                    Ok(online) => {
                        if publisher.publish(online) {
                            debug!(online, "Connectivity changed");
                        }
                    }
                    Err(e) => warn!("Connectivity poll failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
        PolledSignal { values, task }
    }

    /// Poll WiFi status every `interval`
    pub fn wifi_signal(&self, interval: Duration) -> PolledSignal<WifiInfo> {
        let monitor = self.clone();
        let values = Broadcaster::new();
        let publisher = values.clone();
        let task = tokio::spawn(async move {
            loop {
                match monitor.wifi_info().await {
                    Ok(info) => {
                        if publisher.publish(info.clone()) {
                            debug!(
                                wifi = info.connected_to_wifi,
                                ssid = ?info.ssid,
                                "WiFi changed"
                            );
                        }
                    }
                    Err(e) => warn!("WiFi poll failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
        PolledSignal { values, task }
    }
}
