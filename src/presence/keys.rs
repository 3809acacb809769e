use uuid::Uuid;

/// Device index within an account. Small and dense by construction; the
/// primary device is 1.
pub type DeviceId = u8;

/// Set of every live presence manager's identity.
pub const MANAGER_SET_KEY: &str = "presence::managers";

/// Presence record key for one device. The braces are a cluster hash tag so
/// a device's record always lands on one slot.
pub fn presence_key(account: Uuid, device: DeviceId) -> String {
    format!("presence::client::{{{account}::{device}}}")
}

/// Set of presence keys owned by one manager.
pub fn connected_clients_key(manager_id: &str) -> String {
    format!("presence::clients::{manager_id}")
}

/// Liveness channel for one manager. Anything subscribed here counts as the
/// manager being alive; the pruner publishes probes to it.
pub fn manager_channel(manager_id: &str) -> String {
    format!("presence::manager::{manager_id}")
}
