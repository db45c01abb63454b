// Client configuration.
//
// `ClientConfig` holds everything a `Peer` needs that does not change during
// a session: application identity, where the name tier lives, lobby and
// region preferences, the reconnect budget, synchronization tolerances, and
// the shared RPC shortcut table. All fields have defaults (`#[serde(default)]`)
// so a JSON config file only needs to name what it overrides.
//
// The host may persist the reconnection secret and level prefix across
// process restarts; the initial level prefix is therefore configurable here
// while the secret is handed to `Peer::set_secret`.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub app_id: String,
    pub app_version: String,
    pub nick_name: String,
    /// Stable user id sent on authenticate. `None` lets the backend assign one.
    pub user_id: Option<String>,

    /// Address of the discovery tier.
    pub name_server_address: String,
    /// When false, `connect_using_settings` goes straight to
    /// `master_server_address` and skips the region step.
    pub use_name_server: bool,
    pub master_server_address: Option<String>,
    /// Region to authenticate for on the name tier. `None` means: fetch the
    /// region list and wait for `Peer::select_region`.
    pub region: Option<String>,

    /// Join the default (or `lobby_name`) lobby after authenticating on the
    /// master tier.
    pub auto_join_lobby: bool,
    pub lobby_name: Option<String>,

    /// Transparent reconnect attempts per connect sequence for transient
    /// faults (timeouts, connect exceptions, expired tickets).
    pub max_reconnect_attempts: u32,

    /// Per-component tolerance for `Vector2`/`Vector3` equality.
    pub vector_precision: f32,
    /// Maximum angle (degrees) between two quaternions treated as equal.
    pub quaternion_precision_degrees: f32,
    /// Tolerance for scalar float equality.
    pub float_precision: f32,

    /// Method names every participant agrees on; outgoing RPCs send the index
    /// instead of the name.
    pub rpc_shortcuts: Vec<String>,

    /// Default for rooms this client creates: purge a leaver's cached events
    /// and destroy their objects.
    pub auto_cleanup_player_objects: bool,
    pub level_prefix: i16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_version: "1.0".into(),
            nick_name: String::new(),
            user_id: None,
            name_server_address: "127.0.0.1:5058".into(),
            use_name_server: true,
            master_server_address: None,
            region: None,
            auto_join_lobby: true,
            lobby_name: None,
            max_reconnect_attempts: 2,
            vector_precision: 0.000_1,
            quaternion_precision_degrees: 1.0,
            float_precision: 0.01,
            rpc_shortcuts: Vec::new(),
            auto_cleanup_player_objects: true,
            level_prefix: 0,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON config. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the peer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.use_name_server && self.master_server_address.is_none() {
            return Err(ClientError::Config(
                "use_name_server is false but no master_server_address is set".into(),
            ));
        }
        if self.rpc_shortcuts.len() > usize::from(u8::MAX) + 1 {
            return Err(ClientError::Config(format!(
                "at most 256 rpc shortcuts are addressable, got {}",
                self.rpc_shortcuts.len()
            )));
        }
        let negative = [
            self.vector_precision,
            self.quaternion_precision_degrees,
            self.float_precision,
        ]
        .iter()
        .any(|p| *p < 0.0);
        if negative {
            return Err(ClientError::Config("precisions must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ClientConfig::from_json(r#"{"app_id":"demo","region":"eu"}"#).unwrap();
        assert_eq!(config.app_id, "demo");
        assert_eq!(config.region.as_deref(), Some("eu"));
        assert!(config.auto_join_lobby);
        assert_eq!(config.max_reconnect_attempts, 2);
    }

    #[test]
    fn direct_master_requires_an_address() {
        let err = ClientConfig::from_json(r#"{"use_name_server":false}"#).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        let ok = ClientConfig::from_json(
            r#"{"use_name_server":false,"master_server_address":"10.0.0.1:5055"}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let err = ClientConfig::from_json("{").unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
    }
}
