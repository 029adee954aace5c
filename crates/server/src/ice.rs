use std::env;
use std::sync::OnceLock;

use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

const ICE_MODE_VAR: &str = "WEBRTC_ICE_MODE";
const TURN_URLS_VAR: &str = "TURN_URLS";
const TURN_USERNAME_VAR: &str = "TURN_USERNAME";
const TURN_CREDENTIAL_VAR: &str = "TURN_CREDENTIAL";

/// Public STUN server used in prod mode.
const PROD_STUN_URL: &str = "stun:stun.l.google.com:19302";
/// Relay-only TURN endpoint of the local docker integration setup.
const DEV_TURN_URL: &str = "turn:turn:3478?transport=tcp";

static ICE_SERVERS: OnceLock<Vec<RTCIceServer>> = OnceLock::new();

/// ICE-related process environment.
#[derive(Debug, Clone, Default)]
pub struct IceEnv {
    pub mode: Option<String>,
    pub turn_urls: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl IceEnv {
    fn from_process_env() -> Self {
        Self {
            mode: env::var(ICE_MODE_VAR).ok(),
            turn_urls: env::var(TURN_URLS_VAR).ok(),
            turn_username: env::var(TURN_USERNAME_VAR).ok(),
            turn_credential: env::var(TURN_CREDENTIAL_VAR).ok(),
        }
    }
}

/// ICE server list for new peer connections.
///
/// The environment is read and the list is built exactly once per process;
/// every session after the first gets the cached value.
pub fn cached_ice_servers() -> &'static [RTCIceServer] {
    ICE_SERVERS.get_or_init(|| build_ice_servers(&IceEnv::from_process_env()))
}

fn build_ice_servers(env: &IceEnv) -> Vec<RTCIceServer> {
    if env.mode.as_deref() == Some("dev") {
        info!("Using dev ICE configuration (TURN only, forced relay)");
        return vec![RTCIceServer {
            urls: vec![DEV_TURN_URL.to_string()],
            username: "dev".to_string(),
            credential: "devpass".to_string(),
        }];
    }

    info!("Using prod ICE configuration");
    let mut servers = vec![RTCIceServer {
        urls: vec![PROD_STUN_URL.to_string()],
        ..Default::default()
    }];

    let turn_urls: Vec<String> = env
        .turn_urls
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect();

    if !turn_urls.is_empty()
        && let (Some(username), Some(credential)) = (&env.turn_username, &env.turn_credential)
    {
        servers.push(RTCIceServer {
            urls: turn_urls,
            username: username.clone(),
            credential: credential.clone(),
        });
    } else {
        warn!("No TURN server configured for production, STUN only");
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_mode_returns_single_relay_server() {
        let env = IceEnv {
            mode: Some("dev".to_string()),
            ..Default::default()
        };
        let servers = build_ice_servers(&env);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:turn:3478?transport=tcp"]);
        assert_eq!(servers[0].username, "dev");
        assert_eq!(servers[0].credential, "devpass");
    }

    #[test]
    fn prod_without_turn_is_stun_only() {
        let servers = build_ice_servers(&IceEnv::default());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn prod_with_full_turn_env_appends_turn_server() {
        let env = IceEnv {
            mode: Some("prod".to_string()),
            turn_urls: Some("turn:turn.example.com:3478, turns:turn.example.com:5349".to_string()),
            turn_username: Some("alice".to_string()),
            turn_credential: Some("s3cret".to_string()),
        };
        let servers = build_ice_servers(&env);
        assert_eq!(servers.len(), 2);
        assert_eq!(
            servers[1].urls,
            vec!["turn:turn.example.com:3478", "turns:turn.example.com:5349"]
        );
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "s3cret");
    }

    #[test]
    fn prod_with_incomplete_turn_env_is_stun_only() {
        // Missing credential
        let env = IceEnv {
            turn_urls: Some("turn:turn.example.com:3478".to_string()),
            turn_username: Some("alice".to_string()),
            ..Default::default()
        };
        assert_eq!(build_ice_servers(&env).len(), 1);

        // URL list that is empty after trimming
        let env = IceEnv {
            turn_urls: Some(" , ".to_string()),
            turn_username: Some("alice".to_string()),
            turn_credential: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert_eq!(build_ice_servers(&env).len(), 1);
    }

    #[test]
    fn cache_is_built_once() {
        let first = cached_ice_servers();
        let second = cached_ice_servers();
        assert!(std::ptr::eq(first.as_ptr(), second.as_ptr()));
    }
}
