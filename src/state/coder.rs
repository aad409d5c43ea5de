//! Reversible state transforms applied before the state leaves for the provider.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use std::collections::HashMap;

/// Caller parameter carrying the post-login redirect target
pub const REDIRECT_PARAM: &str = "redirect";

const SEPARATOR: char = '.';

/// State with the embedded data split back out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedState {
    pub state: String,
    pub redirect: Option<String>,
}

pub trait StateCoder: Send + Sync {
    fn encode(&self, state: &str, params: &HashMap<String, String>) -> String;

    fn decode(&self, encoded: &str) -> DecodedState;
}

/// Appends the base64url-encoded `redirect` parameter to the state
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectStateCoder;

impl RedirectStateCoder {
    /// Only same-site relative paths are accepted as redirect targets
    fn is_safe_target(target: &str) -> bool {
        target.starts_with('/') && !target.starts_with("//") && !target.contains('\\')
    }
}

impl StateCoder for RedirectStateCoder {
    fn encode(&self, state: &str, params: &HashMap<String, String>) -> String {
        match params.get(REDIRECT_PARAM).filter(|target| !target.is_empty()) {
            Some(target) => format!("{state}{SEPARATOR}{}", URL_SAFE_NO_PAD.encode(target)),
            None => state.to_string(),
        }
    }

    fn decode(&self, encoded: &str) -> DecodedState {
        let Some((state, payload)) = encoded.split_once(SEPARATOR) else {
            return DecodedState {
                state: encoded.to_string(),
                redirect: None,
            };
        };

        let redirect = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|target| Self::is_safe_target(target));

        if redirect.is_none() {
            tracing::warn!("discarding undecodable or unsafe redirect target in state");
        }

        DecodedState {
            state: state.to_string(),
            redirect,
        }
    }
}
